//! In-place manifest rewriting.
//!
//! Both rewriters here work line-by-line on the raw file text so that every
//! byte they are not asked to change survives verbatim: key order, comments,
//! quoting, and whitespace all come back out exactly as they went in.
//! [`update_image`] changes a single container's `image:` scalar;
//! [`update_policies`] replaces the policy-prefixed annotation lines.

use std::collections::BTreeMap;

use crate::image::ImageRef;
use crate::policy::{self, ANNOTATION_PREFIX};
use crate::workload::WorkloadId;

use super::{parse_file, split_documents, Resource, ResourceError};

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t.starts_with('#')
}

/// Splits `rest` (the text after `key: `) into the scalar value and any
/// trailing text (whitespace or comment) that must be preserved.
fn split_value(rest: &str) -> (&str, &str) {
    let rest_trimmed = rest.trim_end();
    if let Some(stripped) = rest_trimmed.strip_prefix('"') {
        if let Some(end) = stripped.find('"') {
            let value_len = end + 2;
            return (&rest[..value_len], &rest[value_len..]);
        }
    }
    if let Some(stripped) = rest_trimmed.strip_prefix('\'') {
        if let Some(end) = stripped.find('\'') {
            let value_len = end + 2;
            return (&rest[..value_len], &rest[value_len..]);
        }
    }
    if let Some(comment) = rest.find(" #") {
        return (rest[..comment].trim_end(), &rest[rest[..comment].trim_end().len()..]);
    }
    (rest_trimmed, &rest[rest_trimmed.len()..])
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    if (v.starts_with('"') && v.ends_with('"') && v.len() >= 2)
        || (v.starts_with('\'') && v.ends_with('\'') && v.len() >= 2)
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

/// Rewrites a scalar line, keeping indentation, the key, the original quote
/// style, and any trailing comment.
fn replace_scalar(line: &str, key: &str, new_value: &str) -> Option<String> {
    let key_colon = format!("{key}:");
    let pos = line.find(&key_colon)?;
    let after = &line[pos + key_colon.len()..];
    let ws_len = after.len() - after.trim_start_matches(' ').len();
    let (value, trailing) = split_value(&after[ws_len..]);
    let rendered = if value.starts_with('"') {
        format!("\"{new_value}\"")
    } else if value.starts_with('\'') {
        format!("'{new_value}'")
    } else {
        new_value.to_string()
    };
    Some(format!(
        "{}{}{rendered}{trailing}",
        &line[..pos + key_colon.len()],
        &after[..ws_len]
    ))
}

/// The byte range of the document in `text` that defines `id`, if any.
fn find_document(source: &str, text: &str, id: &WorkloadId) -> Option<(usize, usize)> {
    for doc in split_documents(text) {
        let start = doc.as_ptr() as usize - text.as_ptr() as usize;
        if let Ok(resources) = parse_file(source, doc.as_bytes()) {
            if resources.iter().any(|r| &r.id == id) {
                return Some((start, start + doc.len()));
            }
        }
    }
    None
}

/// One container item while scanning a containers list: its name and
/// `image:` line as discovered so far, and the column its top-level keys
/// sit at (so keys of nested blocks like `env:` are not mistaken for the
/// container's own).
struct ContainerItem {
    name: Option<String>,
    image_line: Option<usize>,
    key_indent: Option<usize>,
}

/// Rewrites the image of the named container of workload `id` in a manifest
/// file, leaving every other byte unchanged.
///
/// # Errors
///
/// Fails when the file has no document for `id`, the document has no such
/// container, or the file is not UTF-8.
pub fn update_image(
    file: &[u8],
    source: &str,
    id: &WorkloadId,
    container: &str,
    image: &ImageRef,
) -> Result<Vec<u8>, ResourceError> {
    let text = std::str::from_utf8(file).map_err(|e| ResourceError::Parse {
        source_file: source.to_string(),
        reason: format!("not UTF-8: {e}"),
    })?;
    let (doc_start, doc_end) = find_document(source, text, id).ok_or_else(|| {
        ResourceError::NotFound {
            id: id.clone(),
            source_file: source.to_string(),
        }
    })?;

    // Line offsets covering the target document only.
    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = doc_start;
    for line in text[doc_start..doc_end].split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let target_line = locate_image_line(&lines, container).ok_or_else(|| {
        ResourceError::NoSuchContainer {
            id: id.clone(),
            container: container.to_string(),
            source_file: source.to_string(),
        }
    })?;

    let (line_offset, line) = lines[target_line];
    let stripped = line.strip_suffix('\n').unwrap_or(line);
    let replaced =
        replace_scalar(stripped, "image", &image.to_string()).ok_or_else(|| {
            ResourceError::NoSuchContainer {
                id: id.clone(),
                container: container.to_string(),
                source_file: source.to_string(),
            }
        })?;

    let mut out = String::with_capacity(text.len() + 16);
    out.push_str(&text[..line_offset]);
    out.push_str(&replaced);
    if line.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&text[line_offset + line.len()..]);
    Ok(out.into_bytes())
}

/// Finds the index (into `lines`) of the `image:` line belonging to the
/// container named `container`. Handles `image:` appearing before or after
/// `name:` within the item, and dash lines carrying the first key.
fn locate_image_line(lines: &[(usize, &str)], container: &str) -> Option<usize> {
    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx].1;
        if line.trim_end().trim_start() == "containers:" {
            let c_indent = indent_of(line);
            if let Some(found) = scan_items(lines, idx + 1, c_indent, container) {
                return Some(found);
            }
        }
        idx += 1;
    }
    None
}

fn scan_items(
    lines: &[(usize, &str)],
    mut idx: usize,
    c_indent: usize,
    container: &str,
) -> Option<usize> {
    // The list items may sit at the same indent as `containers:` or deeper.
    let mut item_indent = None;
    let mut current: Option<ContainerItem> = None;

    while idx < lines.len() {
        let raw = lines[idx].1;
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        if is_blank_or_comment(line) {
            idx += 1;
            continue;
        }
        let ind = indent_of(line);
        let trimmed = line.trim_start();

        let starts_item = trimmed.starts_with("- ") || trimmed == "-";
        match item_indent {
            None => {
                if starts_item && ind >= c_indent {
                    item_indent = Some(ind);
                } else {
                    // not a list after all
                    return None;
                }
            }
            Some(item_ind) => {
                let block_over = (ind < item_ind) || (ind == item_ind && !starts_item);
                if block_over {
                    break;
                }
            }
        }

        let item_ind = item_indent.unwrap_or(ind);
        let is_item_dash = starts_item && ind == item_ind;
        if is_item_dash {
            if let Some(done) = finish_item(current.take(), container) {
                return Some(done);
            }
            current = Some(ContainerItem {
                name: None,
                image_line: None,
                key_indent: None,
            });
        }

        if let Some(item) = current.as_mut() {
            if is_item_dash && trimmed != "-" {
                item.key_indent = Some(item_ind + 2);
            } else if item.key_indent.is_none() && !starts_item {
                item.key_indent = Some(ind);
            }
            // Only the item's own keys count: the dash line itself, or
            // continuation lines at the key column.
            let at_key_level =
                is_item_dash || (!starts_item && item.key_indent == Some(ind));
            if at_key_level {
                let content = trimmed.strip_prefix("- ").unwrap_or(trimmed);
                if let Some(rest) = content.strip_prefix("name:") {
                    let (value, _) = split_value(rest.trim_start());
                    item.name = Some(unquote(value).to_string());
                } else if content.starts_with("image:") {
                    item.image_line = Some(idx);
                }
            }
            if item.name.as_deref() == Some(container) {
                if let Some(image_line) = item.image_line {
                    return Some(image_line);
                }
            }
        }
        idx += 1;
    }
    finish_item(current, container)
}

fn finish_item(item: Option<ContainerItem>, container: &str) -> Option<usize> {
    let item = item?;
    if item.name.as_deref() == Some(container) {
        item.image_line
    } else {
        None
    }
}

fn quote_annotation(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Applies a policy update to the workload `id` in a manifest file by
/// rewriting its policy-prefixed annotation lines. Non-policy annotations
/// and every other line are untouched.
///
/// # Errors
///
/// Fails when the file has no document for `id` or is not UTF-8.
pub fn update_policies(
    file: &[u8],
    source: &str,
    id: &WorkloadId,
    update: &policy::Update,
) -> Result<Vec<u8>, ResourceError> {
    let text = std::str::from_utf8(file).map_err(|e| ResourceError::Parse {
        source_file: source.to_string(),
        reason: format!("not UTF-8: {e}"),
    })?;
    let (doc_start, doc_end) = find_document(source, text, id).ok_or_else(|| {
        ResourceError::NotFound {
            id: id.clone(),
            source_file: source.to_string(),
        }
    })?;

    let doc = &text[doc_start..doc_end];
    let resources = parse_file(source, doc.as_bytes())?;
    let resource: &Resource =
        resources
            .iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| ResourceError::NotFound {
                id: id.clone(),
                source_file: source.to_string(),
            })?;
    let new_annotations = update.apply_to(resource.policies.clone()).to_annotations();

    let lines: Vec<&str> = doc.split_inclusive('\n').collect();
    let rewritten = rewrite_annotations(&lines, &new_annotations);

    let mut out = String::with_capacity(text.len() + 64);
    out.push_str(&text[..doc_start]);
    out.push_str(&rewritten);
    out.push_str(&text[doc_end..]);
    Ok(out.into_bytes())
}

fn annotation_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);
    if trimmed.starts_with(ANNOTATION_PREFIX) {
        trimmed.split(':').next().map(|k| k.trim_end_matches('"'))
    } else {
        None
    }
}

fn rewrite_annotations(lines: &[&str], new_annotations: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    let mut idx = 0;

    // metadata: block bounds
    let metadata_at = lines
        .iter()
        .position(|l| l.trim_end().trim_start() == "metadata:" && indent_of(l) == 0);
    let Some(metadata_at) = metadata_at else {
        return lines.concat();
    };
    let meta_indent = indent_of(lines[metadata_at]);
    let mut metadata_end = lines.len();
    for (i, l) in lines.iter().enumerate().skip(metadata_at + 1) {
        if !is_blank_or_comment(l) && indent_of(l) <= meta_indent {
            metadata_end = i;
            break;
        }
    }

    let annotations_at = lines[metadata_at + 1..metadata_end]
        .iter()
        .position(|l| l.trim_end().trim_start() == "annotations:")
        .map(|p| p + metadata_at + 1);

    let policy_lines = |indent: usize| -> String {
        let pad = " ".repeat(indent);
        new_annotations
            .iter()
            .map(|(k, v)| format!("{pad}{k}: {}\n", quote_annotation(v)))
            .collect()
    };

    match annotations_at {
        Some(ann_at) => {
            let ann_indent = indent_of(lines[ann_at]);
            // bounds and item indent of the annotation entries
            let mut ann_end = metadata_end;
            for (i, l) in lines.iter().enumerate().skip(ann_at + 1) {
                if i >= metadata_end || (!is_blank_or_comment(l) && indent_of(l) <= ann_indent) {
                    ann_end = i.min(metadata_end);
                    break;
                }
            }
            let item_indent = lines[ann_at + 1..ann_end]
                .iter()
                .find(|l| !is_blank_or_comment(l))
                .map_or(ann_indent + 2, |l| indent_of(l));

            let kept: Vec<&str> = lines[ann_at + 1..ann_end]
                .iter()
                .filter(|l| annotation_key(l).is_none())
                .copied()
                .collect();

            while idx < lines.len() {
                if idx == ann_at {
                    if kept.is_empty() && new_annotations.is_empty() {
                        // drop the now-empty annotations: line entirely
                    } else {
                        out.push_str(lines[ann_at]);
                        out.push_str(&policy_lines(item_indent));
                        for l in &kept {
                            out.push_str(l);
                        }
                    }
                    idx = ann_end;
                    continue;
                }
                out.push_str(lines[idx]);
                idx += 1;
            }
        }
        None => {
            while idx < lines.len() {
                out.push_str(lines[idx]);
                if idx == metadata_at && !new_annotations.is_empty() {
                    let child_indent = lines[metadata_at + 1..metadata_end]
                        .iter()
                        .find(|l| !is_blank_or_comment(l))
                        .map_or(meta_indent + 2, |l| indent_of(l));
                    let pad = " ".repeat(child_indent);
                    out.push_str(&format!("{pad}annotations:\n"));
                    out.push_str(&policy_lines(child_indent + 2));
                }
                idx += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    const MANIFEST: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: hello # the greeter
  namespace: default
spec:
  replicas: 2
  template:
    spec:
      containers:
      - name: hello
        image: quay.io/team/hello:1.2 # pinned
        ports:
        - containerPort: 80
      - name: sidecar
        image: "team/sidecar:0.9"
"#;

    fn hello_id() -> WorkloadId {
        "default:Deployment/hello".parse().unwrap()
    }

    #[test]
    fn rewrites_only_the_named_container() {
        let image = ImageRef::parse("quay.io/team/hello:1.3").unwrap();
        let out = update_image(MANIFEST.as_bytes(), "hello.yaml", &hello_id(), "hello", &image)
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("image: quay.io/team/hello:1.3 # pinned"));
        assert!(out.contains("image: \"team/sidecar:0.9\""));
        // everything but the one line is byte-identical
        let diff: Vec<(&str, &str)> = MANIFEST
            .lines()
            .zip(out.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn preserves_quote_style() {
        let image = ImageRef::parse("team/sidecar:1.0").unwrap();
        let out = update_image(
            MANIFEST.as_bytes(),
            "hello.yaml",
            &hello_id(),
            "sidecar",
            &image,
        )
        .unwrap();
        assert!(String::from_utf8(out)
            .unwrap()
            .contains("image: \"team/sidecar:1.0\""));
    }

    #[test]
    fn image_before_name_is_found() {
        let manifest = r#"kind: Deployment
metadata:
  name: odd
spec:
  template:
    spec:
      containers:
      - image: team/app:v1
        name: app
"#;
        let id: WorkloadId = "default:Deployment/odd".parse().unwrap();
        let image = ImageRef::parse("team/app:v2").unwrap();
        let out = update_image(manifest.as_bytes(), "odd.yaml", &id, "app", &image).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("- image: team/app:v2"));
    }

    #[test]
    fn env_entries_do_not_shadow_the_container_name() {
        let manifest = r#"kind: Deployment
metadata:
  name: hello
spec:
  template:
    spec:
      containers:
      - name: hello
        env:
        - name: GREETING
          value: hi
        image: team/hello:v1
      - name: other
        image: team/other:v1
"#;
        let image = ImageRef::parse("team/hello:v2").unwrap();
        let out =
            update_image(manifest.as_bytes(), "hello.yaml", &hello_id(), "hello", &image)
                .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("image: team/hello:v2"));
        assert!(out.contains("image: team/other:v1"));
        assert!(out.contains("- name: GREETING"));
    }

    #[test]
    fn missing_container_is_an_error() {
        let image = ImageRef::parse("x:y").unwrap();
        assert!(matches!(
            update_image(MANIFEST.as_bytes(), "hello.yaml", &hello_id(), "nope", &image),
            Err(ResourceError::NoSuchContainer { .. })
        ));
    }

    #[test]
    fn missing_workload_is_an_error() {
        let id: WorkloadId = "default:Deployment/ghost".parse().unwrap();
        let image = ImageRef::parse("x:y").unwrap();
        assert!(matches!(
            update_image(MANIFEST.as_bytes(), "hello.yaml", &id, "hello", &image),
            Err(ResourceError::NotFound { .. })
        ));
    }

    #[test]
    fn multi_document_rewrite_targets_one_doc() {
        let file = format!(
            "{MANIFEST}---\nkind: Service\nmetadata:\n  name: hello\nspec:\n  ports:\n  - port: 80\n"
        );
        let image = ImageRef::parse("quay.io/team/hello:2.0").unwrap();
        let out =
            update_image(file.as_bytes(), "both.yaml", &hello_id(), "hello", &image).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("hello:2.0"));
        assert!(out.ends_with("- port: 80\n"));
    }

    #[test]
    fn adds_annotations_block_when_missing() {
        let update = policy::Update {
            add: policy::Set::new().add(Policy::Automated),
            remove: Default::default(),
        };
        let out =
            update_policies(MANIFEST.as_bytes(), "hello.yaml", &hello_id(), &update).unwrap();
        let reparsed = parse_file("hello.yaml", &out).unwrap();
        assert!(reparsed[0].policies.contains(&Policy::Automated));
        // untouched keys still present
        assert!(String::from_utf8(out).unwrap().contains("name: hello # the greeter"));
    }

    #[test]
    fn removes_policy_and_keeps_foreign_annotations() {
        let manifest = r#"kind: Deployment
metadata:
  name: hello
  annotations:
    team.example.com/owner: "platform"
    stevedore.io/automated: "true"
    stevedore.io/locked: "true"
spec:
  template:
    spec:
      containers:
      - name: hello
        image: team/hello:v1
"#;
        let update = policy::Update {
            add: policy::Set::new(),
            remove: [Policy::Locked].into_iter().collect(),
        };
        let out =
            update_policies(manifest.as_bytes(), "hello.yaml", &hello_id(), &update).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.contains("team.example.com/owner: \"platform\""));
        assert!(!text.contains("stevedore.io/locked"));
        let reparsed = parse_file("hello.yaml", &out).unwrap();
        assert!(reparsed[0].policies.contains(&Policy::Automated));
        assert!(!reparsed[0].policies.contains(&Policy::Locked));
    }

    #[test]
    fn lock_records_audit_metadata() {
        let update = policy::Update {
            add: policy::Set::new()
                .add(Policy::Locked)
                .set(Policy::LockedUser, "alice")
                .set(Policy::LockedMsg, "hands off"),
            remove: Default::default(),
        };
        let out =
            update_policies(MANIFEST.as_bytes(), "hello.yaml", &hello_id(), &update).unwrap();
        let reparsed = parse_file("hello.yaml", &out).unwrap();
        assert_eq!(reparsed[0].policies.get(&Policy::LockedUser), Some("alice"));
        assert_eq!(
            reparsed[0].policies.get(&Policy::LockedMsg),
            Some("hands off")
        );
    }
}
