//! Git command wrapper.
//!
//! All repository access shells out to `git` with explicit arguments,
//! prompts disabled, and system configuration ignored. Failures carry the
//! command's stderr; the one place git's output is interpreted is
//! [`classify`], which turns "unknown revision" and push-rejection chatter
//! into typed variants so callers can match instead of grepping strings.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;

/// Default name of the moving tag marking the last applied commit.
pub const DEFAULT_SYNC_TAG: &str = "stevedore-sync";

/// Default ref under which release provenance notes are stored.
pub const DEFAULT_NOTES_REF: &str = "stevedore";

const COMMIT_AUTHOR_NAME: &str = "Stevedore";
const COMMIT_AUTHOR_EMAIL: &str = "support@stevedore.io";

/// Errors from git operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GitError {
    /// A git command exited non-zero for an unclassified reason.
    #[error("git {args}: {reason}")]
    Command {
        /// The arguments the command ran with.
        args: String,
        /// Trimmed stderr (or stdout) of the failed command.
        reason: String,
    },

    /// A named revision does not exist. Callers treat a missing sync tag as
    /// "first run" and fall through to syncing everything.
    #[error("unknown revision {rev}")]
    UnknownRevision {
        /// The revision that could not be resolved.
        rev: String,
    },

    /// The remote rejected a push, most likely because someone else pushed
    /// first. The release that lost the race fails and is reported; the
    /// next cycle re-derives its work.
    #[error("push rejected: {reason}")]
    PushRejected {
        /// Trimmed stderr of the rejected push.
        reason: String,
    },

    /// Filesystem trouble around the working directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the manifest repository lives and how to address it.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Clone URL of the upstream repository.
    pub url: String,
    /// Branch holding the manifests. Must be linear.
    pub branch: String,
    /// Subdirectory of the repo containing manifests; empty means the root.
    pub path: String,
    /// Name of the moving sync-pointer tag.
    pub sync_tag: String,
    /// Notes ref for release provenance, if notes are wanted.
    pub notes_ref: Option<String>,
    /// SSH private key used for fetch and push, if the URL needs one.
    pub key_path: Option<PathBuf>,
}

impl RepoConfig {
    /// A config with the default tag and notes ref and no key.
    #[must_use]
    pub fn new(url: impl Into<String>, branch: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            path: path.into(),
            sync_tag: DEFAULT_SYNC_TAG.to_string(),
            notes_ref: Some(DEFAULT_NOTES_REF.to_string()),
            key_path: None,
        }
    }
}

/// A clone of the manifest repository in a scoped temporary directory.
///
/// The directory is removed when the checkout is dropped, on every exit
/// path.
pub struct Checkout {
    config: RepoConfig,
    _dir: TempDir,
    repo_dir: PathBuf,
}

impl Checkout {
    /// Clones the configured repository into a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Fails when the clone fails or the temp directory cannot be created.
    pub fn clone_repo(config: RepoConfig) -> Result<Self, GitError> {
        let dir = TempDir::new()?;
        let repo_dir = dir.path().join("repo");
        git(
            &[
                "clone",
                "--branch",
                &config.branch,
                &config.url,
                &repo_dir.to_string_lossy(),
            ],
            None,
            &config,
        )?;
        Ok(Self {
            config,
            _dir: dir,
            repo_dir,
        })
    }

    /// A fresh clone of the same upstream, for one release or sync to work
    /// in without disturbing this checkout.
    ///
    /// # Errors
    ///
    /// Fails when the clone fails.
    pub fn working_clone(&self) -> Result<Self, GitError> {
        Self::clone_repo(self.config.clone())
    }

    /// The repository configuration.
    #[must_use]
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Root of the clone.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Directory holding the manifests.
    #[must_use]
    pub fn manifest_dir(&self) -> PathBuf {
        if self.config.path.is_empty() {
            self.repo_dir.clone()
        } else {
            self.repo_dir.join(&self.config.path)
        }
    }

    /// Fetches and fast-forwards the branch. Tags are left alone: fetching
    /// a tag that moved upstream fails, and anything that cares about the
    /// sync tag works in a fresh clone which has the current one.
    ///
    /// # Errors
    ///
    /// Fails when the fetch or merge fails.
    pub fn pull(&self) -> Result<(), GitError> {
        self.run(&["pull", "--ff-only", "--no-tags", "origin", &self.config.branch])?;
        Ok(())
    }

    /// Whether the manifest subdirectory has uncommitted changes.
    ///
    /// # Errors
    ///
    /// Fails when git cannot diff the working tree.
    pub fn has_changes(&self) -> Result<bool, GitError> {
        let subdir = if self.config.path.is_empty() {
            "."
        } else {
            &self.config.path
        };
        // `--quiet` exits 1 when there are changes
        match self.run(&["diff", "--quiet", "--", subdir]) {
            Ok(_) => Ok(false),
            Err(GitError::Command { reason, .. }) if reason.is_empty() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Commits all changes in the working tree.
    ///
    /// # Errors
    ///
    /// Fails when the commit fails (including when there is nothing to
    /// commit).
    pub fn commit_all(&self, message: &str) -> Result<(), GitError> {
        self.run(&[
            "-c",
            &format!("user.name={COMMIT_AUTHOR_NAME}"),
            "-c",
            &format!("user.email={COMMIT_AUTHOR_EMAIL}"),
            "commit",
            "--no-verify",
            "-a",
            "-m",
            message,
        ])?;
        Ok(())
    }

    /// Pushes the branch upstream.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::PushRejected`] when the remote refuses the push
    /// (someone else pushed first).
    pub fn push(&self) -> Result<(), GitError> {
        self.run(&["push", "origin", &self.config.branch])?;
        Ok(())
    }

    /// Resolves a revision to a commit id.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::UnknownRevision`] when the revision does not
    /// exist.
    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    /// The current HEAD commit id.
    ///
    /// # Errors
    ///
    /// Fails when HEAD cannot be resolved.
    pub fn head_revision(&self) -> Result<String, GitError> {
        self.rev_parse("HEAD")
    }

    /// Commit ids reachable from `to` but not from `from`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::UnknownRevision`] when either end is missing.
    pub fn revisions_between(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["rev-list", "--reverse", &format!("{from}..{to}")])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// All commit ids up to and including `to`, oldest first.
    ///
    /// # Errors
    ///
    /// Fails when the revision cannot be listed.
    pub fn revisions_before(&self, to: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["rev-list", "--reverse", to])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Manifest files changed since `since`, as paths relative to the
    /// manifest directory.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::UnknownRevision`] when `since` is missing.
    pub fn changed_files(&self, since: &str) -> Result<Vec<String>, GitError> {
        let subdir = if self.config.path.is_empty() {
            ".".to_string()
        } else {
            self.config.path.clone()
        };
        let out = self.run(&["diff", "--name-only", since, "--", &subdir])?;
        let prefix = if self.config.path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.config.path.trim_end_matches('/'))
        };
        Ok(out
            .lines()
            .map(|l| l.strip_prefix(&prefix).unwrap_or(l).to_string())
            .collect())
    }

    /// Moves the sync tag to `rev` and force-pushes it.
    ///
    /// # Errors
    ///
    /// Fails when tagging or pushing fails.
    pub fn move_sync_tag_and_push(&self, rev: &str, message: &str) -> Result<(), GitError> {
        self.run(&[
            "-c",
            &format!("user.name={COMMIT_AUTHOR_NAME}"),
            "-c",
            &format!("user.email={COMMIT_AUTHOR_EMAIL}"),
            "tag",
            "--force",
            "-a",
            "-m",
            message,
            &self.config.sync_tag,
            rev,
        ])?;
        self.run(&["push", "--force", "origin", &format!("refs/tags/{}", self.config.sync_tag)])?;
        Ok(())
    }

    /// Attaches a provenance note to a commit and pushes the notes ref.
    /// A no-op when the config has no notes ref.
    ///
    /// # Errors
    ///
    /// Fails when adding or pushing the note fails.
    pub fn add_note(&self, rev: &str, note: &str) -> Result<(), GitError> {
        let Some(notes_ref) = &self.config.notes_ref else {
            return Ok(());
        };
        self.run(&[
            "-c",
            &format!("user.name={COMMIT_AUTHOR_NAME}"),
            "-c",
            &format!("user.email={COMMIT_AUTHOR_EMAIL}"),
            "notes",
            "--ref",
            notes_ref,
            "add",
            "-f",
            "-m",
            note,
            rev,
        ])?;
        self.run(&[
            "push",
            "origin",
            &format!("refs/notes/{notes_ref}:refs/notes/{notes_ref}"),
        ])?;
        Ok(())
    }

    /// Reads the provenance note attached to a commit, if any.
    ///
    /// # Errors
    ///
    /// Fails when git cannot be run; a missing note yields `Ok(None)`.
    pub fn note(&self, rev: &str) -> Result<Option<String>, GitError> {
        let Some(notes_ref) = &self.config.notes_ref else {
            return Ok(None);
        };
        match self.run(&["notes", "--ref", notes_ref, "show", rev]) {
            Ok(out) => Ok(Some(out.trim_end().to_string())),
            Err(GitError::Command { .. } | GitError::UnknownRevision { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        git(args, Some(&self.repo_dir), &self.config)
    }
}

/// Runs one git command, classifying failures.
fn git(args: &[&str], cwd: Option<&Path>, config: &RepoConfig) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    let ssh_base = "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";
    match &config.key_path {
        Some(key) => cmd.env(
            "GIT_SSH_COMMAND",
            format!("{ssh_base} -i {}", key.to_string_lossy()),
        ),
        None => cmd.env("GIT_SSH_COMMAND", ssh_base),
    };
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.args(args);

    let output = cmd.output().map_err(GitError::Io)?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let mut reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if reason.is_empty() {
        reason = String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
    Err(classify(args, reason))
}

/// Turns a failed command's stderr into a typed error. This is the only
/// place git's wording is inspected.
fn classify(args: &[&str], reason: String) -> GitError {
    let lower = reason.to_lowercase();
    if lower.contains("unknown revision or path not in the working tree")
        || lower.contains("bad revision")
    {
        let rev = args
            .iter()
            .rev()
            .find(|a| !a.starts_with('-'))
            .map_or_else(String::new, |a| (*a).to_string());
        return GitError::UnknownRevision { rev };
    }
    if lower.contains("[rejected]")
        || lower.contains("non-fast-forward")
        || lower.contains("fetch first")
        || lower.contains("failed to push some refs")
    {
        return GitError::PushRejected { reason };
    }
    GitError::Command {
        args: args.join(" "),
        reason,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> RepoConfig {
        RepoConfig::new(url, "main", "")
    }

    #[test]
    fn clone_commit_push_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let url = gittest::seed_upstream(root.path(), &[("hello.yaml", "kind: x\n")]);

        let checkout = Checkout::clone_repo(config(&url)).unwrap();
        assert!(!checkout.has_changes().unwrap());

        std::fs::write(checkout.dir().join("hello.yaml"), "kind: y\n").unwrap();
        assert!(checkout.has_changes().unwrap());
        checkout.commit_all("change hello").unwrap();
        checkout.push().unwrap();

        let fresh = Checkout::clone_repo(config(&url)).unwrap();
        assert_eq!(
            std::fs::read_to_string(fresh.dir().join("hello.yaml")).unwrap(),
            "kind: y\n"
        );
    }

    #[test]
    fn missing_sync_tag_is_typed() {
        let root = tempfile::tempdir().unwrap();
        let url = gittest::seed_upstream(root.path(), &[("a.yaml", "kind: x\n")]);
        let checkout = Checkout::clone_repo(config(&url)).unwrap();

        let err = checkout
            .revisions_between(&format!("{DEFAULT_SYNC_TAG}~1"), "HEAD")
            .unwrap_err();
        assert!(matches!(err, GitError::UnknownRevision { .. }));

        // first run: everything up to HEAD
        let all = checkout.revisions_before("HEAD").unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn sync_tag_moves_and_survives_reclone() {
        let root = tempfile::tempdir().unwrap();
        let url = gittest::seed_upstream(root.path(), &[("a.yaml", "kind: x\n")]);
        let checkout = Checkout::clone_repo(config(&url)).unwrap();
        let head = checkout.head_revision().unwrap();
        checkout
            .move_sync_tag_and_push(&head, "Sync pointer")
            .unwrap();

        gittest::push_change(root.path(), &url, "a.yaml", "kind: y\n");

        let fresh = Checkout::clone_repo(config(&url)).unwrap();
        let revisions = fresh
            .revisions_between(DEFAULT_SYNC_TAG, "HEAD")
            .unwrap();
        assert_eq!(revisions.len(), 1);
        let changed = fresh.changed_files(DEFAULT_SYNC_TAG).unwrap();
        assert_eq!(changed, vec!["a.yaml".to_string()]);
    }

    #[test]
    fn push_race_loser_gets_typed_rejection() {
        let root = tempfile::tempdir().unwrap();
        let url = gittest::seed_upstream(root.path(), &[("a.yaml", "kind: x\n")]);

        let loser = Checkout::clone_repo(config(&url)).unwrap();
        gittest::push_change(root.path(), &url, "a.yaml", "kind: winner\n");

        std::fs::write(loser.dir().join("a.yaml"), "kind: loser\n").unwrap();
        loser.commit_all("lose the race").unwrap();
        let err = loser.push().unwrap_err();
        assert!(matches!(err, GitError::PushRejected { .. }));
    }

    #[test]
    fn notes_carry_provenance() {
        let root = tempfile::tempdir().unwrap();
        let url = gittest::seed_upstream(root.path(), &[("a.yaml", "kind: x\n")]);
        let checkout = Checkout::clone_repo(config(&url)).unwrap();
        let head = checkout.head_revision().unwrap();

        assert_eq!(checkout.note(&head).unwrap(), None);
        checkout.add_note(&head, r#"{"job":"j-1"}"#).unwrap();
        assert_eq!(
            checkout.note(&head).unwrap().as_deref(),
            Some(r#"{"job":"j-1"}"#)
        );
    }

    #[test]
    fn manifest_dir_respects_subdirectory() {
        let root = tempfile::tempdir().unwrap();
        let url = gittest::seed_upstream(root.path(), &[("deploy/a.yaml", "kind: x\n")]);
        let mut cfg = config(&url);
        cfg.path = "deploy".to_string();
        let checkout = Checkout::clone_repo(cfg).unwrap();
        assert!(checkout.manifest_dir().join("a.yaml").exists());

        gittest::push_change(root.path(), &url, "deploy/a.yaml", "kind: y\n");
        let head = checkout.head_revision().unwrap();
        checkout.move_sync_tag_and_push(&head, "Sync pointer").unwrap();
        let fresh = Checkout::clone_repo({
            let mut c = config(&url);
            c.path = "deploy".to_string();
            c
        })
        .unwrap();
        let changed = fresh.changed_files(DEFAULT_SYNC_TAG).unwrap();
        assert_eq!(changed, vec!["a.yaml".to_string()]);
    }
}
