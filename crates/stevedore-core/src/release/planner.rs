//! The release planner.
//!
//! Phases: snapshot the manifests, let the change-set compute updates,
//! apply them to the working tree, reload, and verify that the reloaded
//! tree is exactly the snapshot plus the planned updates. Committing and
//! pushing is the caller's move; a plan-kind release stops after planning.
//!
//! Verification is mandatory. The rewriter edits raw bytes, and a rewriter
//! bug that dropped a container or touched the wrong image would otherwise
//! sail into git unnoticed.

use std::collections::BTreeMap;

use tracing::info;

use crate::resource::Resource;
use crate::update::{ReleaseKind, ReleaseResult, WorkloadUpdate};
use crate::workload::WorkloadId;

use super::changes::Changes;
use super::{ReleaseContext, ReleaseError};

/// Runs a release through plan, apply, and verify. Returns the per-workload
/// result map; the working tree holds the applied updates on success.
///
/// # Errors
///
/// Fails on fatal conditions: unloadable manifests, failed writes, or any
/// verification discrepancy. Per-workload problems land in the result map
/// instead.
pub fn release(
    rc: &ReleaseContext<'_>,
    changes: &dyn Changes,
) -> Result<ReleaseResult, ReleaseError> {
    let before = rc
        .load_manifests()
        .map_err(|e| e.at_stage("loading manifests"))?;

    let mut result = ReleaseResult::new();
    let updates = changes.calculate_release(rc, &mut result)?;
    if updates.is_empty() {
        info!("no images to update for the workloads given");
        return Ok(result);
    }
    if changes.release_kind() == ReleaseKind::Plan {
        info!(updates = updates.len(), "plan only, not writing");
        return Ok(result);
    }

    rc.write_updates(&updates)
        .map_err(|e| e.at_stage("applying changes"))?;

    let after = rc
        .load_manifests()
        .map_err(|e| e.at_stage("verifying changes"))?;
    verify_changes(before, &updates, &after)?;

    Ok(result)
}

/// Checks that `after` is exactly `before` with `updates` applied: no
/// workload appeared or disappeared, no container list changed shape, and
/// every image is what the plan said it would be.
///
/// Consumes `before`: the check works by destructively applying the planned
/// updates to it, so the map is useless, and unobtainable, afterwards.
///
/// # Errors
///
/// Returns [`ReleaseError::Verification`] naming the first discrepancy.
pub fn verify_changes(
    mut before: BTreeMap<WorkloadId, Resource>,
    updates: &[WorkloadUpdate],
    after: &BTreeMap<WorkloadId, Resource>,
) -> Result<(), ReleaseError> {
    let fail = |reason: String| Err(ReleaseError::Verification { reason });

    for update in updates {
        let Some(resource) = before.get_mut(&update.id) else {
            return fail(format!(
                "workload {} mentioned in update not found in manifests",
                update.id
            ));
        };
        if !resource.is_workload() {
            return fail(format!("{} is not a workload", update.id));
        }
        for cu in &update.updates {
            resource.set_container_image(&cu.container, &cu.target);
        }
    }

    for (id, after_res) in after {
        let Some(before_res) = before.remove(id) else {
            return fail(format!("workload {id} is new after the update"));
        };
        let (Some(before_containers), Some(after_containers)) =
            (before_res.containers(), after_res.containers())
        else {
            if before_res.is_workload() != after_res.is_workload() {
                return fail(format!("{id} changed kind during the update"));
            }
            continue;
        };

        if before_containers.len() != after_containers.len() {
            return fail(format!(
                "{id} has {} containers after the update, expected {}",
                after_containers.len(),
                before_containers.len()
            ));
        }
        for (i, (b, a)) in before_containers.iter().zip(after_containers).enumerate() {
            if b.name != a.name {
                return fail(format!(
                    "container {i} of {id} is named {:?} after the update, expected {:?}",
                    a.name, b.name
                ));
            }
            if b.image != a.image {
                return fail(format!(
                    "container {:?} of {id} runs {} after the update, expected {}",
                    a.name, a.image, b.image
                ));
            }
        }
    }

    if !before.is_empty() {
        let gone: Vec<String> = before.keys().map(ToString::to_string).collect();
        return fail(format!(
            "workloads {{{}}} present before the update but not after",
            gone.join(", ")
        ));
    }
    Ok(())
}
