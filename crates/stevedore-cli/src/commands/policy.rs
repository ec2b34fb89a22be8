//! `stevectl policy`

use std::collections::BTreeMap;

use clap::Args;

use stevedore_core::api::PolicyRequest;
use stevedore_core::policy::{Policy, Set, Update};
use stevedore_core::update::Cause;
use stevedore_core::workload::WorkloadId;

use crate::client::{ApiClient, ClientError};
use crate::commands::{check_release, current_user};

#[derive(Args, Debug)]
pub struct PolicyOpts {
    /// Workload to change, as namespace/name.
    #[arg(long)]
    service: String,

    /// Allow the image poller to release newer images to this workload.
    #[arg(long, conflicts_with = "deautomate")]
    automate: bool,

    /// Stop the image poller touching this workload.
    #[arg(long)]
    deautomate: bool,

    /// Refuse all updates to this workload until unlocked.
    #[arg(long, conflicts_with = "unlock")]
    lock: bool,

    /// Allow updates to this workload again.
    #[arg(long)]
    unlock: bool,

    /// Restrict a container's releasable tags: container=glob. Repeatable.
    #[arg(long = "tag", value_name = "CONTAINER=GLOB")]
    tags: Vec<String>,

    /// Restrict tags for containers without a specific --tag.
    #[arg(long, value_name = "GLOB")]
    tag_all: Option<String>,

    /// Why, for the audit trail.
    #[arg(short, long, default_value = "")]
    message: String,

    /// Print the job id and exit instead of following progress.
    #[arg(long)]
    no_follow: bool,
}

pub fn run(client: &ApiClient, opts: PolicyOpts) -> Result<(), ClientError> {
    let id: WorkloadId = opts
        .service
        .parse()
        .map_err(|e| ClientError::Usage(format!("--service {}: {e}", opts.service)))?;

    let mut add = Set::new();
    let mut remove = std::collections::BTreeSet::new();
    if opts.automate {
        add = add.add(Policy::Automated);
    }
    if opts.deautomate {
        remove.insert(Policy::Automated);
    }
    if opts.lock {
        add = add.add(Policy::Locked).set(Policy::LockedUser, current_user());
        if !opts.message.is_empty() {
            add = add.set(Policy::LockedMsg, opts.message.clone());
        }
    }
    if opts.unlock {
        remove.insert(Policy::Locked);
        remove.insert(Policy::LockedUser);
        remove.insert(Policy::LockedMsg);
    }
    for tag in &opts.tags {
        let (container, glob) = tag.split_once('=').ok_or_else(|| {
            ClientError::Usage(format!("--tag {tag}: expected container=glob"))
        })?;
        add = add.set(Policy::Tag(container.to_string()), glob);
    }
    if let Some(glob) = &opts.tag_all {
        add = add.set(Policy::TagAll, glob.clone());
    }
    if add.is_empty() && remove.is_empty() {
        return Err(ClientError::Usage(
            "nothing to change; pass --automate, --lock, --tag, ...".to_string(),
        ));
    }

    let mut updates = BTreeMap::new();
    updates.insert(id, Update { add, remove });
    let release_id = client.post_policy(&PolicyRequest {
        updates,
        cause: Cause {
            user: current_user(),
            message: opts.message,
        },
    })?;
    println!("Policy change queued: {release_id}");

    if opts.no_follow {
        return Ok(());
    }
    check_release::follow(client, &release_id, false)
}
