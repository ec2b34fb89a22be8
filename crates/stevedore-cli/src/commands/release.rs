//! `stevectl release`

use clap::Args;

use stevedore_core::api::ReleaseRequest;
use stevedore_core::image::ImageRef;
use stevedore_core::update::{Cause, ImageSpec, ReleaseKind, ReleaseSpec, ServiceSpec, UpdateSpec};
use stevedore_core::workload::WorkloadId;

use crate::client::{ApiClient, ClientError};
use crate::commands::{check_release, current_user};

#[derive(Args, Debug)]
pub struct ReleaseOpts {
    /// Workload to release to, as namespace/name. Repeatable.
    #[arg(long = "service", value_name = "WORKLOAD")]
    services: Vec<String>,

    /// Release to every workload in the repo.
    #[arg(long, conflicts_with = "services")]
    all: bool,

    /// Move the named containers to this exact image.
    #[arg(long, value_name = "IMAGE")]
    update_image: Option<String>,

    /// Move every container to the newest image matching its tag policy.
    #[arg(long, conflicts_with = "update_image")]
    update_all_images: bool,

    /// Workload to leave alone even if selected. Repeatable.
    #[arg(long = "exclude", value_name = "WORKLOAD")]
    excludes: Vec<String>,

    /// Plan only: report what would change without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Why this release is happening, for the audit trail.
    #[arg(short, long, default_value = "")]
    message: String,

    /// Print the release id and exit instead of following progress.
    #[arg(long)]
    no_follow: bool,

    /// Force simpler, non-TTY status output.
    #[arg(long)]
    no_tty: bool,
}

fn parse_ids(raw: &[String]) -> Result<Vec<WorkloadId>, ClientError> {
    raw.iter()
        .map(|s| {
            s.parse()
                .map_err(|e| ClientError::Usage(format!("--service {s}: {e}")))
        })
        .collect()
}

pub fn run(client: &ApiClient, opts: ReleaseOpts) -> Result<(), ClientError> {
    let services = if opts.all {
        ServiceSpec::All
    } else if opts.services.is_empty() {
        return Err(ClientError::Usage(
            "one of --service or --all is required".to_string(),
        ));
    } else {
        ServiceSpec::Ids(parse_ids(&opts.services)?)
    };

    let image = match (&opts.update_image, opts.update_all_images) {
        (Some(image), false) => ImageSpec::Exact(
            ImageRef::parse(image)
                .map_err(|e| ClientError::Usage(format!("--update-image: {e}")))?,
        ),
        (None, true) => ImageSpec::Latest,
        (None, false) => {
            return Err(ClientError::Usage(
                "one of --update-image or --update-all-images is required".to_string(),
            ))
        }
        (Some(_), true) => {
            return Err(ClientError::Usage(
                "--update-image and --update-all-images are mutually exclusive".to_string(),
            ))
        }
    };

    let spec = UpdateSpec::Images(ReleaseSpec {
        services,
        image,
        kind: if opts.dry_run {
            ReleaseKind::Plan
        } else {
            ReleaseKind::Execute
        },
        excludes: parse_ids(&opts.excludes)?,
    });

    let release_id = client.post_release(&ReleaseRequest {
        spec,
        cause: Cause {
            user: current_user(),
            message: opts.message,
        },
    })?;
    println!("Release queued: {release_id}");

    if opts.no_follow {
        println!("To check its progress:");
        println!("  stevectl check-release --release-id {release_id}");
        return Ok(());
    }
    check_release::follow(client, &release_id, opts.no_tty)
}
