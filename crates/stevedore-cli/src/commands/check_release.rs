//! `stevectl check-release`

use std::time::Duration;

use chrono::Utc;
use clap::Args;

use stevedore_core::jobs::{Job, JobParams, ReleaseJobParams};
use stevedore_core::update::ReleaseKind;

use crate::client::{ApiClient, ClientError};

/// A heartbeat older than this earns a worker-crash warning.
const LARGEST_HEARTBEAT_DELTA: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Args, Debug)]
pub struct CheckReleaseOpts {
    /// The release id to check.
    #[arg(short = 'r', long)]
    release_id: String,

    /// Dump the release job as JSON instead of following it.
    #[arg(long)]
    no_follow: bool,

    /// Force simpler, non-TTY status output.
    #[arg(long)]
    no_tty: bool,
}

pub fn run(client: &ApiClient, opts: CheckReleaseOpts) -> Result<(), ClientError> {
    if opts.no_follow {
        let job = client.get_job(&opts.release_id)?;
        let rendered = serde_json::to_string_pretty(&job)
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        println!("{rendered}");
        return Ok(());
    }
    follow(client, &opts.release_id, opts.no_tty)
}

fn release_kind(job: &Job) -> Option<ReleaseKind> {
    match &job.params {
        JobParams::Release(ReleaseJobParams { spec, .. }) => match spec {
            stevedore_core::update::UpdateSpec::Images(release) => Some(release.kind),
            stevedore_core::update::UpdateSpec::Automated(_) => Some(ReleaseKind::Execute),
            stevedore_core::update::UpdateSpec::Policies(_) => Some(ReleaseKind::Execute),
        },
        JobParams::AutomatedInstance(_) => None,
    }
}

/// Polls a job once a second, echoing status changes, until it finishes;
/// then prints its log with the appropriate banner.
pub fn follow(client: &ApiClient, release_id: &str, _no_tty: bool) -> Result<(), ClientError> {
    let mut previous = String::new();
    let job = loop {
        let job = client.get_job(release_id)?;

        let mut status = if job.claimed_at.is_none() {
            "Waiting for the job to be claimed...".to_string()
        } else {
            job.status.clone()
        };
        if let Some(heartbeat) = job.heartbeat_at {
            let silence = Utc::now().signed_duration_since(heartbeat);
            if !job.done && silence.num_seconds() > LARGEST_HEARTBEAT_DELTA.as_secs() as i64 {
                status.push_str(&format!(
                    " (warning: no heartbeat in {}s, the worker may have crashed)",
                    silence.num_seconds()
                ));
            }
        }
        if status != previous {
            println!("Status: {status}");
            previous = status;
        }
        if job.is_finished() {
            break job;
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    println!();
    if !job.success {
        println!("Here's as far as we got:");
    } else if release_kind(&job) == Some(ReleaseKind::Plan) {
        println!("Here's the plan:");
    } else {
        println!("Here's what happened:");
    }
    for (i, line) in job.log.iter().enumerate() {
        println!(" {}) {line}", i + 1);
    }

    if job.success && release_kind(&job) == Some(ReleaseKind::Execute) {
        let took = Utc::now().signed_duration_since(job.submitted_at);
        println!("Took {}s", took.num_seconds());
    }

    if job.success {
        Ok(())
    } else {
        Err(ClientError::Api {
            status: 400,
            message: "release failed; see the log above".to_string(),
        })
    }
}
