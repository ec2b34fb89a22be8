//! The daemon's cooperative loop.
//!
//! One `select!` over: the stop signal, the coalesced sync request, the git
//! poll timer, the image poll timer, the queue GC timer, and the channel of
//! claimed jobs. Sync requests coalesce through a depth-1 channel: however
//! many times `ask_for_sync` fires while a sync is pending, at most one
//! more sync runs. The loop swallows (and logs) transient errors; it exits
//! only on the stop signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use stevedore_core::git::GitError;
use stevedore_core::history::{Event, EventMetadata, EventType, LogLevel};
use stevedore_core::jobs::Job;
use stevedore_core::resource;
use stevedore_core::sync;
use stevedore_core::workload::WorkloadId;

use crate::daemon::Daemon;
use crate::worker;

/// How often to poll git for new commits.
pub const GIT_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// How often to poll the registry for new images.
pub const IMAGE_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// How often to GC the job queue and reap stale claims.
pub const JOB_GC_INTERVAL: Duration = Duration::from_secs(60);

impl Daemon {
    /// One sync pass: pull, apply everything to the cluster, record a sync
    /// event for the revisions applied, and advance the sync pointer.
    /// Errors are logged, never returned; the next cycle retries.
    pub fn pull_and_sync(&self) {
        let started = Utc::now();

        let working = {
            let checkout = self.checkout.lock().expect("checkout lock");
            if let Err(e) = checkout.pull() {
                error!(error = %e, "pulling the manifest repo");
                return;
            }
            match checkout.working_clone() {
                Ok(working) => working,
                Err(e) => {
                    error!(error = %e, "creating working clone");
                    return;
                }
            }
        };
        let sync_tag = working.config().sync_tag.clone();

        // Revisions to attribute to this sync. A missing tag is the first
        // run: everything up to HEAD.
        let revisions = match working.revisions_between(&format!("{sync_tag}~1"), "HEAD") {
            Ok(revisions) => revisions,
            Err(GitError::UnknownRevision { .. }) => {
                match working.revisions_before("HEAD") {
                    Ok(revisions) => revisions,
                    Err(e) => {
                        error!(error = %e, "listing revisions");
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "listing revisions since sync tag");
                Vec::new()
            }
        };

        let all_resources = match resource::load(&working.manifest_dir()) {
            Ok(resources) => resources,
            Err(e) => {
                error!(error = %e, "loading manifests from the repo");
                return;
            }
        };
        if let Err(e) = sync::sync(&all_resources, self.cluster.as_ref(), self.delete_orphans) {
            error!(error = %e, "applying manifests to the cluster");
        }

        // Which workloads changed, for the event. A missing tag means we
        // synced everything from scratch.
        let changed_ids: Vec<WorkloadId> = match working.changed_files(&sync_tag) {
            Ok(files) => {
                let existing: Vec<String> = files
                    .into_iter()
                    .filter(|f| working.manifest_dir().join(f).exists())
                    .collect();
                match resource::load_files(&working.manifest_dir(), &existing) {
                    Ok(changed) => changed.keys().cloned().collect(),
                    Err(e) => {
                        error!(error = %e, "loading changed manifests");
                        Vec::new()
                    }
                }
            }
            Err(GitError::UnknownRevision { .. }) => all_resources.keys().cloned().collect(),
            Err(e) => {
                error!(error = %e, "listing changed files");
                Vec::new()
            }
        };

        if !revisions.is_empty() {
            let event = Event {
                id: None,
                workload_ids: changed_ids,
                event_type: EventType::Sync,
                started_at: started,
                ended_at: Utc::now(),
                log_level: LogLevel::Info,
                metadata: EventMetadata::Sync {
                    revisions: revisions.clone(),
                },
            };
            if let Err(e) = self.events.log_event(&self.instance, &event) {
                error!(error = %e, "recording sync event");
            }
        }

        if let Err(e) = working.move_sync_tag_and_push("HEAD", "Sync pointer") {
            error!(error = %e, "moving the sync tag");
        }
        debug!(revisions = revisions.len(), "sync complete");
    }
}

/// Runs the loop until `stop` changes. `sync_rx` must be the receiver half
/// of the daemon's depth-1 sync channel; `jobs_rx` delivers claimed jobs
/// from the poller thread.
pub async fn run(
    daemon: Arc<Daemon>,
    mut sync_rx: mpsc::Receiver<()>,
    mut jobs_rx: mpsc::Receiver<Job>,
    mut stop: watch::Receiver<bool>,
) {
    // Ask for a sync straight away; timers start one period out.
    daemon.ask_for_sync();
    let mut git_poll = interval_at(Instant::now() + GIT_POLL_INTERVAL, GIT_POLL_INTERVAL);
    let mut image_poll = interval_at(Instant::now() + IMAGE_POLL_INTERVAL, IMAGE_POLL_INTERVAL);
    let mut job_gc = interval_at(Instant::now() + JOB_GC_INTERVAL, JOB_GC_INTERVAL);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("stopping the sync loop");
                return;
            }
            Some(()) = sync_rx.recv() => {
                let d = Arc::clone(&daemon);
                let _ = tokio::task::spawn_blocking(move || d.pull_and_sync()).await;
                git_poll.reset();
            }
            _ = git_poll.tick() => {
                // time to look for new commits, unless a sync is pending
                daemon.ask_for_sync();
            }
            _ = image_poll.tick() => {
                let d = Arc::clone(&daemon);
                let _ = tokio::task::spawn_blocking(move || d.check_automation()).await;
            }
            _ = job_gc.tick() => {
                let d = Arc::clone(&daemon);
                let _ = tokio::task::spawn_blocking(move || {
                    match d.jobs.gc() {
                        Ok((removed, requeued)) if removed > 0 || requeued > 0 => {
                            info!(removed, requeued, "job queue GC");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "job queue GC"),
                    }
                })
                .await;
            }
            Some(job) = jobs_rx.recv() => {
                let d = Arc::clone(&daemon);
                let id = job.id;
                let success = tokio::task::spawn_blocking(move || worker::handle_job(&d, job))
                    .await
                    .unwrap_or(false);
                if success {
                    info!(job = %id, "job succeeded");
                    // a successful release probably pushed a commit, so
                    // pull and apply it
                    daemon.ask_for_sync();
                }
            }
        }
    }
}
