//! The job worker.
//!
//! Claims jobs, runs their handlers, and writes the outcome back. A
//! heartbeat thread keeps the claim fresh for as long as the handler runs;
//! handler errors never escape: they become `done=true, success=false`
//! with the error in the log, which is what `check-release` shows the user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use stevedore_core::history::{Event, EventMetadata, EventType};
use stevedore_core::jobs::{
    Job, JobError, JobParams, ReleaseJobParams, METHOD_AUTOMATED_INSTANCE, METHOD_RELEASE,
};
use stevedore_core::policy::{self, Policy};
use stevedore_core::release::{release, Changeset, Changes, ReleaseContext};
use stevedore_core::resource;
use stevedore_core::update::{ReleaseKind, ReleaseResult, UpdateSpec};
use stevedore_core::workload::WorkloadId;

use crate::daemon::{Daemon, DaemonError};

/// How often a busy worker refreshes its claim. Strictly below the
/// reaper's staleness threshold.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// How long an idle poller naps between claim attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The queues this worker serves.
pub const WORKER_QUEUES: &[&str] = &[METHOD_RELEASE, METHOD_AUTOMATED_INSTANCE];

/// Spawns the claim thread: it blocks on the queue and feeds claimed jobs
/// into `tx` for the daemon loop to execute. Exits when `stop` is set or
/// the receiving side goes away.
pub fn spawn_job_poller(
    daemon: Arc<Daemon>,
    tx: tokio::sync::mpsc::Sender<Job>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match daemon.jobs.next_job(WORKER_QUEUES) {
                Ok(job) => {
                    if tx.blocking_send(job).is_err() {
                        return;
                    }
                }
                Err(JobError::NoJobAvailable) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    error!(error = %e, "claiming next job");
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    })
}

/// Runs one claimed job to completion and writes the outcome (plus any
/// follow-up jobs, atomically) back to the store. Returns whether the job
/// succeeded, so the caller can ask for a sync.
pub fn handle_job(daemon: &Daemon, mut job: Job) -> bool {
    info!(job = %job.id, method = %job.method, "running job");

    let hb_stop = Arc::new(AtomicBool::new(false));
    let heartbeater = {
        let jobs = Arc::clone(&daemon.jobs);
        let stop = Arc::clone(&hb_stop);
        let id = job.id;
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(HEARTBEAT_INTERVAL);
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = jobs.heartbeat(id) {
                    warn!(job = %id, error = %e, "heartbeat failed");
                }
            }
        })
    };

    let (follow_ups, outcome) = match job.params.clone() {
        JobParams::Release(params) => (Vec::new(), handle_release(daemon, &mut job, &params)),
        JobParams::AutomatedInstance(_) => {
            let mut log = Vec::new();
            let (follow_ups, outcome) = daemon.handle_automated_instance(&mut log);
            job.log.extend(log);
            (follow_ups, outcome)
        }
    };

    hb_stop.store(true, Ordering::Relaxed);
    let _ = heartbeater.join();

    job.done = true;
    match outcome {
        Ok(()) => {
            job.success = true;
            job.status = "Complete.".to_string();
        }
        Err(e) => {
            job.success = false;
            job.status = format!("Failed: {e}");
            error!(job = %job.id, error = %e, "job failed");
        }
    }
    job.log.push(job.status.clone());

    if let Err(e) = daemon.jobs.finish_job(&job, follow_ups) {
        error!(job = %job.id, error = %e, "writing job outcome");
    }
    job.success
}

/// Appends a progress line and persists it, so `check-release` followers
/// see the stage the release is in.
fn progress(daemon: &Daemon, job: &mut Job, message: impl Into<String>) {
    let message = message.into();
    job.status.clone_from(&message);
    job.log.push(message);
    if let Err(e) = daemon.jobs.update_job(job) {
        warn!(job = %job.id, error = %e, "persisting job progress");
    }
}

fn handle_release(
    daemon: &Daemon,
    job: &mut Job,
    params: &ReleaseJobParams,
) -> Result<(), DaemonError> {
    if let UpdateSpec::Policies(updates) = &params.spec {
        return handle_policy_update(daemon, job, updates);
    }

    let outcome = run_release(daemon, job, params);
    let (result, error) = match &outcome {
        Ok(result) => (result.clone(), None),
        Err(e) => (ReleaseResult::new(), Some(e.to_string())),
    };

    let event = Event::now(
        EventType::Release,
        result.service_ids(),
        EventMetadata::Release {
            spec: params.spec.clone(),
            cause: params.cause.clone(),
            result: result.clone(),
            job: Some(job.id),
            error: error.clone(),
        },
    );
    if let Err(e) = daemon.events.log_event(&daemon.instance, &event) {
        warn!(error = %e, "recording release event");
    }
    if let Some(notifier) = &daemon.notifier {
        if let Err(e) = notifier.post_release(&params.spec, &result, error.as_deref()) {
            warn!(error = %e, "posting release notification");
        }
    }
    outcome.map(|_| ())
}

fn run_release(
    daemon: &Daemon,
    job: &mut Job,
    params: &ReleaseJobParams,
) -> Result<ReleaseResult, DaemonError> {
    let Some(changes) = Changeset::from_spec(params.spec.clone()) else {
        return Err(DaemonError::User("spec is not releasable".to_string()));
    };

    progress(daemon, job, "Cloning the manifest repository.");
    let working = {
        let checkout = daemon.checkout.lock().expect("checkout lock");
        checkout.working_clone()?
    };
    let rc = ReleaseContext::new(working, daemon.cluster.as_ref(), daemon.registry.as_ref());

    progress(daemon, job, "Calculating the release.");
    let result = release(&rc, &changes)?;
    for line in result.to_string().lines() {
        job.log.push(line.to_string());
    }

    if changes.release_kind() == ReleaseKind::Execute && rc.checkout().has_changes()? {
        progress(daemon, job, "Committing and pushing the release.");
        rc.checkout().commit_all(&changes.commit_message(&result))?;
        rc.checkout().push()?;

        match rc.checkout().head_revision() {
            Ok(rev) => {
                let note = json!({
                    "job": job.id,
                    "spec": params.spec,
                    "cause": params.cause,
                    "result": result,
                });
                if let Err(e) = rc.checkout().add_note(&rev, &note.to_string()) {
                    warn!(error = %e, "attaching release note");
                }
                job.log.push(format!("Pushed {rev}."));
            }
            Err(e) => warn!(error = %e, "resolving released revision"),
        }
    } else {
        job.log.push("No changes to push.".to_string());
    }
    Ok(result)
}

fn handle_policy_update(
    daemon: &Daemon,
    job: &mut Job,
    updates: &std::collections::BTreeMap<WorkloadId, policy::Update>,
) -> Result<(), DaemonError> {
    progress(daemon, job, "Cloning the manifest repository.");
    let working = {
        let checkout = daemon.checkout.lock().expect("checkout lock");
        checkout.working_clone()?
    };
    let manifest_dir = working.manifest_dir();
    let manifests = resource::load(&manifest_dir)?;

    progress(daemon, job, "Updating policies.");
    let mut touched = Vec::new();
    for (id, update) in updates {
        let Some(res) = manifests.get(id) else {
            return Err(DaemonError::User(format!("{id} is not in the repository")));
        };
        let path = manifest_dir.join(&res.source);
        let bytes = std::fs::read(&path).map_err(|e| resource::ResourceError::Io {
            path: path.clone(),
            source: e,
        })?;
        let rewritten = resource::update_policies(&bytes, &res.source, id, update)?;
        std::fs::write(&path, rewritten).map_err(|e| resource::ResourceError::Io {
            path: path.clone(),
            source: e,
        })?;
        touched.push(id.clone());
        job.log.push(format!("Updated policies for {id}."));
    }

    if working.has_changes()? {
        progress(daemon, job, "Committing and pushing policy changes.");
        let ids: Vec<String> = touched.iter().map(ToString::to_string).collect();
        working.commit_all(&format!("Update policies for {}", ids.join(", ")))?;
        working.push()?;
    } else {
        job.log.push("Policies already as requested.".to_string());
    }

    for (id, update) in updates {
        for (event_type, policy) in [
            (EventType::Automate, Policy::Automated),
            (EventType::Lock, Policy::Locked),
        ] {
            if update.add.contains(&policy) {
                log_policy_event(daemon, event_type, id);
            }
        }
        for (event_type, policy) in [
            (EventType::Deautomate, Policy::Automated),
            (EventType::Unlock, Policy::Locked),
        ] {
            if update.remove.contains(&policy) {
                log_policy_event(daemon, event_type, id);
            }
        }
    }
    Ok(())
}

fn log_policy_event(daemon: &Daemon, event_type: EventType, id: &WorkloadId) {
    let event = Event::now(event_type, vec![id.clone()], EventMetadata::None);
    if let Err(e) = daemon.events.log_event(&daemon.instance, &event) {
        warn!(error = %e, "recording policy event");
    }
}
