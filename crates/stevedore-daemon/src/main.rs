//! stevedored, the continuous-deployment daemon.
//!
//! Wires the pieces together: clones the manifest repo, opens the job and
//! event stores, starts the HTTP API, the job-claim thread, and the
//! cooperative sync loop, then runs until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use stevedore_core::cluster::InMemoryCluster;
use stevedore_core::git::{Checkout, RepoConfig, DEFAULT_NOTES_REF, DEFAULT_SYNC_TAG};
use stevedore_core::history::EventStore;
use stevedore_core::jobs::{default_retention, default_staleness, JobStore};
use stevedore_core::keyring::KeyRing;
use stevedore_core::notify::SlackNotifier;
use stevedore_core::registry::{CachedRegistry, HttpRegistry};

use stevedore_daemon::{daemon::Daemon, server, sync_loop, worker};

/// stevedored reconciles a manifest repo against a cluster.
#[derive(Parser, Debug)]
#[command(name = "stevedored")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address the API listens on.
    #[arg(long, default_value = "127.0.0.1:3030")]
    listen: SocketAddr,

    /// SQLite database holding jobs and events.
    #[arg(long, default_value = "stevedore.db")]
    database: PathBuf,

    /// Clone URL of the manifest repository.
    #[arg(long)]
    git_url: String,

    /// Branch holding the manifests. Must be linear.
    #[arg(long, default_value = "main")]
    git_branch: String,

    /// Subdirectory of the repo containing manifests; empty for the root.
    #[arg(long, default_value = "")]
    git_path: String,

    /// Name of the moving tag marking the last applied commit.
    #[arg(long, default_value = DEFAULT_SYNC_TAG)]
    git_sync_tag: String,

    /// Notes ref carrying release provenance.
    #[arg(long, default_value = DEFAULT_NOTES_REF)]
    git_notes_ref: String,

    /// Directory holding the SSH identity secret, mounted read-write.
    #[arg(long)]
    ssh_secret_dir: Option<PathBuf>,

    /// File name of the identity within the secret directory.
    #[arg(long, default_value = "identity")]
    ssh_secret_key: String,

    /// Instance identity, namespacing jobs and events.
    #[arg(long, default_value = "default")]
    instance: String,

    /// Bearer token the API requires. Unauthenticated when unset.
    #[arg(long)]
    token: Option<String>,

    /// Seconds registry responses are cached.
    #[arg(long, default_value_t = 300)]
    registry_cache_ttl: u64,

    /// Slack incoming webhook for release notifications.
    #[arg(long)]
    slack_webhook: Option<String>,

    /// Username notifications post as.
    #[arg(long, default_value = "stevedore")]
    slack_username: String,

    /// Delete cluster resources that are no longer in the repo when
    /// syncing.
    #[arg(long)]
    delete_orphans: bool,

    /// Log filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("parsing log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Runtime::new().context("creating the Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    // SSH identity, when the repo needs one.
    let key_path = match &args.ssh_secret_dir {
        Some(dir) => {
            let ring = KeyRing::new(dir, &args.ssh_secret_key).context("loading SSH identity")?;
            let pair = ring.key_pair();
            tracing::info!(public_key = %pair.public_key, "git identity loaded");
            Some(pair.private_key_path)
        }
        None => None,
    };

    let repo = RepoConfig {
        url: args.git_url.clone(),
        branch: args.git_branch.clone(),
        path: args.git_path.clone(),
        sync_tag: args.git_sync_tag.clone(),
        notes_ref: Some(args.git_notes_ref.clone()),
        key_path,
    };

    tracing::info!(url = %repo.url, branch = %repo.branch, "cloning the manifest repo");
    let clone_repo = repo.clone();
    let checkout = tokio::task::spawn_blocking(move || Checkout::clone_repo(clone_repo))
        .await
        .context("joining the clone task")?
        .context("cloning the manifest repo")?;

    let jobs = Arc::new(
        JobStore::open(&args.database, default_retention(), default_staleness())
            .context("opening the job store")?,
    );
    let events =
        Arc::new(EventStore::open(&args.database).context("opening the event store")?);

    // Blocking HTTP clients are built off the async runtime.
    let cache_ttl = std::time::Duration::from_secs(args.registry_cache_ttl);
    let registry = tokio::task::spawn_blocking(move || {
        HttpRegistry::new().map(|client| Arc::new(CachedRegistry::new(client, cache_ttl)))
    })
    .await
    .context("joining the registry build task")?
    .context("building the registry client")?;
    // The orchestrator driver is a seam; the in-memory driver stands in
    // where no real driver is configured.
    let cluster = Arc::new(InMemoryCluster::new());

    let notifier = match args.slack_webhook.clone() {
        Some(url) => {
            let username = args.slack_username.clone();
            let notifier =
                tokio::task::spawn_blocking(move || SlackNotifier::new(url, username))
                    .await
                    .context("joining the notifier build task")?
                    .context("building the notifier")?;
            Some(Arc::new(notifier) as Arc<dyn stevedore_core::notify::Notifier>)
        }
        None => None,
    };

    let (sync_tx, sync_rx) = tokio::sync::mpsc::channel(1);
    let (jobs_tx, jobs_rx) = tokio::sync::mpsc::channel(1);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let mut daemon = Daemon::new(
        args.instance.clone(),
        checkout,
        cluster,
        registry,
        jobs,
        events,
        notifier,
        sync_tx,
    );
    daemon.delete_orphans = args.delete_orphans;
    let daemon = Arc::new(daemon);

    let poller_stop = Arc::new(AtomicBool::new(false));
    let poller = worker::spawn_job_poller(Arc::clone(&daemon), jobs_tx, Arc::clone(&poller_stop));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!(listen = %args.listen, "API listening");
    let app = server::router(Arc::clone(&daemon), args.token.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server exited");
        }
    });

    let loop_task = tokio::spawn(sync_loop::run(
        Arc::clone(&daemon),
        sync_rx,
        jobs_rx,
        stop_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("shutting down");
    poller_stop.store(true, Ordering::Relaxed);
    let _ = stop_tx.send(true);
    let _ = loop_task.await;
    server_task.abort();
    let _ = tokio::task::spawn_blocking(move || poller.join()).await;
    Ok(())
}
