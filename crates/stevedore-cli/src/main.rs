//! stevectl, the command-line client for the stevedore daemon.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use client::ApiClient;

/// stevectl drives releases and policies on a stevedore daemon.
#[derive(Parser, Debug)]
#[command(name = "stevectl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of the daemon API.
    #[arg(long, default_value = "http://127.0.0.1:3030", env = "STEVEDORE_URL")]
    url: String,

    /// Bearer token for the API.
    #[arg(long, env = "STEVEDORE_TOKEN")]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the workloads running in the cluster.
    ListServices,

    /// List the images running and available for workloads.
    ListImages {
        /// Only this workload, as namespace/name.
        #[arg(long)]
        service: Option<String>,
    },

    /// Release new image(s) to workloads.
    Release(commands::release::ReleaseOpts),

    /// Change the policies on a workload.
    Policy(commands::policy::PolicyOpts),

    /// Check the status of a release.
    CheckRelease(commands::check_release::CheckReleaseOpts),

    /// Print the manifests for deploying the daemon itself.
    Install(commands::install::InstallOpts),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

fn run(cli: Cli) -> Result<(), client::ClientError> {
    let client = ApiClient::new(&cli.url, cli.token.clone())?;
    match cli.command {
        Commands::ListServices => commands::list_services::run(&client),
        Commands::ListImages { service } => {
            commands::list_images::run(&client, service.as_deref())
        }
        Commands::Release(opts) => commands::release::run(&client, opts),
        Commands::Policy(opts) => commands::policy::run(&client, opts),
        Commands::CheckRelease(opts) => commands::check_release::run(&client, opts),
        Commands::Install(opts) => commands::install::run(&opts),
    }
}
