//! CLI command definitions for firefleet.
//!
//! `run` drives a whole request, `stop-orphaned` sweeps instances left behind
//! by runs that never cleaned up, and `config` prints schema-derived help.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use regex::Regex;
use tracing::{info, warn};

use crate::aws::AwsCli;
use crate::config::{example_document, Config, ConfigDocs};
use crate::fleet::{
    select_orphans, Ec2Provisioner, PoolServices, ShutdownMode, SshAutoShutdown, SshInitializer,
};
use crate::notify::LogNotifier;
use crate::orchestrator::{Collaborators, ParallelOrchestrator, RunOptions};
use crate::remote::{RemoteTransport, SshOptions, SshTransport};
use crate::shutdown::{spawn_signal_listener, ShutdownToken};
use crate::status::ObjectStoreStatusSink;
use crate::storage::{LocalStore, ObjectStore, S3Store};

/// Run batches of BlueSky fire simulations across ephemeral EC2 instances.
#[derive(Parser)]
#[command(name = "firefleet")]
#[command(about = "Run batches of BlueSky fire simulations across ephemeral EC2 instances")]
#[command(version)]
#[command(
    long_about = "firefleet runs every fire of an input batch on its own EC2 instance, in parallel.\n\nExisting instances are used first; any shortfall is launched and terminated as soon as its run finishes.\n\nExample usage:\n  firefleet run fires.json -c config.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every fire in an input batch.
    Run(RunArgs),

    /// Stop or terminate instances left running by earlier runs.
    StopOrphaned(StopOrphanedArgs),

    /// Show configuration help.
    Config(ConfigArgs),
}

/// Arguments for `firefleet run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input file path or http(s) URL.
    pub input: String,

    /// Configuration file (.json, .yaml or .yml).
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Address of an already-running instance to use; repeatable.
    #[arg(long = "existing", value_name = "ADDRESS")]
    pub existing: Vec<String>,

    /// Override the configured request id.
    #[arg(long)]
    pub request_id: Option<String>,

    /// Publish artifacts to this directory instead of S3.
    #[arg(long, value_name = "DIR")]
    pub local_store: Option<PathBuf>,
}

/// Arguments for `firefleet stop-orphaned`.
#[derive(Parser, Debug)]
pub struct StopOrphanedArgs {
    /// Configuration file; supplies the region.
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Minimum age in hours.
    #[arg(long, default_value = "24")]
    pub hours: f64,

    /// Regular expression matched against instance names.
    #[arg(long, default_value = "^bluesky-aws-")]
    pub name_pattern: String,

    /// Terminate instead of stopping.
    #[arg(long)]
    pub terminate: bool,

    /// List the instances without touching them.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print an example configuration with every setting.
    Example,
    /// Print Markdown documentation of every setting.
    Docs,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_request_command(args).await,
        Commands::StopOrphaned(args) => run_stop_orphaned_command(args).await,
        Commands::Config(args) => run_config_command(args),
    }
}

async fn run_request_command(args: RunArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let aws = AwsCli::new(config.aws.region.clone());

    let store: Arc<dyn ObjectStore> = match &args.local_store {
        Some(dir) => {
            info!(dir = %dir.display(), "Publishing to local directory");
            Arc::new(LocalStore::new(dir))
        }
        None => Arc::new(S3Store::new(aws.clone(), config.aws.s3.bucket_name.clone())),
    };
    let transport: Arc<dyn RemoteTransport> = Arc::new(SshTransport::new(SshOptions::new(
        config.ssh_user.clone(),
        expand_home(&config.ssh_key),
    )));

    let services = Collaborators {
        pool: PoolServices {
            provisioner: Arc::new(Ec2Provisioner::new(
                aws,
                config.aws.ec2.clone(),
                config.aws.iam_instance_profile.clone(),
            )),
            initializer: Arc::new(SshInitializer::new(
                transport.clone(),
                config.aws.ec2.efs_volumes.clone().unwrap_or_default(),
            )),
            auto_shutdown: Arc::new(SshAutoShutdown::new(transport.clone())),
        },
        transport,
        store: store.clone(),
        status_sink: Arc::new(ObjectStoreStatusSink::new(store)),
        notifier: Arc::new(LogNotifier::new(config.notifications.email.clone())),
    };

    let shutdown = ShutdownToken::new();
    let listener = spawn_signal_listener(shutdown.clone());
    let orchestrator = ParallelOrchestrator::new(config, services);
    let result = orchestrator
        .run(
            &args.input,
            RunOptions {
                existing: args.existing,
                request_id: args.request_id,
            },
            &shutdown,
        )
        .await;
    listener.abort();

    let summary = result?;
    println!(
        "Request {}: {} success, {} failure, {} unknown",
        summary.request_id,
        summary.status.counts.success,
        summary.status.counts.failure,
        summary.status.counts.unknown
    );
    if !summary.unpaired.is_empty() {
        println!("{} job(s) not run: no worker available", summary.unpaired.len());
    }
    Ok(())
}

async fn run_stop_orphaned_command(args: StopOrphanedArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let pattern = Regex::new(&args.name_pattern)
        .with_context(|| format!("Invalid name pattern '{}'", args.name_pattern))?;
    let min_age = chrono::Duration::seconds((args.hours * 3600.0) as i64);

    let provisioner = Ec2Provisioner::new(
        AwsCli::new(config.aws.region.clone()),
        config.aws.ec2.clone(),
        config.aws.iam_instance_profile.clone(),
    );
    let running = provisioner.list_running().await?;
    let orphans = select_orphans(&running, &pattern, min_age, Utc::now());
    if orphans.is_empty() {
        println!("No orphaned instances found");
        return Ok(());
    }

    for instance in &orphans {
        println!(
            "{}\t{}\t{}",
            instance.id,
            instance.name.as_deref().unwrap_or("-"),
            instance
                .launch_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );
    }
    if args.dry_run {
        println!("Dry run: {} instance(s) left untouched", orphans.len());
        return Ok(());
    }

    let mode = if args.terminate {
        ShutdownMode::Terminate
    } else {
        ShutdownMode::Stop
    };
    let ids: Vec<String> = orphans.iter().map(|i| i.id.clone()).collect();
    warn!(count = ids.len(), mode = ?mode, "Shutting down orphaned instances");
    provisioner.shutdown_ids(&ids, mode).await?;
    Ok(())
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigSubcommand::Example => {
            println!("{}", serde_json::to_string_pretty(&example_document())?);
        }
        ConfigSubcommand::Docs => {
            print!("{}", ConfigDocs::generate().render());
        }
    }
    Ok(())
}

/// Expand a leading `~/` using `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
