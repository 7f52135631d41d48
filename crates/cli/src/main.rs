use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rewind_core::{parse_resource_args, DryRunMode, ResolveRequest, RevisionSelector};
use rewind_kubehub::Cluster;
use rewind_undo::{Dispatcher, UndoOptions};
use tracing::{error, info};

mod printer;

use printer::{OutcomePrinter, OutputFormat};

#[derive(Parser, Debug)]
#[command(name = "rewindctl", version, about = "Roll Kubernetes workloads back to an earlier revision")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the rollout of workloads
    Rollout {
        #[command(subcommand)]
        command: RolloutCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RolloutCommand {
    /// Roll back to a previous rollout
    Undo(UndoArgs),
}

#[derive(Args, Debug)]
struct UndoArgs {
    /// TYPE NAME... or TYPE/NAME...
    resources: Vec<String>,

    /// The revision to roll back to. 0 means the previous revision
    #[arg(long = "to-revision", default_value_t = 0, value_parser = clap::value_parser!(i64).range(0..))]
    to_revision: i64,

    /// Only print what would be done (client) or ask the server to validate it (server)
    #[arg(
        long = "dry-run",
        value_enum,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = DryRunArg::None,
        default_missing_value = "client"
    )]
    dry_run: DryRunArg,

    /// Manifest files or directories identifying the workloads
    #[arg(short = 'f', long = "filename")]
    filenames: Vec<PathBuf>,

    /// Walk directories given with -f recursively
    #[arg(short = 'R', long = "recursive")]
    recursive: bool,

    /// Namespace (default: from the kubeconfig context)
    #[arg(short = 'n', long = "namespace", env = "REWIND_NAMESPACE")]
    namespace: Option<String>,

    /// Kubeconfig context to use
    #[arg(long = "context")]
    context: Option<String>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Name)]
    output: OutputFormat,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DryRunArg {
    None,
    Client,
    Server,
}

impl From<DryRunArg> for DryRunMode {
    fn from(v: DryRunArg) -> Self {
        match v {
            DryRunArg::None => DryRunMode::None,
            DryRunArg::Client => DryRunMode::Client,
            DryRunArg::Server => DryRunMode::Server,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("REWIND_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REWIND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REWIND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Validate flags and turn them into engine inputs. `default_namespace` is
/// only consulted when `--namespace` is absent.
fn build_request(args: &UndoArgs, default_namespace: &str) -> Result<(ResolveRequest, UndoOptions)> {
    let resources = parse_resource_args(&args.resources)?;
    if resources.is_empty() && args.filenames.is_empty() {
        bail!("required resource not specified");
    }
    let request = ResolveRequest {
        namespace: args.namespace.clone().unwrap_or_else(|| default_namespace.to_string()),
        enforce_namespace: args.namespace.is_some(),
        args: resources,
        filenames: args.filenames.clone(),
        recursive: args.recursive,
    };
    let options = UndoOptions { revision: RevisionSelector::from_flag(args.to_revision)?, dry_run: args.dry_run.into() };
    Ok((request, options))
}

async fn undo(args: UndoArgs) -> Result<ExitCode> {
    // Catch argument errors before touching the cluster.
    build_request(&args, "default")?;
    let cluster = Cluster::connect(args.context.as_deref()).await?;
    let (request, options) = build_request(&args, cluster.default_namespace())?;
    info!(namespace = %request.namespace, revision = options.revision.number(), dry_run = ?options.dry_run, "rollout undo invoked");

    let dispatcher = Dispatcher::new(
        Arc::new(cluster.source()),
        Arc::new(rewind_ops::default_registry(cluster.client())),
        Arc::new(cluster.dry_run_verifier()),
        options,
    );
    let mut printer = OutcomePrinter::new(args.output, options.dry_run, std::io::stdout());
    let report = dispatcher.run(&request, &mut printer).await?;
    let rolled_back = report.rolled_back().count();
    match report.into_result() {
        Ok(outcomes) => {
            info!(outcomes = outcomes.len(), rolled_back, "rollout undo finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            error!(failed = errors.len(), rolled_back, "rollout undo finished with errors");
            eprintln!("{errors}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Rollout { command: RolloutCommand::Undo(args) } => undo(args).await,
    };
    match res {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "rollout undo failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
