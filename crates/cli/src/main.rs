use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use serde::Serialize;
use servicetrait_core::ServiceTrait;
use servicetrait_kubehub::{get_kube_client, RunConfig};
use servicetrait_reconcile::Settings;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod offline;

#[derive(Parser, Debug)]
#[command(name = "servicetraitctl", version, about = "ServiceTrait controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace to watch (default: all)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Delay before a failed pass is retried
    #[arg(long = "requeue-secs", env = "SVCTRAIT_REQUEUE_SECS", global = true, default_value_t = servicetrait_core::DEFAULT_REQUEUE_SECS)]
    requeue_secs: u64,

    /// Field manager for applied services (default: the trait's name)
    #[arg(long = "field-manager", env = "SVCTRAIT_FIELD_MANAGER", global = true)]
    field_manager: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run,
    /// Print the ServiceTrait CRD
    Crd,
    /// Reconcile every ServiceTrait in a manifest bundle without a cluster
    Simulate {
        /// Multi-document YAML with traits and workloads
        #[arg(long = "file")]
        file: PathBuf,
    },
    /// Render the service a trait would create for one StatefulSet manifest
    Render {
        #[arg(long = "file")]
        file: PathBuf,
        /// UID written to the ownership label
        #[arg(long = "trait-uid")]
        trait_uid: String,
    },
}

fn init_tracing() {
    let env = std::env::var("SVCTRAIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SVCTRAIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SVCTRAIT_METRICS_ADDR; expected host:port");
        }
    }
}

fn emit<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn print_report(report: &offline::SimulationReport) {
    println!("loaded {} objects", report.loaded);
    for t in &report.traits {
        let synced = t.synced.as_deref().unwrap_or("-");
        let msg = t.message.as_deref().unwrap_or("");
        println!("{}/{} • {} • synced={} {}", t.namespace, t.name, t.outcome, synced, msg);
        for r in &t.resources {
            println!("    owns {}", r);
        }
    }
    for svc in &report.services {
        let ns = svc.metadata.namespace.as_deref().unwrap_or("");
        let name = svc.metadata.name.as_deref().unwrap_or("");
        let ports: Vec<String> = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ps| ps.iter().map(|p| p.port.to_string()).collect())
            .unwrap_or_default();
        println!("service {}/{} ports=[{}]", ns, name, ports.join(","));
    }
    for r in &report.deleted {
        println!("deleted {}", r);
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings { requeue_after: Duration::from_secs(cli.requeue_secs), field_manager: cli.field_manager.clone() };

    match cli.command {
        Commands::Run => {
            let client = get_kube_client().await.context("building kube client")?;
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received; cancelling in-flight passes");
                stop.cancel();
            });
            info!(ns = ?cli.namespace, requeue_secs = cli.requeue_secs, "run invoked");
            servicetrait_kubehub::run(client, RunConfig { namespace: cli.namespace, settings }, cancel).await?;
        }
        Commands::Crd => {
            let crd = ServiceTrait::crd();
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
                Output::Human | Output::Yaml => print!("{}", serde_yaml::to_string(&crd)?),
            }
        }
        Commands::Simulate { file } => {
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let report = offline::simulate(&yaml, &settings).await?;
            emit(cli.output, &report, print_report)?;
        }
        Commands::Render { file, trait_uid } => {
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let svc = offline::render(&yaml, &trait_uid)?;
            emit(cli.output, &svc, |s| {
                if let Ok(text) = serde_yaml::to_string(s) {
                    print!("{}", text);
                }
            })?;
        }
    }
    Ok(())
}
