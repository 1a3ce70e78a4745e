use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agentop_core::AgentDeployment;
use agentop_feature::{FeatureOptions, InstallInfo};
use agentop_kubehub::KubeStore;
use agentop_reconcile::{Reconciler, ReconcilerOptions};
use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "agentopctl", version, about = "agentop operator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator against the current kube context
    Run(RunArgs),
    /// Print the CustomResourceDefinitions as YAML
    Crds,
    /// Convert CRD manifests into standalone JSON schemas
    Jsonschema {
        /// CRD YAML files; the built-in CRDs when empty
        files: Vec<PathBuf>,
        /// Output directory (default: next to each input, or `.`)
        #[arg(long = "out")]
        out: Option<PathBuf>,
    },
    /// Validate a manifest against the built-in schema
    #[cfg(feature = "validate")]
    Validate {
        /// Kind, e.g. AgentDeployment
        kind: String,
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Watch only this namespace (default: all)
    #[arg(long = "namespace", env = "AGENTOP_WATCH_NAMESPACE")]
    namespace: Option<String>,
    /// Resolve AgentProfiles into per-profile node agents
    #[arg(long = "profiles", env = "AGENTOP_PROFILES")]
    profiles: bool,
    /// Split node agents per node provider
    #[arg(long = "introspection", env = "AGENTOP_INTROSPECTION")]
    introspection: bool,
    #[arg(long = "requeue-secs", env = "AGENTOP_REQUEUE_SECS", default_value_t = 15)]
    requeue_secs: u64,
    /// Per-call Kubernetes API timeout
    #[arg(long = "api-timeout-secs", env = "AGENTOP_API_TIMEOUT_SECS", default_value_t = 10)]
    api_timeout_secs: u64,
    #[arg(long = "install-id", env = "AGENTOP_INSTALL_ID")]
    install_id: Option<String>,
    #[arg(long = "install-type", env = "AGENTOP_INSTALL_TYPE", default_value = "k8s_manual")]
    install_type: String,
}

impl RunArgs {
    fn reconciler_options(&self) -> ReconcilerOptions {
        let install = InstallInfo {
            id: self.install_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            time: Utc::now().timestamp(),
            type_: self.install_type.clone(),
        };
        ReconcilerOptions {
            profiles_enabled: self.profiles,
            introspection_enabled: self.introspection,
            default_requeue: Duration::from_secs(self.requeue_secs),
            features: FeatureOptions { install, ..Default::default() },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("AGENTOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("AGENTOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid AGENTOP_METRICS_ADDR; expected host:port");
        }
    }
}

struct Context {
    reconciler: Reconciler,
    cancel: CancellationToken,
    error_requeue: Duration,
}

async fn reconcile(obj: Arc<AgentDeployment>, ctx: Arc<Context>) -> Result<Action, agentop_core::Error> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let out = ctx.reconciler.reconcile_until(&namespace, &name, Utc::now(), &ctx.cancel).await?;
    Ok(match out.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(obj: Arc<AgentDeployment>, error: &agentop_core::Error, ctx: Arc<Context>) -> Action {
    warn!(name = %obj.name_any(), error = %error, "reconcile failed; requeueing");
    Action::requeue(ctx.error_requeue)
}

async fn run(args: RunArgs) -> Result<()> {
    let client = Client::try_default().await.context("connecting to Kubernetes")?;
    info!(namespace = ?args.namespace, profiles = args.profiles, introspection = args.introspection, "starting operator");

    let store = Arc::new(KubeStore::new(client.clone(), Duration::from_secs(args.api_timeout_secs)));
    let options = args.reconciler_options();
    let error_requeue = options.default_requeue;
    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context { reconciler: Reconciler::new(store, options), cancel: cancel.clone(), error_requeue });

    // Abandon in-flight passes on shutdown; the controller itself drains on the same signal.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let (instances, daemon_sets, deployments): (Api<AgentDeployment>, Api<DaemonSet>, Api<Deployment>) =
        match &args.namespace {
            Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
            None => (Api::all(client.clone()), Api::all(client.clone()), Api::all(client)),
        };

    Controller::new(instances, WatcherConfig::default())
        .owns(daemon_sets, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller stream error"),
            }
        })
        .await;
    info!("operator stopped");
    Ok(())
}

fn jsonschema(files: Vec<PathBuf>, out: Option<PathBuf>) -> Result<()> {
    if files.is_empty() {
        let dir = out.unwrap_or_else(|| PathBuf::from("."));
        for p in agentop_schema::write_all(&dir, &agentop_schema::builtin_schemas()?)? {
            println!("{}", p.display());
        }
        return Ok(());
    }
    for file in files {
        let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        let schemas = agentop_schema::from_yaml(&yaml).with_context(|| format!("converting {}", file.display()))?;
        let dir = out.clone().unwrap_or_else(|| file.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")));
        for p in agentop_schema::write_all(&dir, &schemas)? {
            println!("{}", p.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Crds => print!("{}", agentop_schema::crds_yaml()?),
        Commands::Jsonschema { files, out } => jsonschema(files, out)?,
        #[cfg(feature = "validate")]
        Commands::Validate { kind, file } => {
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let issues = agentop_schema::validate::validate_manifest(&kind, &yaml)?;
            if issues.is_empty() {
                println!("{}: valid", file.display());
            }
            for i in &issues {
                match &i.hint {
                    Some(h) => println!("{}: {} ({})", i.path, i.error, h),
                    None => println!("{}: {}", i.path, i.error),
                }
            }
            if !issues.is_empty() {
                anyhow::bail!("{} validation issue(s)", issues.len());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_map_to_options() {
        let cli = Cli::parse_from(["agentopctl", "run", "--profiles", "--requeue-secs", "30", "--install-id", "abc"]);
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let opts = args.reconciler_options();
        assert!(opts.profiles_enabled);
        assert!(!opts.introspection_enabled);
        assert_eq!(opts.default_requeue, Duration::from_secs(30));
        assert_eq!(opts.features.install.id, "abc");
        assert_eq!(opts.features.install.type_, "k8s_manual");
    }
}
