use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{error, info};

use drift_cluster::{AuthGuard, ExecTokenRefresh, KubeCluster};
use drift_core::{Identity, ResourceSpec};
use drift_diff::IgnoreRules;
use drift_engine::{Engine, EngineConfig, KindRegistry};

#[derive(Parser, Debug)]
#[command(name = "driftctl", version, about = "Reconciling configuration sync for Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace for manifests that do not set one
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Annotation key regex to exclude from drift detection (repeatable)
    #[arg(long = "ignore-annotation", global = true, action = ArgAction::Append)]
    ignore_annotations: Vec<String>,

    /// Label key regex to exclude from drift detection (repeatable)
    #[arg(long = "ignore-label", global = true, action = ArgAction::Append)]
    ignore_labels: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the kinds this build knows how to reconcile
    Kinds,
    /// Show what reconcile would change, without writing anything
    Diff {
        /// Manifest file (YAML, may hold multiple documents)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Converge the cluster toward the manifest
    Reconcile {
        /// Manifest file (YAML, may hold multiple documents)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Overall per-object deadline in seconds, readiness included
        #[arg(long = "timeout", default_value_t = 300)]
        timeout: u64,
    },
    /// Delete an object and confirm its absence
    Remove {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Object name
        name: String,
        /// Overall deadline in seconds
        #[arg(long = "timeout", default_value_t = 120)]
        timeout: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("DRIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DRIFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DRIFT_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse a manifest file into specs, one per YAML document.
fn load_specs(path: &PathBuf, default_ns: Option<&str>) -> Result<Vec<ResourceSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut specs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&raw) {
        let value = Json::deserialize(doc)
            .with_context(|| format!("parsing {}", path.display()))?;
        if value.is_null() {
            continue;
        }
        specs.push(spec_from_manifest(value, default_ns)?);
    }
    if specs.is_empty() {
        bail!("no documents in {}", path.display());
    }
    Ok(specs)
}

fn spec_from_manifest(value: Json, default_ns: Option<&str>) -> Result<ResourceSpec> {
    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .context("manifest missing apiVersion")?;
    let kind = value.get("kind").and_then(|v| v.as_str()).context("manifest missing kind")?;
    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .context("manifest missing metadata.name")?;
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .or(default_ns);
    let identity = Identity::new(format!("{api_version}/{kind}"), namespace, name);
    Ok(ResourceSpec { identity, fields: value, resource_version: None })
}

/// Exec-style token refresh from DRIFT_AUTH_CMD (program plus arguments,
/// whitespace separated). DRIFT_AUTH_TTL_SECS bounds each minted token's
/// lifetime; without it a token is refreshed only on process restart.
fn auth_from_env() -> Option<AuthGuard> {
    let cmd = std::env::var("DRIFT_AUTH_CMD").ok()?;
    let mut parts = cmd.split_whitespace();
    let program = parts.next()?;
    let mut refresher = ExecTokenRefresh::new(program);
    for arg in parts {
        refresher = refresher.arg(arg);
    }
    if let Some(secs) = std::env::var("DRIFT_AUTH_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        refresher = refresher.with_ttl(Duration::from_secs(secs));
    }
    info!(command = program, "exec auth refresher configured");
    Some(AuthGuard::new(Arc::new(refresher)))
}

async fn build_engine(cli: &Cli) -> Result<Engine> {
    let mut config = EngineConfig::from_env();
    config.ignore = IgnoreRules::compile(&cli.ignore_annotations, &cli.ignore_labels)?;
    let mut cluster = KubeCluster::connect().await.context("connecting to the cluster")?;
    if let Some(guard) = auth_from_env() {
        cluster = cluster.with_auth(guard);
    }
    Ok(Engine::new(Arc::new(cluster), KindRegistry::builtin(), config))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Kinds => {
            let kinds = KindRegistry::builtin();
            let mut keys: Vec<&str> = kinds.keys().collect();
            keys.sort_unstable();
            match cli.output {
                Output::Human => {
                    for k in keys {
                        println!("{k}");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
            }
        }
        Commands::Diff { file } => {
            let specs = load_specs(file, cli.namespace.as_deref())?;
            let engine = build_engine(&cli).await?;
            let mut drifted = false;
            for spec in &specs {
                let (patch, observed) = engine.plan(spec).await?;
                drifted |= !patch.is_noop();
                match cli.output {
                    Output::Human => {
                        if patch.is_noop() {
                            println!("{}: in sync", spec.identity);
                        } else if patch.is_create() {
                            println!("{}: absent, would create", spec.identity);
                        } else {
                            let s = patch.summary();
                            println!(
                                "{}: {} adds, {} replaces, {} removes",
                                spec.identity, s.adds, s.replaces, s.removes
                            );
                            for e in &patch.entries {
                                println!("  {:?} {}", e.op, e.dotted_path());
                            }
                        }
                    }
                    Output::Json => {
                        let report = serde_json::json!({
                            "identity": spec.identity,
                            "live": observed.is_some(),
                            "patch": patch,
                        });
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    }
                }
            }
            if drifted {
                std::process::exit(2);
            }
        }
        Commands::Reconcile { file, timeout } => {
            let specs = load_specs(file, cli.namespace.as_deref())?;
            let engine = build_engine(&cli).await?;
            let deadline = Duration::from_secs(*timeout);
            for spec in specs {
                let identity = spec.identity.clone();
                match engine.reconcile(spec, deadline).await {
                    Ok(obs) => {
                        info!(identity = %identity, rv = ?obs.resource_version, "settled");
                        match cli.output {
                            Output::Human => println!("{identity}: settled"),
                            Output::Json => println!("{}", serde_json::to_string_pretty(&obs)?),
                        }
                    }
                    Err(failure) => {
                        error!(identity = %identity, error = %failure.error, "reconcile failed");
                        bail!("{identity}: {}", failure.error);
                    }
                }
            }
        }
        Commands::Remove { gvk, name, timeout } => {
            let id = Identity::new(gvk.clone(), cli.namespace.as_deref(), name.clone());
            let engine = build_engine(&cli).await?;
            match engine.remove(id.clone(), Duration::from_secs(*timeout)).await {
                Ok(()) => println!("{id}: absent"),
                Err(failure) => {
                    error!(identity = %id, error = %failure.error, "remove failed");
                    bail!("{id}: {}", failure.error);
                }
            }
        }
    }
    Ok(())
}
