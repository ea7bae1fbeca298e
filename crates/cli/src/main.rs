use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kfold_apply::{Apply, ApplyConfig, Clients, Delete, DeleteConfig, TokioSleeper};
use kfold_core::Gvk;
use tracing::{error, info};

mod env;
mod manifest;

use env::{ambient_target, Environments, Target};
use manifest::ManifestSource;

#[derive(Parser, Debug)]
#[command(name = "kfoldctl", version, about = "Apply rendered manifests to a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Environment definitions (name -> context, namespace, manifests)
    #[arg(long = "env-file", env = "KFOLD_ENV_FILE", global = true, default_value = "environments.yaml")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update objects, then garbage-collect tagged leftovers
    Apply {
        /// Environment name
        env: String,
        /// Manifest files or directories (default: the environment's manifests)
        #[arg(short = 'f', long = "file")]
        files: Vec<PathBuf>,
        /// Only apply these components (file stems)
        #[arg(short = 'c', long = "component")]
        components: Vec<String>,
        /// Create objects that do not exist yet
        #[arg(long = "create", action = ArgAction::Set, default_value_t = true)]
        create: bool,
        /// Log what would change without writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Tag applied objects and delete tagged objects not applied in this run
        #[arg(long = "gc-tag", default_value = "")]
        gc_tag: String,
        /// Tag objects but skip garbage collection
        #[arg(long = "skip-gc", action = ArgAction::SetTrue)]
        skip_gc: bool,
    },
    /// Delete the declared objects, dependents first
    Delete {
        env: String,
        #[arg(short = 'f', long = "file")]
        files: Vec<PathBuf>,
        #[arg(short = 'c', long = "component")]
        components: Vec<String>,
        /// Seconds before forced termination
        #[arg(long = "grace-period")]
        grace_period: Option<i64>,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Print the last-applied form of a live object
    LastApplied {
        env: String,
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        name: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KFOLD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KFOLD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KFOLD_METRICS_ADDR; expected host:port");
        }
    }
}

fn resolve_target(env_file: &Path, env: &str) -> Result<Target> {
    match Environments::load(env_file)? {
        Some(envs) => envs.resolve(env),
        None => {
            info!(env, file = %env_file.display(), "no environments file; using current context");
            Ok(ambient_target(kfold_kubehub::context_namespace(None)))
        }
    }
}

async fn connect(target: &Target) -> Result<Clients> {
    let kube = kfold_kubehub::connect(target.context.as_deref()).await?;
    Ok(Clients { discovery: Arc::new(kube.clone()), factory: Arc::new(kube), namespace: target.namespace.clone() })
}

fn manifests(files: Vec<PathBuf>, target: &Target) -> Result<ManifestSource> {
    let paths = if files.is_empty() { target.manifests.clone() } else { files };
    if paths.is_empty() {
        return Err(anyhow!("no manifests given; pass -f or list them in the environments file"));
    }
    Ok(ManifestSource::new(paths))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { env, files, components, create, dry_run, gc_tag, skip_gc } => {
            let target = resolve_target(&cli.env_file, &env)?;
            let source = manifests(files, &target)?;
            let clients = connect(&target).await?;
            let mut cfg = ApplyConfig::new(env);
            cfg.components = components;
            cfg.create = create;
            cfg.dry_run = dry_run;
            cfg.gc_tag = gc_tag;
            cfg.skip_gc = skip_gc;
            let report = match Apply::new(cfg, Arc::new(source), clients, Arc::new(TokioSleeper)).run().await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "apply failed");
                    return Err(e.into());
                }
            };
            match cli.output {
                Output::Human => {
                    for a in &report.applied {
                        println!("{}  {}", a.uid, a.object);
                    }
                    if let Some(gc) = &report.gc {
                        for d in &gc.deleted {
                            println!("deleted  {}", d);
                        }
                        println!("gc: {} considered, {} deleted", gc.considered, gc.deleted.len());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Delete { env, files, components, grace_period, dry_run } => {
            let target = resolve_target(&cli.env_file, &env)?;
            let source = manifests(files, &target)?;
            let clients = connect(&target).await?;
            let mut cfg = DeleteConfig::new(env);
            cfg.components = components;
            cfg.grace_period = grace_period;
            cfg.dry_run = dry_run;
            let report = match Delete::new(cfg, Arc::new(source), clients).run().await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "delete failed");
                    return Err(e.into());
                }
            };
            match cli.output {
                Output::Human => {
                    for d in &report.deleted {
                        println!("deleted  {}", d);
                    }
                    for m in &report.missing {
                        println!("missing  {}", m);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::LastApplied { env, gvk, name, namespace } => {
            let key = Gvk::parse_key(&gvk).ok_or_else(|| anyhow!("invalid gvk key: {gvk} (expect v1/Kind or group/v1/Kind)"))?;
            let target = resolve_target(&cli.env_file, &env)?;
            let clients = connect(&target).await?;
            match kfold_apply::last_applied(&clients, &key, namespace.as_deref(), &name).await? {
                Some(obj) => match cli.output {
                    Output::Human => print!("{}", serde_yaml::to_string(obj.as_value())?),
                    Output::Json => println!("{}", serde_json::to_string_pretty(obj.as_value())?),
                },
                None => return Err(anyhow!("{} {} not found", key.kind, name)),
            }
        }
    }
    Ok(())
}
