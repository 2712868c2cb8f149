use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, bail, WrapErr};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workbench_common::{
    ContainerEnvironment, EnvironmentConfig, ImageReference, InstanceKey, MachineConfig,
    MachineSource, Server, ServerConfig,
};
use workbench_runtime::{LogSink, RuntimeConfig, TracingLogSink, WorkspaceRuntime};

#[derive(Parser)]
#[command(name = "workbench", version, about = "Run workspace machines as containers")]
struct Cli {
    /// Runtime settings file. Without it, settings come from WORKBENCH_* env vars.
    #[arg(long, env = "WORKBENCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every machine of an environment file, print their servers and wait for Ctrl-C.
    Up {
        /// TOML file with `[environment]` and `[internal]` tables.
        environment: PathBuf,
        #[arg(long, default_value = "default")]
        workspace: String,
        /// Snapshot every machine before tearing it down.
        #[arg(long)]
        snapshot: bool,
        /// JSON file written by a previous `up --snapshot`, machines are restored from it.
        #[arg(long)]
        restore: Option<PathBuf>,
    },
    /// Start a single machine from an image or a Dockerfile and wait for Ctrl-C.
    Run {
        #[arg(long, default_value = "dev")]
        name: String,
        #[arg(long, default_value = "default")]
        workspace: String,
        #[arg(long, conflicts_with = "recipe", required_unless_present = "recipe")]
        image: Option<String>,
        /// Dockerfile to build the machine from.
        #[arg(long)]
        recipe: Option<PathBuf>,
        /// Servers as `name=port[/transport]`, e.g. `web=8080/tcp`.
        #[arg(long = "server")]
        servers: Vec<String>,
        #[arg(long)]
        dev: bool,
    },
    /// Remove a snapshot image, e.g. `localhost:5000/machine_snapshot_ab12:latest@sha256:...`.
    RmSnapshot { location: String },
    /// Print the effective runtime settings.
    Config,
}

#[derive(Deserialize)]
struct EnvironmentFile {
    environment: EnvironmentConfig,
    internal: ContainerEnvironment,
}

fn load_config(path: Option<&Path>) -> eyre::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_toml_file(path)?,
        None => RuntimeConfig::from_env()?,
    };
    Ok(config)
}

fn parse_server(spec: &str) -> eyre::Result<ServerConfig> {
    let Some((name, port)) = spec.split_once('=') else {
        bail!("server '{spec}' must look like name=port[/transport]");
    };
    Ok(ServerConfig::new(name.trim(), port.trim()))
}

fn snapshot_key(location: &str) -> eyre::Result<InstanceKey> {
    let Some(reference) = ImageReference::parse(location) else {
        bail!("'{location}' is not an image reference");
    };
    let tag = reference.tag_or_latest().to_string();
    Ok(InstanceKey {
        registry: reference.registry,
        repository: reference.repository,
        tag,
        digest: reference.digest,
    })
}

fn print_servers(machine: &str, servers: &BTreeMap<String, Server>) -> eyre::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "machine": machine, "servers": servers }))?
    );
    Ok(())
}

async fn up(
    runtime: &WorkspaceRuntime,
    file: &Path,
    workspace: &str,
    snapshot: bool,
    restore: Option<&Path>,
) -> eyre::Result<()> {
    let text = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let EnvironmentFile {
        environment,
        mut internal,
    } = toml::from_str(&text).wrap_err("invalid environment file")?;

    if let Some(path) = restore {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let snapshots: BTreeMap<String, InstanceKey> = serde_json::from_str(&text)?;
        for (machine, key) in snapshots {
            match internal.service_mut(&machine) {
                Some(service) => service.source = MachineSource::image(key.location()),
                None => warn!(machine = %machine, "Snapshot for unknown machine ignored"),
            }
        }
    }

    let logs: Arc<dyn LogSink> = Arc::new(TracingLogSink::new(environment.name.clone()));
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let start = runtime.start_environment(workspace, environment, internal, logs.clone(), cancel);
    tokio::pin!(start);
    let instances = tokio::select! {
        result = &mut start => result?,
        _ = tokio::signal::ctrl_c() => {
            interrupt.cancel();
            start.await?
        }
    };

    for instance in &instances {
        let servers = runtime.servers(&instance.id).await?;
        print_servers(&instance.machine.name, &servers)?;
    }

    info!("Environment is up, press Ctrl-C to stop it");
    tokio::signal::ctrl_c().await?;

    let ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    let snapshots = runtime.stop_environment(&ids, snapshot, logs).await;
    if snapshot {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,workbench_runtime=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if let Command::Config = cli.command {
        let mut shown = config.clone();
        for creds in shown.registry_auth.values_mut() {
            creds.password = "<redacted>".to_string();
        }
        print!("{}", toml::to_string_pretty(&shown)?);
        return Ok(());
    }

    let runtime = WorkspaceRuntime::connect(config)?;
    match cli.command {
        Command::Up {
            environment,
            workspace,
            snapshot,
            restore,
        } => up(&runtime, &environment, &workspace, snapshot, restore.as_deref()).await?,
        Command::Run {
            name,
            workspace,
            image,
            recipe,
            servers,
            dev,
        } => {
            let source = match (image, recipe) {
                (Some(image), _) => MachineSource::image(image),
                (None, Some(path)) => MachineSource::recipe(
                    std::fs::read_to_string(&path)
                        .wrap_err_with(|| format!("failed to read {}", path.display()))?,
                ),
                (None, None) => bail!("either --image or --recipe is required"),
            };
            let mut machine = if dev {
                MachineConfig::dev(name.clone())
            } else {
                MachineConfig::new(name.clone())
            };
            for spec in &servers {
                machine = machine.with_server(parse_server(spec)?);
            }

            let logs: Arc<dyn LogSink> = Arc::new(TracingLogSink::new(name.clone()));
            let instance = runtime
                .create_instance(&workspace, machine, source, logs, CancellationToken::new())
                .await?;
            print_servers(&name, &runtime.servers(&instance.id).await?)?;

            info!(instance_id = %instance.id, "Machine is running, press Ctrl-C to remove it");
            tokio::signal::ctrl_c().await?;
            runtime.destroy(&instance.id).await?;
        }
        Command::RmSnapshot { location } => {
            let key = snapshot_key(&location)?;
            runtime.remove_snapshot(&key).await?;
            info!(snapshot = %key, "Snapshot removed");
        }
        Command::Config => {}
    }

    Ok(())
}
