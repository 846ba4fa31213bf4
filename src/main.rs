//! oneshot operator - runs Backup and Restore operations on Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use oneshot::compute::{ComputeConfig, PodProvisioner};
use oneshot::controller::{run_operation_controller, BackupAdapter, KubeStore, RestoreAdapter};
use oneshot::crd::{Backup, Restore};
use oneshot::engine::{Engine, EngineConfig};
use oneshot::events::KubeEventPublisher;
use oneshot::exec::{AgentClientConfig, HttpExecutionClient};
use oneshot::storage::{KubeVolumeClient, StorageConfig, StorageProvisioner};
use oneshot::telemetry::{init_tracing, LogFormat};
use oneshot::FIELD_MANAGER;

/// oneshot - operator for one-shot backup and restore operations
#[derive(Parser, Debug)]
#[command(name = "oneshot", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "ONESHOT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Backup and Restore controllers (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Port the agent listens on
    #[arg(long, env = "ONESHOT_AGENT_PORT", default_value_t = oneshot::DEFAULT_AGENT_PORT)]
    agent_port: u16,

    /// Scheme used to reach the agent
    #[arg(long, env = "ONESHOT_AGENT_SCHEME", default_value = "http")]
    agent_scheme: String,

    /// Claim size for operations without a volume override
    #[arg(long, env = "ONESHOT_DEFAULT_VOLUME_SIZE", default_value = "1Gi")]
    default_volume_size: String,

    /// Deadline for each remote call in seconds
    #[arg(long, env = "ONESHOT_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    /// Delay between status polls of a running operation in seconds
    #[arg(long, env = "ONESHOT_POLL_INTERVAL_SECS", default_value_t = 10)]
    poll_interval_secs: u64,

    /// Image running the agent in worker pods
    #[arg(
        long,
        env = "ONESHOT_AGENT_IMAGE",
        default_value = "ghcr.io/oneshot-dev/agent:latest"
    )]
    agent_image: String,
}

impl ControllerArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ..Default::default()
        }
    }

    fn agent_config(&self) -> AgentClientConfig {
        AgentClientConfig {
            scheme: self.agent_scheme.clone(),
            port: self.agent_port,
            request_timeout: Duration::from_secs(self.call_timeout_secs),
            endpoint_override: None,
        }
    }

    fn compute_config(&self) -> ComputeConfig {
        ComputeConfig {
            agent_image: self.agent_image.clone(),
            agent_port: self.agent_port,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let backup = serde_yaml::to_string(&Backup::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Backup CRD: {}", e))?;
        let restore = serde_yaml::to_string(&Restore::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Restore CRD: {}", e))?;
        println!("{backup}---\n{restore}");
        return Ok(());
    }

    init_tracing(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

/// Ensure the operator's CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply,
/// so CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Backup::crd(), Restore::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("all oneshot CRDs installed/updated");
    Ok(())
}

/// Run the Backup and Restore controllers until shutdown
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("oneshot controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let compute = Arc::new(PodProvisioner::new(client.clone(), args.compute_config()));
    let exec = Arc::new(HttpExecutionClient::new(args.agent_config())?);
    let backups = Arc::new(KubeStore::<Backup>::new(client.clone()));

    let storage = StorageProvisioner::new(
        KubeVolumeClient::new(client.clone()),
        StorageConfig {
            default_size: args.default_volume_size.clone(),
        },
    )?;
    let backup_engine = Arc::new(Engine::new(
        BackupAdapter::new(backups.clone(), storage),
        compute.clone(),
        exec.clone(),
        Arc::new(KubeEventPublisher::new(client.clone(), "oneshot-backup-controller")),
        args.engine_config(),
    ));

    let restore_engine = Arc::new(Engine::new(
        RestoreAdapter::new(Arc::new(KubeStore::<Restore>::new(client.clone())), backups),
        compute,
        exec,
        Arc::new(KubeEventPublisher::new(client.clone(), "oneshot-restore-controller")),
        args.engine_config(),
    ));

    tracing::info!("Starting oneshot controllers...");
    tracing::info!("  - Backup controller");
    tracing::info!("  - Restore controller");

    tokio::select! {
        _ = run_operation_controller::<Backup, _>(client.clone(), backup_engine) => {
            tracing::info!("Backup controller completed");
        }
        _ = run_operation_controller::<Restore, _>(client, restore_engine) => {
            tracing::info!("Restore controller completed");
        }
    }

    Ok(())
}
