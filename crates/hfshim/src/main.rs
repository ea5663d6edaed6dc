use clap::{Parser, ValueEnum};
use hfshim_controller::{
    metrics, ControllerMetrics, ControllerRunner, HttpResourceStore, LeaderElector, ReconcilerConfig,
    RunnerConfig, SshProber, VirtualMachineReconciler, LEADER_LEASE_NAME,
};
use hfshim_storage::{KvResourceStore, RedbBackend, ResourceStore, StoreClient};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "hf-shim-operator", about = "Provisions hobbyfarm VirtualMachines on cloud providers")]
struct Cli {
    /// Namespace VirtualMachines are provisioned in
    #[arg(long, env = "HF_NAMESPACE", default_value = "hobbyfarm")]
    namespace: String,

    /// Namespace Environments and VirtualMachineTemplates are read from (defaults to each VM's namespace)
    #[arg(long, env = "HF_CATALOG_NAMESPACE")]
    catalog_namespace: Option<String>,

    /// Reconcile passes allowed in flight at once
    #[arg(long, env = "HF_THREADS", default_value_t = 5)]
    threads: usize,

    /// Address serving /healthz and /metrics
    #[arg(long, env = "HF_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Only run the controller while holding the leader lease
    #[arg(long, env = "HF_ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,

    /// Identity recorded in the leader lease
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Base URL of a Kubernetes-compatible API server
    #[arg(long, env = "HF_API_URL", conflicts_with = "data_dir")]
    api_url: Option<String>,

    /// Bearer token for the API server
    #[arg(long, env = "HF_API_TOKEN", requires = "api_url", hide_env_values = true)]
    api_token: Option<String>,

    /// Path to the redb database file, used when no API server is given
    #[arg(long, env = "HF_DATA_DIR", default_value = "./hfshim.redb")]
    data_dir: String,

    /// Seconds between runner ticks
    #[arg(long, env = "HF_POLL_INTERVAL", default_value_t = 5)]
    poll_interval: u64,

    /// Seconds allowed for one remote-shell liveness probe
    #[arg(long, env = "HF_PROBE_TIMEOUT", default_value_t = 10)]
    probe_timeout: u64,

    #[arg(long, env = "HF_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let metrics_addr: SocketAddr = cli
        .metrics_addr
        .parse()
        .map_err(|e| miette::miette!("Invalid metrics address '{}': {}", cli.metrics_addr, e))?;
    if cli.threads == 0 {
        return Err(miette::miette!("--threads must be at least 1"));
    }

    let client = StoreClient::new(create_store(&cli)?);
    let prober = Arc::new(SshProber::new(Duration::from_secs(cli.probe_timeout)));
    let reconciler = Arc::new(VirtualMachineReconciler::new(
        client.clone(),
        prober,
        ReconcilerConfig {
            catalog_namespace: cli.catalog_namespace.clone(),
        },
    ));
    let metrics = Arc::new(
        ControllerMetrics::new().map_err(|e| miette::miette!("Failed to set up metrics: {}", e))?,
    );
    let runner = Arc::new(ControllerRunner::new(
        reconciler,
        metrics.clone(),
        RunnerConfig {
            namespace: cli.namespace.clone(),
            threads: cli.threads,
            poll_interval: Duration::from_secs(cli.poll_interval),
            ..Default::default()
        },
    ));

    let token = CancellationToken::new();

    let metrics_token = token.clone();
    let metrics_handle = {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics_addr, metrics, metrics_token).await {
                error!("Metrics server error: {}", e);
            }
        })
    };

    let controller_handle = if cli.enable_leader_election {
        let identity = cli
            .identity
            .clone()
            .unwrap_or_else(|| format!("hf-shim-operator-{}", uuid::Uuid::new_v4()));
        let elector = Arc::new(LeaderElector::new(client, LEADER_LEASE_NAME, &cli.namespace, &identity));
        tokio::spawn(run_as_leader(elector, runner, metrics.clone(), token.clone()))
    } else {
        metrics.set_leader(true);
        let runner_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(runner_token).await {
                error!("Runner error: {}", e);
            }
        })
    };

    info!(
        namespace = %cli.namespace,
        "hf-shim-operator started, metrics on {}",
        metrics_addr
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(metrics_handle, controller_handle);
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

/// The HTTP store when an API server is given, otherwise the embedded redb store
fn create_store(cli: &Cli) -> miette::Result<Arc<dyn ResourceStore>> {
    if let Some(url) = &cli.api_url {
        info!("Using API server at {}", url);
        let store = HttpResourceStore::new(url);
        let store = match &cli.api_token {
            Some(token) => store.with_token(token.clone()),
            None => store,
        };
        return Ok(Arc::new(store));
    }

    info!("Using embedded store at {}", cli.data_dir);
    let backend = RedbBackend::new(Path::new(&cli.data_dir))
        .map_err(|e| miette::miette!("Failed to open storage at '{}': {}", cli.data_dir, e))?;
    Ok(Arc::new(KvResourceStore::new(Arc::new(backend))))
}

/// Run the runner only while holding the lease, re-campaigning after a loss
async fn run_as_leader(
    elector: Arc<LeaderElector>,
    runner: Arc<ControllerRunner>,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
) {
    loop {
        let Some(mut guard) = elector.clone().acquire(token.clone()).await else {
            return;
        };
        metrics.set_leader(true);

        let term = token.child_token();
        let runner_task = {
            let runner = runner.clone();
            let term = term.clone();
            tokio::spawn(async move { runner.run(term).await })
        };

        let shutting_down = tokio::select! {
            _ = guard.lost() => {
                warn!(identity = %elector.identity(), "Lost leadership, stopping runner");
                false
            }
            _ = token.cancelled() => true,
        };

        term.cancel();
        match runner_task.await {
            Ok(Err(e)) => error!("Runner error: {}", e),
            Err(e) => error!("Runner task failed: {}", e),
            Ok(Ok(())) => {}
        }
        metrics.set_leader(false);

        if shutting_down {
            if let Err(e) = guard.release().await {
                warn!("Failed to release leader lease: {}", e);
            }
            return;
        }
    }
}
