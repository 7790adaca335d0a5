use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use baton_core::app::{CreateTaskRequest, QueueBuilder, QueueContext, TaskService};
use baton_core::config::{BackoffConfig, BatonConfig, DiscoveryConfig, PollConfig, TaskTypeConfig};
use baton_core::discovery::Discovery;
use baton_core::domain::{DispatchError, ResponseEnvelope, ServerInstance, TaskStatus};
use baton_core::impls::{
    HttpDispatcher, InMemoryCoordinator, InMemoryLockStore, InMemoryTaskStore, StubDispatcher,
};
use baton_core::ports::{
    Clock, Dispatcher, HttpMethod, Route, SystemClock, UlidGenerator,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "baton", about = "Leader-gated distributed task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a standalone node until Ctrl-C.
    Run {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: String,
        /// Publish this node as an instance of `--service` at this host:port.
        #[arg(long, requires = "service")]
        advertise: Option<String>,
        #[arg(long)]
        service: Option<String>,
        #[arg(long, default_value_t = 30)]
        dispatch_timeout_secs: u64,
    },
    /// Submit one task to an in-process downstream and wait for it to finish.
    Demo {
        /// Make the second sub-task fail.
        #[arg(long)]
        fail: bool,
    },
}

fn load_config(path: &str) -> Result<BatonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path}"))?;
    let config: BatonConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config: {path}"))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

struct Node {
    discovery: Arc<Discovery>,
    store: Arc<InMemoryTaskStore>,
    clock: Arc<dyn Clock>,
    ctx: QueueContext,
}

async fn start_node(
    coordinator: &InMemoryCoordinator,
    config: &BatonConfig,
    dispatcher: Arc<dyn Dispatcher>,
) -> Node {
    let session = coordinator.connect().await;
    let discovery = Arc::new(Discovery::start(
        Arc::new(session),
        config,
        config.identity.clone(),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryTaskStore::new());
    let ctx = QueueContext::new(
        discovery.clone(),
        store.clone(),
        Arc::new(InMemoryLockStore::new(clock.clone())),
        dispatcher,
        clock.clone(),
    );
    Node {
        discovery,
        store,
        clock,
        ctx,
    }
}

async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    tracing::info!("received SIGINT");
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(
    config_path: &str,
    advertise: Option<String>,
    service: Option<String>,
    dispatch_timeout: Duration,
) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(config_path, identity = %config.identity, "starting baton node");

    let coordinator = InMemoryCoordinator::new();
    let node = start_node(
        &coordinator,
        &config,
        Arc::new(HttpDispatcher::new(dispatch_timeout)),
    )
    .await;

    if let (Some(address), Some(service)) = (advertise, service) {
        node.discovery
            .register_self(&service, &ServerInstance::new(address, "http"))
            .await
            .with_context(|| format!("failed to register as instance of '{service}'"))?;
    }

    let queue = QueueBuilder::from_config(node.ctx.clone(), &config)
        .context("failed to build task queue")?
        .build()?;
    let workers = queue.start();

    shutdown_signal().await?;

    workers.shutdown_and_join().await;
    node.discovery.shutdown().await;
    tracing::info!("baton node stopped");
    Ok(())
}

async fn demo(fail: bool) -> Result<()> {
    let fast = |ms| BackoffConfig {
        base_ms: ms,
        multiplier: 1.0,
        max_ms: None,
    };
    let mut sync_host = TaskTypeConfig::new(
        "sync_host",
        Route::new("host", HttpMethod::Post, "/sync/host"),
    );
    sync_host.retry = 2;
    sync_host.retry_interval_ms = 100;
    sync_host.poll = PollConfig {
        not_leader: fast(200),
        idle: fast(100),
        fetch_error: fast(500),
    };
    let config = BatonConfig {
        discovery: DiscoveryConfig {
            services: vec!["host".to_string()],
            ..DiscoveryConfig::default()
        },
        task_types: vec![sync_host],
        ..BatonConfig::default()
    };
    config.validate()?;

    // 2 つの下流インスタンスに見立てたハンドラ
    let dispatcher = StubDispatcher::new(move |url, body| {
        if fail && body["step"] == 1 {
            return Err(DispatchError::Rejected {
                code: 1199014,
                message: format!("{url} refused step 1"),
            });
        }
        Ok(ResponseEnvelope::success(json!({ "handled_by": url, "echo": body })))
    });

    let coordinator = InMemoryCoordinator::new();
    let node = start_node(&coordinator, &config, Arc::new(dispatcher)).await;
    for address in ["10.0.0.1:8080", "10.0.0.2:8080"] {
        node.discovery
            .register_self("host", &ServerInstance::new(address, "http"))
            .await?;
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while !node.discovery.is_master() || node.discovery.servers("host").is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("discovery did not settle")?;

    let service = TaskService::new(
        node.store.clone(),
        Arc::new(UlidGenerator::new(SystemClock)),
        node.clock.clone(),
    );
    let task = service
        .create(
            CreateTaskRequest::new(
                "sync_host",
                42,
                vec![json!({ "step": 0 }), json!({ "step": 1 }), json!({ "step": 2 })],
            )
            .user("demo"),
        )
        .await?;
    tracing::info!(task_id = %task.task_id, "submitted task");

    let queue = QueueBuilder::from_config(node.ctx.clone(), &config)?
        .expect_tasks(&["sync_host"])
        .build()?;
    let workers = queue.start();

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(task) = service.detail(task.task_id).await?
                && task.status.is_terminal()
            {
                return anyhow::Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("task did not finish in time")??;

    workers.shutdown_and_join().await;
    node.discovery.shutdown().await;

    for sub in &finished.sub_tasks {
        let response = sub
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();
        println!("{} {:?} {}", sub.sub_task_id, sub.status, response);
    }
    println!("{} {:?}", finished.task_id, finished.status);
    println!("{:?}", service.queue_counts(None).await?);

    if fail != (finished.status == TaskStatus::Fail) {
        bail!("unexpected final status {:?}", finished.status);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Run {
            config,
            advertise,
            service,
            dispatch_timeout_secs,
        } => {
            run(
                &config,
                advertise,
                service,
                Duration::from_secs(dispatch_timeout_secs),
            )
            .await
        }
        Command::Demo { fail } => demo(fail).await,
    }
}
