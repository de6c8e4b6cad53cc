//! Toolsmith - Main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use toolsmith::{
    build::{self, BuildCoordinator, BuildPool, ProcessRunner, RegistryPublisher},
    config::Config,
    db::{self, Database},
    history::BuildStatus,
    orchestrator::{ApiState, ExecutionCoordinator, KubeCluster, ToolRef, ToolsmithApi},
    tools::ToolResolver,
};

/// Poll cadence for build log tails and `build --wait`.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pending builds the queue holds before submitters wait.
const BUILD_QUEUE_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "toolsmith")]
#[command(about = "Run registered tool scripts on a cluster and build their images")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Listen port, overriding API_PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one tool synchronously and print the outcome as JSON
    Run {
        /// Tool id or legacy path, e.g. `recon/nmap_scan`
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Build a tool's image and wait for the result
    Build {
        /// Tool id or legacy path
        tool: String,
    },
}

/// Everything the commands share.
struct Engine {
    db: Arc<dyn Database>,
    executions: Arc<ExecutionCoordinator>,
    builds: Arc<BuildCoordinator>,
    resolver: Arc<ToolResolver>,
    publisher: Arc<RegistryPublisher>,
    pool: BuildPool,
}

impl Engine {
    async fn start(config: &Config) -> anyhow::Result<Self> {
        let db = db::connect_from_config(&config.database).await?;
        tracing::info!(backend = ?config.database.backend, "Database connected and migrations applied");

        let cluster = Arc::new(KubeCluster::connect(config.cluster.namespace.clone()).await?);
        tracing::info!(namespace = %config.cluster.namespace, "Cluster client ready");

        tokio::fs::create_dir_all(&config.build.context_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create build context dir {}",
                    config.build.context_dir.display()
                )
            })?;

        let runner = Arc::new(ProcessRunner::new());
        let publisher = Arc::new(RegistryPublisher::new(
            runner.clone(),
            config.cluster.cluster_type,
            config.build.ecr_region.clone(),
        ));
        let backend = build::select_backend(
            &config.build,
            &config.cluster,
            cluster.clone(),
            runner,
            publisher.clone(),
            db.clone(),
        );
        let pool = BuildPool::start(
            backend,
            db.clone(),
            config.build.workers,
            BUILD_QUEUE_CAPACITY,
        );

        let resolver = Arc::new(ToolResolver::new(db.clone(), config.build.registry.clone()));
        let builds = Arc::new(BuildCoordinator::new(
            db.clone(),
            resolver.clone(),
            pool.queue(),
        ));
        let executions = Arc::new(ExecutionCoordinator::new(
            cluster,
            db.clone(),
            resolver.clone(),
            config.cluster.clone(),
        ));

        Ok(Self {
            db,
            executions,
            builds,
            resolver,
            publisher,
            pool,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolsmith=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::from_env()?;
    let engine = Engine::start(&config).await?;

    match args.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => serve(engine, &config, port).await,
        Command::Run { tool, args } => run(engine, tool, &args).await,
        Command::Build { tool } => build_and_wait(engine, tool).await,
    }
}

async fn serve(engine: Engine, config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.api.port);
    let addr: SocketAddr = format!("{}:{}", config.api.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.api.host, port))?;

    let state = ApiState {
        executions: engine.executions.clone(),
        builds: engine.builds.clone(),
        store: engine.db.clone(),
        publisher: engine.publisher.clone(),
        context_dir: config.build.context_dir.clone(),
        log_poll_interval: LOG_POLL_INTERVAL,
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
    };

    let served = ToolsmithApi::start(state, addr, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!(e));
    engine.pool.shutdown().await;
    served
}

async fn run(engine: Engine, tool: String, args: &str) -> anyhow::Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(args).context("--args must be a JSON object")?;
    let response = engine
        .executions
        .run_sync(ToolRef::Identifier(tool), arguments)
        .await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    engine.pool.shutdown().await;
    if response.exit_code != 0 {
        anyhow::bail!("tool exited with code {}", response.exit_code);
    }
    Ok(())
}

async fn build_and_wait(engine: Engine, tool: String) -> anyhow::Result<()> {
    let definition = engine.resolver.find(&tool).await?;
    let docker = definition.parse_config()?.docker.unwrap_or_default();
    let build_id = engine.builds.trigger_build(&definition.id, docker).await?;
    tracing::info!(build_id = %build_id, tool_id = %definition.id, "Build started");

    let mut printed = 0;
    let job = loop {
        let Some(job) = engine.builds.build_status(build_id).await? else {
            anyhow::bail!("build {} disappeared", build_id);
        };
        if let Some(new) = job.logs.get(printed..) {
            print!("{}", new);
            printed = job.logs.len();
        }
        if job.status.is_terminal() {
            break job;
        }
        tokio::time::sleep(LOG_POLL_INTERVAL).await;
    };

    engine.pool.shutdown().await;
    match job.status {
        BuildStatus::Success => {
            println!("Image: {}", job.image_tag.unwrap_or_default());
            Ok(())
        }
        status => anyhow::bail!("build {} finished {}", build_id, status),
    }
}
