//! gantry server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::{Parser, ValueEnum};
use gantry_api::services::GitHubClient;
use gantry_api::{AppState, routes};
use gantry_cluster::{Cluster, KubeCluster, LeaderElector};
use gantry_config::{SystemConfig, load_system_config};
use gantry_core::artifact::{LogStore, MemoryLogStore};
use gantry_core::githost::GitHost;
use gantry_db::{PgSchemaCheck, Repos, create_pool, run_migrations};
use gantry_scheduler::{
    BazelBuilder, BuilderOptions, Controller, Discovery, DiscoveryViewer, GarbageCollector,
    ObjectLogStore, TimeoutSweeper, coordinator, discovery,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "gantry-server", about = "Bazel build orchestrator for Kubernetes")]
struct Args {
    /// Path to the KDL configuration file
    #[arg(long, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `database-url` from the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Apply embedded migrations before starting
    #[arg(long)]
    migrate: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = match &args.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(url) = args.database_url {
        config.database_url = Some(url);
    }

    // Connect to the database
    let database_url = config
        .database_url
        .clone()
        .context("database url is not configured")?;
    info!("Connecting to database...");
    let pool = create_pool(&database_url).await?;
    if args.migrate {
        run_migrations(&pool).await?;
        info!("Migrations applied");
    }
    let repos = Repos::postgres(pool.clone());

    let cluster = KubeCluster::new(config.namespace.clone()).await?;
    let shared_cluster: Arc<dyn Cluster> = Arc::new(cluster.clone());

    let logs: Arc<dyn LogStore> = match &config.storage {
        Some(storage) => Arc::new(ObjectLogStore::new(storage.clone())),
        None => {
            warn!("storage is not configured, build logs are kept in memory");
            Arc::new(MemoryLogStore::new())
        }
    };
    let github: Option<Arc<dyn GitHost>> = match &config.github.token {
        Some(token) => Some(Arc::new(GitHubClient::new(
            config.github.api_url.clone(),
            Some(token.clone()),
        ))),
        None => {
            warn!("github token is not configured, statuses and comments are disabled");
            None
        }
    };

    let options = BuilderOptions::from_config(&config);
    let builder = Arc::new(BazelBuilder::new(
        options.clone(),
        shared_cluster.clone(),
        repos.clone(),
        logs.clone(),
        github.clone(),
    ));
    let discoverer = Arc::new(Discovery::new(
        options,
        shared_cluster.clone(),
        repos.clone(),
        builder.clone(),
        github.clone(),
    ));
    let viewer = Arc::new(DiscoveryViewer::new());

    let router = Arc::new(
        gantry_cluster::Router::builder()
            .add(coordinator::JOB_TYPE, builder.clone())
            .add(discovery::JOB_TYPE, discoverer.clone())
            .add(discovery::JOB_TYPE, viewer.clone())
            .build(),
    );
    let gc = Arc::new(GarbageCollector::new(
        repos.clone(),
        logs,
        config.gc.retain,
        config.gc.interval(),
    ));
    let sweeper = Arc::new(TimeoutSweeper::new(
        shared_cluster,
        builder.clone(),
        coordinator::JOB_TYPE,
        config.sweep.interval(),
        config.task.timeout(),
    ));
    let controller = Controller::new(cluster.jobs(), router, builder.clone(), gc, sweeper);

    let state = AppState::new(
        repos,
        builder,
        discoverer,
        github,
        viewer,
        Arc::new(PgSchemaCheck::new(pool)),
    )
    .with_webhook_secret(config.github.webhook_secret.clone());
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
            shutdown.cancel();
        }
    });

    let listen = config.listen;
    let lead = move |token: CancellationToken| serve(controller.clone(), app.clone(), listen, token);

    if config.leader_election.enabled {
        let election = &config.leader_election;
        let identity = election
            .identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let namespace = election
            .lease_namespace
            .clone()
            .unwrap_or_else(|| config.namespace.clone());
        let elector = LeaderElector::new(
            cluster.client(),
            &namespace,
            election.lease_name.clone(),
            identity,
        );
        elector.run(shutdown, lead).await;
    } else {
        lead(shutdown).await;
    }

    Ok(())
}

/// Run the controller and the HTTP server until `token` is cancelled.
async fn serve(controller: Controller, app: Router, addr: SocketAddr, token: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            token.cancel();
            return;
        }
    };
    info!("Starting server on {}", addr);

    let http = async {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .await;
        if let Err(e) = result {
            error!(error = %e, "server exited");
            token.cancel();
        }
    };
    tokio::join!(controller.run(token.clone()), http);
}
