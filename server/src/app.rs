//! Core application

use std::sync::Arc;

use thiserror::Error;

use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::data::{self, StoreError};
use crate::domain::cluster::{Cluster, ClusterError, LoopbackTransport};
use crate::domain::hub::Hub;
use crate::domain::push::{LogPushAdapter, Push};
use crate::domain::{ServerCtx, standalone_ctx};

/// Startup failure, mapped onto the process exit codes: config errors exit
/// with 1, store init errors with 2, cluster init errors with 3.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
    #[error("store initialization failed: {0}")]
    Store(#[from] StoreError),
    #[error("cluster initialization failed: {0}")]
    Cluster(#[from] ClusterError),
}

impl InitError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::Config(_) => 1,
            InitError::Store(_) => 2,
            InitError::Cluster(_) => 3,
        }
    }
}

pub struct CoreApp {
    pub config: AppConfig,
    pub ctx: Arc<ServerCtx>,
    pub shutdown: ShutdownService,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<(), InitError> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await;
        Ok(())
    }

    async fn init(cli: &CliConfig) -> Result<Self, InitError> {
        let config = AppConfig::load(cli).map_err(InitError::Config)?;

        let store = data::open_store(
            config.store_backend,
            config.topics.masked_tag_namespaces.clone(),
        )?;
        tracing::debug!(backend = %config.store_backend, "Store initialized");

        let mut push = Push::new();
        for name in &config.push_adapters {
            match name.as_str() {
                "log" => push.register(Arc::new(LogPushAdapter)),
                other => tracing::warn!(adapter = other, "unknown push adapter skipped"),
            }
        }

        let ctx = match config.cluster_spec() {
            None => standalone_ctx(config.topics.clone(), store, push),
            Some(spec) => {
                // The network transport for cluster frames is pluggable;
                // without one configured the node falls back to the
                // in-process loopback, which only serves single-machine
                // simulations.
                tracing::warn!(
                    node = %spec.self_name,
                    "no cluster network transport configured, using in-process loopback"
                );
                let transport = LoopbackTransport::new();
                let cluster = Cluster::new(spec, transport.clone())?;
                transport.register(cluster.self_name(), cluster.inbox());

                let ctx = ServerCtx::new(config.topics.clone(), store, push);
                let hub = Hub::new(ctx.clone());
                ctx.attach_hub(hub);
                cluster.attach_ctx(ctx.clone());
                ctx.attach_cluster(Some(cluster));
                ctx
            }
        };

        let shutdown = ShutdownService::new(ctx.clone());
        if let Some(cluster) = ctx.cluster() {
            for task in cluster.start(shutdown.subscribe()) {
                shutdown.register(task).await;
            }
        }

        Ok(Self {
            config,
            ctx,
            shutdown,
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        tracing::info!(
            host = %app.config.server.host,
            port = app.config.server.port,
            push = ?app.ctx.push.names(),
            cluster = app.ctx.cluster().map(|c| c.self_name().to_string()),
            "server ready, transports may attach"
        );

        app.shutdown.wait().await;
        app.shutdown.shutdown().await;
    }
}
