use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use spool_analyzer::{Analyzer, AnalyzerConfig, OpenAiClient};
use spool_db::{Database, StatusStatistics};
use spool_stream::{
    EventBus, FanOutHub, Ingestor, IngestorConfig, LogStore, LokiLogStore, RedisEventBus,
};

use crate::{telemetry, ws};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;
    let _telemetry = telemetry::init("spool-daemon")?;

    let db = Database::connect(&config.database_url)
        .await
        .context("failed to open metadata store")?;

    let logs: Arc<dyn LogStore> =
        Arc::new(LokiLogStore::new(&config.loki_url).context("failed to build log store client")?);

    let bus: Arc<dyn EventBus> = RedisEventBus::connect(&config.redis_url)
        .await
        .context("failed to connect to event bus")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub = FanOutHub::new();
    tokio::spawn(hub.clone().run(bus.subscribe_events(), shutdown_rx.clone()));

    let ingestor = Arc::new(Ingestor::new(
        db.clone(),
        logs.clone(),
        bus.clone(),
        IngestorConfig {
            batch_size: config.batch_size,
            batch_interval: config.batch_interval,
            flush_attempts: 3,
        },
    ));

    let model = Arc::new(OpenAiClient::new().context("failed to build model client")?);
    let analyzer = Analyzer::new(
        db.clone(),
        logs.clone(),
        bus.clone(),
        model,
        AnalyzerConfig {
            workers: config.analyzer_workers,
            poll_timeout: Duration::from_secs(5),
        },
    );
    let workers = analyzer.spawn(shutdown_rx.clone());

    let state = Arc::new(AppState {
        db,
        logs,
        hub,
        ingestor,
        shutdown: shutdown_rx.clone(),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/ingest", get(ws::ingest))
        .route("/ws/runs/:run_id", get(ws::subscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "spool-daemon listening");

    // The serve future stops accepting on the shutdown signal but still
    // waits for open connections; the grace period bounds that wait. The
    // handlers watch the same channel, so streams abort themselves well
    // before the deadline in the normal case.
    let mut grace_watch = shutdown_rx.clone();
    tokio::select! {
        served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx)) => {
            served.context("HTTP server exited")?;
        }
        _ = async {
            while !*grace_watch.borrow() {
                if grace_watch.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(config.shutdown_grace).await;
        } => {
            warn!(grace = ?config.shutdown_grace,
                "shutdown grace elapsed with connections still open; forcing exit");
        }
    }

    // Give in-flight analyzer tasks the same bounded window to finish.
    let drained = tokio::time::timeout(config.shutdown_grace, async {
        for worker in workers {
            let _ = worker.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace = ?config.shutdown_grace, "shutdown grace elapsed with workers still busy");
    }
    info!("spool-daemon stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown.send(true);
}

pub(crate) struct AppState {
    pub db: Database,
    pub logs: Arc<dyn LogStore>,
    pub hub: Arc<FanOutHub>,
    pub ingestor: Arc<Ingestor>,
    /// Flips to true on shutdown; WebSocket handlers watch it so open
    /// streams wind down instead of pinning the process.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    database_url: String,
    loki_url: String,
    redis_url: String,
    batch_size: usize,
    batch_interval: Duration,
    analyzer_workers: usize,
    shutdown_grace: Duration,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("SPOOL_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SPOOL_LISTEN_ADDR")?;

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be configured")?;

        let loki_url =
            env::var("SPOOL_LOKI_URL").unwrap_or_else(|_| "http://localhost:3100".to_string());
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let batch_size = env::var("SPOOL_BATCH_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(100);
        let batch_interval = env::var("SPOOL_BATCH_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        let analyzer_workers = env::var("SPOOL_ANALYZER_WORKERS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(2);

        let shutdown_grace = env::var("SPOOL_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        Ok(Self {
            listen_addr,
            database_url,
            loki_url,
            redis_url,
            batch_size,
            batch_interval,
            analyzer_workers,
            shutdown_grace,
        })
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatusStatistics>, ApiError> {
    let stats = state.db.stats().await.map_err(ApiError::internal)?;
    Ok(Json(stats))
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
