//! FaqBot API Gateway
//!
//! The HTTP entry point for the chatbot.
//! Handles:
//! - Streaming answer endpoints (SSE)
//! - Session inspection and eviction
//! - Rate limiting and concurrency limits
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;

use anyhow::Context as _;
use axum::{
    error_handling::HandleErrorLayer,
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Router,
};
use faqbot_common::{
    config::{AppConfig, ObservabilityConfig},
    context::{ChatEngine, EngineDeps},
    db::{
        memory::{InMemoryChatLog, InMemoryFaqStore, InMemoryRecordStore},
        DbPool, Repository,
    },
    embeddings::{create_embedder, MockEmbedder},
    errors::AppError,
    llm::{create_completer, MockCompleter},
    metrics::{self, GENERATION_BUCKETS, LATENCY_BUCKETS, METRICS_PREFIX},
    session::SessionStore,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tower::{limit::ConcurrencyLimitLayer, timeout::TimeoutLayer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<ChatEngine>,
    pub sessions: Arc<SessionStore>,
    pub db: Option<DbPool>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, deps: EngineDeps, db: Option<DbPool>) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let engine = Arc::new(ChatEngine::new(&config, deps, sessions.clone()));
        Self {
            config,
            engine,
            sessions,
            db,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Validated on load
    let config = Arc::new(AppConfig::load().context("Failed to load configuration")?);
    init_tracing(&config.observability);

    info!(service = %config.observability.service_name, "Starting FaqBot API Gateway v{}", faqbot_common::VERSION);

    // Initialize metrics
    let prometheus = install_prometheus()?;
    metrics::register_metrics();

    let (deps, db) = build_deps(&config).await?;
    let state = AppState::new(config.clone(), deps, db).with_metrics(prometheus);

    let _sweeper = state
        .sessions
        .spawn_eviction(config.session.idle_ttl(), config.session.sweep_interval());

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .into_future();

    // Open streams get `shutdown_timeout` to finish once the signal arrives
    let grace = config.shutdown_timeout();
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.notified().await;
            tokio::time::sleep(grace).await;
        } => warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed, closing open streams"),
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let latency = [
        "request_duration_seconds",
        "retrieval_duration_seconds",
        "embedding_duration_seconds",
    ];
    let long_running = ["generation_duration_seconds", "turn_duration_seconds"];

    let mut builder = PrometheusBuilder::new();
    for name in latency {
        builder = builder.set_buckets_for_metric(
            Matcher::Full(format!("{}_{}", METRICS_PREFIX, name)),
            LATENCY_BUCKETS,
        )?;
    }
    for name in long_running {
        builder = builder.set_buckets_for_metric(
            Matcher::Full(format!("{}_{}", METRICS_PREFIX, name)),
            GENERATION_BUCKETS,
        )?;
    }
    Ok(builder.install_recorder()?)
}

/// Providers and stores for the configured profile.
///
/// Without a database URL the gateway runs on mock providers and in-memory
/// stores.
async fn build_deps(config: &AppConfig) -> anyhow::Result<(EngineDeps, Option<DbPool>)> {
    if !config.has_database() {
        warn!("No database configured, using in-memory stores and mock providers");
        let deps = EngineDeps {
            embedder: Arc::new(MockEmbedder::new(config.embedding.dimension)),
            completer: Arc::new(MockCompleter::new()),
            faq_store: Arc::new(InMemoryFaqStore::new()),
            chat_log: Arc::new(InMemoryChatLog::new()),
            records: Arc::new(InMemoryRecordStore::new()),
        };
        return Ok((deps, None));
    }

    let db = DbPool::new(&config.database).await?;
    match db.pgvector_enabled().await {
        Ok(true) => info!("pgvector extension available"),
        Ok(false) => warn!("pgvector extension not installed, distance-mode retrieval will fail"),
        Err(e) => warn!(error = %e, "Could not check for the pgvector extension"),
    }

    let repo = Arc::new(Repository::new(db.clone()));
    let deps = EngineDeps {
        embedder: create_embedder(&config.embedding)?,
        completer: create_completer(&config.llm)?,
        faq_store: repo.clone(),
        chat_log: repo.clone(),
        records: repo,
    };
    Ok((deps, Some(db)))
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Chat endpoints
    let mut chat_routes = Router::new()
        .route("/faq/chatbot", post(handlers::chat::ask))
        .route("/ask", post(handlers::chat::ask))
        .route("/chatbot/ask", post(handlers::chat::converse));

    if state.config.rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(
            state.config.rate_limit.requests_per_second,
            state.config.rate_limit.burst,
        );
        chat_routes = chat_routes.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    }

    let ops_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        // Session endpoints
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get_session).delete(handlers::sessions::delete_session),
        );

    let limits = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_middleware_error))
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(ConcurrencyLimitLayer::new(state.config.server.max_concurrent_requests.max(1)));

    // Compose the app
    Router::new()
        .merge(chat_routes)
        .merge(ops_routes)
        .layer(axum::middleware::from_fn(middleware::track_metrics))
        .layer(limits)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Errors raised by tower middleware (timeouts)
async fn handle_middleware_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        AppError::ServiceUnavailable {
            message: "Request timed out".to_string(),
        }
        .into_response()
    } else {
        AppError::Internal {
            message: err.to_string(),
        }
        .into_response()
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal(notify: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
    notify.notify_one();
}
