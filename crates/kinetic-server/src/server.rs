use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use kinetic_coord::{JobScheduler, Ticker, TokioTicker};
use kinetic_core::{SharedClock, SystemClock};
use kinetic_kv::KeyValueStore;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    admin, config::AppConfig, handlers, middleware as app_middleware, state::AppState,
};

pub struct KineticServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    scheduler_enabled: bool,
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/presence/heartbeat", post(handlers::presence_heartbeat))
        .nest("/admin", admin::admin_routes())
        // Middleware stack (order: request id -> trace -> metrics -> rate limit -> body limit)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(app_middleware::request_id))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|req: &axum::http::Request<_>| {
                            let req_id = req
                                .extensions()
                                .get::<axum::http::HeaderValue>()
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string();
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri(),
                                http.status_code = tracing::field::Empty,
                                request_id = %req_id
                            )
                        })
                        .on_response(
                            |res: &axum::http::Response<_>,
                             latency: std::time::Duration,
                             span: &tracing::Span| {
                                span.record(
                                    "http.status_code",
                                    tracing::field::display(res.status().as_u16()),
                                );
                                tracing::info!(
                                    http.status = %res.status().as_u16(),
                                    elapsed_ms = %latency.as_millis(),
                                    "request handled"
                                );
                            },
                        ),
                )
                .layer(middleware::from_fn(app_middleware::http_metrics))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    app_middleware::rate_limit,
                ))
                .layer(axum::extract::DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    clock: SharedClock,
    ticker: Arc<dyn Ticker>,
    store: Option<KeyValueStore>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            clock: Arc::new(SystemClock),
            ticker: Arc::new(TokioTicker),
            store: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = ticker;
        self
    }

    /// Use an existing store instead of connecting from configuration.
    pub fn with_store(mut self, store: KeyValueStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> anyhow::Result<KineticServer> {
        self.config.validate().map_err(anyhow::Error::msg)?;
        crate::metrics::init_metrics();

        let store = match self.store {
            Some(store) => store,
            None => {
                kinetic_kv::connect_store(&self.config.redis, &self.config.cache, self.clock.clone())
                    .await
            }
        };
        tracing::info!(mode = %store.mode(), "Key-value store ready");

        let scheduler = JobScheduler::new(&self.config.scheduler, self.ticker, self.clock.clone());
        let state = AppState::new(&self.config, store, self.clock, scheduler);
        let app = build_app(state.clone(), &self.config);

        Ok(KineticServer {
            addr: self.addr,
            app,
            state,
            scheduler_enabled: self.config.scheduler.enabled,
        })
    }
}

impl KineticServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if self.scheduler_enabled {
            self.state.scheduler.start();
        } else {
            tracing::info!("Job scheduler disabled by configuration");
        }

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        self.state.scheduler.stop();
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
