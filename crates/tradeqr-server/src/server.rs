//! Pairing-session server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::{header, Method};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tradeqr_core::rate_limit::SlidingWindowLimiter;
use tradeqr_core::sqlite_store::SqliteStore;
use tradeqr_core::store::{InMemoryStore, SessionStore};
use tradeqr_core::SessionManager;

use crate::api::{create_router, AppState};
use crate::config::{ServerConfig, StoreBackend};
use crate::identity::StaticTokenIdentity;
use crate::metrics::ServiceMetrics;

pub struct TradeServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    limiter: Arc<SlidingWindowLimiter>,
    identity: Arc<StaticTokenIdentity>,
    metrics: Arc<ServiceMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl TradeServer {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn SessionStore> = match config.store {
            StoreBackend::Sqlite => {
                info!(path = %config.database_path.display(), "Opening SQLite session store");
                Arc::new(SqliteStore::new(&config.database_path)?)
            }
            StoreBackend::Memory => {
                info!("Using in-memory session store");
                InMemoryStore::new_shared()
            }
        };

        let limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit_config()));
        for origin in &config.rate_limit_allowlist {
            limiter.add_to_allowlist(origin.clone()).await;
        }

        let sessions = Arc::new(
            SessionManager::new(store, limiter.clone()).with_config(config.session_config()),
        );

        let identity = Arc::new(StaticTokenIdentity::new(config.tokens.clone()));
        if identity.is_empty() {
            info!("No identity tokens configured; every request will be rejected as unauthorized");
        }

        let metrics = Arc::new(ServiceMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            sessions,
            limiter,
            identity,
            metrics,
            shutdown_tx,
        })
    }

    /// Build the full HTTP stack.
    pub fn router(&self) -> Router {
        let state = AppState {
            sessions: self.sessions.clone(),
            identity: self.identity.clone(),
            metrics: self.metrics.clone(),
            trust_forwarded_for: self.config.trust_forwarded_for,
        };

        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
        let cors = if self.config.cors_allow_any_origin {
            cors.allow_origin(Any)
        } else {
            cors
        };

        create_router(state).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(TimeoutLayer::new(self.config.request_timeout())),
        )
    }

    /// Run until SIGINT, SIGTERM or [`TradeServer::shutdown`].
    pub async fn run(&self) -> Result<()> {
        let sweep = tokio::spawn(Self::sweep_task(
            self.sessions.clone(),
            self.limiter.clone(),
            self.metrics.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let app = self.router();
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("tradeqr-server listening on {}", self.config.listen_addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(Self::shutdown_signal(self.shutdown_tx.subscribe()))
            .await?;

        // Stop the sweep as well when shutdown came from a signal.
        self.shutdown();
        let _ = sweep.await;
        info!("tradeqr-server stopped");

        Ok(())
    }

    async fn sweep_task(
        sessions: Arc<SessionManager>,
        limiter: Arc<SlidingWindowLimiter>,
        metrics: Arc<ServiceMetrics>,
        config: ServerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match sessions.sweep_expired().await {
                        Ok(expired) => metrics.sessions_expired.inc_by(expired as f64),
                        Err(e) => error!(error = %e, "Expiry sweep failed"),
                    }
                    let pruned = limiter.prune().await;
                    if pruned > 0 {
                        info!("Pruned {} idle rate limit origins", pruned);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm {
                        Some(ref mut sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = async {
                if *shutdown.borrow() {
                    return;
                }
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            } => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
