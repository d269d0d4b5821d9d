use axum::{
    Json, Router,
    extract::{FromRef, State},
    routing::get,
};
use serde::Serialize;
use sqlx::PgPool;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    auth::TokenVerifier,
    config::SseConfig,
    events::{ConnectionRegistry, EventBus},
};

pub mod error;
pub mod sse;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pool: PgPool,
    token_verifier: TokenVerifier,
    events: EventBus,
    registry: ConnectionRegistry,
    sse_heartbeat_interval: Duration,
    sse_connection_timeout: Duration,
}

impl FromRef<ApiState> for PgPool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        socket: SocketAddr,
        pool: PgPool,
        events: EventBus,
        token_verifier: TokenVerifier,
        sse_config: &SseConfig,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let registry = ConnectionRegistry::with_cap(sse_config.max_connections_per_user);
        let cleanup = registry.start_cleanup_routine(Duration::from_secs(60), sse_config.heartbeat_interval, sse_config.connection_timeout);
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                cleanup.cancel();
            }
        });

        let state = ApiState {
            pool,
            token_verifier,
            events,
            registry,
            sse_heartbeat_interval: sse_config.heartbeat_interval,
            sse_connection_timeout: sse_config.connection_timeout,
        };

        let router = Router::new()
            .route("/healthy", get(healthy))
            .route("/v1/events/stream", get(sse::sse_handler))
            .layer((TraceLayer::new_for_http(), TimeoutLayer::new(Duration::from_secs(10))))
            .with_state(state);

        ApiServer {
            socket,
            router: Router::new().nest("/api", router),
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket).await.map_err(ApiServerError::Bind)?;

        info!(addr = %self.socket, "API server listening");

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!(error = ?e, "API server error");
                token.cancel();
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

#[derive(Debug, Serialize)]
struct HealthyResponse {
    healthy: bool,
    status: &'static str,
}

async fn healthy(State(pool): State<PgPool>) -> Json<HealthyResponse> {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => Json(HealthyResponse { healthy: true, status: "OK" }),
        Err(e) => {
            error!(error = ?e, "database health check failed");
            Json(HealthyResponse {
                healthy: false,
                status: "database error",
            })
        }
    }
}
