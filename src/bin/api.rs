use sqlx::postgres::PgPoolOptions;
use tempmail_core::{
    ApiServer, auth::TokenVerifier, config::AppConfig,
    events::{EventBus, EventStore},
    init_tracing, shutdown_signal,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = AppConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let events = EventBus::new(EventStore::with_capacity(config.sse.event_buffer_size));
    let token_verifier = TokenVerifier::new(&config.jwt_secret);

    let shutdown = CancellationToken::new();
    let socket = "0.0.0.0:8080".parse().expect("static socket address");
    let server = ApiServer::new(socket, pool, events, token_verifier, &config.sse, shutdown.clone());

    info!(%socket, "starting API server");
    server.spawn();

    shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();
}
