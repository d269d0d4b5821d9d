use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{
        IntoResponse, Response,
        sse::{Event as AxumEvent, Sse},
    },
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    api::{ApiState, error::ApiError},
    events::{Event, EventType},
    models::EventId,
};

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn to_axum_event(event: &Event) -> AxumEvent {
    AxumEvent::default()
        .event(event.event_type.as_str())
        .data(event.payload.to_string())
        .id(event.id.to_string())
}

/// `GET /api/v1/events/stream`. Implements the `HandleStream` algorithm:
/// authenticate, register the connection (possibly evicting the oldest for
/// this user), emit `connected`, replay since `Last-Event-ID` if present,
/// subscribe to the bus, then serve heartbeats and events until the client
/// disconnects or the connection is evicted or times out.
pub async fn sse_handler(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = query.token.or_else(|| bearer_token(&headers)).ok_or_else(ApiError::auth_token_invalid)?;
    let user_id = state.token_verifier.verify(&token).map_err(|_| ApiError::auth_token_invalid())?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<EventId>().ok());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = std::sync::Arc::new(crate::events::Connection::new(user_id, tx.clone()));
    state.registry.add(conn.clone());

    let heartbeat_interval = state.sse_heartbeat_interval;
    let connection_timeout = state.sse_connection_timeout;
    let events = state.events.clone();
    let registry = state.registry.clone();

    let stream = async_stream::stream! {
        yield Ok::<AxumEvent, Infallible>(
            AxumEvent::default()
                .event(EventType::Connected.as_str())
                .data(json!({ "connection_id": conn.id }).to_string())
                .id("0"),
        );

        if let Some(last_id) = last_event_id {
            for event in events.store().since(user_id, last_id) {
                yield Ok(to_axum_event(&event));
            }
        }

        let subscription = events.subscribe(user_id, move |event| {
            let _ = tx.send(event.clone());
        });

        let started_at = tokio::time::Instant::now();
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;

        loop {
            if conn.is_closed() || started_at.elapsed() > connection_timeout {
                break;
            }

            tokio::select! {
                _ = heartbeat.tick() => {
                    registry.update_last_ping(user_id, conn.id);
                    yield Ok(
                        AxumEvent::default()
                            .event(EventType::Heartbeat.as_str())
                            .data(json!({ "at": chrono::Utc::now() }).to_string())
                            .id("0"),
                    );
                }
                received = rx.recv() => match received {
                    Some(event) => yield Ok(to_axum_event(&event)),
                    None => break,
                }
            }
        }

        subscription.unsubscribe();
        registry.remove(user_id, conn.id);
        trace!(%user_id, "sse stream ended");
    };

    let sse = Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}
