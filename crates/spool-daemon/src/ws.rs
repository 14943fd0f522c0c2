//! WebSocket adapters: the bidirectional ingestion stream and the one-way
//! run subscription.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use spool_stream::{
    authorize_token, fanout::DEFAULT_SUBSCRIBER_CAPACITY, BusEvent, FanOutError, Frame, Reply,
};

use crate::server::{ApiError, AppState};

/// Bidirectional ingestion stream. Authentication travels in the
/// `authorization` header; frames and replies are JSON text messages.
pub(crate) async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = header_token(&headers) else {
        return ApiError::unauthorized("missing authorization header").into_response();
    };
    ws.on_upgrade(move |socket| serve_ingest(state, socket, token))
}

async fn serve_ingest(state: Arc<AppState>, socket: WebSocket, token: String) {
    let (mut sink, mut stream) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(256);
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(32);

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            match serde_json::to_string(&reply) {
                Ok(payload) => {
                    if sink.send(Message::Text(payload)).await.is_err() {
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "unserializable reply"),
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let reader_replies = reply_tx.clone();
    let mut shutdown = state.shutdown.clone();
    let reader = tokio::spawn(async move {
        loop {
            // Dropping frame_tx on any exit hands the engine a closed
            // channel: final flush, then the run finalizes as aborted.
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if frame_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        // Malformed frame: tell the client and drop the
                        // stream; the engine observes the close and aborts
                        // the run.
                        Err(err) => {
                            let _ = reader_replies
                                .send(Reply::Error {
                                    message: format!("malformed frame: {err}"),
                                })
                                .await;
                            break;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        let _ = reader_replies
                            .send(Reply::Error {
                                message: "binary frames are not supported".into(),
                            })
                            .await;
                        break;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Ping/pong stays at the transport layer.
                    Some(Ok(_)) => {}
                }
            }
        }
    });

    match state.ingestor.run_stream(&token, frame_rx, reply_tx).await {
        Ok(outcome) => info!(?outcome, "ingest stream closed"),
        Err(err) => debug!(error = %err, "ingest stream terminated"),
    }

    // The engine is done: stop reading even if the client lingers.
    reader.abort();
    let _ = writer.await;
}

#[derive(Deserialize)]
pub(crate) struct SubscribeQuery {
    token: Option<String>,
}

/// One-way run subscription: snapshot from the log store, then the live
/// tail. Authorization happens before the upgrade.
pub(crate) async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token.or_else(|| header_token(&headers)) else {
        return ApiError::unauthorized("missing token").into_response();
    };

    match authorize_token(&state.db, run_id, &token).await {
        Ok(_) => ws.on_upgrade(move |socket| serve_subscriber(state, socket, run_id)),
        Err(FanOutError::RunNotFound(_)) => ApiError::not_found("run not found").into_response(),
        Err(FanOutError::Forbidden) => ApiError::forbidden("access denied").into_response(),
        Err(FanOutError::Internal(err)) => ApiError::internal(err).into_response(),
    }
}

async fn serve_subscriber(state: Arc<AppState>, socket: WebSocket, run_id: Uuid) {
    // Register before reading the snapshot: anything published from here on
    // lands in the queue, so the subscriber sees overlap at worst, never a gap.
    let mut subscription = state.hub.subscribe(run_id, DEFAULT_SUBSCRIBER_CAPACITY);
    let (mut sink, mut stream) = socket.split();

    let snapshot = match state.logs.query(run_id).await {
        Ok(lines) => lines,
        Err(err) => {
            warn!(%run_id, error = %err, "snapshot query failed");
            state.hub.unsubscribe(run_id, subscription.id);
            return;
        }
    };
    for line in &snapshot {
        if send_event(&mut sink, &BusEvent::log(run_id, line)).await.is_err() {
            state.hub.unsubscribe(run_id, subscription.id);
            return;
        }
    }
    debug!(%run_id, snapshot_lines = snapshot.len(), "subscriber attached");

    let mut shutdown = state.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = subscription.rx.recv() => match event {
                Some(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                // The hub dropped us (backpressure) or shut down.
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pings are answered by the transport; inbound data is ignored.
                Some(Ok(_)) => {}
            }
        }
    }

    state.hub.unsubscribe(run_id, subscription.id);
    debug!(%run_id, "subscriber detached");
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &BusEvent,
) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    sink.send(Message::Text(payload)).await.map_err(|_| ())
}

/// Pulls a token from the `authorization` header, tolerating a `Bearer `
/// prefix.
fn header_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_token_accepts_bare_and_bearer_values() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc123"));
        assert_eq!(header_token(&headers).as_deref(), Some("abc123"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(header_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn header_token_rejects_empty_values() {
        let mut headers = HeaderMap::new();
        assert!(header_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(header_token(&headers).is_none());
    }
}
