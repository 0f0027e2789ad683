//! Connection gateway
//!
//! Accepts WebSocket connections, authenticates their token through the
//! session validator, and runs one read loop per connection. Inbound
//! frames are decoded once into the closed [`ClientMessage`] set; every
//! failure mode is answered with a structured error frame and the loop
//! keeps running. Only a client close, a transport error, or the idle
//! timeout ends a connection.

use crate::api::AppContext;
use crate::error::{Error, Result};
use crate::qos::OutboundFrame;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use keymuse_common::events::NormalizedEvent;
use keymuse_common::protocol::{
    ClientMessage, NotReadyReason, PatternPayload, ServerMessage,
};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-connection mutable state owned by the read loop
struct ConnState {
    conn_id: Uuid,
    session_id: String,
    /// Newest timestamp this connection has forwarded; monotonicity is
    /// enforced per connection, not per session
    last_event_ts: Option<u64>,
    last_inbound: Instant,
}

/// `GET /ws?token=...` — upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(ctx): State<AppContext>,
) -> impl IntoResponse {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, token))
}

/// Full lifecycle of one connection: handshake, read loop, teardown.
///
/// The session's buffer and emotion state are keyed by session id and
/// survive this connection; only connection-local state is released here.
pub async fn handle_socket(socket: WebSocket, ctx: AppContext, token: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(session_id) = ctx.validator.validate(&token) else {
        warn!("Handshake rejected: invalid token");
        let frame = ServerMessage::error(Error::InvalidToken.code(), "session token rejected");
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = ws_tx.send(Message::Text(json)).await;
        }
        let _ = ws_tx.close().await;
        return;
    };

    let (conn_id, mut out_rx) = ctx.connections.register(&session_id);

    ctx.connections.send_to(
        conn_id,
        ServerMessage::ConnectionEstablished {
            session_id: session_id.clone(),
            qos_config: ctx.config.qos.summary(),
            timestamp: chrono::Utc::now(),
        },
    );

    // Writer task: owns the sink half, serializes and compresses frames.
    // It ends when the pool entry (the only sender) is dropped.
    let threshold = ctx.config.qos.compression_threshold_bytes;
    let connections = Arc::clone(&ctx.connections);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                OutboundFrame::Message(server_message) => {
                    match serde_json::to_string(&server_message) {
                        Ok(json) => encode_outbound(json, threshold),
                        Err(e) => {
                            error!("Failed to serialize outbound frame: {e}");
                            continue;
                        }
                    }
                }
                OutboundFrame::Ping => Message::Ping(Vec::new()),
                OutboundFrame::Pong(payload) => Message::Pong(payload),
            };
            let bytes = payload_len(&message);
            if ws_tx.send(message).await.is_err() {
                debug!("Writer for {conn_id} lost its socket");
                break;
            }
            connections.record_outbound(conn_id, bytes);
        }
        let _ = ws_tx.close().await;
    });

    let mut conn = ConnState {
        conn_id,
        session_id,
        last_event_ts: None,
        last_inbound: Instant::now(),
    };
    let heartbeat = Duration::from_secs(ctx.config.qos.heartbeat_interval_secs);
    let idle_timeout = Duration::from_secs(ctx.config.qos.idle_timeout_secs);

    loop {
        match tokio::time::timeout(heartbeat, ws_rx.next()).await {
            // Quiet for one heartbeat interval: probe, close if fully idle
            Err(_) => {
                if conn.last_inbound.elapsed() >= idle_timeout {
                    info!(
                        "Closing connection {conn_id}: silent for {}s",
                        conn.last_inbound.elapsed().as_secs()
                    );
                    break;
                }
                if !ctx.connections.send_ping(conn_id) {
                    break; // reaped by the pool
                }
            }
            Ok(Some(Ok(message))) => {
                conn.last_inbound = Instant::now();
                match message {
                    Message::Text(text) => {
                        if !process_text_frame(&ctx, &mut conn, &text) {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        ctx.connections.admit_inbound(conn_id);
                        ctx.connections.send_to(
                            conn_id,
                            ServerMessage::error("protocol_error", "binary frames not supported"),
                        );
                    }
                    Message::Ping(payload) => {
                        ctx.connections.send_pong(conn_id, payload);
                    }
                    Message::Pong(_) => {} // liveness already refreshed
                    Message::Close(_) => {
                        debug!("Client closed connection {conn_id}");
                        break;
                    }
                }
            }
            Ok(Some(Err(e))) => {
                warn!("WebSocket error on {conn_id}: {e}");
                break;
            }
            Ok(None) => {
                debug!("WebSocket stream ended for {conn_id}");
                break;
            }
        }
    }

    // Dropping the pool entry closes the outbound queue; the writer then
    // closes the socket on its way out.
    ctx.connections.unregister(conn_id);
    let _ = writer.await;
    info!("Connection {conn_id} torn down");
}

/// Rate-limit, decode and dispatch one text frame. Returns false only
/// when the connection is gone and the loop should exit.
fn process_text_frame(ctx: &AppContext, conn: &mut ConnState, text: &str) -> bool {
    let started = Instant::now();

    if !ctx.connections.admit_inbound(conn.conn_id) {
        return ctx.connections.send_to(
            conn.conn_id,
            ServerMessage::error(
                Error::RateLimit.code(),
                format!(
                    "limit is {} messages per second",
                    ctx.config.qos.rate_limit_per_sec
                ),
            ),
        );
    }

    let reply = match handle_message(ctx, conn, text, started) {
        Ok(reply) => reply,
        Err(e) => {
            if matches!(e, Error::Internal(_)) {
                // Unexpected failure: log with context, reply generically
                error!("Internal error on {}: {e}", conn.conn_id);
            } else {
                debug!("Recoverable error on {}: {e}", conn.conn_id);
            }
            Some(ServerMessage::error(e.code(), e.to_string()))
        }
    };

    match reply {
        Some(reply) => ctx.connections.send_to(conn.conn_id, reply),
        None => true,
    }
}

/// Decode one frame and run the matching operation
fn handle_message(
    ctx: &AppContext,
    conn: &mut ConnState,
    text: &str,
    started: Instant,
) -> Result<Option<ServerMessage>> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("unrecognized message: {e}")))?;

    match message {
        ClientMessage::TypingEvent { session_id, event } => {
            if let Some(echo) = session_id {
                if echo != conn.session_id {
                    debug!(
                        "Connection {} echoed session {echo}, bound to {}",
                        conn.conn_id, conn.session_id
                    );
                }
            }
            validate_event(conn, &event)?;
            ctx.store.append(&conn.session_id, event);
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            ctx.connections.record_latency(conn.conn_id, latency_ms);
            Ok(Some(ServerMessage::EventProcessed {
                status: "buffered".to_string(),
                latency_ms,
            }))
        }

        ClientMessage::BatchTypingEvents { events } => {
            let total_count = events.len();
            let mut processed_count = 0;
            for event in events {
                // A rejected event drops alone; the rest of the batch stands
                if validate_event(conn, &event).is_ok() {
                    ctx.store.append(&conn.session_id, event);
                    processed_count += 1;
                }
            }
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            ctx.connections.record_latency(conn.conn_id, latency_ms);
            Ok(Some(ServerMessage::BatchProcessed {
                processed_count,
                total_count,
                latency_ms,
            }))
        }

        ClientMessage::GetPattern => Ok(Some(pattern_query(ctx, &conn.session_id))),

        ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
    }
}

/// Reject structurally invalid or out-of-order events; the buffer is
/// never silently reordered.
fn validate_event(conn: &mut ConnState, event: &NormalizedEvent) -> Result<()> {
    if event.key.is_empty() {
        return Err(Error::Validation("event key must not be empty".into()));
    }
    if let Some(last) = conn.last_event_ts {
        if event.timestamp_ms < last {
            return Err(Error::Validation(format!(
                "timestamp {} precedes {}; events must be non-decreasing",
                event.timestamp_ms, last
            )));
        }
    }
    conn.last_event_ts = Some(event.timestamp_ms);
    Ok(())
}

/// Synchronous pattern query over the current buffer snapshot.
///
/// Below the minimum sample size this answers pattern_not_ready, never an
/// error; extraction precondition failures surface the same way with
/// their own reason.
fn pattern_query(ctx: &AppContext, session_id: &str) -> ServerMessage {
    let required = ctx.config.qos.min_events;
    let buffered = ctx.store.buffered_len(session_id);
    if buffered < required {
        return ServerMessage::PatternNotReady {
            reason: NotReadyReason::MinEvents,
            buffered,
            required,
        };
    }

    let window = ctx
        .store
        .window(session_id, ctx.config.qos.analysis_window_ms)
        .unwrap_or_default();

    match ctx.extractor.extract(&window) {
        crate::analysis::Extraction::Stats(stats) => ServerMessage::PatternData {
            pattern: PatternPayload {
                stats,
                emotion: ctx.store.latest_emotion(session_id),
            },
        },
        crate::analysis::Extraction::InsufficientEvents { available, required } => {
            ServerMessage::PatternNotReady {
                reason: NotReadyReason::InsufficientEvents,
                buffered: available,
                required,
            }
        }
        crate::analysis::Extraction::InvalidTimeSpan => ServerMessage::PatternNotReady {
            reason: NotReadyReason::InvalidTimeSpan,
            buffered,
            required,
        },
    }
}

/// Serialize an outbound payload, gzip-compressing it as a binary frame
/// when it meets the threshold and compression strictly shrinks it.
fn encode_outbound(json: String, threshold: usize) -> Message {
    if json.len() >= threshold {
        if let Ok(compressed) = gzip(json.as_bytes()) {
            if compressed.len() < json.len() {
                return Message::Binary(compressed);
            }
        }
    }
    Message::Text(json)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) | Message::Ping(bytes) | Message::Pong(bytes) => bytes.len(),
        Message::Close(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PatternExtractor;
    use crate::collab::TokenIsSessionValidator;
    use crate::qos::ConnectionPool;
    use crate::session::SessionStore;
    use keymuse_common::config::Config;
    use keymuse_common::events::KeyEdge;

    fn test_ctx() -> AppContext {
        let config = Arc::new(Config::default());
        AppContext {
            store: Arc::new(SessionStore::new(
                config.qos.buffer_capacity,
                config.qos.max_sessions,
            )),
            connections: Arc::new(ConnectionPool::new(
                config.qos.rate_limit_per_sec,
                config.qos.max_latency_ms,
            )),
            extractor: Arc::new(PatternExtractor::new(config.analysis.clone())),
            validator: Arc::new(TokenIsSessionValidator),
            config,
            started_at: Instant::now(),
        }
    }

    fn test_conn(ctx: &AppContext, session: &str) -> ConnState {
        let (conn_id, _rx) = ctx.connections.register(session);
        ConnState {
            conn_id,
            session_id: session.to_string(),
            last_event_ts: None,
            last_inbound: Instant::now(),
        }
    }

    fn typing_event_json(ts: u64) -> String {
        format!(
            r#"{{"type":"typing_event","event":{{"key":"a","timestamp":{ts},"type":"keydown"}}}}"#
        )
    }

    #[test]
    fn accepted_event_reaches_the_buffer() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");

        let reply = handle_message(&ctx, &mut conn, &typing_event_json(100), Instant::now())
            .unwrap()
            .unwrap();
        assert!(matches!(reply, ServerMessage::EventProcessed { .. }));
        assert_eq!(ctx.store.buffered_len("s1"), 1);
    }

    #[test]
    fn non_monotonic_event_is_rejected_not_reordered() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");

        handle_message(&ctx, &mut conn, &typing_event_json(500), Instant::now()).unwrap();
        let err = handle_message(&ctx, &mut conn, &typing_event_json(400), Instant::now())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_event");
        assert_eq!(ctx.store.buffered_len("s1"), 1);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");
        let err = handle_message(&ctx, &mut conn, "{not json", Instant::now()).unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[test]
    fn unknown_message_kind_is_a_protocol_error() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");
        let err = handle_message(
            &ctx,
            &mut conn,
            r#"{"type":"subscribe","channel":"x"}"#,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[test]
    fn batch_counts_accepted_and_rejected_events() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");

        let batch = r#"{"type":"batch_typing_events","events":[
            {"key":"a","timestamp":100,"type":"keydown"},
            {"key":"b","timestamp":50,"type":"keydown"},
            {"key":"c","timestamp":200,"type":"keydown"}
        ]}"#;
        let reply = handle_message(&ctx, &mut conn, batch, Instant::now())
            .unwrap()
            .unwrap();
        match reply {
            ServerMessage::BatchProcessed {
                processed_count,
                total_count,
                ..
            } => {
                assert_eq!(processed_count, 2); // the 50ms event went backwards
                assert_eq!(total_count, 3);
            }
            other => panic!("wrong reply: {other:?}"),
        }
        assert_eq!(ctx.store.buffered_len("s1"), 2);
    }

    #[test]
    fn sparse_session_query_answers_not_ready() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");
        for ts in [100u64, 200, 300, 400, 500] {
            handle_message(&ctx, &mut conn, &typing_event_json(ts), Instant::now()).unwrap();
        }
        let reply = handle_message(&ctx, &mut conn, r#"{"type":"get_pattern"}"#, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            ServerMessage::PatternNotReady {
                reason: NotReadyReason::MinEvents,
                buffered: 5,
                required: 10,
            }
        );
    }

    #[test]
    fn warm_session_query_returns_statistics() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");
        for i in 0..12u64 {
            handle_message(&ctx, &mut conn, &typing_event_json(i * 150), Instant::now()).unwrap();
        }
        let reply = handle_message(&ctx, &mut conn, r#"{"type":"get_pattern"}"#, Instant::now())
            .unwrap()
            .unwrap();
        match reply {
            ServerMessage::PatternData { pattern } => {
                assert_eq!(pattern.stats.keydown_count, 12);
                assert!(pattern.stats.words_per_minute > 0.0);
            }
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[test]
    fn ping_answers_pong() {
        let ctx = test_ctx();
        let mut conn = test_conn(&ctx, "s1");
        let reply = handle_message(&ctx, &mut conn, r#"{"type":"ping"}"#, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(reply, ServerMessage::Pong);
    }

    #[test]
    fn small_frames_stay_uncompressed() {
        let message = encode_outbound("{\"type\":\"pong\"}".to_string(), 1024);
        assert!(matches!(message, Message::Text(_)));
    }

    #[test]
    fn large_compressible_frames_shrink_to_binary() {
        let json = format!("{{\"data\":\"{}\"}}", "a".repeat(4096));
        let original_len = json.len();
        match encode_outbound(json, 1024) {
            Message::Binary(bytes) => assert!(bytes.len() < original_len),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test]
    fn frames_below_threshold_stay_text() {
        let json = format!("{{\"data\":\"{}\"}}", "a".repeat(512));
        let message = encode_outbound(json, 1024);
        assert!(matches!(message, Message::Text(_)));
    }
}
