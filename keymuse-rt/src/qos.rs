//! Connection pool and QoS management
//!
//! Tracks every live WebSocket connection with its metrics, enforces the
//! per-connection rate limit, fans results out to all connections of a
//! session, and reaps idle connections. Connection state is transient:
//! reaping releases only connection-local resources, never the session's
//! buffer or emotion state.

use keymuse_common::protocol::ServerMessage;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Smoothing factor of the per-connection latency moving average
const LATENCY_EMA_ALPHA: f64 = 0.1;

/// Frames queued to a connection's writer task.
///
/// Protocol messages are JSON; Ping/Pong are WebSocket control frames so
/// liveness probing stays outside the closed outbound message set.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(ServerMessage),
    /// Server-initiated liveness probe
    Ping,
    /// Reply to a client's protocol-level ping
    Pong(Vec<u8>),
}

/// Sliding one-second message window.
///
/// Excess messages are rejected immediately, never queued.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit as usize,
            window: Duration::from_secs(1),
            hits: VecDeque::with_capacity(limit as usize),
        }
    }

    /// Record one message attempt at `now`. Returns false when the
    /// connection already used its budget within the sliding window.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() < self.limit {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-connection counters, created on connect and destroyed on disconnect
#[derive(Debug)]
pub struct ConnectionMetrics {
    pub connected_at: Instant,
    pub last_inbound: Instant,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_out: u64,
    /// Exponential moving average of processing latency, milliseconds
    pub avg_latency_ms: f64,
}

struct Connection {
    session_id: String,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    metrics: ConnectionMetrics,
    rate: RateWindow,
}

/// Aggregate snapshot served by the metrics accessor
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub connections: usize,
    pub messages_per_sec: f64,
    pub avg_latency_ms: f64,
    pub bandwidth_bytes_per_sec: f64,
}

struct RateProbe {
    at: Instant,
    messages: u64,
    bytes: u64,
}

/// Registry of live connections keyed by connection id
pub struct ConnectionPool {
    connections: Mutex<HashMap<Uuid, Connection>>,
    max_latency_ms: f64,
    rate_limit: u32,
    totals: Mutex<Totals>,
    probe: Mutex<RateProbe>,
}

#[derive(Default)]
struct Totals {
    messages: u64,
    bytes_out: u64,
}

impl ConnectionPool {
    pub fn new(rate_limit: u32, max_latency_ms: f64) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_latency_ms,
            rate_limit,
            totals: Mutex::new(Totals::default()),
            probe: Mutex::new(RateProbe {
                at: Instant::now(),
                messages: 0,
                bytes: 0,
            }),
        }
    }

    /// Register a connection for a session. Returns the connection id and
    /// the receiver end of its outbound queue; dropping the pool entry
    /// closes the queue, which ends the connection's writer task.
    pub fn register(&self, session_id: &str) -> (Uuid, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        let now = Instant::now();
        let connection = Connection {
            session_id: session_id.to_string(),
            sender: tx,
            metrics: ConnectionMetrics {
                connected_at: now,
                last_inbound: now,
                messages_in: 0,
                messages_out: 0,
                bytes_out: 0,
                avg_latency_ms: 0.0,
            },
            rate: RateWindow::new(self.rate_limit),
        };
        self.connections.lock().unwrap().insert(conn_id, connection);
        info!("Connection {conn_id} registered for session {session_id}");
        (conn_id, rx)
    }

    /// Release a connection's metrics and outbound queue
    pub fn unregister(&self, conn_id: Uuid) {
        if self.connections.lock().unwrap().remove(&conn_id).is_some() {
            debug!("Connection {conn_id} unregistered");
        }
    }

    /// Account one inbound message and check the rate limit.
    ///
    /// Returns false when the message must be rejected with
    /// `rate_limit_exceeded`; rejected messages still refresh liveness.
    pub fn admit_inbound(&self, conn_id: Uuid) -> bool {
        let now = Instant::now();
        self.totals.lock().unwrap().messages += 1;
        let mut connections = self.connections.lock().unwrap();
        let Some(connection) = connections.get_mut(&conn_id) else {
            return false;
        };
        connection.metrics.last_inbound = now;
        connection.metrics.messages_in += 1;
        connection.rate.try_acquire(now)
    }

    /// Fold one processing-latency sample into the connection's EMA.
    /// Budget breaches are logged, never enforced by dropping messages.
    pub fn record_latency(&self, conn_id: Uuid, latency_ms: f64) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(connection) = connections.get_mut(&conn_id) {
            let ema = &mut connection.metrics.avg_latency_ms;
            *ema = if connection.metrics.messages_in <= 1 {
                latency_ms
            } else {
                LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * *ema
            };
            if *ema > self.max_latency_ms {
                warn!(
                    "Connection {conn_id} latency EMA {:.1}ms exceeds budget {:.1}ms",
                    *ema, self.max_latency_ms
                );
            }
        }
    }

    /// Account outbound bytes for the bandwidth metric
    pub fn record_outbound(&self, conn_id: Uuid, bytes: usize) {
        self.totals.lock().unwrap().bytes_out += bytes as u64;
        let mut connections = self.connections.lock().unwrap();
        if let Some(connection) = connections.get_mut(&conn_id) {
            connection.metrics.messages_out += 1;
            connection.metrics.bytes_out += bytes as u64;
        }
    }

    /// Queue a protocol message to one connection. Returns false if it
    /// is gone.
    pub fn send_to(&self, conn_id: Uuid, message: ServerMessage) -> bool {
        self.send_frame(conn_id, OutboundFrame::Message(message))
    }

    /// Queue a WebSocket-level liveness probe
    pub fn send_ping(&self, conn_id: Uuid) -> bool {
        self.send_frame(conn_id, OutboundFrame::Ping)
    }

    /// Queue the reply to a client's protocol-level ping
    pub fn send_pong(&self, conn_id: Uuid, payload: Vec<u8>) -> bool {
        self.send_frame(conn_id, OutboundFrame::Pong(payload))
    }

    fn send_frame(&self, conn_id: Uuid, frame: OutboundFrame) -> bool {
        let connections = self.connections.lock().unwrap();
        match connections.get(&conn_id) {
            Some(connection) => connection.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Fan a frame out to every live connection of a session.
    ///
    /// A dead connection never blocks delivery to the rest; dead entries
    /// are pruned on the way. Returns the number of deliveries, so a
    /// session with no connections makes the caller's broadcast a no-op
    /// rather than an error.
    pub fn broadcast(&self, session_id: &str, message: &ServerMessage) -> usize {
        let mut connections = self.connections.lock().unwrap();
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (conn_id, connection) in connections.iter() {
            if connection.session_id != session_id {
                continue;
            }
            if connection
                .sender
                .send(OutboundFrame::Message(message.clone()))
                .is_ok()
            {
                delivered += 1;
            } else {
                dead.push(*conn_id);
            }
        }
        for conn_id in dead {
            connections.remove(&conn_id);
            debug!("Pruned dead connection {conn_id} during broadcast");
        }
        delivered
    }

    /// Close connections with no inbound traffic for `idle_timeout`.
    /// Dropping the pool entry closes the outbound queue, which ends the
    /// connection's writer and read loop. Session state is untouched.
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut connections = self.connections.lock().unwrap();
        let idle: Vec<Uuid> = connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.metrics.last_inbound) > idle_timeout)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in &idle {
            connections.remove(conn_id);
            info!("Reaped idle connection {conn_id}");
        }
        idle.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Rates are computed over the interval since the previous snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        let connections = self.connections.lock().unwrap();
        let count = connections.len();
        let avg_latency_ms = if count == 0 {
            0.0
        } else {
            connections
                .values()
                .map(|c| c.metrics.avg_latency_ms)
                .sum::<f64>()
                / count as f64
        };
        drop(connections);

        let totals = self.totals.lock().unwrap();
        let (messages, bytes) = (totals.messages, totals.bytes_out);
        drop(totals);

        let mut probe = self.probe.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(probe.at).as_secs_f64().max(1e-3);
        let messages_per_sec = (messages - probe.messages) as f64 / elapsed;
        let bandwidth_bytes_per_sec = (bytes - probe.bytes) as f64 / elapsed;
        *probe = RateProbe {
            at: now,
            messages,
            bytes,
        };

        PoolMetrics {
            connections: count,
            messages_per_sec,
            avg_latency_ms,
            bandwidth_bytes_per_sec,
        }
    }
}

/// Periodic idle-connection reaper, joined at teardown via the shutdown
/// signal.
pub fn spawn_reaper(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick carries no information
        info!(
            "Idle reaper started ({}s interval, {}s timeout)",
            interval.as_secs(),
            idle_timeout.as_secs()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = pool.reap_idle(idle_timeout);
                    if reaped > 0 {
                        debug!("Reaped {reaped} idle connections");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Idle reaper stopping");
                    break;
                }
            }
        }
    })
}
