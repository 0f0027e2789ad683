//! Batch scheduler and analysis worker pool
//!
//! A periodic tick loop drains dirty sessions from the store and hands
//! each one to a bounded pool of native worker threads, keeping CPU-bound
//! extraction and mapping off the connection-handling path. The store's
//! per-session Processing state guarantees at most one in-flight analysis
//! per session; the pool only provides parallelism across sessions.

use crate::analysis::{EmotionMapper, Extraction, PatternExtractor};
use crate::collab::{EmotionSink, MusicTrigger};
use crate::qos::ConnectionPool;
use crate::session::{AnalysisJob, SessionStore};
use keymuse_common::config::QosConfig;
use keymuse_common::protocol::{PatternPayload, ServerMessage};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything a worker needs to complete one analysis run
pub struct AnalysisContext {
    pub store: Arc<SessionStore>,
    pub connections: Arc<ConnectionPool>,
    pub extractor: PatternExtractor,
    pub mapper: EmotionMapper,
    pub sink: Arc<dyn EmotionSink>,
    pub trigger: Arc<dyn MusicTrigger>,
}

struct SharedPoolState {
    queue: Mutex<VecDeque<AnalysisJob>>,
    condvar: Condvar,
    stop_flag: AtomicBool,
}

/// Bounded pool of native analysis workers
pub struct AnalysisPool {
    state: Arc<SharedPoolState>,
    threads: Vec<JoinHandle<()>>,
}

impl AnalysisPool {
    /// Spawn `worker_threads` workers (0 selects the available core count).
    pub fn new(worker_threads: usize, ctx: Arc<AnalysisContext>) -> Self {
        let count = if worker_threads == 0 {
            thread::available_parallelism().map_or(2, |n| n.get())
        } else {
            worker_threads
        };

        let state = Arc::new(SharedPoolState {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop_flag: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(count);
        for worker_id in 0..count {
            let state_clone = Arc::clone(&state);
            let ctx_clone = Arc::clone(&ctx);
            threads.push(thread::spawn(move || {
                Self::worker_loop(worker_id, state_clone, ctx_clone);
            }));
        }

        info!("Analysis pool started with {count} worker threads");
        Self { state, threads }
    }

    /// Queue one job. Jobs submitted during shutdown are dropped; the
    /// session's Processing state is released so it is re-analyzable
    /// after restart.
    pub fn submit(&self, job: AnalysisJob, ctx: &AnalysisContext) {
        if self.state.stop_flag.load(Ordering::Relaxed) {
            warn!("Analysis pool shutting down; dropping job for {}", job.session_id);
            ctx.store.finish_analysis(&job.session_id, None);
            return;
        }
        {
            let mut queue = self.state.queue.lock().unwrap();
            queue.push_back(job);
        }
        self.state.condvar.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.state.queue.lock().unwrap().len()
    }

    fn worker_loop(worker_id: usize, state: Arc<SharedPoolState>, ctx: Arc<AnalysisContext>) {
        debug!("Analysis worker {worker_id} started");
        loop {
            let job = {
                let mut queue = state.queue.lock().unwrap();
                while queue.is_empty() && !state.stop_flag.load(Ordering::Relaxed) {
                    queue = state.condvar.wait(queue).unwrap();
                }
                if state.stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                queue.pop_front()
            };

            let Some(job) = job else { continue };
            let session_id = job.session_id.clone();

            // Task boundary: an unexpected failure is logged and the
            // session released; it must never take the worker down.
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                process_job(&ctx, job);
            }));
            if outcome.is_err() {
                error!("Analysis worker {worker_id} recovered from panic on session {session_id}");
                ctx.store.finish_analysis(&session_id, None);
            }
        }
        debug!("Analysis worker {worker_id} exiting");
    }

    /// Signal stop and join every worker
    pub fn shutdown(self) {
        info!("Shutting down analysis pool");
        self.state.stop_flag.store(true, Ordering::Relaxed);
        self.state.condvar.notify_all();
        for (idx, handle) in self.threads.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                error!("Analysis worker {idx} join failed: {e:?}");
            }
        }
        info!("Analysis pool shut down");
    }
}

/// Run one job to completion: extract, map, publish, persist.
///
/// The previous-vector slot updates only on a successful computation;
/// precondition failures release the session without touching it. A
/// session whose connections are all gone completes silently.
fn process_job(ctx: &AnalysisContext, job: AnalysisJob) {
    match ctx.extractor.extract(&job.events) {
        Extraction::Stats(stats) => {
            let vector = ctx.mapper.map(&stats, job.previous.as_ref());
            ctx.store.finish_analysis(&job.session_id, Some(vector));

            let update = ServerMessage::PatternUpdate {
                pattern: PatternPayload {
                    stats: stats.clone(),
                    emotion: Some(vector),
                },
            };
            let delivered = ctx.connections.broadcast(&job.session_id, &update);
            if delivered == 0 {
                debug!("No live connections for {}; update not broadcast", job.session_id);
            }

            ctx.sink.save_typing_pattern(&job.session_id, &stats);
            ctx.sink.save_emotion_profile(&job.session_id, &vector);
            ctx.trigger.emotion_updated(&job.session_id, &vector);
        }
        Extraction::InsufficientEvents { available, required } => {
            debug!(
                "Session {}: {available}/{required} keydowns, analysis skipped",
                job.session_id
            );
            ctx.store.finish_analysis(&job.session_id, None);
        }
        Extraction::InvalidTimeSpan => {
            debug!("Session {}: zero time span, analysis skipped", job.session_id);
            ctx.store.finish_analysis(&job.session_id, None);
        }
    }
}

/// Periodic tick loop: dispatch up to `batch_size` distinct dirty
/// sessions per tick. Owns the worker pool and joins it on shutdown.
pub fn spawn_scheduler(
    ctx: Arc<AnalysisContext>,
    pool: AnalysisPool,
    config: &QosConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let tick = Duration::from_millis(config.batch_interval_ms);
    let batch_size = config.batch_size;
    let min_events = config.min_events;
    let window_ms = config.analysis_window_ms;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        info!(
            "Batch scheduler started ({}ms tick, batch size {batch_size})",
            tick.as_millis()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let jobs = ctx.store.take_dirty_batch(batch_size, min_events, window_ms);
                    if !jobs.is_empty() {
                        debug!("Dispatching {} dirty sessions", jobs.len());
                    }
                    for job in jobs {
                        pool.submit(job, &ctx);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Batch scheduler stopping");
        pool.shutdown();
    })
}

/// Periodic store GC: stale events first, then sessions idle past the
/// session timeout (destroying a session clears its emotion state).
pub fn spawn_gc(
    store: Arc<SessionStore>,
    config: &QosConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(config.gc_interval_secs);
    let max_event_age_ms = config.event_max_age_ms;
    let session_idle = Duration::from_millis(config.event_max_age_ms);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        info!("Buffer GC started ({}s interval)", interval.as_secs());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (events, sessions) = store.collect_garbage(max_event_age_ms, session_idle);
                    if events > 0 || sessions > 0 {
                        debug!("GC removed {events} stale events, {sessions} idle sessions");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Buffer GC stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{LoggingSink, LoggingTrigger};
    use keymuse_common::config::AnalysisConfig;
    use keymuse_common::events::{KeyEdge, NormalizedEvent};
    use std::time::Instant;

    fn context() -> Arc<AnalysisContext> {
        Arc::new(AnalysisContext {
            store: Arc::new(SessionStore::new(1000, 1000)),
            connections: Arc::new(ConnectionPool::new(100, 50.0)),
            extractor: PatternExtractor::new(AnalysisConfig::default()),
            mapper: EmotionMapper::new(AnalysisConfig::default()),
            sink: Arc::new(LoggingSink),
            trigger: Arc::new(LoggingTrigger),
        })
    }

    fn feed(store: &SessionStore, session_id: &str, count: u64) {
        for i in 0..count {
            store.append(
                session_id,
                NormalizedEvent {
                    key: "a".to_string(),
                    timestamp_ms: i * 150,
                    duration_ms: Some(70),
                    edge: KeyEdge::KeyDown,
                },
            );
        }
    }

    fn wait_for_idle(store: &SessionStore, session_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match store.analysis_state(session_id) {
                Some(crate::session::AnalysisState::Idle) | None => return,
                _ if Instant::now() > deadline => panic!("analysis did not finish"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    #[test]
    fn pool_completes_a_job_and_stores_the_vector() {
        let ctx = context();
        let pool = AnalysisPool::new(2, Arc::clone(&ctx));

        feed(&ctx.store, "s1", 15);
        let jobs = ctx.store.take_dirty_batch(50, 10, u64::MAX);
        assert_eq!(jobs.len(), 1);
        pool.submit(jobs.into_iter().next().unwrap(), &ctx);

        wait_for_idle(&ctx.store, "s1");
        let vector = ctx.store.latest_emotion("s1").expect("vector stored");
        assert!(vector.energy > 0.0);

        pool.shutdown();
    }

    #[test]
    fn insufficient_window_releases_session_without_vector() {
        let ctx = context();
        let pool = AnalysisPool::new(1, Arc::clone(&ctx));

        // 10 keyups pass the min-events gate but carry no keydowns
        for i in 0..10u64 {
            ctx.store.append(
                "ups",
                NormalizedEvent {
                    key: "a".to_string(),
                    timestamp_ms: i * 100,
                    duration_ms: None,
                    edge: KeyEdge::KeyUp,
                },
            );
        }
        let jobs = ctx.store.take_dirty_batch(50, 10, u64::MAX);
        assert_eq!(jobs.len(), 1);
        pool.submit(jobs.into_iter().next().unwrap(), &ctx);

        wait_for_idle(&ctx.store, "ups");
        assert_eq!(ctx.store.latest_emotion("ups"), None);

        pool.shutdown();
    }

    #[test]
    fn shutdown_joins_cleanly_with_queued_work() {
        let ctx = context();
        let pool = AnalysisPool::new(2, Arc::clone(&ctx));
        for s in 0..20 {
            let id = format!("s{s}");
            feed(&ctx.store, &id, 15);
        }
        for job in ctx.store.take_dirty_batch(50, 10, u64::MAX) {
            pool.submit(job, &ctx);
        }
        pool.shutdown();
    }
}
