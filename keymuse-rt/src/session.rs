//! Per-session event buffering and analysis bookkeeping
//!
//! The [`SessionStore`] owns every [`SessionBuffer`] plus the one piece of
//! cross-task mutable state the pipeline has: each session's analysis
//! state and previous emotion vector. All operations are short and
//! O(1)-ish, so a single coarse mutex is enough; the per-session
//! Processing state is what serializes analysis, not the lock.

use keymuse_common::events::{EmotionVector, NormalizedEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Analysis state machine for one session.
///
/// Idle → Dirty on a new event; Dirty → Processing when the scheduler
/// picks the session up; Processing → Idle on completion, or → Dirty when
/// events arrived mid-run. A session is never dispatched while Processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Idle,
    Dirty,
    Processing {
        /// Events arrived while the in-flight run was active
        redirty: bool,
    },
}

/// Bounded FIFO of normalized events for one session
#[derive(Debug)]
pub struct SessionBuffer {
    events: VecDeque<NormalizedEvent>,
    capacity: usize,
}

impl SessionBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append an event, evicting the oldest when full.
    ///
    /// Streams from a single connection arrive in timestamp order; when
    /// multiple connections interleave, the event is slotted backwards
    /// from the tail so the buffer stays timestamp-ordered. Returns true
    /// when an old event was evicted to make room.
    fn append(&mut self, event: NormalizedEvent) -> bool {
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front();
            true
        } else {
            false
        };

        let mut idx = self.events.len();
        while idx > 0 && self.events[idx - 1].timestamp_ms > event.timestamp_ms {
            idx -= 1;
        }
        if idx == self.events.len() {
            self.events.push_back(event);
        } else {
            self.events.insert(idx, event);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn newest_timestamp(&self) -> Option<u64> {
        self.events.back().map(|e| e.timestamp_ms)
    }

    /// Pure, restartable read of events newer than newest − duration_ms.
    ///
    /// "Now" is the newest buffered timestamp since event clocks are
    /// client-relative.
    pub fn window(&self, duration_ms: u64) -> Vec<NormalizedEvent> {
        let Some(newest) = self.newest_timestamp() else {
            return Vec::new();
        };
        let cutoff = newest.saturating_sub(duration_ms);
        self.events
            .iter()
            .filter(|e| e.timestamp_ms >= cutoff)
            .cloned()
            .collect()
    }

    /// Drop events older than newest − max_age_ms. Returns the number
    /// removed.
    fn evict_older_than(&mut self, max_age_ms: u64) -> usize {
        let Some(newest) = self.newest_timestamp() else {
            return 0;
        };
        let cutoff = newest.saturating_sub(max_age_ms);
        let before = self.events.len();
        while let Some(front) = self.events.front() {
            if front.timestamp_ms < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
        before - self.events.len()
    }
}

struct SessionEntry {
    buffer: SessionBuffer,
    state: AnalysisState,
    previous_emotion: Option<EmotionVector>,
    last_activity: Instant,
}

struct StoreInner {
    sessions: HashMap<String, SessionEntry>,
    /// Explicit work queue; a session id appears here iff its state is Dirty
    dirty_queue: VecDeque<String>,
}

/// One unit of work handed to the analysis worker pool
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub session_id: String,
    /// Snapshot taken at pickup time; output may lag newer events by a tick
    pub events: Vec<NormalizedEvent>,
    pub previous: Option<EmotionVector>,
}

/// Owner of all session buffers and analysis state
pub struct SessionStore {
    inner: Mutex<StoreInner>,
    buffer_capacity: usize,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(buffer_capacity: usize, max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                sessions: HashMap::new(),
                dirty_queue: VecDeque::new(),
            }),
            buffer_capacity,
            max_sessions,
        }
    }

    /// Append an event to a session's buffer, creating the session on
    /// first contact and marking it dirty.
    pub fn append(&self, session_id: &str, event: NormalizedEvent) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if !inner.sessions.contains_key(session_id) && inner.sessions.len() >= self.max_sessions {
            if let Some(victim) = least_recently_active(&inner.sessions) {
                debug!("Session cap reached; evicting least-recently-active {victim}");
                inner.sessions.remove(&victim);
                inner.dirty_queue.retain(|id| id != &victim);
            }
        }

        let capacity = self.buffer_capacity;
        let entry = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                buffer: SessionBuffer::new(capacity),
                state: AnalysisState::Idle,
                previous_emotion: None,
                last_activity: Instant::now(),
            });

        entry.buffer.append(event);
        entry.last_activity = Instant::now();

        match entry.state {
            AnalysisState::Idle => {
                entry.state = AnalysisState::Dirty;
                inner.dirty_queue.push_back(session_id.to_string());
            }
            AnalysisState::Dirty => {}
            AnalysisState::Processing { .. } => {
                entry.state = AnalysisState::Processing { redirty: true };
            }
        }
    }

    /// Windowed snapshot of a session's events; None for unknown sessions
    pub fn window(&self, session_id: &str, duration_ms: u64) -> Option<Vec<NormalizedEvent>> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(session_id)
            .map(|e| e.buffer.window(duration_ms))
    }

    /// Number of buffered events for a session (0 for unknown sessions)
    pub fn buffered_len(&self, session_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(session_id)
            .map_or(0, |e| e.buffer.len())
    }

    /// Most recently computed emotion vector for a session
    pub fn latest_emotion(&self, session_id: &str) -> Option<EmotionVector> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(session_id)
            .and_then(|e| e.previous_emotion)
    }

    /// Current analysis state of a session
    pub fn analysis_state(&self, session_id: &str) -> Option<AnalysisState> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(session_id).map(|e| e.state)
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Dequeue up to `max` dirty sessions, transitioning each to
    /// Processing and snapshotting its analysis window.
    ///
    /// Sessions below `min_events` are reset to Idle and skipped; the
    /// next append re-marks them dirty, so nothing is lost, and queries
    /// against them answer pattern_not_ready in the meantime.
    pub fn take_dirty_batch(
        &self,
        max: usize,
        min_events: usize,
        window_ms: u64,
    ) -> Vec<AnalysisJob> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut jobs = Vec::new();

        while jobs.len() < max {
            let Some(session_id) = inner.dirty_queue.pop_front() else {
                break;
            };
            let Some(entry) = inner.sessions.get_mut(&session_id) else {
                continue; // evicted while queued
            };
            if entry.state != AnalysisState::Dirty {
                continue;
            }
            if entry.buffer.len() < min_events {
                entry.state = AnalysisState::Idle;
                continue;
            }
            entry.state = AnalysisState::Processing { redirty: false };
            jobs.push(AnalysisJob {
                events: entry.buffer.window(window_ms),
                previous: entry.previous_emotion,
                session_id,
            });
        }
        jobs
    }

    /// Complete an in-flight analysis. Stores the new emotion vector when
    /// the run succeeded and re-queues the session if events arrived
    /// mid-run. A session evicted mid-run is silently ignored.
    pub fn finish_analysis(&self, session_id: &str, emotion: Option<EmotionVector>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(entry) = inner.sessions.get_mut(session_id) else {
            debug!("finish_analysis for evicted session {session_id}");
            return;
        };
        if let Some(vector) = emotion {
            entry.previous_emotion = Some(vector);
        }
        match entry.state {
            AnalysisState::Processing { redirty: true } => {
                entry.state = AnalysisState::Dirty;
                inner.dirty_queue.push_back(session_id.to_string());
            }
            AnalysisState::Processing { redirty: false } => {
                entry.state = AnalysisState::Idle;
            }
            other => {
                warn!("finish_analysis for {session_id} in unexpected state {other:?}");
            }
        }
    }

    /// Periodic GC: drop stale events everywhere and destroy sessions
    /// with no activity for `max_session_idle`. Destroying a session
    /// clears its emotion state with it. Returns (events removed,
    /// sessions removed).
    pub fn collect_garbage(
        &self,
        max_event_age_ms: u64,
        max_session_idle: Duration,
    ) -> (usize, usize) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let now = Instant::now();
        let mut events_removed = 0;

        for entry in inner.sessions.values_mut() {
            events_removed += entry.buffer.evict_older_than(max_event_age_ms);
        }

        let stale: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, e)| {
                now.duration_since(e.last_activity) > max_session_idle
                    && !matches!(e.state, AnalysisState::Processing { .. })
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.sessions.remove(id);
            inner.dirty_queue.retain(|queued| queued != id);
        }
        (events_removed, stale.len())
    }

    /// Explicit teardown of one session and all its derived state
    pub fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(session_id);
        inner.dirty_queue.retain(|id| id != session_id);
    }
}

fn least_recently_active(sessions: &HashMap<String, SessionEntry>) -> Option<String> {
    sessions
        .iter()
        .min_by_key(|(_, e)| e.last_activity)
        .map(|(id, _)| id.clone())
}
