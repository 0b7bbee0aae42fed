use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const DEFAULT_INACTIVE_CAPACITY: usize = 30;
pub const DEFAULT_ACTIVE_CAPACITY: usize = 5000;
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(30);

const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

/// 0 for ERROR up to 4 for TRACE. Higher is more verbose.
fn rank(level: Level) -> u8 {
    LEVELS.iter().position(|l| *l == level).unwrap_or(4) as u8
}

/// One captured log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

#[derive(Debug)]
struct BufferState {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
    /// Subscription expiry per level rank.
    expires: [Option<Instant>; 5],
}

/// Fixed-capacity ring of recent log events for live viewers.
///
/// Idle, it keeps a short tail at `base_level`. While a viewer keeps
/// renewing interest in a level, it captures down to that level and grows
/// to the active capacity; once every subscription lapses it shrinks back,
/// keeping the newest entries. Reads return owned copies.
#[derive(Debug)]
pub struct LogBuffer {
    state: Mutex<BufferState>,
    /// Most verbose rank currently captured.
    effective_rank: AtomicU8,
    base_rank: u8,
    inactive_capacity: usize,
    active_capacity: usize,
    timeout: Duration,
}

impl LogBuffer {
    pub fn new(
        inactive_capacity: usize,
        active_capacity: usize,
        timeout: Duration,
        base_level: Level,
    ) -> Self {
        let inactive_capacity = inactive_capacity.max(1);
        let active_capacity = active_capacity.max(inactive_capacity);
        Self {
            state: Mutex::new(BufferState {
                entries: VecDeque::with_capacity(inactive_capacity),
                capacity: inactive_capacity,
                next_id: 1,
                expires: [None; 5],
            }),
            effective_rank: AtomicU8::new(rank(base_level)),
            base_rank: rank(base_level),
            inactive_capacity,
            active_capacity,
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether events at `level` are currently captured. One atomic load.
    pub fn enabled(&self, level: Level) -> bool {
        rank(level) <= self.effective_rank.load(Ordering::Acquire)
    }

    pub fn effective_level(&self) -> Level {
        LEVELS[usize::from(self.effective_rank.load(Ordering::Acquire))]
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Keep capturing `level` for another timeout period.
    pub fn renew_subscription(&self, level: Level) {
        self.renew_subscription_at(level, Instant::now());
    }

    pub(crate) fn renew_subscription_at(&self, level: Level, now: Instant) {
        let mut state = self.lock();
        state.expires[usize::from(rank(level))] = Some(now + self.timeout);
        state.capacity = self.active_capacity;
        self.recompute(&state);
    }

    pub fn record(&self, level: Level, target: &str, message: String) {
        self.record_at(level, target, message, Instant::now(), Utc::now());
    }

    pub(crate) fn record_at(
        &self,
        level: Level,
        target: &str,
        message: String,
        now: Instant,
        timestamp: DateTime<Utc>,
    ) {
        if !self.enabled(level) {
            return;
        }
        let mut state = self.lock();
        self.expire(&mut state, now);
        if rank(level) > self.effective_rank.load(Ordering::Acquire) {
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back(LogEntry {
            id,
            timestamp,
            level,
            target: target.to_string(),
            message,
        });
        while state.entries.len() > state.capacity {
            state.entries.pop_front();
        }
    }

    /// Drop lapsed subscriptions; shrink when none remain.
    pub fn expire_subscriptions(&self) {
        let mut state = self.lock();
        self.expire(&mut state, Instant::now());
    }

    fn expire(&self, state: &mut BufferState, now: Instant) {
        let mut changed = false;
        for slot in state.expires.iter_mut() {
            if matches!(slot, Some(deadline) if *deadline <= now) {
                *slot = None;
                changed = true;
            }
        }
        if !changed {
            return;
        }
        if state.expires.iter().all(Option::is_none) {
            state.capacity = self.inactive_capacity;
            while state.entries.len() > state.capacity {
                state.entries.pop_front();
            }
        }
        self.recompute(state);
    }

    fn recompute(&self, state: &BufferState) {
        let subscribed = state
            .expires
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(rank, _)| rank as u8)
            .max();
        let effective = subscribed.map_or(self.base_rank, |r| r.max(self.base_rank));
        self.effective_rank.store(effective, Ordering::Release);
    }

    /// Owned copy of every buffered entry, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Entries newer than `id` at `min_level` or more severe. Only the newest
    /// `page_size` matches are returned, oldest first.
    pub fn after_id(&self, id: u64, min_level: Level, page_size: usize) -> Vec<LogEntry> {
        let state = self.lock();
        let max_rank = rank(min_level);
        let mut page: Vec<LogEntry> = state
            .entries
            .iter()
            .rev()
            .filter(|e| e.id > id && rank(e.level) <= max_rank)
            .take(page_size)
            .cloned()
            .collect();
        page.reverse();
        page
    }

    /// Entries stamped after `time` at `min_level` or more severe, oldest first.
    pub fn after_time(&self, time: DateTime<Utc>, min_level: Level) -> Vec<LogEntry> {
        let max_rank = rank(min_level);
        self.lock()
            .entries
            .iter()
            .filter(|e| e.timestamp > time && rank(e.level) <= max_rank)
            .cloned()
            .collect()
    }
}

/// `tracing` layer feeding a [`LogBuffer`].
#[derive(Debug, Clone)]
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if !self.buffer.enabled(level) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer
            .record(level, metadata.target(), visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
