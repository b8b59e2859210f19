//! A bounded FIFO of log entries with many producers and one async consumer.
//!
//! Producers must never block the worker's event pump, so `push` is
//! synchronous and sheds the chattiest queued `Msg` when the bus is full.
//! Activity records are never dropped.

use super::{BuildLogger, Field, Level, LogEntry};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

/// The shared log entry queue. Constructed once per task and handed to every
/// producer as an injected `Arc` handle.
pub struct LogBus {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

struct Inner {
    queue: VecDeque<LogEntry>,
    closed: bool,
    dropped: u64,
}

impl LogBus {
    /// Create a bus bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(LogBus {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Enqueue an entry without blocking. When the bus is full the oldest
    /// `Msg` of the chattiest level present is discarded instead; activity
    /// records always get through. Entries pushed after `close` are ignored.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut inner = self.inner.lock().expect("log bus lock");
            if inner.closed {
                return;
            }

            if inner.queue.len() >= self.capacity {
                match Self::chattiest_msg(&inner.queue) {
                    Some(index) => {
                        inner.queue.remove(index);
                        inner.dropped += 1;
                    }
                    None if entry.is_discardable() => {
                        // Nothing older to shed, the incoming message is the
                        // oldest discardable one.
                        inner.dropped += 1;
                        return;
                    }
                    None => {}
                }
            }

            inner.queue.push_back(entry);
        }
        self.notify.notify_one();
    }

    /// Drain up to `max` entries. Waits until at least one entry is
    /// available or the bus is closed; an empty result means closed and
    /// fully drained.
    pub async fn pop_many(&self, max: usize) -> Vec<LogEntry> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("log bus lock");
                if !inner.queue.is_empty() {
                    let take = max.min(inner.queue.len());
                    return inner.queue.drain(..take).collect();
                }
                if inner.closed {
                    return Vec::new();
                }
            }
            notified.await;
        }
    }

    /// Close the bus and wake all waiters. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("log bus lock");
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Number of entries shed so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("log bus lock").dropped
    }

    /// Index of the oldest `Msg` with the chattiest level in the queue.
    fn chattiest_msg(queue: &VecDeque<LogEntry>) -> Option<usize> {
        let mut found: Option<(usize, Level)> = None;
        for (index, entry) in queue.iter().enumerate() {
            if let Some(level) = entry.msg_level() {
                match found {
                    Some((_, best)) if level <= best => {}
                    _ => found = Some((index, level)),
                }
            }
        }
        found.map(|(index, _)| index)
    }
}

/// A [`BuildLogger`] implementation stamping entries with a monotonic
/// millisecond clock and pushing them onto the bus. The agent uses this to
/// interleave its own messages with the worker's.
pub struct BusLogger {
    bus: Arc<LogBus>,
    started: Instant,
}

impl BusLogger {
    /// Create a logger handle over the given bus.
    pub fn new(bus: Arc<LogBus>) -> Self {
        BusLogger {
            bus,
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl BuildLogger for BusLogger {
    fn log_msg(&self, level: Level, text: String) {
        let ms = self.now_ms();
        self.bus.push(LogEntry::Msg { level, ms, text });
    }

    fn start_activity(
        &self,
        act_id: u64,
        level: Level,
        kind: u64,
        text: String,
        fields: Vec<Field>,
        parent: u64,
    ) {
        let ms = self.now_ms();
        self.bus.push(LogEntry::StartActivity {
            act_id,
            level,
            ms,
            kind,
            text,
            fields,
            parent,
        });
    }

    fn stop_activity(&self, act_id: u64) {
        let ms = self.now_ms();
        self.bus.push(LogEntry::StopActivity { act_id, ms });
    }

    fn result(&self, act_id: u64, kind: u64, fields: Vec<Field>) {
        let ms = self.now_ms();
        self.bus.push(LogEntry::Result {
            act_id,
            ms,
            kind,
            fields,
        });
    }
}
