use crate::clock::Clock;
use crate::task::TaskEnvelope;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_COUNT_MAX_SIZE: usize = 100;
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(10);

/// Optional callback invoked when a time-count aggregator auto-flushes on
/// `Add`. Always dispatched off the buffer lock.
pub type FlushCallback = Arc<dyn Fn(Vec<TaskEnvelope>) + Send + Sync>;

/// Buffers tasks and signals flush readiness. All operations are atomic with
/// respect to one another; `Flush` never hands a partially-mutated slice to
/// two callers; `stop` halts any background timer and is idempotent.
pub trait Aggregator: Send + Sync {
    fn add(&self, envelope: TaskEnvelope);
    fn should_flush(&self) -> bool;
    /// Drains the buffer and resets internal state, returning what was held.
    fn flush(&self) -> Vec<TaskEnvelope>;
    fn reset(&self);
    fn size(&self) -> usize;
    fn stop(&self);
}

/// `ShouldFlush` iff buffered >= `max_size`. Non-positive `max_size` at
/// construction resolves to `DEFAULT_COUNT_MAX_SIZE`. No timers.
pub struct CountAggregator {
    max_size: usize,
    buffer: Mutex<Vec<TaskEnvelope>>,
}

impl CountAggregator {
    pub fn new(max_size: i64) -> Self {
        let max_size = if max_size <= 0 {
            DEFAULT_COUNT_MAX_SIZE
        } else {
            max_size as usize
        };
        Self {
            max_size,
            buffer: Mutex::new(Vec::new()),
        }
    }
}

impl Aggregator for CountAggregator {
    fn add(&self, envelope: TaskEnvelope) {
        self.buffer.lock().unwrap().push(envelope);
    }

    fn should_flush(&self) -> bool {
        self.buffer.lock().unwrap().len() >= self.max_size
    }

    fn flush(&self) -> Vec<TaskEnvelope> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    fn reset(&self) {
        self.buffer.lock().unwrap().clear();
    }

    fn size(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    fn stop(&self) {
        // No background timer to halt.
    }
}

struct TimeState {
    buffer: Vec<TaskEnvelope>,
    last_flush: DateTime<Utc>,
}

/// `ShouldFlush` iff `now - lastFlush >= timeWindow` and buffer is
/// non-empty. Runs an internal timer that marks readiness on expiry; the
/// actual drain happens when the consumer calls `Flush`. Default window 10s.
pub struct TimeAggregator {
    time_window: Duration,
    state: Arc<Mutex<TimeState>>,
    clock: Arc<dyn Clock>,
    ready: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimeAggregator {
    pub fn new(time_window: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        let time_window = if time_window.is_zero() {
            DEFAULT_TIME_WINDOW
        } else {
            time_window
        };
        let aggregator = Arc::new(Self {
            time_window,
            state: Arc::new(Mutex::new(TimeState {
                buffer: Vec::new(),
                last_flush: clock.now(),
            })),
            clock,
            ready: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        });
        aggregator.spawn_timer();
        aggregator
    }

    fn spawn_timer(self: &Arc<Self>) {
        let ready = self.ready.clone();
        let stopped = self.stopped.clone();
        let window = self.time_window;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                ready.store(true, Ordering::SeqCst);
            }
        });
        *self.timer.lock().unwrap() = Some(handle);
    }
}

impl Aggregator for TimeAggregator {
    fn add(&self, envelope: TaskEnvelope) {
        self.state.lock().unwrap().buffer.push(envelope);
    }

    fn should_flush(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.buffer.is_empty() {
            return false;
        }
        self.ready.load(Ordering::SeqCst)
            || self.clock.now() - state.last_flush >= chrono::Duration::from_std(self.time_window).unwrap_or_default()
    }

    fn flush(&self) -> Vec<TaskEnvelope> {
        let mut state = self.state.lock().unwrap();
        let drained = std::mem::take(&mut state.buffer);
        state.last_flush = self.clock.now();
        self.ready.store(false, Ordering::SeqCst);
        drained
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.buffer.clear();
        state.last_flush = self.clock.now();
        self.ready.store(false, Ordering::SeqCst);
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return; // already stopped
        }
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Combines count and time triggers. Crucially, on an `Add` that causes
/// `size >= max_size`, the aggregator auto-flushes in place under the
/// buffer lock; the optional `flush_callback` is dispatched in a separate
/// task to avoid re-entrancy deadlocks. The internal timer resets after
/// each flush and on `Reset`.
pub struct TimeCountAggregator {
    max_size: usize,
    time_window: Duration,
    state: Arc<Mutex<TimeState>>,
    clock: Arc<dyn Clock>,
    ready: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    flush_callback: Option<FlushCallback>,
}

impl TimeCountAggregator {
    pub fn new(max_size: i64, time_window: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_flush_callback(max_size, time_window, clock, None)
    }

    pub fn with_flush_callback(
        max_size: i64,
        time_window: Duration,
        clock: Arc<dyn Clock>,
        flush_callback: Option<FlushCallback>,
    ) -> Arc<Self> {
        let max_size = if max_size <= 0 {
            DEFAULT_COUNT_MAX_SIZE
        } else {
            max_size as usize
        };
        let time_window = if time_window.is_zero() {
            DEFAULT_TIME_WINDOW
        } else {
            time_window
        };
        let aggregator = Arc::new(Self {
            max_size,
            time_window,
            state: Arc::new(Mutex::new(TimeState {
                buffer: Vec::new(),
                last_flush: clock.now(),
            })),
            clock,
            ready: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            flush_callback,
        });
        aggregator.spawn_timer();
        aggregator
    }

    fn spawn_timer(&self) {
        let ready = self.ready.clone();
        let stopped = self.stopped.clone();
        let window = self.time_window;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                ready.store(true, Ordering::SeqCst);
            }
        });
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// Aborts and respawns the background timer, so the next time-trigger
    /// is a full `time_window` away from now rather than from whenever the
    /// timer last happened to fire. Called after every flush (count- or
    /// time-triggered) and on `reset`.
    fn reset_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
        self.ready.store(false, Ordering::SeqCst);
        if !self.stopped.load(Ordering::SeqCst) {
            self.spawn_timer();
        }
    }
}

impl Aggregator for TimeCountAggregator {
    fn add(&self, envelope: TaskEnvelope) {
        let drained = {
            let mut state = self.state.lock().unwrap();
            state.buffer.push(envelope);
            if state.buffer.len() >= self.max_size {
                let drained = std::mem::take(&mut state.buffer);
                state.last_flush = self.clock.now();
                Some(drained)
            } else {
                None
            }
        };

        if let Some(drained) = drained {
            self.reset_timer();
            debug!(count = drained.len(), "time-count aggregator auto-flushed on count trigger");
            if let Some(cb) = self.flush_callback.clone() {
                tokio::spawn(async move {
                    cb(drained);
                });
            }
        }
    }

    fn should_flush(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.buffer.is_empty() {
            return false;
        }
        state.buffer.len() >= self.max_size
            || self.ready.load(Ordering::SeqCst)
            || self.clock.now() - state.last_flush >= chrono::Duration::from_std(self.time_window).unwrap_or_default()
    }

    fn flush(&self) -> Vec<TaskEnvelope> {
        let drained = {
            let mut state = self.state.lock().unwrap();
            let drained = std::mem::take(&mut state.buffer);
            state.last_flush = self.clock.now();
            drained
        };
        self.reset_timer();
        drained
    }

    fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.buffer.clear();
            state.last_flush = self.clock.now();
        }
        self.reset_timer();
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::task::{Priority, Task, TaskEnvelope};

    fn envelope(n: usize) -> TaskEnvelope {
        TaskEnvelope::new(
            "APP",
            Task::new("t", format!("{n}").into_bytes()),
            "APP_PRIORITY_NORMAL".into(),
            Priority::Normal,
        )
    }

    #[test]
    fn count_aggregator_flushes_at_max_size() {
        let agg = CountAggregator::new(3);
        agg.add(envelope(1));
        agg.add(envelope(2));
        assert!(!agg.should_flush());
        agg.add(envelope(3));
        assert!(agg.should_flush());
        let flushed = agg.flush();
        assert_eq!(flushed.len(), 3);
        assert_eq!(agg.size(), 0);
    }

    #[test]
    fn count_aggregator_non_positive_max_size_defaults() {
        let agg = CountAggregator::new(0);
        for i in 0..DEFAULT_COUNT_MAX_SIZE - 1 {
            agg.add(envelope(i));
        }
        assert!(!agg.should_flush());
        agg.add(envelope(DEFAULT_COUNT_MAX_SIZE));
        assert!(agg.should_flush());
    }

    #[tokio::test]
    async fn time_aggregator_flushes_after_window_elapses() {
        let agg = TimeAggregator::new(Duration::from_millis(50), Arc::new(SystemClock));
        agg.add(envelope(1));
        assert!(!agg.should_flush());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(agg.should_flush());
        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        agg.stop();
        agg.stop(); // idempotent
    }

    #[tokio::test]
    async fn time_aggregator_does_not_flush_empty_buffer() {
        let agg = TimeAggregator::new(Duration::from_millis(30), Arc::new(SystemClock));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!agg.should_flush());
        agg.stop();
    }

    #[tokio::test]
    async fn time_count_aggregator_auto_flushes_on_count_trigger() {
        let agg = TimeCountAggregator::new(3, Duration::from_secs(10), Arc::new(SystemClock));
        agg.add(envelope(1));
        agg.add(envelope(2));
        agg.add(envelope(3));
        assert_eq!(agg.size(), 0);
        agg.stop();
    }

    #[tokio::test]
    async fn time_count_aggregator_dispatches_flush_callback_off_lock() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<usize>(1);
        let cb: FlushCallback = Arc::new(move |batch| {
            let _ = tx.try_send(batch.len());
        });
        let agg = TimeCountAggregator::with_flush_callback(
            2,
            Duration::from_secs(10),
            Arc::new(SystemClock),
            Some(cb),
        );
        agg.add(envelope(1));
        agg.add(envelope(2));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("callback should fire");
        assert_eq!(received, Some(2));
        agg.stop();
    }
}
