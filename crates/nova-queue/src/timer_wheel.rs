use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A boxed callback fired once the wheel's tick reaches a `TimerTask`'s slot
/// and its `execute_at` has passed. Dispatched off the ticker thread so the
/// wheel never blocks on user code, and so a callback that itself schedules
/// a new timer entry can't deadlock against the tick loop.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerTask {
    execute_at: DateTime<Utc>,
    callback: TimerCallback,
}

/// Hashed-wheel in-process scheduler for short-delay tasks.
///
/// `slotCount` slots of `tickMs` resolution each; default 3,600 slots of
/// 1,000 ms (one hour horizon). Entries whose true delay exceeds
/// `slotCount * tickMs` are placed by the modulo into some slot but their
/// `execute_at` check keeps them pending until the real time arrives — in
/// practice the delay manager avoids this by deferring such tasks to the
/// broker-backed tier.
pub struct TimerWheel {
    slots: Arc<Mutex<Vec<VecDeque<TimerTask>>>>,
    current_slot: Arc<Mutex<usize>>,
    slot_count: usize,
    tick_ms: u64,
    clock: Arc<dyn Clock>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl TimerWheel {
    pub const DEFAULT_SLOT_COUNT: usize = 3_600;
    pub const DEFAULT_TICK_MS: u64 = 1_000;

    pub fn new(slot_count: usize, tick_ms: u64, clock: Arc<dyn Clock>) -> Arc<Self> {
        let slots = (0..slot_count).map(|_| VecDeque::new()).collect();
        Arc::new(Self {
            slots: Arc::new(Mutex::new(slots)),
            current_slot: Arc::new(Mutex::new(0)),
            slot_count,
            tick_ms,
            clock,
            ticker: Mutex::new(None),
            shutdown: Mutex::new(None),
        })
    }

    /// Delay horizon: `slotCount * tickMs`.
    pub fn horizon(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slot_count as u64 * self.tick_ms)
    }

    /// Start the background ticker. Idempotent: calling twice while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel(1);
        let wheel = self.clone();
        let tick_ms = self.tick_ms;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => wheel.tick(),
                    _ = rx.recv() => break,
                }
            }
        });
        *ticker = Some(handle);
        *self.shutdown.lock().unwrap() = Some(tx);
    }

    /// Stop the background ticker. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        let tx = self.shutdown.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.ticker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// `Add(task, delayMs, cb)`: non-positive delay invokes `cb` synchronously,
    /// off-wheel.
    pub fn add(self: &Arc<Self>, delay_ms: i64, cb: TimerCallback) {
        if delay_ms <= 0 {
            cb();
            return;
        }
        let execute_at = self.clock.now() + chrono::Duration::milliseconds(delay_ms);
        self.add_at(execute_at, cb);
    }

    /// `AddAt(task, executeAt, cb)`: equivalent to `Add(task, executeAt - now, cb)`.
    pub fn add_at(self: &Arc<Self>, execute_at: DateTime<Utc>, cb: TimerCallback) {
        let now = self.clock.now();
        let delay_ms = (execute_at - now).num_milliseconds();
        if delay_ms <= 0 {
            cb();
            return;
        }
        let offset_slots = (delay_ms as u64 / self.tick_ms).max(1) as usize;
        let mut current = self.current_slot.lock().unwrap();
        let target = (*current + offset_slots) % self.slot_count;
        drop(current);
        self.slots.lock().unwrap()[target].push_back(TimerTask {
            execute_at,
            callback: cb,
        });
    }

    /// Walk the current slot, fire due entries off-thread, advance the
    /// pointer. Entries not yet due are re-queued for the next full
    /// rotation.
    fn tick(self: &Arc<Self>) {
        let now = self.clock.now();
        let mut current = self.current_slot.lock().unwrap();
        let slot_idx = *current;
        *current = (*current + 1) % self.slot_count;
        drop(current);

        let mut due = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots[slot_idx];
            let mut remaining = VecDeque::with_capacity(slot.len());
            while let Some(entry) = slot.pop_front() {
                if entry.execute_at <= now {
                    due.push(entry);
                } else {
                    remaining.push_back(entry);
                }
            }
            *slot = remaining;
        }

        if due.is_empty() {
            return;
        }
        trace!(slot = slot_idx, fired = due.len(), "timer wheel tick");
        for entry in due {
            tokio::spawn(async move {
                entry.callback();
            });
        }
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("slot_count", &self.slot_count)
            .field("tick_ms", &self.tick_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn zero_delay_invokes_callback_before_add_returns() {
        let wheel = TimerWheel::new(8, 10, Arc::new(SystemClock));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        wheel.add(0, Box::new(move || fired2.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delayed_callback_fires_after_ticks() {
        let wheel = TimerWheel::new(8, 20, Arc::new(SystemClock));
        wheel.start();

        let (tx, mut rx) = mpsc::channel::<()>(1);
        wheel.add(
            50,
            Box::new(move || {
                let _ = tx.try_send(());
            }),
        );

        let fired = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("callback should fire within timeout");
        assert!(fired.is_some());
        wheel.stop().await;
    }

    #[test]
    fn horizon_is_slot_count_times_tick_ms() {
        let wheel = TimerWheel::new(3_600, 1_000, Arc::new(SystemClock));
        assert_eq!(wheel.horizon(), std::time::Duration::from_secs(3_600));
    }
}
