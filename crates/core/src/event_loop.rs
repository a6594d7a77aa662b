//! Single-threaded cooperative scheduler
//!
//! Drives three collections every tick: timer handlers (ordered by next
//! fire time), flat-out handlers (invoked every tick, no delay), and a
//! typed message queue (dispatched in FIFO order to interested
//! handlers). Suspension happens exclusively at the tick's single sleep
//! point; handlers must run to completion without blocking.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Abstraction over wall-clock time so tests can drive the loop without
/// sleeping in real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Opaque identifier for a registered timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Opaque identifier for a registered queue handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandlerId(u64);

/// Opaque identifier for a registered flat-out handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlatOutId(u64);

type TimerHandler = Box<dyn FnMut() + Send>;
type FlatOutHandler = Box<dyn FnMut() -> bool + Send>;
type QueueHandler = Box<dyn FnMut(&QueueItem) + Send>;

struct Timer {
    id: TimerId,
    handler: TimerHandler,
    /// `None` for a one-shot timer (not re-armed after firing).
    period: Option<Duration>,
    next_fire: Instant,
}

struct FlatOut {
    id: FlatOutId,
    handler: FlatOutHandler,
}

struct QueueSubscription {
    id: QueueHandlerId,
    type_tags: Vec<String>,
    handler: QueueHandler,
}

/// An item placed on the event loop's message queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub type_tag: String,
    pub payload: String,
}

/// Single-threaded cooperative scheduler.
///
/// Not `Send`/`Sync` on purpose: every handler and the loop itself run
/// on one thread. Other threads (such as the transport's I/O thread)
/// never call into the loop directly; they hand messages to the owning
/// thread over an ordinary channel (see `aiko_transport::MqttTransport`'s
/// queue receiver), which calls [`EventLoop::push_queue_item`] itself.
pub struct EventLoop {
    clock: Arc<dyn Clock>,
    timers: Vec<Timer>,
    flat_outs: Vec<FlatOut>,
    queue_subscriptions: Vec<QueueSubscription>,
    pending_queue: std::collections::VecDeque<QueueItem>,
    next_id: u64,
    terminate_requested: Option<i32>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        EventLoop {
            clock,
            timers: Vec::new(),
            flat_outs: Vec::new(),
            queue_subscriptions: Vec::new(),
            pending_queue: std::collections::VecDeque::new(),
            next_id: 0,
            terminate_requested: None,
        }
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// A cloneable handle to the loop's clock, for components (such as
    /// [`crate::lease::Lease`]) that need to read the time from inside a
    /// flat-out handler without borrowing the loop itself.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Register a one-shot or periodic timer. `period = None` fires once
    /// after `delay` and is not re-armed.
    pub fn add_timer<F>(&mut self, delay: Duration, period: Option<Duration>, handler: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = TimerId(self.fresh_id());
        let next_fire = self.clock.now() + delay;
        self.timers.push(Timer {
            id,
            handler: Box::new(handler),
            period,
            next_fire,
        });
        id
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.iter().any(|t| t.id == id)
    }

    /// Register a handler invoked every tick with no delay. Return
    /// `false` from the handler to deregister it.
    pub fn add_flat_out<F>(&mut self, handler: F) -> FlatOutId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let id = FlatOutId(self.fresh_id());
        self.flat_outs.push(FlatOut {
            id,
            handler: Box::new(handler),
        });
        id
    }

    pub fn cancel_flat_out(&mut self, id: FlatOutId) {
        self.flat_outs.retain(|f| f.id != id);
    }

    /// Register interest in one or more type tags on the message queue.
    pub fn add_queue_handler<F>(&mut self, type_tags: Vec<String>, handler: F) -> QueueHandlerId
    where
        F: FnMut(&QueueItem) + Send + 'static,
    {
        let id = QueueHandlerId(self.fresh_id());
        self.queue_subscriptions.push(QueueSubscription {
            id,
            type_tags,
            handler: Box::new(handler),
        });
        id
    }

    pub fn cancel_queue_handler(&mut self, id: QueueHandlerId) {
        self.queue_subscriptions.retain(|q| q.id != id);
    }

    /// Enqueue an item for dispatch on a future tick.
    pub fn push_queue_item(&mut self, item: QueueItem) {
        self.pending_queue.push_back(item);
    }

    /// Request termination: the current tick completes, then [`run`]
    /// returns `exit_status`.
    pub fn terminate(&mut self, exit_status: i32) {
        self.terminate_requested = Some(exit_status);
    }

    /// Run one tick: drain fire-eligible timers, drain all flat-out
    /// handlers, dispatch all pending queue items. Returns the duration
    /// the caller should sleep for before the next tick (capped at 1ms),
    /// or `None` if termination was requested during this tick.
    pub fn tick(&mut self) -> Option<Duration> {
        let now = self.clock.now();

        // Fire eligible timers; re-arm periodic ones.
        let mut fired_indices = Vec::new();
        for (index, timer) in self.timers.iter().enumerate() {
            if timer.next_fire <= now {
                fired_indices.push(index);
            }
        }
        for index in fired_indices {
            (self.timers[index].handler)();
            match self.timers[index].period {
                Some(period) => {
                    self.timers[index].next_fire += period;
                }
                None => {
                    // One-shot: mark for removal by setting a far-future
                    // fire time is wrong; instead remove immediately
                    // after invoking. We defer removal to avoid index
                    // shift mid-loop by using retain below.
                }
            }
        }
        self.timers.retain(|t| t.period.is_some() || t.next_fire > now);

        // Drain all flat-out handlers every tick.
        let mut still_active = Vec::with_capacity(self.flat_outs.len());
        for mut flat_out in std::mem::take(&mut self.flat_outs) {
            let keep = (flat_out.handler)();
            if keep {
                still_active.push(flat_out);
            }
        }
        self.flat_outs = still_active;

        // Dispatch all pending queue items, in order, to every matching
        // handler.
        while let Some(item) = self.pending_queue.pop_front() {
            for subscription in &mut self.queue_subscriptions {
                if subscription
                    .type_tags
                    .iter()
                    .any(|tag| tag == &item.type_tag)
                {
                    (subscription.handler)(&item);
                }
            }
        }

        if self.terminate_requested.is_some() {
            return None;
        }

        let next = self
            .timers
            .iter()
            .map(|t| t.next_fire.saturating_duration_since(self.clock.now()))
            .min()
            .unwrap_or(Duration::from_millis(1));
        Some(next.min(Duration::from_millis(1)))
    }

    /// Run the loop until `terminate` is called, sleeping (real time)
    /// between ticks. Returns the exit status passed to `terminate`.
    pub async fn run(&mut self) -> i32 {
        loop {
            match self.tick() {
                Some(sleep_for) => tokio::time::sleep(sleep_for).await,
                None => return self.terminate_requested.unwrap_or(0),
            }
        }
    }

    /// Test/simulation helper: advance the injected clock is the
    /// caller's responsibility (via a `FakeClock`); this just runs ticks
    /// until termination or `max_ticks` is reached, without sleeping.
    pub fn run_until_terminated(&mut self, max_ticks: usize) -> Option<i32> {
        for _ in 0..max_ticks {
            if self.tick().is_none() {
                return Some(self.terminate_requested.unwrap_or(0));
            }
        }
        None
    }
}

/// A manually-driven clock, for deterministic lease/timer tests without
/// real sleeps (spec.md §8 properties 2 and 6). Available outside of
/// `aiko-core`'s own test build under the `test-util` feature so
/// downstream crates can drive an `EventLoop` deterministically in their
/// own tests too, the way tokio gates its time-pausing helpers behind
/// its own "test-util" feature.
#[cfg(any(test, feature = "test-util"))]
pub mod fake_clock {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Clone)]
    pub struct FakeClock {
        base: Instant,
        offset_ms: Arc<AtomicU64>,
    }

    impl Default for FakeClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeClock {
        pub fn new() -> Self {
            FakeClock {
                base: Instant::now(),
                offset_ms: Arc::new(AtomicU64::new(0)),
            }
        }

        pub fn advance(&self, duration: Duration) {
            self.offset_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::fake_clock::FakeClock;
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn flat_out_runs_every_tick_until_it_returns_false() {
        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(Arc::new(clock));
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();
        event_loop.add_flat_out(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            counter_clone.load(Ordering::SeqCst) < 3
        });
        event_loop.tick();
        event_loop.tick();
        event_loop.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn timer_fires_once_it_is_due_and_is_not_re_armed_by_default() {
        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(Arc::new(clock.clone()));
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        event_loop.add_timer(Duration::from_millis(100), None, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        event_loop.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(150));
        event_loop.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        event_loop.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "one-shot must not re-fire");
    }

    #[test]
    fn periodic_timer_reschedules_itself() {
        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(Arc::new(clock.clone()));
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        event_loop.add_timer(
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        for _ in 0..5 {
            clock.advance(Duration::from_millis(10));
            event_loop.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn cancel_timer_prevents_future_fires() {
        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(Arc::new(clock.clone()));
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        let id = event_loop.add_timer(Duration::from_millis(10), None, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        event_loop.cancel_timer(id);
        clock.advance(Duration::from_millis(100));
        event_loop.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn queue_items_dispatch_in_order_to_matching_handlers_only() {
        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(Arc::new(clock));
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        event_loop.add_queue_handler(vec!["control".to_string()], move |item| {
            received_clone.lock().push(item.payload.clone());
        });
        event_loop.add_queue_handler(vec!["other".to_string()], |_item| {
            panic!("should not be invoked for a non-matching tag");
        });

        event_loop.push_queue_item(QueueItem {
            type_tag: "control".to_string(),
            payload: "(add a 1)".to_string(),
        });
        event_loop.push_queue_item(QueueItem {
            type_tag: "control".to_string(),
            payload: "(add b 2)".to_string(),
        });
        event_loop.tick();

        assert_eq!(
            *received.lock(),
            vec!["(add a 1)".to_string(), "(add b 2)".to_string()]
        );
    }

    #[test]
    fn terminate_completes_current_tick_then_stops() {
        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(Arc::new(clock));
        let ran = Arc::new(AtomicU64::new(0));
        let ran_clone = ran.clone();
        event_loop.add_flat_out(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            true
        });
        event_loop.terminate(7);
        let status = event_loop.run_until_terminated(10);
        assert_eq!(ran.load(Ordering::SeqCst), 1, "current tick still runs");
        assert_eq!(status, Some(7));
    }
}
