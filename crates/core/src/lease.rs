//! Expiring tokens polled from the event loop's clock
//!
//! A lease tracks a deadline and, when `auto_extend` is set, a renewal
//! point at 0.8x the lease time. Both are checked from a flat-out
//! handler registered on the event loop at construction, since timer
//! handlers here cannot themselves add new timers (they don't have
//! access back to the loop). `extend` pushes the deadline (and renewal
//! point) out from now and fires `on_extend`; reaching the deadline
//! without an intervening extend fires `on_expire` exactly once and
//! deregisters the handler. `terminate` deregisters without firing
//! either callback.

use crate::event_loop::{Clock, EventLoop, FlatOutId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Opaque identity passed back to `on_expire`/`on_extend`. Typically a
/// stream id or an EC subscriber id.
pub type LeaseId = u64;

struct LeaseState {
    expiry: Instant,
    auto_extend_at: Option<Instant>,
    lease_time: Duration,
}

/// An expiring token, optionally self-renewing.
pub struct Lease {
    id: LeaseId,
    auto_extend: bool,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<LeaseState>>,
    on_extend: Arc<dyn Fn(LeaseId) + Send + Sync>,
    alive: Arc<AtomicBool>,
    handler_id: FlatOutId,
}

impl Lease {
    /// Create a lease and register its polling handler on `event_loop`.
    ///
    /// `on_expire` fires once when the deadline is reached with no
    /// intervening `extend`. `on_extend` fires every time `extend` is
    /// called, including the self-renewals triggered by `auto_extend`.
    pub fn new<E, X>(
        event_loop: &mut EventLoop,
        id: LeaseId,
        time: Duration,
        on_expire: E,
        on_extend: X,
        auto_extend: bool,
    ) -> Self
    where
        E: Fn(LeaseId) + Send + Sync + 'static,
        X: Fn(LeaseId) + Send + Sync + 'static,
    {
        let clock = event_loop.clock_handle();
        let now = clock.now();
        let state = Arc::new(Mutex::new(LeaseState {
            expiry: now + time,
            auto_extend_at: auto_extend.then(|| now + time.mul_f64(0.8)),
            lease_time: time,
        }));
        let alive = Arc::new(AtomicBool::new(true));
        let on_extend: Arc<dyn Fn(LeaseId) + Send + Sync> = Arc::new(on_extend);

        let poll_clock = clock.clone();
        let poll_state = state.clone();
        let poll_alive = alive.clone();
        let poll_on_extend = on_extend.clone();
        let handler_id = event_loop.add_flat_out(move || {
            if !poll_alive.load(Ordering::SeqCst) {
                return false;
            }
            let now = poll_clock.now();
            let mut guard = poll_state.lock().unwrap();

            if let Some(renew_at) = guard.auto_extend_at {
                if now >= renew_at {
                    let lease_time = guard.lease_time;
                    guard.expiry = now + lease_time;
                    guard.auto_extend_at = Some(now + lease_time.mul_f64(0.8));
                    drop(guard);
                    poll_on_extend(id);
                    return true;
                }
            }

            if now >= guard.expiry {
                drop(guard);
                poll_alive.store(false, Ordering::SeqCst);
                on_expire(id);
                return false;
            }

            true
        });

        Lease {
            id,
            auto_extend,
            clock,
            state,
            on_extend,
            alive,
            handler_id,
        }
    }

    /// Push the deadline (and, if `auto_extend`, the renewal point) out
    /// from now by `new_time`, firing `on_extend`. Use this when an
    /// external event — such as a `process_frame` — should renew the
    /// lease.
    pub fn extend(&mut self, new_time: Duration) {
        let now = self.clock.now();
        {
            let mut guard = self.state.lock().unwrap();
            guard.lease_time = new_time;
            guard.expiry = now + new_time;
            if self.auto_extend {
                guard.auto_extend_at = Some(now + new_time.mul_f64(0.8));
            }
        }
        (self.on_extend)(self.id);
    }

    /// Deregister the lease's polling handler without invoking either
    /// callback.
    pub fn terminate(&mut self, event_loop: &mut EventLoop) {
        self.alive.store(false, Ordering::SeqCst);
        event_loop.cancel_flat_out(self.handler_id);
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn time(&self) -> Duration {
        self.state.lock().unwrap().lease_time
    }

    /// Whether the lease has neither expired nor been terminated.
    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Time remaining before expiry, zero if already past due.
    pub fn remaining(&self) -> Duration {
        let now = self.clock.now();
        let expiry = self.state.lock().unwrap().expiry;
        expiry.saturating_duration_since(now)
    }
}
