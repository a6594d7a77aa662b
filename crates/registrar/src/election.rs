//! Primary-election state machine: `start -> primary_search -> {primary, secondary}`.
//!
//! The search timeout is registered on the event loop, so (like
//! [`aiko_core::lease::Lease`]) the firing closure cannot itself reach
//! back into the loop to schedule a new timer; state changes it
//! triggers are pushed onto a shared event queue the caller drains,
//! and re-entering `primary_search` (on losing the primary) re-arms a
//! fresh timer from outside the closure.

use aiko_core::event_loop::{EventLoop, TimerId};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PRIMARY_SEARCH_TIMEOUT: Duration = Duration::from_secs(2);

fn jittered_search_timeout() -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    PRIMARY_SEARCH_TIMEOUT.mul_f64(factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    PrimarySearch,
    Primary,
    Secondary,
}

/// A transition the caller should react to: publish the retained
/// `(primary found ...)` announcement, set the LWT, clear a local
/// catalog, and so on.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionEvent {
    /// The search timeout elapsed with no announcement seen first.
    BecamePrimary { self_topic: String, time_started: u64 },
    /// An earlier or already-retained primary was observed.
    BecameSecondary { primary_topic_path: String },
    /// A `(primary absent)` was seen while secondary; catalog should be
    /// cleared by the caller.
    ReturnedToPrimarySearch,
}

pub struct RegistrarElection {
    self_topic: String,
    time_started: u64,
    state: Arc<Mutex<State>>,
    primary_topic_path: Arc<Mutex<Option<String>>>,
    pending_events: Arc<Mutex<VecDeque<ElectionEvent>>>,
    search_timer: Option<TimerId>,
}

impl RegistrarElection {
    pub fn new(self_topic: impl Into<String>, time_started: u64) -> Self {
        RegistrarElection {
            self_topic: self_topic.into(),
            time_started,
            state: Arc::new(Mutex::new(State::Start)),
            primary_topic_path: Arc::new(Mutex::new(None)),
            pending_events: Arc::new(Mutex::new(VecDeque::new())),
            search_timer: None,
        }
    }

    /// Subscribe to the boot topic and enter `primary_search`. Call once
    /// at process start.
    pub fn start(&mut self, event_loop: &mut EventLoop) {
        self.enter_primary_search(event_loop);
    }

    fn enter_primary_search(&mut self, event_loop: &mut EventLoop) {
        *self.state.lock().unwrap() = State::PrimarySearch;

        let state = self.state.clone();
        let pending = self.pending_events.clone();
        let self_topic = self.self_topic.clone();
        let time_started = self.time_started;
        let id = event_loop.add_timer(jittered_search_timeout(), None, move || {
            let mut guard = state.lock().unwrap();
            if *guard == State::PrimarySearch {
                *guard = State::Primary;
                drop(guard);
                pending.lock().unwrap().push_back(ElectionEvent::BecamePrimary {
                    self_topic: self_topic.clone(),
                    time_started,
                });
            }
        });
        self.search_timer = Some(id);
    }

    /// A `(primary found topic_path time_started)` arrived, from self or
    /// from a peer.
    pub fn on_primary_found(&mut self, event_loop: &mut EventLoop, primary_topic_path: &str, time_started: u64) {
        if primary_topic_path == self.self_topic {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        match *guard {
            State::PrimarySearch => {
                *guard = State::Secondary;
                drop(guard);
                if let Some(id) = self.search_timer.take() {
                    event_loop.cancel_timer(id);
                }
                self.become_secondary(primary_topic_path);
            }
            // Concurrent promotion: the earlier `time_started` wins.
            State::Primary if time_started < self.time_started => {
                *guard = State::Secondary;
                drop(guard);
                self.become_secondary(primary_topic_path);
            }
            State::Secondary => {
                *self.primary_topic_path.lock().unwrap() = Some(primary_topic_path.to_string());
            }
            State::Primary | State::Start => {}
        }
    }

    fn become_secondary(&mut self, primary_topic_path: &str) {
        *self.primary_topic_path.lock().unwrap() = Some(primary_topic_path.to_string());
        self.pending_events
            .lock()
            .unwrap()
            .push_back(ElectionEvent::BecameSecondary {
                primary_topic_path: primary_topic_path.to_string(),
            });
    }

    /// A `(primary absent)` was observed (typically the former
    /// primary's LWT firing).
    pub fn on_primary_absent(&mut self, event_loop: &mut EventLoop) {
        let is_secondary = *self.state.lock().unwrap() == State::Secondary;
        if !is_secondary {
            return;
        }
        *self.primary_topic_path.lock().unwrap() = None;
        self.pending_events
            .lock()
            .unwrap()
            .push_back(ElectionEvent::ReturnedToPrimarySearch);
        self.enter_primary_search(event_loop);
    }

    pub fn drain_events(&mut self) -> Vec<ElectionEvent> {
        self.pending_events.lock().unwrap().drain(..).collect()
    }

    pub fn is_primary(&self) -> bool {
        *self.state.lock().unwrap() == State::Primary
    }

    pub fn is_secondary(&self) -> bool {
        *self.state.lock().unwrap() == State::Secondary
    }

    pub fn primary_topic_path(&self) -> Option<String> {
        self.primary_topic_path.lock().unwrap().clone()
    }
}
