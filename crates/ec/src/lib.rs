//! Eventual-consistency state replication: a `Producer` owning an
//! authoritative two-level key-value state, and a `Consumer` that
//! mirrors it over a lease-renewed subscription.
//!
//! Neither side touches a transport directly: callers drive them with
//! incoming payloads and drain the `OutgoingMessage`s they produce,
//! publishing those through whatever `MessageTransport` the process is
//! using. Both sides do register per-subscription
//! [`aiko_core::lease::Lease`]s on the caller's `EventLoop` (the producer
//! per remote subscriber, the consumer for its own subscription), so
//! leases expire and get cleaned up deterministically under a
//! `FakeClock` in tests, without a broker.

use aiko_core::error::{Error, Result};
use aiko_core::event_loop::EventLoop;
use aiko_core::lease::{Lease, LeaseId};
use aiko_core::parser;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// A leaf value in the EC state tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Boolean(bool),
    Integer(i64),
    Null,
    Text(String),
}

impl Scalar {
    pub fn parse(token: &str) -> Self {
        match token {
            "true" => Scalar::Boolean(true),
            "false" => Scalar::Boolean(false),
            "null" => Scalar::Null,
            other => other
                .parse::<i64>()
                .map(Scalar::Integer)
                .unwrap_or_else(|_| Scalar::Text(other.to_string())),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Boolean(b) => write!(f, "{b}"),
            Scalar::Integer(i) => write!(f, "{i}"),
            Scalar::Null => write!(f, "null"),
            Scalar::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A message a caller should publish on the named topic.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: String,
}

impl OutgoingMessage {
    fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        OutgoingMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// `{key: scalar | {subkey: scalar}}`. Dot-separated paths, depth > 2 rejected.
#[derive(Debug, Default)]
enum Entry {
    #[default]
    Empty,
    Scalar(Scalar),
    Map(HashMap<String, Scalar>),
}

fn split_path(path: &str) -> Result<(&str, Option<&str>)> {
    let mut parts = path.split('.');
    let root = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Protocol(format!("empty EC path: {path}")))?;
    let sub = parts.next();
    if parts.next().is_some() {
        return Err(Error::Protocol(format!("EC path depth > 2: {path}")));
    }
    Ok((root, sub))
}

/// Which root keys a subscription is interested in.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemNames {
    All,
    Named(HashSet<String>),
}

impl ItemNames {
    pub fn parse(token: &str) -> Self {
        if token == "*" {
            ItemNames::All
        } else {
            ItemNames::Named(token.split(',').map(|s| s.to_string()).collect())
        }
    }

    fn contains(&self, root: &str) -> bool {
        match self {
            ItemNames::All => true,
            ItemNames::Named(names) => names.contains(root),
        }
    }
}

impl std::fmt::Display for ItemNames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemNames::All => write!(f, "*"),
            ItemNames::Named(names) => {
                let mut names: Vec<&String> = names.iter().collect();
                names.sort();
                write!(f, "{}", names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(","))
            }
        }
    }
}

struct Subscription {
    item_names: ItemNames,
    /// Expiry removes the subscription (spec: "per-subscriber;
    /// attributes: `{lease_time, response_topic, item_names[]}`.
    /// Expiry removes the subscription."). Renewed, not auto-extended:
    /// the subscriber must re-send `(stream ...)` before it lapses.
    lease: Lease,
}

/// Hosts the authoritative state dictionary for one service. Every
/// method is synchronous and side-effect-free beyond its return value;
/// the caller is responsible for publishing the resulting messages and
/// for polling [`EcProducer::reap_expired_subscriptions`] once per tick.
pub struct EcProducer {
    state_topic: String,
    state: HashMap<String, Entry>,
    subscriptions: HashMap<String, Subscription>,
    expired_subscriptions: Arc<Mutex<Vec<String>>>,
}

impl EcProducer {
    pub fn new(state_topic: impl Into<String>) -> Self {
        EcProducer {
            state_topic: state_topic.into(),
            state: HashMap::new(),
            subscriptions: HashMap::new(),
            expired_subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn get(&self, path: &str) -> Result<Option<Scalar>> {
        let (root, sub) = split_path(path)?;
        Ok(match (self.state.get(root), sub) {
            (Some(Entry::Scalar(value)), None) => Some(value.clone()),
            (Some(Entry::Map(map)), Some(sub_key)) => map.get(sub_key).cloned(),
            _ => None,
        })
    }

    fn set(&mut self, path: &str, value: Scalar) -> Result<()> {
        let (root, sub) = split_path(path)?;
        match sub {
            None => {
                self.state.insert(root.to_string(), Entry::Scalar(value));
            }
            Some(sub_key) => {
                let entry = self.state.entry(root.to_string()).or_insert(Entry::Empty);
                if !matches!(entry, Entry::Map(_)) {
                    *entry = Entry::Map(HashMap::new());
                }
                if let Entry::Map(map) = entry {
                    map.insert(sub_key.to_string(), value);
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        let (root, sub) = split_path(path)?;
        match sub {
            None => {
                self.state.remove(root);
            }
            Some(sub_key) => {
                if let Some(Entry::Map(map)) = self.state.get_mut(root) {
                    map.remove(sub_key);
                }
            }
        }
        Ok(())
    }

    /// Every `(path, value)` currently matching `item_names`, by root key.
    fn snapshot_items(&self, item_names: &ItemNames) -> Vec<(String, Scalar)> {
        let mut items = Vec::new();
        let mut roots: Vec<&String> = self.state.keys().collect();
        roots.sort();
        for root in roots {
            if !item_names.contains(root) {
                continue;
            }
            match &self.state[root] {
                Entry::Scalar(value) => items.push((root.clone(), value.clone())),
                Entry::Map(map) => {
                    let mut sub_keys: Vec<&String> = map.keys().collect();
                    sub_keys.sort();
                    for sub_key in sub_keys {
                        items.push((format!("{root}.{sub_key}"), map[sub_key].clone()));
                    }
                }
                Entry::Empty => {}
            }
        }
        items
    }

    /// Handle one payload received on `/control`. Returns every message
    /// the caller should publish as a result.
    pub fn handle_control(&mut self, event_loop: &mut EventLoop, payload: &str) -> Result<Vec<OutgoingMessage>> {
        let (command, params) = parser::parse(payload)?;
        debug!(command = command.as_str(), "EC control command");
        match command.as_str() {
            "add" | "update" => {
                let path = params.first().ok_or_else(|| Error::Protocol("missing path".into()))?;
                let value = params.get(1).ok_or_else(|| Error::Protocol("missing value".into()))?;
                self.set(path, Scalar::parse(value))?;
                Ok(self.fan_out(path, payload))
            }
            "remove" => {
                let path = params.first().ok_or_else(|| Error::Protocol("missing path".into()))?;
                self.remove(path)?;
                Ok(self.fan_out(path, payload))
            }
            "stream" => self.handle_stream_command(event_loop, &params),
            other => Err(Error::Protocol(format!("unknown EC control command: {other}"))),
        }
    }

    fn fan_out(&self, path: &str, raw_command: &str) -> Vec<OutgoingMessage> {
        let root = path.split('.').next().unwrap_or(path);
        let mut messages = vec![OutgoingMessage::new(self.state_topic.clone(), raw_command)];
        let mut response_topics: Vec<&String> = self.subscriptions.keys().collect();
        response_topics.sort();
        for response_topic in response_topics {
            if self.subscriptions[response_topic].item_names.contains(root) {
                messages.push(OutgoingMessage::new(response_topic.clone(), raw_command));
            }
        }
        messages
    }

    fn handle_stream_command(&mut self, event_loop: &mut EventLoop, params: &[String]) -> Result<Vec<OutgoingMessage>> {
        let response_topic = params
            .first()
            .ok_or_else(|| Error::Protocol("missing response_topic".into()))?
            .clone();
        let lease_time: u64 = params
            .get(1)
            .ok_or_else(|| Error::Protocol("missing lease_time".into()))?
            .parse()
            .map_err(|_| Error::Protocol("lease_time is not an integer".into()))?;
        let item_names = ItemNames::parse(
            params.get(2).ok_or_else(|| Error::Protocol("missing item_names".into()))?,
        );

        if lease_time == 0 {
            if let Some(mut subscription) = self.subscriptions.remove(&response_topic) {
                subscription.lease.terminate(event_loop);
            }
            return Ok(Vec::new());
        }
        let lease_duration = Duration::from_secs(lease_time);

        if let Some(subscription) = self.subscriptions.get_mut(&response_topic) {
            subscription.item_names = item_names;
            subscription.lease.extend(lease_duration);
            return Ok(Vec::new());
        }

        let expired = self.expired_subscriptions.clone();
        let expired_topic = response_topic.clone();
        let lease = Lease::new(
            event_loop,
            0,
            lease_duration,
            move |_id| {
                expired.lock().unwrap().push(expired_topic.clone());
            },
            |_id| {},
            false,
        );
        self.subscriptions
            .insert(response_topic.clone(), Subscription { item_names: item_names.clone(), lease });

        let items = self.snapshot_items(&item_names);
        let mut messages = vec![OutgoingMessage::new(
            response_topic.clone(),
            parser::generate("item_count", &[items.len().to_string()]),
        )];
        for (path, value) in &items {
            messages.push(OutgoingMessage::new(
                response_topic.clone(),
                parser::generate("add", &[path.clone(), value.to_string()]),
            ));
        }
        messages.push(OutgoingMessage::new(
            self.state_topic.clone(),
            parser::generate("sync", &[response_topic]),
        ));
        Ok(messages)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Drain any subscriptions whose lease expired since the last call,
    /// removing each from the subscription table. Intended to be polled
    /// once per event loop tick, mirroring `Pipeline::reap_expired_streams`.
    pub fn reap_expired_subscriptions(&mut self) {
        let topics: Vec<String> = std::mem::take(&mut *self.expired_subscriptions.lock().unwrap());
        for topic in topics {
            self.subscriptions.remove(&topic);
        }
    }
}

/// Mirrors a producer's state over a lease-renewed subscription.
pub struct EcConsumer {
    producer_control_topic: String,
    response_topic: String,
    item_names: ItemNames,
    cache: HashMap<String, Scalar>,
    item_count: Option<usize>,
    items_received: usize,
    ready: bool,
    lease: Option<Lease>,
    pending_renewals: Arc<Mutex<Vec<LeaseId>>>,
}

impl EcConsumer {
    pub fn new(
        producer_control_topic: impl Into<String>,
        response_topic: impl Into<String>,
        item_names: ItemNames,
    ) -> Self {
        EcConsumer {
            producer_control_topic: producer_control_topic.into(),
            response_topic: response_topic.into(),
            item_names,
            cache: HashMap::new(),
            item_count: None,
            items_received: 0,
            ready: false,
            lease: None,
            pending_renewals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Arm the local lease (auto-renewing at 0.8x `lease_time`) and
    /// return the initial `(stream response_topic lease_time item_names)`
    /// command to publish on the producer's control topic.
    pub fn subscribe(&mut self, event_loop: &mut EventLoop, lease_time: Duration) -> OutgoingMessage {
        let pending = self.pending_renewals.clone();
        self.lease = Some(Lease::new(
            event_loop,
            0,
            lease_time,
            |_id| {},
            move |id| {
                pending.lock().unwrap().push(id);
            },
            true,
        ));
        self.stream_command(lease_time)
    }

    fn stream_command(&self, lease_time: Duration) -> OutgoingMessage {
        OutgoingMessage::new(
            self.producer_control_topic.clone(),
            parser::generate(
                "stream",
                &[
                    self.response_topic.clone(),
                    lease_time.as_secs().to_string(),
                    self.item_names.to_string(),
                ],
            ),
        )
    }

    /// Drain any renewal ticks fired by the lease's auto-extend, emitting
    /// the re-subscribe command the producer expects to keep the server
    /// side of the subscription alive.
    pub fn drain_renewals(&mut self) -> Vec<OutgoingMessage> {
        let fired = std::mem::take(&mut *self.pending_renewals.lock().unwrap());
        let lease_time = self.lease.as_ref().map(|l| l.time()).unwrap_or_default();
        fired.iter().map(|_| self.stream_command(lease_time)).collect()
    }

    /// Apply one payload received on the response topic.
    pub fn apply_message(&mut self, payload: &str) -> Result<()> {
        let (command, params) = parser::parse(payload)?;
        match command.as_str() {
            "item_count" => {
                let count: usize = params
                    .first()
                    .ok_or_else(|| Error::Protocol("missing item_count".into()))?
                    .parse()
                    .map_err(|_| Error::Protocol("item_count is not an integer".into()))?;
                self.item_count = Some(count);
                self.items_received = 0;
                self.ready = count == 0;
            }
            "add" | "update" => {
                let path = params.first().ok_or_else(|| Error::Protocol("missing path".into()))?;
                let value = params.get(1).ok_or_else(|| Error::Protocol("missing value".into()))?;
                self.cache.insert(path.clone(), Scalar::parse(value));
                if self.item_count.is_some() && !self.ready {
                    self.items_received += 1;
                    if Some(self.items_received) == self.item_count {
                        self.ready = true;
                    }
                }
            }
            "remove" => {
                let path = params.first().ok_or_else(|| Error::Protocol("missing path".into()))?;
                self.cache.remove(path);
            }
            "sync" => {
                // Informational only.
            }
            other => {
                return Err(Error::Protocol(format!("unknown EC response command: {other}")));
            }
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Scalar> {
        self.cache.get(path)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn cache(&self) -> &HashMap<String, Scalar> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_applied_and_republished_on_state_topic() {
        let mut event_loop = EventLoop::new();
        let mut producer = EcProducer::new("AIKO/host1/1/1/state");
        let messages = producer.handle_control(&mut event_loop, "(add a 1)").unwrap();
        assert_eq!(messages, vec![OutgoingMessage::new("AIKO/host1/1/1/state", "(add a 1)")]);
        assert_eq!(producer.get("a").unwrap(), Some(Scalar::Integer(1)));
    }

    #[test]
    fn nested_path_is_stored_under_its_root() {
        let mut event_loop = EventLoop::new();
        let mut producer = EcProducer::new("state");
        producer.handle_control(&mut event_loop, "(add b.c 2)").unwrap();
        assert_eq!(producer.get("b.c").unwrap(), Some(Scalar::Integer(2)));
    }

    #[test]
    fn depth_three_path_is_rejected() {
        let mut event_loop = EventLoop::new();
        let mut producer = EcProducer::new("state");
        let result = producer.handle_control(&mut event_loop, "(add a.b.c 1)");
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn ec_snapshot_scenario() {
        let mut event_loop = EventLoop::new();
        let mut producer = EcProducer::new("AIKO/producer/1/1/state");
        producer.handle_control(&mut event_loop, "(add a 1)").unwrap();
        producer.handle_control(&mut event_loop, "(add b.c 2)").unwrap();

        let messages = producer
            .handle_control(&mut event_loop, "(stream AIKO/consumer/1/1/response 10 *)")
            .unwrap();

        assert_eq!(
            messages,
            vec![
                OutgoingMessage::new("AIKO/consumer/1/1/response", "(item_count 2)"),
                OutgoingMessage::new("AIKO/consumer/1/1/response", "(add a 1)"),
                OutgoingMessage::new("AIKO/consumer/1/1/response", "(add b.c 2)"),
                OutgoingMessage::new(
                    "AIKO/producer/1/1/state",
                    "(sync AIKO/consumer/1/1/response)"
                ),
            ]
        );

        let mut consumer = EcConsumer::new(
            "AIKO/producer/1/1/control",
            "AIKO/consumer/1/1/response",
            ItemNames::All,
        );
        for message in &messages {
            if message.topic == "AIKO/consumer/1/1/response" {
                consumer.apply_message(&message.payload).unwrap();
            }
        }
        assert!(consumer.is_ready());
        assert_eq!(consumer.get("a"), Some(&Scalar::Integer(1)));
        assert_eq!(consumer.get("b.c"), Some(&Scalar::Integer(2)));

        // Producer update then re-forwards to the open subscription.
        let update_messages = producer.handle_control(&mut event_loop, "(update a 5)").unwrap();
        for message in &update_messages {
            if message.topic == "AIKO/consumer/1/1/response" {
                consumer.apply_message(&message.payload).unwrap();
            }
        }
        assert_eq!(consumer.get("a"), Some(&Scalar::Integer(5)));
        assert_eq!(consumer.get("b.c"), Some(&Scalar::Integer(2)));
    }

    #[test]
    fn zero_lease_time_terminates_subscription() {
        let mut event_loop = EventLoop::new();
        let mut producer = EcProducer::new("state");
        producer
            .handle_control(&mut event_loop, "(stream response 10 *)")
            .unwrap();
        assert_eq!(producer.subscription_count(), 1);
        producer.handle_control(&mut event_loop, "(stream response 0 *)").unwrap();
        assert_eq!(producer.subscription_count(), 0);
    }

    #[test]
    fn subscription_lease_expires_and_is_removed_without_a_renewal() {
        use aiko_core::event_loop::fake_clock::FakeClock;
        use std::sync::Arc as StdArc;

        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(StdArc::new(clock.clone()));
        let mut producer = EcProducer::new("state");
        producer
            .handle_control(&mut event_loop, "(stream response 10 *)")
            .unwrap();
        assert_eq!(producer.subscription_count(), 1);

        clock.advance(Duration::from_secs(5));
        event_loop.tick();
        producer.reap_expired_subscriptions();
        assert_eq!(producer.subscription_count(), 1, "must not expire before its lease time");

        clock.advance(Duration::from_secs(6));
        event_loop.tick();
        producer.reap_expired_subscriptions();
        assert_eq!(producer.subscription_count(), 0, "must expire once its lease time elapses");
    }

    #[test]
    fn resending_stream_renews_the_lease_instead_of_resynchronizing() {
        use aiko_core::event_loop::fake_clock::FakeClock;
        use std::sync::Arc as StdArc;

        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(StdArc::new(clock.clone()));
        let mut producer = EcProducer::new("state");
        producer.handle_control(&mut event_loop, "(add a 1)").unwrap();
        producer
            .handle_control(&mut event_loop, "(stream response 10 *)")
            .unwrap();

        clock.advance(Duration::from_secs(9));
        event_loop.tick();
        let renewal_messages = producer
            .handle_control(&mut event_loop, "(stream response 10 *)")
            .unwrap();
        assert!(renewal_messages.is_empty(), "a renewal must not re-send the snapshot");

        clock.advance(Duration::from_secs(9));
        event_loop.tick();
        producer.reap_expired_subscriptions();
        assert_eq!(producer.subscription_count(), 1, "the renewal must have pushed the deadline out");
    }

    #[test]
    fn consumer_auto_renews_without_external_action() {
        use aiko_core::event_loop::fake_clock::FakeClock;
        use std::sync::Arc as StdArc;

        let clock = FakeClock::new();
        let mut event_loop = EventLoop::with_clock(StdArc::new(clock.clone()));
        let mut consumer = EcConsumer::new("producer/control", "consumer/response", ItemNames::All);
        let initial = consumer.subscribe(&mut event_loop, Duration::from_millis(100));
        assert_eq!(initial.topic, "producer/control");

        for _ in 0..20 {
            clock.advance(Duration::from_millis(10));
            event_loop.tick();
        }
        let renewals = consumer.drain_renewals();
        assert!(!renewals.is_empty());
        assert!(renewals.iter().all(|m| m.topic == "producer/control"));
    }
}
