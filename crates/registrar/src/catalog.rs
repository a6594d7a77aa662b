//! Service catalog: the registrar's `services`/`history` table and the
//! `/in` command handler that maintains it.

use aiko_core::error::{Error, Result};
use aiko_core::parser;
use aiko_core::service::{ServiceFilter, ServiceRecord, Tag, TopicPath};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// A message the caller should publish as a result of handling a
/// catalog command.
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

fn tags_sublist(tags: &[Tag]) -> String {
    format!("({})", tags.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" "))
}

fn parse_tags_sublist(token: &str) -> Vec<Tag> {
    token
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split_whitespace()
        .filter_map(|s| s.parse::<Tag>().ok())
        .collect()
}

fn encode_add(record: &ServiceRecord) -> String {
    parser::generate(
        "add",
        &[
            record.topic_path.to_string(),
            record.protocol.clone(),
            record.transport.clone(),
            record.owner.clone(),
            tags_sublist(&record.tags),
        ],
    )
}

/// `services` keyed by topic path, plus a bounded ring buffer of
/// recently removed records.
pub struct ServiceCatalog {
    out_topic: String,
    services: HashMap<TopicPath, ServiceRecord>,
    history: VecDeque<ServiceRecord>,
    history_capacity: usize,
}

impl ServiceCatalog {
    pub fn new(out_topic: impl Into<String>, history_capacity: usize) -> Self {
        ServiceCatalog {
            out_topic: out_topic.into(),
            services: HashMap::new(),
            history: VecDeque::new(),
            history_capacity,
        }
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.history.iter()
    }

    pub fn get(&self, topic_path: &TopicPath) -> Option<&ServiceRecord> {
        self.services.get(topic_path)
    }

    fn insert(&mut self, record: ServiceRecord) {
        self.services.insert(record.topic_path.clone(), record);
    }

    fn remove(&mut self, topic_path: &TopicPath, time_remove: u64) -> Option<ServiceRecord> {
        let mut record = self.services.remove(topic_path)?;
        record.time_remove = time_remove;
        self.history.push_back(record.clone());
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        Some(record)
    }

    /// Handle one payload received on the registrar's `/in` topic.
    pub fn handle_in(&mut self, payload: &str, now: u64) -> Result<Vec<OutgoingMessage>> {
        let (command, params) = parser::parse(payload)?;
        debug!(command = command.as_str(), "registrar /in command");
        match command.as_str() {
            "add" => {
                let topic_path: TopicPath = params
                    .first()
                    .ok_or_else(|| Error::Protocol("missing topic_path".into()))?
                    .parse()?;
                let protocol = params.get(1).cloned().unwrap_or_default();
                let transport = params.get(2).cloned().unwrap_or_default();
                let owner = params.get(3).cloned().unwrap_or_default();
                let tags = params.get(4).map(|s| parse_tags_sublist(s)).unwrap_or_default();
                let name = tags
                    .iter()
                    .find(|t| t.key == "name")
                    .map(|t| t.value.clone())
                    .unwrap_or_else(|| topic_path.to_string());

                let record = ServiceRecord::new(topic_path, name, protocol, transport, owner, tags, now);
                let out = OutgoingMessage::new(self.out_topic.clone(), encode_add(&record));
                self.insert(record);
                Ok(vec![out])
            }
            "remove" => {
                let topic_path: TopicPath = params
                    .first()
                    .ok_or_else(|| Error::Protocol("missing topic_path".into()))?
                    .parse()?;
                if self.remove(&topic_path, now).is_some() {
                    Ok(vec![OutgoingMessage::new(
                        self.out_topic.clone(),
                        parser::generate("remove", &[topic_path.to_string()]),
                    )])
                } else {
                    Ok(Vec::new())
                }
            }
            "query" => self.handle_query(&params),
            other => Err(Error::Protocol(format!("unknown registrar /in command: {other}"))),
        }
    }

    fn handle_query(&self, params: &[String]) -> Result<Vec<OutgoingMessage>> {
        let response_topic = params
            .first()
            .ok_or_else(|| Error::Protocol("missing response_topic".into()))?
            .clone();
        let field = |index: usize| -> Option<String> {
            params.get(index).filter(|s| s.as_str() != "*").cloned()
        };
        let filter = ServiceFilter {
            topic_path: None,
            name: None,
            protocol: field(1),
            transport: field(2),
            owner: field(3),
            tags: params.get(4).map(|s| parse_tags_sublist(s)).unwrap_or_default(),
        };

        let mut matches: Vec<&ServiceRecord> = self.services.values().filter(|r| filter.matches(r)).collect();
        matches.sort_by(|a, b| a.topic_path.cmp(&b.topic_path));

        let mut messages = vec![OutgoingMessage::new(
            response_topic.clone(),
            parser::generate("item_count", &[matches.len().to_string()]),
        )];
        for record in &matches {
            messages.push(OutgoingMessage::new(response_topic.clone(), encode_add(record)));
        }
        messages.push(OutgoingMessage::new(
            self.out_topic.clone(),
            parser::generate("sync", &[response_topic]),
        ));
        Ok(messages)
    }

    /// `namespace/+/+/+/state` carrying `(absent)`: remove that topic
    /// path, or every service under it if it names a whole process.
    pub fn handle_state_absent(&mut self, topic_path: &str, now: u64) -> Result<Vec<OutgoingMessage>> {
        let topic_path: TopicPath = topic_path.parse()?;
        let targets: Vec<TopicPath> = if topic_path.is_process() {
            self.services
                .keys()
                .filter(|t| {
                    t.namespace == topic_path.namespace
                        && t.host == topic_path.host
                        && t.process_id == topic_path.process_id
                })
                .cloned()
                .collect()
        } else {
            vec![topic_path]
        };

        let mut messages = Vec::new();
        for target in targets {
            if self.remove(&target, now).is_some() {
                messages.push(OutgoingMessage::new(
                    self.out_topic.clone(),
                    parser::generate("remove", &[target.to_string()]),
                ));
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(service_id: u32) -> TopicPath {
        TopicPath::new("AIKO", "host1", 100, service_id)
    }

    #[test]
    fn add_inserts_and_republishes_on_out_topic() {
        let mut catalog = ServiceCatalog::new("AIKO/host1/100/0/out", 10);
        let messages = catalog
            .handle_in("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1)
            .unwrap();
        assert_eq!(catalog.service_count(), 1);
        assert_eq!(messages[0].topic, "AIKO/host1/100/0/out");
        assert!(messages[0].payload.starts_with("(add AIKO/host1/100/1 video tcp alice"));
    }

    #[test]
    fn remove_moves_record_to_history() {
        let mut catalog = ServiceCatalog::new("out", 10);
        catalog.handle_in("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1).unwrap();
        catalog.handle_in("(remove AIKO/host1/100/1)", 2).unwrap();
        assert_eq!(catalog.service_count(), 0);
        let history: Vec<&ServiceRecord> = catalog.history().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].time_remove, 2);
    }

    #[test]
    fn query_replies_with_item_count_then_matches_then_sync() {
        let mut catalog = ServiceCatalog::new("out", 10);
        catalog.handle_in("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1).unwrap();
        catalog.handle_in("(add AIKO/host1/100/2 audio tcp bob (name=mic))", 1).unwrap();

        let messages = catalog.handle_in("(query resp video * * *)", 5).unwrap();
        assert_eq!(messages[0].payload, "(item_count 1)");
        assert!(messages[1].payload.contains("AIKO/host1/100/1"));
        assert_eq!(messages.last().unwrap().payload, "(sync resp)");
    }

    #[test]
    fn state_absent_on_a_process_removes_every_service_under_it() {
        let mut catalog = ServiceCatalog::new("out", 10);
        catalog.handle_in("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1).unwrap();
        catalog.handle_in("(add AIKO/host1/100/2 audio tcp alice (name=mic))", 1).unwrap();
        catalog.handle_in("(add AIKO/host1/200/1 video tcp bob (name=other))", 1).unwrap();

        let messages = catalog.handle_state_absent("AIKO/host1/100/0", 9).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(catalog.service_count(), 1);
        assert!(catalog.get(&topic(1)).is_none());
    }

    #[test]
    fn service_count_and_time_remove_hold_the_live_vs_history_invariant() {
        let mut catalog = ServiceCatalog::new("out", 10);
        catalog.handle_in("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1).unwrap();
        catalog.handle_in("(add AIKO/host1/100/2 audio tcp alice (name=mic))", 1).unwrap();
        catalog.handle_in("(remove AIKO/host1/100/2)", 4).unwrap();

        assert_eq!(catalog.service_count(), catalog.services.len());
        for record in catalog.services.values() {
            assert_eq!(record.time_remove, 0, "a live record must never carry a removal time");
        }
        for record in catalog.history() {
            assert!(record.time_remove > 0, "a history record must always carry a removal time");
        }
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let mut catalog = ServiceCatalog::new("out", 2);
        for i in 1..=3u32 {
            let path = format!("AIKO/host1/100/{i}");
            catalog.handle_in(&format!("(add {path} video tcp alice (name=s{i}))"), 1).unwrap();
            catalog.handle_in(&format!("(remove {path})"), 2).unwrap();
        }
        assert_eq!(catalog.history().count(), 2);
    }
}
