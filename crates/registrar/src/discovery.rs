//! Service discovery: a cache of the primary registrar's catalog, fed by
//! its `/out` topic, with registered `(filter, change_handler)` pairs.

use aiko_core::error::{Error, Result};
use aiko_core::parser;
use aiko_core::service::{ServiceFilter, ServiceRecord, Tag, TopicPath};
use std::collections::HashMap;

fn parse_tags_sublist(token: &str) -> Vec<Tag> {
    token
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split_whitespace()
        .filter_map(|s| s.parse::<Tag>().ok())
        .collect()
}

/// `"add"` or `"remove"`, matching §4.11's change-handler contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
}

struct Registration {
    filter: ServiceFilter,
    handler: Box<dyn FnMut(ChangeKind, &ServiceRecord) + Send>,
}

/// Process-wide cache of services known to the primary registrar.
#[derive(Default)]
pub struct DiscoveryCache {
    cache: HashMap<TopicPath, ServiceRecord>,
    registrations: Vec<Registration>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        DiscoveryCache::default()
    }

    pub fn register(&mut self, filter: ServiceFilter, handler: impl FnMut(ChangeKind, &ServiceRecord) + Send + 'static) {
        self.registrations.push(Registration {
            filter,
            handler: Box::new(handler),
        });
    }

    pub fn query(&self, filter: &ServiceFilter) -> Vec<&ServiceRecord> {
        self.cache.values().filter(|r| filter.matches(r)).collect()
    }

    pub fn get(&self, topic_path: &TopicPath) -> Option<&ServiceRecord> {
        self.cache.get(topic_path)
    }

    /// Apply one payload observed on the primary registrar's `/out` topic.
    pub fn apply_event(&mut self, payload: &str, time_add: u64) -> Result<()> {
        let (command, params) = parser::parse(payload)?;
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
                let record = ServiceRecord::new(topic_path.clone(), name, protocol, transport, owner, tags, time_add);

                self.cache.insert(topic_path, record.clone());
                for registration in &mut self.registrations {
                    if registration.filter.matches(&record) {
                        (registration.handler)(ChangeKind::Add, &record);
                    }
                }
                Ok(())
            }
            "remove" => {
                let topic_path: TopicPath = params
                    .first()
                    .ok_or_else(|| Error::Protocol("missing topic_path".into()))?
                    .parse()?;
                if let Some(record) = self.cache.remove(&topic_path) {
                    for registration in &mut self.registrations {
                        if registration.filter.matches(&record) {
                            (registration.handler)(ChangeKind::Remove, &record);
                        }
                    }
                }
                Ok(())
            }
            "sync" => Ok(()),
            other => Err(Error::Protocol(format!("unknown discovery /out command: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn add_event_invokes_matching_handlers_only() {
        let mut cache = DiscoveryCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        cache.register(
            ServiceFilter {
                name: Some("camera".to_string()),
                ..Default::default()
            },
            move |kind, record| {
                seen_clone.lock().unwrap().push((kind, record.topic_path.to_string()));
            },
        );

        cache
            .apply_event("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1)
            .unwrap();
        cache
            .apply_event("(add AIKO/host1/100/2 audio tcp bob (name=mic))", 1)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (ChangeKind::Add, "AIKO/host1/100/1".to_string()));
    }

    #[test]
    fn remove_event_fires_handler_with_the_removed_record() {
        let mut cache = DiscoveryCache::new();
        let removed = Arc::new(Mutex::new(false));
        let removed_clone = removed.clone();
        cache.register(ServiceFilter::default(), move |kind, _record| {
            if kind == ChangeKind::Remove {
                *removed_clone.lock().unwrap() = true;
            }
        });

        cache
            .apply_event("(add AIKO/host1/100/1 video tcp alice (name=camera))", 1)
            .unwrap();
        cache.apply_event("(remove AIKO/host1/100/1)", 2).unwrap();

        assert!(*removed.lock().unwrap());
        assert!(cache.get(&TopicPath::new("AIKO", "host1", 100, 1)).is_none());
    }

    #[test]
    fn sync_is_informational_and_does_not_error() {
        let mut cache = DiscoveryCache::new();
        cache.apply_event("(sync AIKO/host1/100/1/out)", 1).unwrap();
    }
}
