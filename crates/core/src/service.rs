//! Process-wide service identity, topic paths, and service records
//!
//! Every process that joins the namespace is a `Service`: it owns a
//! topic path `namespace/host/process_id/service_id` and publishes to
//! five standard sub-topics (`in`, `out`, `state`, `control`, `log`).
//! `ServiceRecord` and `ServiceFilter` are the catalog entry and query
//! shape used by the registrar and by discovery.

use std::collections::BTreeSet;

/// `namespace/host/process_id/service_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPath {
    pub namespace: String,
    pub host: String,
    pub process_id: u32,
    pub service_id: u32,
}

impl TopicPath {
    pub fn new(namespace: impl Into<String>, host: impl Into<String>, process_id: u32, service_id: u32) -> Self {
        TopicPath {
            namespace: namespace.into(),
            host: host.into(),
            process_id,
            service_id,
        }
    }

    /// `true` when this path names a process rather than a specific
    /// service within it (service_id == 0).
    pub fn is_process(&self) -> bool {
        self.service_id == 0
    }

    fn sub_topic(&self, suffix: &str) -> String {
        format!("{}/{}", self, suffix)
    }

    pub fn in_topic(&self) -> String {
        self.sub_topic("in")
    }

    pub fn out_topic(&self) -> String {
        self.sub_topic("out")
    }

    pub fn state_topic(&self) -> String {
        self.sub_topic("state")
    }

    pub fn control_topic(&self) -> String {
        self.sub_topic("control")
    }

    pub fn log_topic(&self) -> String {
        self.sub_topic("log")
    }
}

impl std::fmt::Display for TopicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.host, self.process_id, self.service_id
        )
    }
}

impl std::str::FromStr for TopicPath {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let [namespace, host, process_id, service_id] = parts[..] else {
            return Err(crate::error::Error::Protocol(format!("malformed topic path: {s}")));
        };
        let process_id: u32 = process_id
            .parse()
            .map_err(|_| crate::error::Error::Protocol(format!("malformed topic path: {s}")))?;
        let service_id: u32 = service_id
            .parse()
            .map_err(|_| crate::error::Error::Protocol(format!("malformed topic path: {s}")))?;
        Ok(TopicPath::new(namespace, host, process_id, service_id))
    }
}

/// One `key=value` tag attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl std::str::FromStr for Tag {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        s.split_once('=')
            .map(|(key, value)| Tag::new(key, value))
            .ok_or_else(|| crate::error::Error::Protocol(format!("malformed tag: {s}")))
    }
}

/// A catalog entry: everything the registrar and discovery know about a
/// running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub topic_path: TopicPath,
    pub name: String,
    pub protocol: String,
    pub transport: String,
    pub owner: String,
    pub tags: Vec<Tag>,
    /// Seconds since epoch; 0 while the record is live.
    pub time_add: u64,
    pub time_remove: u64,
}

impl ServiceRecord {
    pub fn new(
        topic_path: TopicPath,
        name: impl Into<String>,
        protocol: impl Into<String>,
        transport: impl Into<String>,
        owner: impl Into<String>,
        tags: Vec<Tag>,
        time_add: u64,
    ) -> Self {
        ServiceRecord {
            topic_path,
            name: name.into(),
            protocol: protocol.into(),
            transport: transport.into(),
            owner: owner.into(),
            tags,
            time_add,
            time_remove: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.time_remove == 0
    }

    /// The tag set implied by this record, including its name/protocol/
    /// transport/owner as implicit tags, used for subset-containment
    /// matching in `ServiceFilter`.
    fn implicit_tags(&self) -> BTreeSet<String> {
        let mut set: BTreeSet<String> = self.tags.iter().map(|t| t.to_string()).collect();
        set.insert(format!("name={}", self.name));
        set.insert(format!("protocol={}", self.protocol));
        set.insert(format!("transport={}", self.transport));
        set.insert(format!("owner={}", self.owner));
        set
    }
}

const WILDCARD: &str = "*";

/// A query over the catalog. Any field may be `"*"` to mean "don't
/// care"; matching across fields is conjunctive.
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub topic_path: Option<String>,
    pub name: Option<String>,
    pub protocol: Option<String>,
    pub transport: Option<String>,
    pub owner: Option<String>,
    pub tags: Vec<Tag>,
}

impl ServiceFilter {
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        field_matches(self.topic_path.as_deref(), &record.topic_path.to_string())
            && field_matches(self.name.as_deref(), &record.name)
            && field_matches(self.protocol.as_deref(), &record.protocol)
            && field_matches(self.transport.as_deref(), &record.transport)
            && field_matches(self.owner.as_deref(), &record.owner)
            && tags_are_subset(&self.tags, record)
    }
}

fn field_matches(filter_value: Option<&str>, actual: &str) -> bool {
    match filter_value {
        None => true,
        Some(WILDCARD) => true,
        Some(expected) => expected == actual,
    }
}

fn tags_are_subset(filter_tags: &[Tag], record: &ServiceRecord) -> bool {
    if filter_tags.is_empty() {
        return true;
    }
    let record_tags = record.implicit_tags();
    filter_tags.iter().all(|tag| {
        if tag.value == WILDCARD {
            record_tags.iter().any(|t| t.starts_with(&format!("{}=", tag.key)))
        } else {
            record_tags.contains(&tag.to_string())
        }
    })
}

/// Standing identity of a process that has joined the namespace.
#[derive(Debug, Clone)]
pub struct Service {
    pub topic_path: TopicPath,
    pub name: String,
    pub protocol: String,
    pub transport: String,
    pub owner: String,
    pub tags: Vec<Tag>,
}

impl Service {
    pub fn new(
        topic_path: TopicPath,
        name: impl Into<String>,
        protocol: impl Into<String>,
        transport: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Service {
            topic_path,
            name: name.into(),
            protocol: protocol.into(),
            transport: transport.into(),
            owner: owner.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    pub fn to_record(&self, time_add: u64) -> ServiceRecord {
        ServiceRecord::new(
            self.topic_path.clone(),
            self.name.clone(),
            self.protocol.clone(),
            self.transport.clone(),
            self.owner.clone(),
            self.tags.clone(),
            time_add,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(service_id: u32) -> TopicPath {
        TopicPath::new("AIKO", "host1", 100, service_id)
    }

    #[test]
    fn topic_path_formats_and_derives_sub_topics() {
        let path = topic(1);
        assert_eq!(path.to_string(), "AIKO/host1/100/1");
        assert_eq!(path.in_topic(), "AIKO/host1/100/1/in");
        assert_eq!(path.control_topic(), "AIKO/host1/100/1/control");
    }

    #[test]
    fn process_topic_has_zero_service_id() {
        assert!(topic(0).is_process());
        assert!(!topic(1).is_process());
    }

    #[test]
    fn topic_path_round_trips_through_its_string_form() {
        let path = topic(1);
        let parsed: TopicPath = path.to_string().parse().unwrap();
        assert_eq!(parsed, path);
        assert!("not/a/valid/path/at/all".parse::<TopicPath>().is_err());
    }

    #[test]
    fn wildcard_filter_matches_everything() {
        let record = ServiceRecord::new(topic(1), "camera", "video", "tcp", "alice", vec![], 1);
        let filter = ServiceFilter::default();
        assert!(filter.matches(&record));
    }

    #[test]
    fn filter_by_name_is_exact() {
        let record = ServiceRecord::new(topic(1), "camera", "video", "tcp", "alice", vec![], 1);
        let filter = ServiceFilter {
            name: Some("camera".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&record));

        let filter = ServiceFilter {
            name: Some("microphone".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&record));
    }

    #[test]
    fn tag_matching_is_subset_containment() {
        let record = ServiceRecord::new(
            topic(1),
            "camera",
            "video",
            "tcp",
            "alice",
            vec![Tag::new("room", "101"), Tag::new("resolution", "1080p")],
            1,
        );
        let filter = ServiceFilter {
            tags: vec![Tag::new("room", "101")],
            ..Default::default()
        };
        assert!(filter.matches(&record));

        let filter = ServiceFilter {
            tags: vec![Tag::new("room", "202")],
            ..Default::default()
        };
        assert!(!filter.matches(&record));
    }

    #[test]
    fn record_generated_from_service_carries_its_tags() {
        let service = Service::new(topic(1), "camera", "video", "tcp", "alice").with_tag("room", "101");
        let record = service.to_record(42);
        assert_eq!(record.tags, vec![Tag::new("room", "101")]);
        assert_eq!(record.time_add, 42);
        assert!(record.is_live());
    }
}
