//! Client-side half of the registrar wire protocol (§4.10/§4.11 of the
//! design): this binary only ever talks *to* a registrar, it never runs
//! the election or catalog state machine itself.

use aiko_core::error::{Error, Result};
use aiko_core::event_loop::QueueItem;
use aiko_core::parser;
use aiko_core::service::{ServiceRecord, Tag, TopicPath};
use aiko_transport::MessageTransport;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// `namespace/service/registrar`, the retained boot topic every
/// registrar announces its primary status on.
pub fn boot_topic(namespace: &str) -> String {
    format!("{namespace}/service/registrar")
}

/// Subscribe to the boot topic and wait for a retained `(primary found
/// topic time)` announcement. Returns the primary's topic path.
pub async fn discover_primary(
    transport: &dyn MessageTransport,
    queue_rx: &mut UnboundedReceiver<QueueItem>,
    namespace: &str,
    wait_for: Duration,
) -> Result<TopicPath> {
    let boot = boot_topic(namespace);
    transport
        .subscribe(&[boot.clone()])
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;

    let found = timeout(wait_for, async {
        while let Some(item) = queue_rx.recv().await {
            if item.type_tag != boot {
                continue;
            }
            let (command, params) = parser::parse(&item.payload)?;
            if command == "primary" && params.first().map(String::as_str) == Some("found") {
                let topic_path = params
                    .get(1)
                    .ok_or_else(|| Error::Protocol("missing topic in (primary found ...)".into()))?;
                return Ok(topic_path.parse::<TopicPath>()?);
            }
        }
        Err(Error::Transport("registrar announcement channel closed".into()))
    })
    .await;

    match found {
        Ok(result) => result,
        Err(_) => Err(Error::Transport(format!(
            "no primary registrar announced on '{boot}' within {wait_for:?}"
        ))),
    }
}

/// Publish `(add topic proto transport owner (tags))` on the registrar's
/// `/in` topic.
pub async fn register(transport: &dyn MessageTransport, registrar: &TopicPath, record: &ServiceRecord) -> Result<()> {
    let tags = format!(
        "({})",
        record.tags.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" ")
    );
    let payload = parser::generate(
        "add",
        &[
            record.topic_path.to_string(),
            record.protocol.clone(),
            record.transport.clone(),
            record.owner.clone(),
            tags,
        ],
    );
    transport
        .publish(&registrar.in_topic(), &payload, false, true)
        .await
        .map_err(|err| Error::Transport(err.to_string()))
}

/// Query the registrar catalog for every service tagged `name=<name>`
/// and collect the topic paths of whatever matches.
pub async fn find_by_name(
    transport: &dyn MessageTransport,
    queue_rx: &mut UnboundedReceiver<QueueItem>,
    registrar: &TopicPath,
    response_topic: &str,
    name: &str,
    wait_for: Duration,
) -> Result<Vec<TopicPath>> {
    transport
        .subscribe(&[response_topic.to_string()])
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;

    let query_tag = Tag::new("name", name);
    let payload = parser::generate(
        "query",
        &[
            response_topic.to_string(),
            "*".to_string(),
            "*".to_string(),
            "*".to_string(),
            format!("({query_tag})"),
        ],
    );
    transport
        .publish(&registrar.in_topic(), &payload, false, true)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;

    let collected = timeout(wait_for, async {
        let mut expected: Option<usize> = None;
        let mut matches = Vec::new();
        while let Some(item) = queue_rx.recv().await {
            if item.type_tag != response_topic {
                continue;
            }
            let (command, params) = parser::parse(&item.payload)?;
            match command.as_str() {
                "item_count" => {
                    let count: usize = params
                        .first()
                        .ok_or_else(|| Error::Protocol("missing item_count".into()))?
                        .parse()
                        .map_err(|_| Error::Protocol("malformed item_count".into()))?;
                    expected = Some(count);
                    if count == 0 {
                        return Ok(matches);
                    }
                }
                "add" => {
                    let topic_path: TopicPath = params
                        .first()
                        .ok_or_else(|| Error::Protocol("missing topic in (add ...)".into()))?
                        .parse()?;
                    matches.push(topic_path);
                    if expected == Some(matches.len()) {
                        return Ok(matches);
                    }
                }
                "sync" => return Ok(matches),
                _ => {}
            }
        }
        Ok(matches)
    })
    .await;

    match collected {
        Ok(result) => result,
        Err(_) => Err(Error::Transport(format!("registrar query for '{name}' timed out after {wait_for:?}"))),
    }
}

/// Publish `(remove topic)` on the registrar's `/in` topic.
pub async fn unregister(transport: &dyn MessageTransport, registrar: &TopicPath, topic_path: &TopicPath) -> Result<()> {
    let payload = parser::generate("remove", &[topic_path.to_string()]);
    transport
        .publish(&registrar.in_topic(), &payload, false, true)
        .await
        .map_err(|err| Error::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_topic_is_namespaced() {
        assert_eq!(boot_topic("AIKO"), "AIKO/service/registrar");
    }
}
