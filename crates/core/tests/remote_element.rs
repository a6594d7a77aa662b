//! End-to-end: a remote element contributes nothing while its backing
//! service is absent, then forwards `process_frame` as a published
//! S-expression once discovery binds a service to it.

use aiko_core::element::{FrameContext, LocalElementRegistry, Value};
use aiko_core::event_loop::EventLoop;
use aiko_core::pipeline::{Deploy, FrameOutcome, FramePublisher, Pipeline, PipelineDefinition, PipelineElementDefinition, PIPELINE_DEFINITION_VERSION};
use aiko_core::service::{Service, ServiceFilter, TopicPath};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

fn definition() -> PipelineDefinition {
    PipelineDefinition {
        version: PIPELINE_DEFINITION_VERSION.to_string(),
        name: "remote".to_string(),
        runtime: "test".to_string(),
        graph: vec!["(R)".to_string()],
        parameters: HashMap::new(),
        elements: vec![PipelineElementDefinition {
            name: "R".to_string(),
            input: vec![],
            output: vec![],
            parameters: HashMap::new(),
            deploy: Deploy::Remote {
                module: "remote_worker".to_string(),
                service_filter: ServiceFilter {
                    name: Some("worker".to_string()),
                    ..Default::default()
                },
            },
        }],
    }
}

fn service() -> Service {
    Service::new(TopicPath::new("AIKO", "host1", 1, 1), "remote", "pipeline", "tcp", "tester")
}

#[test]
fn remote_element_absent_contributes_nothing_and_does_not_error() {
    let registry = LocalElementRegistry::new();
    let mut pipeline = Pipeline::from_definition(&definition(), &registry, service()).unwrap();

    assert_eq!(pipeline.remote_service_present("R"), Some(false));

    let mut event_loop = EventLoop::new();
    let outcome = pipeline.process_frame(&mut event_loop, FrameContext::new(0, 0)).unwrap();
    match outcome {
        FrameOutcome::Completed(swag) => assert!(swag.is_empty(), "absent remote element must add no swag"),
        FrameOutcome::Dropped => panic!("an absent remote element must not drop the frame"),
    }
}

struct RecordingPublisher {
    published: Arc<Mutex<Vec<(String, String)>>>,
}

impl FramePublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &str) {
        self.published.lock().push((topic.to_string(), payload.to_string()));
    }
}

#[test]
fn remote_element_discovered_forwards_process_frame_to_its_in_topic() {
    let registry = LocalElementRegistry::new();
    let mut pipeline = Pipeline::from_definition(&definition(), &registry, service()).unwrap();

    let published = Arc::new(Mutex::new(Vec::new()));
    let publisher = Arc::new(RecordingPublisher { published: published.clone() });
    pipeline.bind_remote_service("R", "AIKO/host2/42/1/R/in".to_string(), publisher);

    assert_eq!(pipeline.remote_service_present("R"), Some(true));

    let mut event_loop = EventLoop::new();
    let mut context = FrameContext::new(3, 0);
    context.swag.insert("n".to_string(), Value::Integer(9));
    let outcome = pipeline.process_frame(&mut event_loop, context).unwrap();
    match outcome {
        FrameOutcome::Completed(_) => {}
        FrameOutcome::Dropped => panic!("binding a remote service must not drop the frame"),
    }

    let calls = published.lock();
    assert_eq!(calls.len(), 1);
    let (topic, payload) = &calls[0];
    assert_eq!(topic, "AIKO/host2/42/1/R/in");
    assert!(payload.starts_with("(process_frame 3"), "payload was: {payload}");

    pipeline.unbind_remote_service("R");
    assert_eq!(pipeline.remote_service_present("R"), Some(false));
}
