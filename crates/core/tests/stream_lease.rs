//! End-to-end: a stream's lease is extended by activity and expires
//! (destroying the stream, firing `stop_stream` exactly once) once grace
//! time passes with no further `process_frame` calls.

use aiko_core::element::{ElementConfig, FrameContext, LocalElementRegistry, PipelineElement, StreamEvent, Value};
use aiko_core::event_loop::fake_clock::FakeClock;
use aiko_core::event_loop::EventLoop;
use aiko_core::pipeline::{Deploy, Pipeline, PipelineDefinition, PipelineElementDefinition, PIPELINE_DEFINITION_VERSION};
use aiko_core::service::{Service, TopicPath};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingStops {
    stops: Arc<AtomicU64>,
}

impl PipelineElement for CountingStops {
    fn name(&self) -> &str {
        "A"
    }
    fn start_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }
    fn process_frame(&mut self, _stream_id: u64, _inputs: &HashMap<String, Value>) -> (StreamEvent, HashMap<String, Value>) {
        (StreamEvent::Okay, HashMap::new())
    }
    fn stop_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        (StreamEvent::Okay, None)
    }
}

fn definition() -> PipelineDefinition {
    PipelineDefinition {
        version: PIPELINE_DEFINITION_VERSION.to_string(),
        name: "leased".to_string(),
        runtime: "test".to_string(),
        graph: vec!["(A)".to_string()],
        parameters: HashMap::new(),
        elements: vec![PipelineElementDefinition {
            name: "A".to_string(),
            input: vec![],
            output: vec![],
            parameters: HashMap::new(),
            deploy: Deploy::Local { module: "counting_stops".to_string() },
        }],
    }
}

#[test]
fn stream_extends_on_activity_and_expires_after_grace_time() {
    let stops = Arc::new(AtomicU64::new(0));
    let mut registry = LocalElementRegistry::new();
    let registry_stops = stops.clone();
    registry.register(
        "counting_stops",
        Box::new(move |_: &ElementConfig| Box::new(CountingStops { stops: registry_stops.clone() }) as Box<dyn PipelineElement>),
    );

    let service = Service::new(TopicPath::new("AIKO", "host1", 1, 1), "leased", "pipeline", "tcp", "tester");
    let mut pipeline = Pipeline::from_definition(&definition(), &registry, service).unwrap();

    let clock = FakeClock::new();
    let mut event_loop = EventLoop::with_clock(Arc::new(clock.clone()));

    pipeline.create_stream(&mut event_loop, 7, HashMap::new(), Duration::from_secs(1)).unwrap();
    assert!(pipeline.has_stream(7));

    clock.advance(Duration::from_millis(900));
    event_loop.tick();
    pipeline.reap_expired_streams(&mut event_loop);
    assert!(pipeline.has_stream(7), "must not expire before grace time");
    pipeline.process_frame(&mut event_loop, FrameContext::new(7, 0)).unwrap();

    clock.advance(Duration::from_millis(900));
    event_loop.tick();
    pipeline.reap_expired_streams(&mut event_loop);
    assert!(pipeline.has_stream(7), "process_frame must have extended the lease");
    assert_eq!(stops.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_millis(1100));
    event_loop.tick();
    pipeline.reap_expired_streams(&mut event_loop);
    assert!(!pipeline.has_stream(7), "must expire once grace time elapses with no activity");
    assert_eq!(stops.load(Ordering::SeqCst), 1, "stop_stream must fire exactly once");
}
