//! Pipeline: graph walker, stream leases, and remote-element proxy management

use crate::element::{
    ElementConfig, FrameContext, LocalElementRegistry, PipelineElement, RemoteAbsentElement,
    StreamEvent, Value,
};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::graph::Graph;
use crate::lease::Lease;
use crate::parser;
use crate::service::{Service, ServiceFilter};
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// How a pipeline element is deployed.
#[derive(Debug, Clone)]
pub enum Deploy {
    /// Instantiated in-process from a registered module factory.
    Local { module: String },
    /// Proxied to a discovered Service matching `service_filter`.
    Remote {
        module: String,
        service_filter: ServiceFilter,
    },
}

/// One entry in a `PipelineDefinition`'s element list.
#[derive(Debug, Clone)]
pub struct PipelineElementDefinition {
    pub name: String,
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub parameters: HashMap<String, Value>,
    pub deploy: Deploy,
}

/// The supported definition schema version. Parsers must reject any other.
pub const PIPELINE_DEFINITION_VERSION: &str = "1.0";

/// `{version, name, runtime, graph, parameters, elements}` — the
/// declarative description a `Pipeline` is built from.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub version: String,
    pub name: String,
    /// Informational tag only; not interpreted by construction.
    pub runtime: String,
    pub graph: Vec<String>,
    pub parameters: HashMap<String, Value>,
    pub elements: Vec<PipelineElementDefinition>,
}

impl PipelineDefinition {
    pub fn validate_version(&self) -> Result<()> {
        if self.version != PIPELINE_DEFINITION_VERSION {
            return Err(Error::Configuration(format!(
                "unsupported pipeline definition version: {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// Sends a `process_frame` message to a discovered remote service. The
/// concrete implementation lives in the transport crate; `aiko-core`
/// only needs the narrow publish contract.
pub trait FramePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str);
}

/// A remote element with a service currently bound: forwards every
/// `process_frame` call as a published S-expression on the target's
/// `/in` topic and contributes no swag of its own (results, if any,
/// arrive later through the EC channel, not synchronously).
struct RemoteProxyElement {
    name: String,
    target_in_topic: String,
    publisher: Arc<dyn FramePublisher>,
}

impl PipelineElement for RemoteProxyElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }

    fn process_frame(
        &mut self,
        stream_id: u64,
        inputs: &HashMap<String, Value>,
    ) -> (StreamEvent, HashMap<String, Value>) {
        let mut params: Vec<String> = vec![stream_id.to_string()];
        let mut keys: Vec<&String> = inputs.keys().collect();
        keys.sort();
        for key in keys {
            params.push(format!("{}={:?}", key, inputs[key]));
        }
        let payload = parser::generate("process_frame", &params);
        self.publisher.publish(&self.target_in_topic, &payload);
        (StreamEvent::Okay, HashMap::new())
    }

    fn stop_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }
}

struct RemoteBinding {
    module: String,
    service_filter: ServiceFilter,
    present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Ready,
    Stopped,
}

/// Outcome of one `process_frame` traversal.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    /// The traversal ran to completion (or was cut short by `NoFrame`);
    /// carries the swag accumulated so far.
    Completed(Swag),
    /// An element returned `DropFrame`; the frame is discarded entirely.
    Dropped,
}

pub use crate::element::Swag;

/// Graph walker, stream table, and remote-element proxy management for
/// one pipeline instance.
pub struct Pipeline {
    pub service: Service,
    definition_parameters: HashMap<String, Value>,
    graph: Graph,
    element_configs: HashMap<String, ElementConfig>,
    elements: HashMap<String, Box<dyn PipelineElement>>,
    remote_bindings: HashMap<String, RemoteBinding>,
    streams: HashMap<u64, Stream>,
    lifecycle: Lifecycle,
    expired_streams: Arc<Mutex<Vec<u64>>>,
    log_publisher: Option<Arc<dyn FramePublisher>>,
}

impl Pipeline {
    /// Build a pipeline from its definition: construct the graph, then
    /// instantiate each element (local from the registry, remote as an
    /// absent placeholder pending discovery).
    pub fn from_definition(
        definition: &PipelineDefinition,
        registry: &LocalElementRegistry,
        service: Service,
    ) -> Result<Self> {
        definition.validate_version()?;
        let graph = Graph::from_subgraphs(&definition.graph)?;

        let mut element_configs = HashMap::new();
        let mut elements: HashMap<String, Box<dyn PipelineElement>> = HashMap::new();
        let mut remote_bindings = HashMap::new();

        for element_def in &definition.elements {
            if !graph.contains(&element_def.name) {
                return Err(Error::Configuration(format!(
                    "element '{}' is not referenced by the pipeline graph",
                    element_def.name
                )));
            }

            let mut config = ElementConfig::new(element_def.name.clone());
            config.inputs = element_def.input.clone();
            config.outputs = element_def.output.clone();
            config.parameters = element_def.parameters.clone();

            match &element_def.deploy {
                Deploy::Local { module } => {
                    let instance = registry.create(module, &config).ok_or_else(|| {
                        Error::Configuration(format!(
                            "no local element factory registered for module '{module}'"
                        ))
                    })?;
                    elements.insert(element_def.name.clone(), instance);
                }
                Deploy::Remote { module, service_filter } => {
                    elements.insert(
                        element_def.name.clone(),
                        Box::new(RemoteAbsentElement::new(element_def.name.clone())),
                    );
                    remote_bindings.insert(
                        element_def.name.clone(),
                        RemoteBinding {
                            module: module.clone(),
                            service_filter: service_filter.clone(),
                            present: false,
                        },
                    );
                }
            }
            element_configs.insert(element_def.name.clone(), config);
        }

        Ok(Pipeline {
            service,
            definition_parameters: definition.parameters.clone(),
            graph,
            element_configs,
            elements,
            remote_bindings,
            streams: HashMap::new(),
            lifecycle: Lifecycle::Ready,
            expired_streams: Arc::new(Mutex::new(Vec::new())),
            log_publisher: None,
        })
    }

    /// Publish every subsequent diagnostic (stream errors; see
    /// `process_frame`) to this service's `/log` topic instead of
    /// dropping it. Unset by default: a pipeline with no registrar/
    /// transport wiring yet still runs, it just logs nowhere but
    /// `tracing`.
    pub fn set_log_publisher(&mut self, publisher: Arc<dyn FramePublisher>) {
        self.log_publisher = Some(publisher);
    }

    fn emit_diagnostic(&self, message: &str) {
        warn!(topic_path = %self.service.topic_path, message, "stream error");
        if let Some(publisher) = &self.log_publisher {
            let payload = parser::generate("log", &[message.to_string()]);
            publisher.publish(&self.service.topic_path.log_topic(), &payload);
        }
    }

    /// The pipeline's own default parameters, used as the fallback tier
    /// of element parameter resolution.
    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.definition_parameters
    }

    /// Whether a remote element's backing service is currently bound.
    pub fn remote_service_present(&self, element_name: &str) -> Option<bool> {
        self.remote_bindings.get(element_name).map(|b| b.present)
    }

    pub fn remote_service_filter(&self, element_name: &str) -> Option<&ServiceFilter> {
        self.remote_bindings.get(element_name).map(|b| &b.service_filter)
    }

    /// Discovery reported a matching service online: swap the element's
    /// placeholder for a transport proxy targeting `in_topic`.
    pub fn bind_remote_service(
        &mut self,
        element_name: &str,
        in_topic: String,
        publisher: Arc<dyn FramePublisher>,
    ) {
        if let Some(binding) = self.remote_bindings.get_mut(element_name) {
            binding.present = true;
            self.elements.insert(
                element_name.to_string(),
                Box::new(RemoteProxyElement {
                    name: element_name.to_string(),
                    target_in_topic: in_topic,
                    publisher,
                }),
            );
        }
    }

    /// Discovery reported the matching service is gone: revert to
    /// remote-absent.
    pub fn unbind_remote_service(&mut self, element_name: &str) {
        if let Some(binding) = self.remote_bindings.get_mut(element_name) {
            binding.present = false;
            self.elements.insert(
                element_name.to_string(),
                Box::new(RemoteAbsentElement::new(element_name.to_string())),
            );
        }
    }

    /// Create a stream: rejected if the pipeline isn't ready. Invokes
    /// `start_stream` on every element in graph order; per-element
    /// failures are logged but do not abort creation.
    pub fn create_stream(
        &mut self,
        event_loop: &mut EventLoop,
        stream_id: u64,
        parameters: HashMap<String, Value>,
        grace_time: Duration,
    ) -> Result<()> {
        if self.lifecycle != Lifecycle::Ready {
            return Err(Error::Configuration(format!(
                "cannot create stream {stream_id}: pipeline is not ready"
            )));
        }

        let expired = self.expired_streams.clone();
        let lease = Lease::new(
            event_loop,
            stream_id,
            grace_time,
            move |id| {
                expired.lock().unwrap().push(id);
            },
            |_id| {},
            false,
        );
        let stream = Stream::new(stream_id, parameters, lease);
        self.streams.insert(stream_id, stream);

        for node_name in self.graph.iter_order() {
            if let Some(element) = self.elements.get_mut(&node_name) {
                let (event, diagnostic) = element.start_stream(stream_id);
                if event == StreamEvent::Error {
                    warn!(
                        stream_id,
                        element = node_name.as_str(),
                        diagnostic = diagnostic.unwrap_or_default(),
                        "start_stream failed; continuing with partial start"
                    );
                }
            }
        }
        Ok(())
    }

    /// Destroy a stream: remove it from the lease table and invoke
    /// `stop_stream` on every element in graph order, ignoring
    /// per-element errors to guarantee full cleanup.
    pub fn destroy_stream(&mut self, event_loop: &mut EventLoop, stream_id: u64) {
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            stream.lease.terminate(event_loop);
        }
        for node_name in self.graph.iter_order() {
            if let Some(element) = self.elements.get_mut(&node_name) {
                let _ = element.stop_stream(stream_id);
            }
        }
    }

    /// Drain any streams whose lease expired since the last call,
    /// destroying each in turn. Intended to be polled once per event
    /// loop tick.
    pub fn reap_expired_streams(&mut self, event_loop: &mut EventLoop) {
        let ids: Vec<u64> = std::mem::take(&mut *self.expired_streams.lock().unwrap());
        for stream_id in ids {
            info!(stream_id, "lease expired; destroying stream");
            self.destroy_stream(event_loop, stream_id);
        }
    }

    pub fn has_stream(&self, stream_id: u64) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Walk the graph in iteration order, gathering each node's declared
    /// inputs from `swag`, invoking the element, and merging its outputs
    /// back per the event semantics in the element contract.
    ///
    /// A missing declared input or an element returning `Error` is a
    /// stream error: the offending stream is destroyed (its
    /// `stop_stream` runs on every element, its lease is released) and
    /// a diagnostic is published on `/log` before the error is
    /// returned. Other streams are unaffected.
    pub fn process_frame(
        &mut self,
        event_loop: &mut EventLoop,
        context: FrameContext,
    ) -> Result<FrameOutcome> {
        let FrameContext {
            stream_id,
            frame_id: _frame_id,
            swag: mut swag,
        } = context;

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            let current_time = stream.lease.time();
            stream.lease.extend(current_time);
            stream.next_frame_id();
        }

        for node_name in self.graph.iter_order() {
            let config = self.element_configs.get(&node_name);
            let mut inputs = HashMap::new();
            if let Some(config) = config {
                for input_name in &config.inputs {
                    match swag.get(input_name) {
                        Some(value) => {
                            inputs.insert(input_name.clone(), value.clone());
                        }
                        None => {
                            let message = format!(
                                "element '{node_name}' is missing declared input '{input_name}'"
                            );
                            self.emit_diagnostic(&message);
                            self.destroy_stream(event_loop, stream_id);
                            return Err(Error::Stream { stream_id, message });
                        }
                    }
                }
            }

            let element = match self.elements.get_mut(&node_name) {
                Some(element) => element,
                None => continue,
            };
            let (event, outputs) = element.process_frame(stream_id, &inputs);
            match event {
                StreamEvent::Okay => {
                    swag.extend(outputs);
                }
                StreamEvent::NoFrame => {
                    return Ok(FrameOutcome::Completed(swag));
                }
                StreamEvent::DropFrame => {
                    return Ok(FrameOutcome::Dropped);
                }
                StreamEvent::Stop | StreamEvent::LoopEnd => {
                    return Ok(FrameOutcome::Completed(swag));
                }
                StreamEvent::Error => {
                    let message = format!("element '{node_name}' returned ERROR");
                    self.emit_diagnostic(&message);
                    self.destroy_stream(event_loop, stream_id);
                    return Err(Error::Stream { stream_id, message });
                }
            }
        }

        Ok(FrameOutcome::Completed(swag))
    }
}
