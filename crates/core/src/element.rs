//! `PipelineElement` trait, frame dataflow types, and parameter resolution
//!
//! Every element in a pipeline graph implements three lifecycle calls —
//! `start_stream`, `process_frame`, `stop_stream` — against a shared
//! per-frame accumulator ("swag") and a per-element, per-stream
//! parameter view (`ElementConfig`).

use std::collections::HashMap;
use std::sync::Arc;

/// A scalar or small-structured value flowing through the graph's swag
/// and through parameter resolution. Deliberately not `serde_json::Value`
/// (most swag entries are scalars; this keeps the hot path allocation-free
/// for the common case).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Arc<[u8]>),
    Sequence(Vec<Value>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// The per-frame accumulator mapping element-output names to their
/// values, threaded through one traversal of the graph.
pub type Swag = HashMap<String, Value>;

/// `{stream_id, frame_id, swag}`, alive only for the duration of one
/// graph traversal.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub stream_id: u64,
    pub frame_id: u64,
    pub swag: Swag,
}

impl FrameContext {
    pub fn new(stream_id: u64, frame_id: u64) -> Self {
        FrameContext {
            stream_id,
            frame_id,
            swag: Swag::new(),
        }
    }
}

/// Outcome of a `PipelineElement` lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Merge outputs into swag, continue to successors.
    Okay,
    /// No output this tick; skip successors for this frame, stream lives on.
    NoFrame,
    /// Abandon the current frame entirely; successors are not invoked.
    DropFrame,
    /// The element's data source is exhausted; gracefully destroy the stream.
    Stop,
    /// Fatal for this stream; destroy it and surface a diagnostic.
    Error,
    /// Loop-control completion signal, caller-defined handling.
    LoopEnd,
}

/// The resolved, element-level view of a `PipelineElementDefinition`
/// used to instantiate a local element or register a remote one.
#[derive(Debug, Clone, Default)]
pub struct ElementConfig {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Element-level default parameters.
    pub parameters: HashMap<String, Value>,
}

impl ElementConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ElementConfig {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: HashMap::new(),
        }
    }
}

/// Per-element, per-stream parameter lookup: element config, falling
/// back to the pipeline's own defaults, falling back to a caller-supplied
/// default; stream-level overrides supersede everything.
pub struct ParameterResolver<'a> {
    element: &'a ElementConfig,
    pipeline_defaults: &'a HashMap<String, Value>,
    stream_overrides: &'a HashMap<String, Value>,
}

impl<'a> ParameterResolver<'a> {
    pub fn new(
        element: &'a ElementConfig,
        pipeline_defaults: &'a HashMap<String, Value>,
        stream_overrides: &'a HashMap<String, Value>,
    ) -> Self {
        ParameterResolver {
            element,
            pipeline_defaults,
            stream_overrides,
        }
    }

    /// Resolve `name`: stream override, then element default, then (if
    /// `use_pipeline`) the pipeline's own default, else `default` with
    /// `found = false`.
    pub fn get(&self, name: &str, default: Value, use_pipeline: bool) -> (Value, bool) {
        if let Some(value) = self.stream_overrides.get(name) {
            return (value.clone(), true);
        }
        if let Some(value) = self.element.parameters.get(name) {
            return (value.clone(), true);
        }
        if use_pipeline {
            if let Some(value) = self.pipeline_defaults.get(name) {
                return (value.clone(), true);
            }
        }
        (default, false)
    }
}

/// A named unit in a pipeline graph with declared inputs, outputs, and
/// parameters.
pub trait PipelineElement: Send {
    fn name(&self) -> &str;

    /// Called once before the first `process_frame` for a stream.
    fn start_stream(&mut self, stream_id: u64) -> (StreamEvent, Option<String>);

    /// Called once per frame. `inputs` carries this element's declared
    /// input names resolved from the incoming swag.
    fn process_frame(
        &mut self,
        stream_id: u64,
        inputs: &HashMap<String, Value>,
    ) -> (StreamEvent, HashMap<String, Value>);

    /// Called once when a stream is destroyed, regardless of how it ends.
    fn stop_stream(&mut self, stream_id: u64) -> (StreamEvent, Option<String>);
}

/// A remote element that has no discovered backing service yet: every
/// call succeeds trivially with no contributed output.
pub struct RemoteAbsentElement {
    name: String,
}

impl RemoteAbsentElement {
    pub fn new(name: impl Into<String>) -> Self {
        RemoteAbsentElement { name: name.into() }
    }
}

impl PipelineElement for RemoteAbsentElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }

    fn process_frame(
        &mut self,
        _stream_id: u64,
        _inputs: &HashMap<String, Value>,
    ) -> (StreamEvent, HashMap<String, Value>) {
        (StreamEvent::Okay, HashMap::new())
    }

    fn stop_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }
}

/// Copies every declared input straight to an identically named output.
/// Used by tests and as the simplest possible local element.
pub struct PassThroughElement {
    name: String,
    field: String,
}

impl PassThroughElement {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        PassThroughElement {
            name: name.into(),
            field: field.into(),
        }
    }
}

impl PipelineElement for PassThroughElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }

    fn process_frame(
        &mut self,
        _stream_id: u64,
        inputs: &HashMap<String, Value>,
    ) -> (StreamEvent, HashMap<String, Value>) {
        let mut outputs = HashMap::new();
        if let Some(value) = inputs.get(&self.field) {
            outputs.insert(self.field.clone(), value.clone());
        }
        (StreamEvent::Okay, outputs)
    }

    fn stop_stream(&mut self, _stream_id: u64) -> (StreamEvent, Option<String>) {
        (StreamEvent::Okay, None)
    }
}

/// Registry of factory functions keyed by module descriptor, used to
/// instantiate `deploy: local { module }` elements.
pub type LocalElementFactory = Box<dyn Fn(&ElementConfig) -> Box<dyn PipelineElement> + Send + Sync>;

#[derive(Default)]
pub struct LocalElementRegistry {
    factories: HashMap<String, LocalElementFactory>,
}

impl LocalElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: impl Into<String>, factory: LocalElementFactory) {
        self.factories.insert(module.into(), factory);
    }

    pub fn create(&self, module: &str, config: &ElementConfig) -> Option<Box<dyn PipelineElement>> {
        self.factories.get(module).map(|factory| factory(config))
    }

    pub fn contains(&self, module: &str) -> bool {
        self.factories.contains_key(module)
    }
}
