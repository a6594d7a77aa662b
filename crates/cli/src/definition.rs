//! JSON pipeline-definition loading.
//!
//! `aiko-core` deliberately keeps its `Value` and `PipelineDefinition`
//! types free of `serde` so the hot frame-processing path stays
//! allocation-free; schema parsing for the on-disk definition format is
//! this crate's job instead (declarative-definition schema validation is
//! explicitly out of scope for the execution engine).

use aiko_core::element::Value;
use aiko_core::error::{Error, Result};
use aiko_core::pipeline::{Deploy, PipelineDefinition, PipelineElementDefinition};
use aiko_core::service::{ServiceFilter, Tag};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Deserialize)]
struct DefinitionFile {
    version: String,
    name: String,
    #[serde(default)]
    runtime: String,
    graph: Vec<String>,
    #[serde(default)]
    parameters: HashMap<String, serde_json::Value>,
    elements: Vec<ElementFile>,
}

#[derive(Deserialize)]
struct ElementFile {
    name: String,
    #[serde(default)]
    input: Vec<String>,
    #[serde(default)]
    output: Vec<String>,
    #[serde(default)]
    parameters: HashMap<String, serde_json::Value>,
    deploy: DeployFile,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeployFile {
    Local {
        module: String,
    },
    Remote {
        module: String,
        #[serde(default)]
        service_filter: ServiceFilterFile,
    },
}

#[derive(Deserialize, Default)]
struct ServiceFilterFile {
    #[serde(default)]
    topic_path: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl ServiceFilterFile {
    fn into_filter(self) -> Result<ServiceFilter> {
        let tags = self
            .tags
            .iter()
            .map(|s| s.parse::<Tag>())
            .collect::<Result<Vec<_>>>()?;
        Ok(ServiceFilter {
            topic_path: self.topic_path,
            name: self.name,
            protocol: self.protocol,
            transport: self.transport,
            owner: self.owner,
            tags,
        })
    }
}

/// Read and parse a definition file from disk into the type `Pipeline`
/// construction expects.
pub fn load(path: &Path) -> Result<PipelineDefinition> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| Error::Configuration(format!("cannot read '{}': {err}", path.display())))?;
    let file: DefinitionFile = serde_json::from_str(&raw)
        .map_err(|err| Error::Configuration(format!("malformed definition file '{}': {err}", path.display())))?;

    let parameters = convert_parameters(file.parameters)?;
    let mut elements = Vec::with_capacity(file.elements.len());
    for element in file.elements {
        let deploy = match element.deploy {
            DeployFile::Local { module } => Deploy::Local { module },
            DeployFile::Remote { module, service_filter } => Deploy::Remote {
                module,
                service_filter: service_filter.into_filter()?,
            },
        };
        elements.push(PipelineElementDefinition {
            name: element.name,
            input: element.input,
            output: element.output,
            parameters: convert_parameters(element.parameters)?,
            deploy,
        });
    }

    Ok(PipelineDefinition {
        version: file.version,
        name: file.name,
        runtime: file.runtime,
        graph: file.graph,
        parameters,
        elements,
    })
}

fn convert_parameters(raw: HashMap<String, serde_json::Value>) -> Result<HashMap<String, Value>> {
    raw.into_iter()
        .map(|(key, value)| value_from_json(&value).map(|v| (key, v)))
        .collect()
}

/// Convert one JSON value into swag's `Value`. Objects have no
/// representation in `Value` and are rejected.
pub fn value_from_json(json: &serde_json::Value) -> Result<Value> {
    match json {
        serde_json::Value::Null => Err(Error::Configuration("null parameter values are not supported".into())),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(Error::Configuration(format!("number out of range: {n}")))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_json::Value::Array(items) => {
            let values = items.iter().map(value_from_json).collect::<Result<Vec<_>>>()?;
            Ok(Value::Sequence(values))
        }
        serde_json::Value::Object(_) => {
            Err(Error::Configuration("nested objects are not supported as parameter values".into()))
        }
    }
}

/// Convert a swag `Value` back to JSON, for printing `process_frame`
/// results. `Bytes` has no natural JSON form; it is rendered as an array
/// of its raw byte values.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => serde_json::Value::from(bytes.iter().map(|b| *b as u64).collect::<Vec<_>>()),
        Value::Sequence(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
    }
}

/// Parse the `--frame-data` flag (a JSON object) into an initial swag.
pub fn swag_from_json(raw: &str) -> Result<HashMap<String, Value>> {
    let parsed: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| Error::Configuration(format!("malformed --frame-data: {err}")))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| Error::Configuration("--frame-data must be a JSON object".into()))?;
    convert_parameters(object.clone().into_iter().collect())
}
