//! Service descriptors and the registry built from them.
//!
//! A service exposes one workflow template under a stable name, with a
//! typed parameter list (where each caller value is written into the
//! graph) and an optional list of named outputs (where to read results
//! from once the engine finishes).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Accepted parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParameterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Number => "number",
            ParameterKind::Boolean => "boolean",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Integer => value.is_i64() || value.is_u64(),
            ParameterKind::Number => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
        }
    }
}

/// A caller-supplied input and the node input it is written into.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ParameterSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[validate(length(min = 1))]
    pub node_id: String,
    #[validate(length(min = 1))]
    pub input: String,
}

/// Kind of a declared output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Image,
    Video,
    Audio,
    Model,
    Text,
    Json,
}

impl OutputKind {
    /// Key under a node's `output` object where this kind is usually found.
    pub fn default_output_type(self) -> &'static str {
        match self {
            OutputKind::Image => "images",
            OutputKind::Video => "gifs",
            OutputKind::Audio => "audio",
            OutputKind::Model => "model",
            OutputKind::Text => "text",
            OutputKind::Json => "json",
        }
    }

    /// Kinds whose values are files served by the engine.
    pub fn is_file(self) -> bool {
        matches!(
            self,
            OutputKind::Image | OutputKind::Video | OutputKind::Audio | OutputKind::Model
        )
    }
}

/// Where in the engine result a declared output lives.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OutputSource {
    #[validate(length(min = 1))]
    pub node_id: String,
    /// Key in the node's output object. Defaults per [`OutputKind`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    /// Element of a multi-valued output. Defaults to the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// A named output assembled into the job result.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OutputSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[validate(nested)]
    pub source: OutputSource,
}

impl OutputSpec {
    pub fn output_type(&self) -> &str {
        self.source
            .output_type
            .as_deref()
            .unwrap_or_else(|| self.kind.default_output_type())
    }
}

/// A workflow exposed as an invocable service.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Workflow template id.
    #[validate(length(min = 1))]
    pub workflow: String,
    #[serde(default)]
    #[validate(nested)]
    pub parameters: Vec<ParameterSpec>,
    /// Declared outputs. Order matters: the last one names the end node.
    #[serde(default)]
    #[validate(nested)]
    pub outputs: Vec<OutputSpec>,
}

impl ServiceConfig {
    /// Validate caller parameters and fill in defaults.
    ///
    /// Returns the map of values to write into the workflow. Unknown
    /// names, missing required values, and type mismatches are rejected.
    pub fn resolve_parameters(
        &self,
        supplied: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CoreError> {
        if let Some(unknown) = supplied
            .keys()
            .find(|name| !self.parameters.iter().any(|p| &p.name == *name))
        {
            return Err(CoreError::Validation(format!(
                "Unknown parameter '{unknown}' for service '{}'",
                self.name
            )));
        }

        let mut resolved = Map::new();
        for spec in &self.parameters {
            let value = match supplied.get(&spec.name).filter(|v| !v.is_null()) {
                Some(value) => value.clone(),
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None if spec.required => {
                        return Err(CoreError::Validation(format!(
                            "Missing required parameter '{}'",
                            spec.name
                        )));
                    }
                    None => continue,
                },
            };

            if !spec.kind.accepts(&value) {
                return Err(CoreError::Validation(format!(
                    "Parameter '{}' must be of type {}",
                    spec.name,
                    spec.kind.as_str()
                )));
            }
            resolved.insert(spec.name.clone(), value);
        }

        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// On-disk shape of the service descriptor file.
#[derive(Debug, Deserialize, Validate)]
pub struct ServicesFile {
    #[validate(nested)]
    pub services: Vec<ServiceConfig>,
}

/// Names taken by the built-in job tools on the agent endpoint.
pub const RESERVED_SERVICE_NAMES: [&str; 3] = ["get_job", "list_jobs", "cancel_job"];

/// Every configured service, keyed by name in configuration order.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: IndexMap<String, ServiceConfig>,
}

impl ServiceRegistry {
    pub fn from_services(services: Vec<ServiceConfig>) -> Result<Self, CoreError> {
        let mut map = IndexMap::with_capacity(services.len());
        for service in services {
            service.validate().map_err(|e| {
                CoreError::Validation(format!("Invalid service '{}': {e}", service.name))
            })?;
            if RESERVED_SERVICE_NAMES.contains(&service.name.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Service name '{}' is reserved for a job tool",
                    service.name
                )));
            }
            if map.contains_key(&service.name) {
                return Err(CoreError::Conflict(format!(
                    "Duplicate service name '{}'",
                    service.name
                )));
            }
            map.insert(service.name.clone(), service);
        }
        Ok(Self { services: map })
    }

    /// Parse and validate a descriptor file's contents.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let file: ServicesFile = serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Invalid services file: {e}")))?;
        Self::from_services(file.services)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
