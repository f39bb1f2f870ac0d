//! Built-in agent tools.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use kiln_core::job::JobStatus;
use kiln_core::service::ServiceConfig;
use kiln_core::types::JobId;
use kiln_jobs::JobFilter;

use crate::engine::JobExecutor;
use crate::mcp::{Tool, ToolDefinition, ToolError};

/// Default page size for `list_jobs` when the agent sends no limit.
const DEFAULT_LIST_LIMIT: usize = 20;

/// Submits a job for one configured service.
pub struct ServiceTool {
    service: ServiceConfig,
}

impl ServiceTool {
    pub fn new(service: ServiceConfig) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for ServiceTool {
    fn definition(&self) -> ToolDefinition {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.service.parameters {
            let mut schema = json!({
                "type": param.kind.as_str(),
                "description": param.description,
            });
            if let Some(default) = &param.default {
                schema["default"] = default.clone();
            }
            properties.insert(param.name.clone(), schema);
            if param.required && param.default.is_none() {
                required.push(param.name.clone());
            }
        }

        let description = if self.service.description.is_empty() {
            format!("Run the '{}' workflow as an asynchronous job", self.service.name)
        } else {
            self.service.description.clone()
        };

        ToolDefinition {
            name: self.service.name.clone(),
            description,
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }),
        }
    }

    async fn call(
        &self,
        executor: &JobExecutor,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let job = executor.submit(&self.service.name, arguments).await?;
        Ok(json!({
            "job_id": job.job_id,
            "service": job.service,
            "status": job.status,
        }))
    }
}

pub struct GetJobTool;

#[async_trait]
impl Tool for GetJobTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_job".into(),
            description: "Get a job's status, progress, and result or error once finished".into(),
            input_schema: job_id_schema(),
        }
    }

    async fn call(
        &self,
        executor: &JobExecutor,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let job_id = job_id_argument(&arguments)?;
        let job = executor
            .manager()
            .get_job(&job_id)
            .await
            .ok_or_else(|| ToolError(format!("Job {job_id} not found")))?;
        serde_json::to_value(job.view()).map_err(|e| ToolError(e.to_string()))
    }
}

pub struct ListJobsTool;

#[async_trait]
impl Tool for ListJobsTool {
    fn definition(&self) -> ToolDefinition {
        let statuses: Vec<&str> = JobStatus::ALL.iter().map(|s| s.as_str()).collect();
        ToolDefinition {
            name: "list_jobs".into(),
            description: "List jobs, newest first".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "service": { "type": "string" },
                    "status": { "type": "string", "enum": statuses },
                    "limit": { "type": "integer", "minimum": 1 },
                    "offset": { "type": "integer", "minimum": 0 },
                },
            }),
        }
    }

    async fn call(
        &self,
        executor: &JobExecutor,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut filter: JobFilter = serde_json::from_value(Value::Object(arguments))
            .map_err(|e| ToolError(format!("Invalid arguments: {e}")))?;
        filter.limit = Some(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT));

        let jobs: Vec<_> = executor
            .manager()
            .list_jobs(&filter)
            .await
            .iter()
            .map(|job| job.summary())
            .collect();
        Ok(json!({ "jobs": jobs }))
    }
}

pub struct CancelJobTool;

#[async_trait]
impl Tool for CancelJobTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "cancel_job".into(),
            description: "Cancel a pending or running job".into(),
            input_schema: job_id_schema(),
        }
    }

    async fn call(
        &self,
        executor: &JobExecutor,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let job_id = job_id_argument(&arguments)?;
        let status = executor
            .cancel(&job_id)
            .await
            .ok_or_else(|| ToolError(format!("Job {job_id} not found")))?;
        Ok(json!({ "job_id": job_id, "status": status }))
    }
}

fn job_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "job_id": { "type": "string", "format": "uuid" } },
        "required": ["job_id"],
    })
}

fn job_id_argument(arguments: &Map<String, Value>) -> Result<JobId, ToolError> {
    let raw = arguments
        .get("job_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError("Missing string argument 'job_id'".into()))?;
    raw.parse()
        .map_err(|_| ToolError(format!("'{raw}' is not a valid job id")))
}
