use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One credential record, merged into a user's context when acquired.
pub type Credential = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

/// Milliseconds, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreProcessor {
    /// Literal values merged into the context before rendering.
    pub inject: Map<String, Value>,
    /// `source -> target`: copies `context[source]` into `context[target]`,
    /// in declaration order, so later entries can read earlier targets.
    pub alias: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessor {
    /// `context key -> response body path`.
    pub extract: IndexMap<String, String>,
    pub alias: IndexMap<String, String>,
    /// `response body path -> expected value`.
    pub assert: IndexMap<String, String>,
    pub delay: Option<DelayRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Processor {
    pub pre: Option<PreProcessor>,
    pub post: Option<PostProcessor>,
}

/// One templated HTTP action of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub processor: Option<Processor>,
}

impl ActionNode {
    pub fn pre(&self) -> Option<&PreProcessor> {
        self.processor.as_ref().and_then(|p| p.pre.as_ref())
    }

    pub fn post(&self) -> Option<&PostProcessor> {
        self.processor.as_ref().and_then(|p| p.post.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub sequence: Vec<ActionNode>,
}

/// The shard of a run handed to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAssignment {
    pub run_id: String,
    pub worker_id: usize,
    pub ccu_share: usize,
    /// Seconds.
    pub ramp_up_time: u64,
    /// Seconds.
    pub duration: u64,
    pub nodes: Vec<ActionNode>,
    pub input: Map<String, Value>,
    pub credentials_share: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub run_id: String,
    pub endpoint_id: String,
    pub status_code: u16,
    /// Milliseconds spent in the HTTP call itself.
    pub response_time: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub message: String,
    pub worker_id: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

/// Worker to coordinator protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum WorkerMessage {
    Log(LogRecord),
    Info(Notice),
    Error(Notice),
    Done(WorkerSummary),
}

impl WorkerMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info(Notice {
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(Notice {
            message: message.into(),
        })
    }
}
