//! Per-run execution state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::fuzzer::FuzzResult;
use crate::http::HttpTransaction;

/// Named string bindings for one flow run. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableContext {
    variables: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a variable value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Set a variable value
    pub fn set(&mut self, name: &str, value: &str) {
        self.variables.insert(name.to_string(), value.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Remove a variable
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.variables.remove(name)
    }

    /// Bind every entry of `values`, overwriting existing names
    pub fn merge(&mut self, values: HashMap<String, String>) {
        self.variables.extend(values);
    }

    /// Copy handed to collaborators that must not write back directly
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.variables.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl From<HashMap<String, String>> for VariableContext {
    fn from(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }
}

/// Flow run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Step state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_index: usize,
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,

    /// Short human-readable summary
    pub output: String,

    pub error: Option<String>,

    /// Requests the step sent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<HttpTransaction>,

    /// Fuzz results, ordered by payload index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fuzz_results: Vec<FuzzResult>,

    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn new(step_index: usize, step_id: &str, step_name: &str) -> Self {
        Self {
            step_index,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Pending,
            output: String::new(),
            error: None,
            transactions: Vec::new(),
            fuzz_results: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// State of one flow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub flow_id: String,
    pub run_id: String,
    pub variables: VariableContext,
    pub status: RunStatus,

    /// One entry per finished step, in step order
    pub results: Vec<ExecutionResult>,

    /// First fatal error
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(flow_id: &str, variables: VariableContext) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            variables,
            status: RunStatus::Pending,
            results: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to a terminal state
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}
