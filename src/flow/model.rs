//! Flow definitions
//!
//! A flow is a static, serializable description of ordered steps. Running it
//! produces an [`ExecutionContext`](super::ExecutionContext); the definition
//! itself carries no execution state apart from cached chef previews.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::extract::ExtractionRule;
use super::template::RequestTemplate;
use crate::chef::{self, ChefAction};
use crate::fuzzer::{PayloadRange, PayloadSource};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A named, ordered sequence of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GleipFlow {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Variables bound before the first step runs
    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl GleipFlow {
    pub fn new(name: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            description: None,
            variables: HashMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }
}

/// One unit of work in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Replay(ReplayStep),
    Chef(ChefStep),
    Script(ScriptStep),
    Fuzz(FuzzStep),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Replay(s) => &s.id,
            Step::Chef(s) => &s.id,
            Step::Script(s) => &s.id,
            Step::Fuzz(s) => &s.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Step::Replay(s) => &s.name,
            Step::Chef(s) => &s.name,
            Step::Script(s) => &s.name,
            Step::Fuzz(s) => &s.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Replay(_) => "replay",
            Step::Chef(_) => "chef",
            Step::Script(_) => "script",
            Step::Fuzz(_) => "fuzz",
        }
    }
}

/// Send a stored request and bind values from its response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStep {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    pub request: RequestTemplate,

    #[serde(default)]
    pub extract: Vec<ExtractionRule>,

    /// Overrides `flows.follow_redirects`
    #[serde(default)]
    pub follow_redirects: Option<bool>,
}

impl ReplayStep {
    pub fn new(name: &str, request: RequestTemplate) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            request,
            extract: Vec::new(),
            follow_redirects: None,
        }
    }

    pub fn with_extraction(mut self, rule: ExtractionRule) -> Self {
        self.extract.push(rule);
        self
    }
}

/// Transform one variable into another through a chef pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChefStep {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    pub input_variable: String,

    #[serde(default)]
    pub actions: Vec<ChefAction>,

    pub output_variable: String,
}

impl ChefStep {
    pub fn new(name: &str, input_variable: &str, output_variable: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            input_variable: input_variable.to_string(),
            actions: Vec::new(),
            output_variable: output_variable.to_string(),
        }
    }

    pub fn with_action(mut self, action: ChefAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Recompute every action's cached preview for `input`
    pub fn refresh_previews(&mut self, input: &str) {
        chef::refresh_previews(&mut self.actions, input);
    }
}

/// Hand the variables to the script executor and merge what comes back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    pub script: String,
}

impl ScriptStep {
    pub fn new(name: &str, script: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            script: script.to_string(),
        }
    }
}

/// Send the template once per payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzStep {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    /// Template with `§name§` insertion points
    pub request: RequestTemplate,

    pub payloads: PayloadSource,

    #[serde(default)]
    pub payload_range: Option<PayloadRange>,

    /// Chef chain applied to every payload before insertion
    #[serde(default)]
    pub payload_processing: Vec<ChefAction>,

    /// Overrides `fuzzer.max_concurrent`
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Overrides `flows.follow_redirects`
    #[serde(default)]
    pub follow_redirects: Option<bool>,
}

impl FuzzStep {
    pub fn new(name: &str, request: RequestTemplate, payloads: PayloadSource) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            request,
            payloads,
            payload_range: None,
            payload_processing: Vec::new(),
            max_concurrent: None,
            follow_redirects: None,
        }
    }
}

impl From<ReplayStep> for Step {
    fn from(step: ReplayStep) -> Self {
        Step::Replay(step)
    }
}

impl From<ChefStep> for Step {
    fn from(step: ChefStep) -> Self {
        Step::Chef(step)
    }
}

impl From<ScriptStep> for Step {
    fn from(step: ScriptStep) -> Self {
        Step::Script(step)
    }
}

impl From<FuzzStep> for Step {
    fn from(step: FuzzStep) -> Self {
        Step::Fuzz(step)
    }
}
