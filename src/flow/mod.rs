//! Flows: ordered request/transform/script/fuzz steps sharing a variable
//! context, and the engine that runs them.

mod context;
mod engine;
mod executors;
mod extract;
mod model;
mod store;
mod template;

pub use context::{ExecutionContext, ExecutionResult, RunStatus, StepStatus, VariableContext};
pub use engine::{FlowEngine, RunHandle};
pub use executors::{StepEnv, StepExecutor, StepOutput, StepServices};
pub use extract::{extract, ExtractSource, ExtractionRule};
pub use model::{ChefStep, FuzzStep, GleipFlow, ReplayStep, ScriptStep, Step};
pub use store::{load_file, FlowStore, FlowSummary};
pub use template::{substitute, RequestTemplate};
