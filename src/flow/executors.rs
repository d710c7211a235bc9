//! Step executors, one per step kind

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::context::VariableContext;
use super::extract::extract;
use super::model::{ChefStep, FuzzStep, ReplayStep, ScriptStep, Step};
use crate::app::{AppEvent, Config, EventSink};
use crate::chef;
use crate::error::{GleipError, Result, ScriptError};
use crate::fuzzer::{self, FuzzEngine, FuzzJob, FuzzResult};
use crate::http::{HttpSender, HttpTransaction, SendOptions};
use crate::scripting::ScriptExecutor;

/// Collaborators shared by every step of every run
#[derive(Clone)]
pub struct StepServices {
    pub sender: HttpSender,
    pub fuzzer: FuzzEngine,

    /// `None` when scripting is disabled
    pub scripts: Option<Arc<dyn ScriptExecutor>>,

    /// Default redirect policy for replay and fuzz requests
    pub follow_redirects: bool,

    pub request_timeout: Duration,
}

impl StepServices {
    pub fn new(config: &Config, sender: HttpSender, scripts: Option<Arc<dyn ScriptExecutor>>) -> Self {
        Self {
            fuzzer: FuzzEngine::new(sender.clone(), &config.fuzzer),
            sender,
            scripts,
            follow_redirects: config.flows.follow_redirects,
            request_timeout: Duration::from_secs(config.flows.request_timeout_secs),
        }
    }

    fn send_options(&self, follow_redirects: Option<bool>) -> SendOptions {
        SendOptions::default()
            .follow_redirects(follow_redirects.unwrap_or(self.follow_redirects))
            .timeout(self.request_timeout)
    }
}

/// Where a step runs
pub struct StepEnv<'a> {
    pub flow_id: &'a str,
    pub run_id: &'a str,
    pub step_index: usize,
    pub cancel: &'a CancellationToken,
    pub events: &'a EventSink,
}

impl StepEnv<'_> {
    /// Run `work` unless the run is cancelled first
    async fn until_cancelled<T>(&self, work: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GleipError::Cancelled),
            result = work => result,
        }
    }
}

/// What a successful step hands back to the engine
#[derive(Debug, Default)]
pub struct StepOutput {
    /// Short human-readable summary
    pub summary: String,

    /// Bindings to merge into the run's variables
    pub variables: HashMap<String, String>,

    pub transactions: Vec<HttpTransaction>,
    pub fuzz_results: Vec<FuzzResult>,

    /// The step stopped early because the run was cancelled
    pub interrupted: bool,
}

/// Execute contract shared by every step kind.
///
/// Executors read the variables but never write them: bindings travel back
/// in [`StepOutput`] and the engine merges them only when the step succeeds.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        services: &StepServices,
        env: &StepEnv<'_>,
        variables: &VariableContext,
    ) -> Result<StepOutput>;
}

#[async_trait]
impl StepExecutor for Step {
    async fn execute(
        &self,
        services: &StepServices,
        env: &StepEnv<'_>,
        variables: &VariableContext,
    ) -> Result<StepOutput> {
        match self {
            Step::Replay(step) => step.execute(services, env, variables).await,
            Step::Chef(step) => step.execute(services, env, variables).await,
            Step::Script(step) => step.execute(services, env, variables).await,
            Step::Fuzz(step) => step.execute(services, env, variables).await,
        }
    }
}

#[async_trait]
impl StepExecutor for ReplayStep {
    async fn execute(
        &self,
        services: &StepServices,
        env: &StepEnv<'_>,
        variables: &VariableContext,
    ) -> Result<StepOutput> {
        let request = self.request.render(variables)?;
        let options = services.send_options(self.follow_redirects);

        tracing::debug!(
            run_id = env.run_id,
            step = env.step_index,
            method = %request.method,
            url = %request.url,
            "Replaying request"
        );
        let transaction = env.until_cancelled(services.sender.send(&request, &options)).await?;

        let mut bound = HashMap::new();
        for rule in &self.extract {
            let value = extract(rule, &transaction)?;
            tracing::debug!(variable = %rule.variable, "Extracted variable");
            bound.insert(rule.variable.clone(), value);
        }

        let summary = format!(
            "{} {} -> {} ({}ms)",
            request.method,
            request.url,
            transaction.status().map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            transaction.duration_ms.unwrap_or(0)
        );

        Ok(StepOutput {
            summary,
            variables: bound,
            transactions: vec![transaction],
            ..Default::default()
        })
    }
}

#[async_trait]
impl StepExecutor for ChefStep {
    async fn execute(
        &self,
        _services: &StepServices,
        _env: &StepEnv<'_>,
        variables: &VariableContext,
    ) -> Result<StepOutput> {
        let input = variables
            .get(&self.input_variable)
            .ok_or_else(|| GleipError::UnboundVariable(self.input_variable.clone()))?;

        let output = chef::execute(&self.actions, input)?;

        Ok(StepOutput {
            summary: format!("{} = {}", self.output_variable, chef::truncate_preview(&output)),
            variables: HashMap::from([(self.output_variable.clone(), output)]),
            ..Default::default()
        })
    }
}

#[async_trait]
impl StepExecutor for ScriptStep {
    async fn execute(
        &self,
        services: &StepServices,
        env: &StepEnv<'_>,
        variables: &VariableContext,
    ) -> Result<StepOutput> {
        let executor = services
            .scripts
            .as_ref()
            .ok_or_else(|| ScriptError::ExecutionError("scripting is disabled".into()))?;

        let snapshot = variables.snapshot();
        let returned = env
            .until_cancelled(async { executor.execute(&self.script, &snapshot).await.map_err(GleipError::from) })
            .await?;

        Ok(StepOutput {
            summary: format!("{} variables returned", returned.len()),
            variables: returned,
            ..Default::default()
        })
    }
}

#[async_trait]
impl StepExecutor for FuzzStep {
    async fn execute(
        &self,
        services: &StepServices,
        env: &StepEnv<'_>,
        variables: &VariableContext,
    ) -> Result<StepOutput> {
        let base = self.request.render(variables)?;
        if !fuzzer::has_markers(&base) {
            return Err(GleipError::InvalidStep(format!(
                "fuzz step '{}' has no §name§ insertion points",
                self.name
            )));
        }

        let payloads = fuzzer::select(self.payloads.load()?, self.payload_range);
        let mut jobs = Vec::with_capacity(payloads.len());
        for (index, raw) in payloads {
            let payload = fuzzer::process(&raw, &self.payload_processing).map_err(|e| {
                GleipError::InvalidStep(format!("payload {} could not be processed: {}", index, e))
            })?;
            jobs.push(FuzzJob {
                index,
                request: fuzzer::apply_payload(&base, &payload),
                payload,
            });
        }

        tracing::debug!(run_id = env.run_id, step = env.step_index, payloads = jobs.len(), "Dispatching fuzz jobs");
        let mut engine = services
            .fuzzer
            .clone()
            .with_follow_redirects(self.follow_redirects.unwrap_or(services.follow_redirects));
        if let Some(max_concurrent) = self.max_concurrent {
            engine = engine.with_max_concurrent(max_concurrent);
        }

        let outcome = engine
            .run(jobs, env.cancel, |results| {
                env.events.emit(AppEvent::FuzzUpdate {
                    flow_id: env.flow_id.to_string(),
                    step_id: self.id.clone(),
                    results,
                })
            })
            .await;

        Ok(StepOutput {
            summary: outcome.results.summary(),
            interrupted: outcome.cancelled,
            fuzz_results: outcome.results.into_results(),
            ..Default::default()
        })
    }
}
