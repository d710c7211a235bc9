//! Flow execution engine
//!
//! Runs the steps of one flow strictly in order. The run owns its
//! [`ExecutionContext`]; the active step only reads the variables, and its
//! bindings are merged back once it has succeeded.

use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::{ExecutionContext, ExecutionResult, RunStatus, StepStatus, VariableContext};
use super::executors::{StepEnv, StepExecutor, StepServices};
use super::model::GleipFlow;
use crate::app::{AppEvent, EventSink};
use crate::error::{GleipError, Result};

/// Flow interpreter
#[derive(Clone)]
pub struct FlowEngine {
    services: StepServices,
    events: EventSink,
}

/// Handle to a flow run started with [`FlowEngine::start`]
pub struct RunHandle {
    flow_id: String,
    cancel: CancellationToken,
    task: JoinHandle<ExecutionContext>,
}

impl RunHandle {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Ask the run to stop. The active step is interrupted and the run
    /// ends `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<ExecutionContext> {
        match self.task.await {
            Ok(context) => Ok(context),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(GleipError::Cancelled),
        }
    }
}

impl FlowEngine {
    pub fn new(services: StepServices, events: EventSink) -> Self {
        Self { services, events }
    }

    /// Run `flow` on a background task
    pub fn start(&self, flow: GleipFlow) -> RunHandle {
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let flow_id = flow.id.clone();
        let task = tokio::spawn(async move { engine.run(&flow, &token).await });

        RunHandle { flow_id, cancel, task }
    }

    /// Run `flow` to completion on the current task
    pub async fn run(&self, flow: &GleipFlow, cancel: &CancellationToken) -> ExecutionContext {
        let mut context = ExecutionContext::new(&flow.id, VariableContext::from(flow.variables.clone()));
        context.status = RunStatus::Running;

        tracing::info!(flow = %flow.name, run_id = %context.run_id, steps = flow.steps.len(), "Flow run started");
        self.events
            .emit(AppEvent::FlowStarted {
                flow_id: context.flow_id.clone(),
                run_id: context.run_id.clone(),
            })
            .await;

        let mut outcome: Option<(RunStatus, String)> = None;

        for (index, step) in flow.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome = Some((RunStatus::Cancelled, GleipError::Cancelled.to_string()));
                break;
            }

            let mut result = ExecutionResult::new(index, step.id(), step.name());
            result.status = StepStatus::Running;
            tracing::debug!(step = index, kind = step.kind(), name = step.name(), "Step started");

            let env = StepEnv {
                flow_id: &context.flow_id,
                run_id: &context.run_id,
                step_index: index,
                cancel,
                events: &self.events,
            };
            let start = Instant::now();
            let executed = step.execute(&self.services, &env, &context.variables).await;
            result.duration_ms = start.elapsed().as_millis() as u64;

            match executed {
                Ok(output) if output.interrupted => {
                    result.status = StepStatus::Failed;
                    result.output = output.summary;
                    result.error = Some(GleipError::Cancelled.in_step(index, step.name()).to_string());
                    result.transactions = output.transactions;
                    result.fuzz_results = output.fuzz_results;
                    outcome = Some((RunStatus::Cancelled, GleipError::Cancelled.to_string()));
                }
                Ok(output) => {
                    result.status = StepStatus::Completed;
                    result.output = output.summary;
                    result.transactions = output.transactions;
                    result.fuzz_results = output.fuzz_results;
                    context.variables.merge(output.variables);
                }
                Err(e) => {
                    let status = if e.is_cancelled() {
                        RunStatus::Cancelled
                    } else {
                        RunStatus::Failed
                    };
                    let e = e.in_step(index, step.name());
                    tracing::warn!(error = %e, "Step failed");
                    result.status = StepStatus::Failed;
                    result.error = Some(e.to_string());
                    outcome = Some((status, e.to_string()));
                }
            }

            tracing::info!(
                step = index,
                name = step.name(),
                status = ?result.status,
                duration_ms = result.duration_ms,
                "{}",
                result.output
            );

            context.results.push(result);
            self.events
                .emit(AppEvent::StepExecuted {
                    flow_id: context.flow_id.clone(),
                    run_id: context.run_id.clone(),
                    step_index: index,
                    results: context.results.clone(),
                })
                .await;

            if outcome.is_some() {
                break;
            }
        }

        match outcome {
            Some((status, error)) => context.finish(status, Some(error)),
            None => context.finish(RunStatus::Completed, None),
        }

        tracing::info!(
            flow = %flow.name,
            run_id = %context.run_id,
            status = %context.status,
            "Flow run finished"
        );
        self.events
            .emit(AppEvent::FlowFinished {
                flow_id: context.flow_id.clone(),
                run_id: context.run_id.clone(),
                status: context.status,
                error: context.error.clone(),
            })
            .await;

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Config;
    use crate::chef::ChefAction;
    use crate::flow::{
        ChefStep, ExtractSource, ExtractionRule, FuzzStep, ReplayStep, RequestTemplate, ScriptStep,
    };
    use crate::fuzzer::PayloadSource;
    use crate::http::{HttpResponse, HttpSender};
    use crate::scripting::JsScriptExecutor;
    use crate::test_support::spawn_origin;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn engine(config: &Config) -> (FlowEngine, mpsc::Receiver<AppEvent>) {
        let sender = HttpSender::new(config).unwrap();
        let scripts: Arc<dyn crate::scripting::ScriptExecutor> = Arc::new(JsScriptExecutor::new(&config.scripting));
        let (events, rx) = EventSink::channel(1024);
        (FlowEngine::new(StepServices::new(config, sender, Some(scripts)), events), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn echo_origin() -> String {
        spawn_origin(|req| {
            let mut response = HttpResponse::new(200);
            response.headers.append("X-Token", "c2VjcmV0");
            response.body = req.target.clone().into_bytes();
            response
        })
        .await
    }

    #[tokio::test]
    async fn test_variables_thread_through_steps() {
        let base = echo_origin().await;
        let flow = GleipFlow::new("chain")
            .with_variable("token", "abc123")
            .with_step(
                ReplayStep::new("login", RequestTemplate::new("GET", &format!("{}/auth?t={{{{token}}}}", base)))
                    .with_extraction(ExtractionRule::new("raw", ExtractSource::Header { name: "x-token".into() }))
                    .with_extraction(ExtractionRule::new("echo", ExtractSource::Body { pattern: ".+".into() })),
            )
            .with_step(ChefStep::new("decode", "raw", "secret").with_action(ChefAction::new("base64_decode")))
            .with_step(ScriptStep::new("shout", "vars.loud = vars.secret.toUpperCase();"));

        let (engine, mut rx) = engine(&Config::default());
        let context = engine.run(&flow, &CancellationToken::new()).await;

        assert_eq!(context.status, RunStatus::Completed);
        assert_eq!(context.variables.get("echo"), Some("/auth?t=abc123"));
        assert_eq!(context.variables.get("secret"), Some("secret"));
        assert_eq!(context.variables.get("loud"), Some("SECRET"));
        assert_eq!(context.results.len(), 3);
        assert_eq!(context.results[0].transactions.len(), 1);

        let events = drain(&mut rx);
        let kinds: Vec<&str> = events.iter().map(AppEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["flow_started", "step_executed", "step_executed", "step_executed", "flow_finished"]
        );
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::StepExecuted { step_index, .. } => Some(*step_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unbound_variable_fails_the_run() {
        let base = echo_origin().await;
        let flow = GleipFlow::new("unbound")
            .with_step(ReplayStep::new("r", RequestTemplate::new("GET", &format!("{}/{{{{token}}}}", base))))
            .with_step(ScriptStep::new("never", "vars.ran = 1;"));

        let (engine, _rx) = engine(&Config::default());
        let context = engine.run(&flow, &CancellationToken::new()).await;

        assert_eq!(context.status, RunStatus::Failed);
        assert_eq!(context.results.len(), 1);
        assert!(context.error.as_deref().unwrap_or("").contains("Unbound variable 'token'"));
        assert!(!context.variables.contains("ran"));
    }

    #[tokio::test]
    async fn test_failed_chef_step_leaves_variables_untouched() {
        let flow = GleipFlow::new("bad decode")
            .with_variable("input", "***")
            .with_variable("out", "before")
            .with_step(ChefStep::new("decode", "input", "out").with_action(ChefAction::new("base64_decode")));

        let (engine, mut rx) = engine(&Config::default());
        let context = engine.run(&flow, &CancellationToken::new()).await;

        assert_eq!(context.status, RunStatus::Failed);
        assert_eq!(context.variables.get("out"), Some("before"));
        assert_eq!(context.results[0].status, StepStatus::Failed);
        assert!(context.results[0].error.as_deref().unwrap_or("").contains("base64_decode"));

        let last = drain(&mut rx).pop();
        assert!(matches!(last, Some(AppEvent::FlowFinished { status: RunStatus::Failed, .. })));
    }

    #[tokio::test]
    async fn test_fuzz_step_collects_one_result_per_payload() {
        let base = spawn_origin(|req| {
            let status = if req.target.contains("admin") { 403 } else { 200 };
            HttpResponse::new(status)
        })
        .await;

        let payloads: Vec<String> = ["guest", "admin", "root", "ops", "dev"].iter().map(|s| s.to_string()).collect();
        let mut fuzz = FuzzStep::new(
            "users",
            RequestTemplate::new("GET", &format!("{}/users/§name§", base)),
            PayloadSource::List { payloads },
        );
        fuzz.max_concurrent = Some(2);
        let flow = GleipFlow::new("fuzz")
            .with_step(fuzz)
            .with_step(ScriptStep::new("after", "vars.done = 'yes';"));

        let (engine, mut rx) = engine(&Config::default());
        let context = engine.run(&flow, &CancellationToken::new()).await;

        assert_eq!(context.status, RunStatus::Completed);
        let results = &context.results[0].fuzz_results;
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(results[1].payload, "admin");
        assert_eq!(results[1].status, Some(403));

        let events = drain(&mut rx);
        let updates: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::FuzzUpdate { results, .. } => Some(results.len()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![1, 2, 3, 4, 5]);

        // every fuzz update precedes the fuzz step's StepExecuted
        let first_step = events
            .iter()
            .position(|e| matches!(e, AppEvent::StepExecuted { .. }))
            .unwrap();
        let last_update = events
            .iter()
            .rposition(|e| matches!(e, AppEvent::FuzzUpdate { .. }))
            .unwrap();
        assert!(last_update < first_step);
    }

    #[tokio::test]
    async fn test_step_events_stay_ordered_around_a_fuzz_step() {
        let base = spawn_origin(|req| {
            let mut response = HttpResponse::new(if req.target.ends_with("/7") { 404 } else { 200 });
            response.body = b"alice".to_vec();
            response
        })
        .await;

        let payloads: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let mut fuzz = FuzzStep::new(
            "ids",
            RequestTemplate::new("GET", &format!("{}/{{{{user}}}}/§id§", base)),
            PayloadSource::List { payloads },
        );
        fuzz.max_concurrent = Some(3);
        let flow = GleipFlow::new("replay fuzz script")
            .with_step(
                ReplayStep::new("whoami", RequestTemplate::new("GET", &format!("{}/me", base)))
                    .with_extraction(ExtractionRule::new("user", ExtractSource::Body { pattern: "\\w+".into() })),
            )
            .with_step(fuzz)
            .with_step(ScriptStep::new("after", "vars.seen = vars.user;"));

        let (engine, mut rx) = engine(&Config::default());
        let context = engine.run(&flow, &CancellationToken::new()).await;

        assert_eq!(context.status, RunStatus::Completed);
        assert_eq!(context.results[1].fuzz_results.len(), 8);
        assert_eq!(context.variables.get("seen"), Some("alice"));

        let events = drain(&mut rx);
        let executed: Vec<(usize, usize)> = events
            .iter()
            .enumerate()
            .filter_map(|(pos, e)| match e {
                AppEvent::StepExecuted { step_index, .. } => Some((pos, *step_index)),
                _ => None,
            })
            .collect();
        assert_eq!(executed.iter().map(|(_, i)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);

        let updates: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, AppEvent::FuzzUpdate { .. }))
            .map(|(pos, _)| pos)
            .collect();
        assert_eq!(updates.len(), 8);
        assert!(updates.iter().all(|pos| *pos > executed[0].0 && *pos < executed[1].0));
    }

    #[tokio::test]
    async fn test_cancel_mid_fuzz_ends_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let payloads: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let mut config = Config::default();
        config.fuzzer.cancel_grace_secs = 0;
        let flow = GleipFlow::new("slow")
            .with_step(FuzzStep::new(
                "hang",
                RequestTemplate::new("GET", &format!("http://{}/§n§", addr)),
                PayloadSource::List { payloads },
            ))
            .with_step(ScriptStep::new("never", "vars.ran = 1;"));

        let (engine, mut rx) = engine(&config);
        let handle = engine.start(flow);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();

        let context = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("run should stop after cancel")
            .unwrap();

        assert_eq!(context.status, RunStatus::Cancelled);
        assert_eq!(context.results.len(), 1);
        assert!(context.results[0].fuzz_results.len() <= 50);
        assert!(!context.variables.contains("ran"));

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(AppEvent::FlowFinished { status: RunStatus::Cancelled, .. })
        ));
        let finished_at = events.len() - 1;
        assert!(!events[..finished_at]
            .iter()
            .skip_while(|e| !matches!(e, AppEvent::StepExecuted { .. }))
            .any(|e| matches!(e, AppEvent::FuzzUpdate { .. })));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let flow = GleipFlow::new("noop").with_step(ScriptStep::new("s", "vars.x = 1;"));
        let (engine, _rx) = engine(&Config::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let context = engine.run(&flow, &cancel).await;
        assert_eq!(context.status, RunStatus::Cancelled);
        assert!(context.results.is_empty());
    }
}
