//! Script execution for flow script steps
//!
//! The flow engine only sees the [`ScriptExecutor`] trait: variables go in as
//! a snapshot, a mapping comes back. The bundled implementation runs
//! JavaScript with boa.

use async_trait::async_trait;
use boa_engine::{Context as JsContext, Source};
use std::collections::HashMap;
use std::time::Duration;

use crate::app::ScriptingConfig;
use crate::chef::actions::json_to_string;
use crate::error::ScriptError;

/// Capability to run a script against a variable snapshot
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run `script` once. Returns the variables the script wants bound.
    async fn execute(
        &self,
        script: &str,
        variables: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ScriptError>;
}

/// JavaScript executor
///
/// Scripts see the variables as the `vars` object and bind new values by
/// assigning to it: `vars.token = vars.raw.split('.')[1];`
pub struct JsScriptExecutor {
    /// Script timeout in milliseconds
    timeout_ms: u64,

    /// Loop iteration ceiling
    loop_iteration_limit: u64,
}

impl JsScriptExecutor {
    pub fn new(config: &ScriptingConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            loop_iteration_limit: config.loop_iteration_limit,
        }
    }
}

// Console output is buffered and replayed into tracing afterwards
const PRELUDE: &str = r#"
    var __gleip_log = [];
    var console = {
        log: function() { __gleip_log.push(Array.prototype.slice.call(arguments).join(' ')); }
    };
"#;

#[async_trait]
impl ScriptExecutor for JsScriptExecutor {
    async fn execute(
        &self,
        script: &str,
        variables: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ScriptError> {
        let vars_json =
            serde_json::to_string(variables).map_err(|e| ScriptError::ExecutionError(e.to_string()))?;
        let script = script.to_string();
        let loop_limit = self.loop_iteration_limit;

        // boa contexts are not Send; the whole run lives on a blocking thread
        let task = tokio::task::spawn_blocking(move || run_script(&script, &vars_json, loop_limit));

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ScriptError::ExecutionError(format!("script task failed: {}", e))),
            Err(_) => Err(ScriptError::Timeout(self.timeout_ms)),
        }
    }
}

fn run_script(script: &str, vars_json: &str, loop_limit: u64) -> Result<HashMap<String, String>, ScriptError> {
    let mut context = JsContext::default();
    context.runtime_limits_mut().set_loop_iteration_limit(loop_limit);

    let setup = format!("{}\nvar vars = {};", PRELUDE, vars_json);
    context
        .eval(Source::from_bytes(&setup))
        .map_err(|e| ScriptError::ExecutionError(format!("failed to set up variables: {}", e)))?;

    let outcome = context.eval(Source::from_bytes(script));

    if let Ok(logged) = eval_string(&mut context, "JSON.stringify(__gleip_log)") {
        if let Ok(lines) = serde_json::from_str::<Vec<String>>(&logged) {
            for line in lines {
                tracing::debug!(target: "gleip::script", "{}", line);
            }
        }
    }

    outcome.map_err(|e| ScriptError::ExecutionError(e.to_string()))?;

    let output = eval_string(&mut context, "JSON.stringify(vars)")?;
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&output)
        .map_err(|_| ScriptError::InvalidOutput("`vars` must remain an object".into()))?;

    Ok(object
        .iter()
        .map(|(name, value)| (name.clone(), json_to_string(value)))
        .collect())
}

fn eval_string(context: &mut JsContext, code: &str) -> Result<String, ScriptError> {
    let value = context
        .eval(Source::from_bytes(code))
        .map_err(|e| ScriptError::ExecutionError(e.to_string()))?;
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .map_err(|e| ScriptError::ExecutionError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(loop_limit: u64) -> JsScriptExecutor {
        JsScriptExecutor::new(&ScriptingConfig {
            enabled: true,
            timeout_ms: 5000,
            loop_iteration_limit: loop_limit,
        })
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_script_reads_and_writes_vars() {
        let script = r#"
            console.log("user is", vars.user);
            vars.greeting = "hi " + vars.user;
            vars.count = 3;
        "#;
        let out = executor(10_000)
            .execute(script, &vars(&[("user", "ada")]))
            .await
            .unwrap();

        assert_eq!(out.get("greeting").map(String::as_str), Some("hi ada"));
        assert_eq!(out.get("count").map(String::as_str), Some("3"));
        assert_eq!(out.get("user").map(String::as_str), Some("ada"));
    }

    #[tokio::test]
    async fn test_thrown_error_fails() {
        let err = executor(10_000)
            .execute("throw new Error('boom');", &HashMap::new())
            .await
            .unwrap_err();
        match err {
            ScriptError::ExecutionError(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_runaway_loop_is_bounded() {
        let err = executor(1_000)
            .execute("while (true) {}", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::ExecutionError(_) | ScriptError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_replacing_vars_is_invalid_output() {
        let err = executor(10_000)
            .execute("vars = 5;", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidOutput(_)));
    }
}
