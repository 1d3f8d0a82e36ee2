use super::dag::WorkflowDag;
use super::retry::{RetryPolicy, RetryingHandler};
use crate::context::ExecutionContext;
use crate::error::StructuralError;
use crate::runtime::{ExecOptions, Runtime};
use crate::types::{Outputs, RunId, StepDefinition};
use anyhow::{anyhow, Context as _};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Everything a handler receives for one execution attempt
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub run_id: RunId,
    pub step: Arc<StepDefinition>,
    /// The step's params with every `${...}` reference resolved
    pub input: Value,
    pub context: ExecutionContext,
    /// 1-based, increments on each `loop_until` iteration
    pub attempt: u32,
}

/// A unit of work behind a step kind
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, invocation: StepInvocation) -> anyhow::Result<Outputs>;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Outputs>> + Send,
{
    async fn execute(&self, invocation: StepInvocation) -> anyhow::Result<Outputs> {
        (self.0)(invocation).await
    }
}

/// Returns its resolved params as outputs
pub struct EchoHandler;

#[async_trait::async_trait]
impl StepHandler for EchoHandler {
    async fn execute(&self, invocation: StepInvocation) -> anyhow::Result<Outputs> {
        match invocation.input {
            Value::Null => Ok(Outputs::new()),
            Value::Object(map) => Ok(map),
            other => {
                let mut outputs = Outputs::new();
                outputs.insert("value".to_string(), other);
                Ok(outputs)
            }
        }
    }
}

/// Runs `params.command` through a runtime backend.
///
/// Recognised params: `command` (required), `cwd`, `env` (object),
/// `allow_failure` (keep a non-zero exit as success) and
/// `collect_artifacts`.
pub struct ShellHandler {
    runtime: Arc<dyn Runtime>,
    default_timeout: Duration,
}

impl ShellHandler {
    pub fn new(runtime: Arc<dyn Runtime>, default_timeout: Duration) -> Self {
        Self {
            runtime,
            default_timeout,
        }
    }
}

#[async_trait::async_trait]
impl StepHandler for ShellHandler {
    async fn execute(&self, invocation: StepInvocation) -> anyhow::Result<Outputs> {
        let params = &invocation.input;
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("shell step requires a string 'command' param"))?;

        let env = params
            .get("env")
            .and_then(Value::as_object)
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| {
                        let value = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let timeout = invocation
            .step
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);

        let options = ExecOptions {
            cwd: params.get("cwd").and_then(Value::as_str).map(Into::into),
            env,
            timeout,
        };

        self.runtime
            .setup()
            .await
            .with_context(|| format!("failed to prepare {} runtime", self.runtime.name()))?;

        let result = self.runtime.execute(command, options).await;
        tracing::debug!(
            step = %invocation.step.name,
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "shell command finished"
        );

        if let Some(error) = &result.error {
            return Err(anyhow!("{error}"));
        }

        let allow_failure = params
            .get("allow_failure")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if result.exit_code != 0 && !allow_failure {
            return Err(anyhow!(
                "command exited with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
        }

        let mut outputs = Outputs::new();
        outputs.insert("exit_code".to_string(), Value::from(result.exit_code));
        outputs.insert("stdout".to_string(), Value::String(result.stdout));
        outputs.insert("stderr".to_string(), Value::String(result.stderr));
        outputs.insert(
            "duration_ms".to_string(),
            Value::from(result.duration.as_millis() as u64),
        );

        if params
            .get("collect_artifacts")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let artifacts = self.runtime.collect_artifacts().await?;
            outputs.insert("artifacts".to_string(), Value::Object(artifacts));
        }

        Ok(outputs)
    }
}

/// Maps step kinds to handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    retry: Option<RetryPolicy>,
}

impl HandlerRegistry {
    /// Empty registry with the `echo` kind available
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register("echo", EchoHandler);
        registry
    }

    /// Registry with `echo` plus a `shell` kind backed by the given runtime
    pub fn with_runtime(runtime: Arc<dyn Runtime>, default_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register("shell", ShellHandler::new(runtime, default_timeout));
        registry
    }

    /// Wrap every resolved handler in a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = (policy.max_attempts > 1).then_some(policy);
        self
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: impl StepHandler + 'static) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, f: F)
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outputs>> + Send + 'static,
    {
        self.register(kind, FnHandler(f));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepHandler>> {
        let handler = self.handlers.get(kind)?.clone();
        Some(match &self.retry {
            Some(policy) => Arc::new(RetryingHandler::new(handler, policy.clone())),
            None => handler,
        })
    }

    /// Bind a handler to every step of a DAG before anything runs
    pub fn resolve(
        &self,
        dag: &WorkflowDag,
    ) -> Result<HashMap<String, Arc<dyn StepHandler>>, StructuralError> {
        dag.steps()
            .map(|step| {
                self.get(&step.kind)
                    .map(|handler| (step.name.clone(), handler))
                    .ok_or_else(|| StructuralError::UnknownKind {
                        step: step.name.clone(),
                        kind: step.kind.clone(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(step: StepDefinition, input: Value) -> StepInvocation {
        StepInvocation {
            run_id: RunId::new(),
            step: Arc::new(step),
            input,
            context: ExecutionContext::default(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let outputs = EchoHandler
            .execute(invocation(StepDefinition::new("e"), json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(outputs.get("a"), Some(&json!(1)));

        let outputs = EchoHandler
            .execute(invocation(StepDefinition::new("e"), json!("text")))
            .await
            .unwrap();
        assert_eq!(outputs.get("value"), Some(&json!("text")));
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("double", |inv: StepInvocation| async move {
            let n = inv.input.get("n").and_then(Value::as_i64).unwrap_or(0);
            let mut out = Outputs::new();
            out.insert("n".to_string(), json!(n * 2));
            Ok(out)
        });

        let handler = registry.get("double").unwrap();
        let outputs = handler
            .execute(invocation(StepDefinition::new("d"), json!({"n": 21})))
            .await
            .unwrap();
        assert_eq!(outputs.get("n"), Some(&json!(42)));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("triple").is_none());
    }

    #[test]
    fn test_resolve_rejects_unknown_kind() {
        let registry = HandlerRegistry::new();
        let dag = WorkflowDag::build(vec![
            StepDefinition::new("ok"),
            StepDefinition::new("llm").kind("agent"),
        ])
        .unwrap();

        let err = registry.resolve(&dag).err().unwrap();
        assert_eq!(
            err,
            StructuralError::UnknownKind {
                step: "llm".to_string(),
                kind: "agent".to_string(),
            }
        );
    }
}
