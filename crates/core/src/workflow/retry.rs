use super::handler::{StepHandler, StepInvocation};
use crate::types::Outputs;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Retry policy for handler failures.
///
/// Retries happen inside a single RUNNING attempt; the step never leaves
/// RUNNING between tries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            backoff_secs,
        }
    }

    /// Check if we should retry after the given (1-based) try
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Exponential backoff before the try following `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_secs(self.backoff_secs.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

pub struct RetryingHandler {
    inner: Arc<dyn StepHandler>,
    policy: RetryPolicy,
}

impl RetryingHandler {
    pub fn new(inner: Arc<dyn StepHandler>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait::async_trait]
impl StepHandler for RetryingHandler {
    async fn execute(&self, invocation: StepInvocation) -> anyhow::Result<Outputs> {
        let mut attempt = 1;
        loop {
            match self.inner.execute(invocation.clone()).await {
                Ok(outputs) => return Ok(outputs),
                Err(e) if self.policy.should_retry(attempt) => {
                    let backoff = self.policy.backoff(attempt);
                    tracing::info!(
                        step = %invocation.step.name,
                        error = %e,
                        "retrying step after {:?} (try {})",
                        backoff,
                        attempt + 1
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("giving up after {attempt} tries")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::types::{RunId, StepDefinition};
    use crate::workflow::handler::HandlerRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn invocation() -> StepInvocation {
        StepInvocation {
            run_id: RunId::new(),
            step: Arc::new(StepDefinition::new("flaky").kind("flaky")),
            input: serde_json::Value::Null,
            context: ExecutionContext::default(),
            attempt: 1,
        }
    }

    fn flaky_registry(failures: u32, calls: Arc<AtomicU32>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", move |_inv| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    anyhow::bail!("transient failure {n}");
                }
                Ok(Outputs::new())
            }
        });
        registry
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::new(4, 2);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = flaky_registry(2, calls.clone()).with_retry(RetryPolicy::new(3, 1));

        let result = registry.get("flaky").unwrap().execute(invocation()).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = flaky_registry(5, calls.clone()).with_retry(RetryPolicy::new(2, 1));

        let err = registry
            .get("flaky")
            .unwrap()
            .execute(invocation())
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(format!("{err:#}").contains("giving up after 2 tries"));
    }

    #[tokio::test]
    async fn test_single_attempt_policy_is_not_applied() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = flaky_registry(1, calls.clone()).with_retry(RetryPolicy::default());

        assert!(registry.get("flaky").unwrap().execute(invocation()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
