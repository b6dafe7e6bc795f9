use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::errors::ApplicationError;
use crate::ports::PortError;
use crate::resilience::breaker::CallPermit;
use crate::resilience::retry::RetryPolicy;
use crate::resilience::{BreakerRegistry, Dependency};

/// Failures worth another attempt.
pub trait TransientFailure {
    fn is_transient(&self) -> bool;
}

impl TransientFailure for PortError {
    fn is_transient(&self) -> bool {
        PortError::is_transient(self)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExternalCallError<E> {
    #[error("{dependency} {operation} timed out after {attempts} attempt(s)")]
    Timeout { dependency: Dependency, operation: String, attempts: u32 },
    #[error("{dependency} circuit is open")]
    CircuitOpen { dependency: Dependency, retry_after: chrono::Duration },
    #[error("{dependency} {operation} failed: {error}")]
    Failed { dependency: Dependency, operation: String, error: E, attempts: u32 },
}

impl<E> ExternalCallError<E> {
    pub fn dependency(&self) -> Dependency {
        match self {
            Self::Timeout { dependency, .. }
            | Self::CircuitOpen { dependency, .. }
            | Self::Failed { dependency, .. } => *dependency,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl<E: Display> From<ExternalCallError<E>> for ApplicationError {
    fn from(value: ExternalCallError<E>) -> Self {
        match value {
            ExternalCallError::Timeout { dependency, operation, .. } => {
                ApplicationError::Timeout { stage: format!("{dependency}.{operation}") }
            }
            ExternalCallError::CircuitOpen { dependency, retry_after } => {
                ApplicationError::CircuitOpen {
                    dependency: dependency.to_string(),
                    retry_after_secs: retry_after.num_seconds().max(1) as u64,
                }
            }
            ExternalCallError::Failed { dependency, error, .. } => ApplicationError::ExternalService {
                dependency: dependency.to_string(),
                message: error.to_string(),
            },
        }
    }
}

/// Wraps every outbound call: breaker admission, a per-attempt deadline and
/// bounded retries for transient failures. One call records one outcome on
/// the dependency's breaker, however many attempts it took.
#[derive(Clone)]
pub struct Resilience {
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl Resilience {
    pub fn new(breakers: Arc<BreakerRegistry>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self { breakers, retry, call_timeout }
    }

    /// Same breakers and deadline, single attempt. Used for non-idempotent
    /// calls such as booking and customer sends.
    pub fn without_retries(&self) -> Self {
        Self { breakers: self.breakers.clone(), retry: RetryPolicy::none(), call_timeout: self.call_timeout }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn call<T, E, F, Fut>(
        &self,
        dependency: Dependency,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T, ExternalCallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientFailure + Display,
    {
        let breaker = self.breakers.get(dependency);
        let permit = breaker.try_acquire().map_err(|open| {
            warn!(
                event_name = "core.resilience.short_circuit",
                correlation_id = "resilience",
                dependency = dependency.as_str(),
                operation,
                retry_after_secs = open.retry_after.num_seconds(),
                "call rejected by open circuit"
            );
            ExternalCallError::CircuitOpen { dependency, retry_after: open.retry_after }
        })?;
        // A half-open probe gets exactly one attempt.
        let max_retries = if permit == CallPermit::Probe { 0 } else { self.retry.max_retries };

        let mut attempt = 0;
        loop {
            let outcome = tokio::time::timeout(self.call_timeout, attempt_fn()).await;
            let retryable = match &outcome {
                Ok(Ok(_)) => false,
                Ok(Err(error)) => error.is_transient(),
                Err(_) => true,
            };

            if retryable && attempt < max_retries {
                let delay = self.retry.backoff(attempt);
                warn!(
                    event_name = "core.resilience.retry",
                    correlation_id = "resilience",
                    dependency = dependency.as_str(),
                    operation,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    timed_out = outcome.is_err(),
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let attempts = attempt + 1;
            return match outcome {
                Ok(Ok(value)) => {
                    breaker.record_success();
                    Ok(value)
                }
                Ok(Err(error)) => {
                    // A definitive rejection still proves the dependency answered.
                    if error.is_transient() {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }
                    Err(ExternalCallError::Failed {
                        dependency,
                        operation: operation.to_string(),
                        error,
                        attempts,
                    })
                }
                Err(_) => {
                    breaker.record_failure();
                    Err(ExternalCallError::Timeout {
                        dependency,
                        operation: operation.to_string(),
                        attempts,
                    })
                }
            };
        }
    }
}
