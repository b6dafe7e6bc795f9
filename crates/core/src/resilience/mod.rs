//! Timeout, retry and circuit breaking for calls leaving the process.

pub mod breaker;
pub mod guard;
pub mod retry;

use std::fmt;

use serde::Serialize;

use crate::clock::SharedClock;

pub use breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitOpen,
    CircuitState,
};
pub use guard::{ExternalCallError, Resilience, TransientFailure};
pub use retry::RetryPolicy;

/// External dependencies that each get their own breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Checkpoint,
    Crm,
    LanguageModel,
}

impl Dependency {
    pub const ALL: [Dependency; 3] = [Self::Checkpoint, Self::Crm, Self::LanguageModel];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Crm => "crm",
            Self::LanguageModel => "language_model",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: Dependency,
    pub state: CircuitState,
    pub metrics: CircuitBreakerMetrics,
}

pub struct BreakerRegistry {
    checkpoint: CircuitBreaker,
    crm: CircuitBreaker,
    language_model: CircuitBreaker,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            checkpoint: CircuitBreaker::new(Dependency::Checkpoint, config.clone(), clock.clone()),
            crm: CircuitBreaker::new(Dependency::Crm, config.clone(), clock.clone()),
            language_model: CircuitBreaker::new(Dependency::LanguageModel, config, clock),
        }
    }

    pub fn get(&self, dependency: Dependency) -> &CircuitBreaker {
        match dependency {
            Dependency::Checkpoint => &self.checkpoint,
            Dependency::Crm => &self.crm,
            Dependency::LanguageModel => &self.language_model,
        }
    }

    pub fn state(&self, dependency: Dependency) -> CircuitState {
        self.get(dependency).state()
    }

    pub fn any_open(&self) -> bool {
        Dependency::ALL.iter().any(|dependency| self.get(*dependency).is_open())
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        Dependency::ALL
            .iter()
            .map(|dependency| {
                let breaker = self.get(*dependency);
                BreakerSnapshot {
                    dependency: *dependency,
                    state: breaker.state(),
                    metrics: breaker.metrics(),
                }
            })
            .collect()
    }
}
