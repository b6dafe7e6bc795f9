//! Dialogue engine for lead qualification over WhatsApp/SMS.
//!
//! # Turn flow
//!
//! 1. **Pipeline** (`pipeline`) - dedup, per-thread serialization, state load
//! 2. **Short circuits** - response cache, terminated conversations
//! 3. **Extraction** (`conversation`, `confirmation`) - local shortcuts first, model last
//! 4. **Orchestration** (`runtime`) - Decide/Invoke loop over the closed
//!    capability set in `tools`
//! 5. **Termination** (`terminator`) - natural-end detection before and after
//!    the loop
//!
//! # Safety Principle
//!
//! The model proposes; it never decides eligibility. Calendar access,
//! booking and tagging are gated by deterministic checks in `calendar` and
//! `tagging`.

pub mod calendar;
pub mod confirmation;
pub mod conversation;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod runtime;
pub mod tagging;
pub mod terminator;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use llm::{LanguageModel, ModelTurn};
pub use pipeline::{PipelineSettings, TurnPipeline, TurnResult, TurnStatus};
pub use runtime::{Orchestrator, OrchestratorSettings};
