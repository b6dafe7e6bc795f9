//! Tool-calling orchestrator: Decide, Invoke, loop, bounded by an iteration
//! ceiling. Every path out of [`Orchestrator::run_turn`] sends exactly one
//! customer-visible message.

use std::mem;
use std::sync::Arc;

use leadflow_core::clock::SharedClock;
use leadflow_core::domain::conversation::{ConversationState, TerminationReason};
use leadflow_core::domain::message::ChatMessage;
use leadflow_core::ports::PortError;
use leadflow_core::reducers::{apply_delta, StateDelta};
use leadflow_core::resilience::{Dependency, ExternalCallError, Resilience};
use tracing::{info, warn};

use crate::calendar::describe_slot;
use crate::llm::{LanguageModel, ModelRequest, ModelTurn};
use crate::prompt::{system_prompt, PromptSettings};
use crate::terminator::{Terminator, APOLOGY_COPY, UNAVAILABLE_COPY};
use crate::tools::{capability_specs, Capability, CapabilityEffect, CapabilityExecutor, TurnContext};

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub max_iterations: u32,
    pub history_window: usize,
    pub extraction_cap: u32,
    pub prompt: PromptSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            history_window: 10,
            extraction_cap: 3,
            prompt: PromptSettings::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnEnd {
    Reply,
    Booked,
    Terminated(TerminationReason),
    IterationCeiling,
    ModelUnavailable,
    /// The turn deadline passed before or during a model decision.
    DeadlineExceeded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Everything the turn changed, to be folded into the checkpointed state.
    pub delta: StateDelta,
    pub reply: Option<String>,
    pub sent: bool,
    pub iterations: u32,
    pub ended_by: TurnEnd,
}

struct TurnProgress {
    working: ConversationState,
    delta: StateDelta,
    iterations: u32,
}

pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    executor: Arc<CapabilityExecutor>,
    resilience: Resilience,
    terminator: Arc<Terminator>,
    settings: OrchestratorSettings,
    clock: SharedClock,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        executor: Arc<CapabilityExecutor>,
        resilience: Resilience,
        terminator: Arc<Terminator>,
        settings: OrchestratorSettings,
        clock: SharedClock,
    ) -> Self {
        Self { model, executor, resilience, terminator, settings, clock }
    }

    pub fn executor(&self) -> &Arc<CapabilityExecutor> {
        &self.executor
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn run_turn(&self, state: &ConversationState, ctx: &mut TurnContext) -> TurnOutcome {
        let mut progress =
            TurnProgress { working: state.clone(), delta: StateDelta::default(), iterations: 0 };

        loop {
            if progress.iterations >= self.settings.max_iterations {
                warn!(
                    event_name = "agent.orchestrator.iteration_ceiling",
                    correlation_id = %ctx.correlation_id,
                    thread_id = %state.thread_id,
                    iterations = progress.iterations,
                    "iteration ceiling reached without a reply"
                );
                return self.finish(progress, APOLOGY_COPY, TurnEnd::IterationCeiling, ctx).await;
            }
            if ctx.deadline_passed() {
                return self.past_deadline(progress, ctx).await;
            }
            progress.iterations += 1;

            let request = ModelRequest {
                system_prompt: system_prompt(
                    &progress.working,
                    &self.settings.prompt,
                    self.executor.calendar(),
                ),
                history: progress.working.recent_messages(self.settings.history_window).to_vec(),
                capabilities: capability_specs(),
            };
            let Some(decision) = self.decide(&request, ctx).await else {
                return self.past_deadline(progress, ctx).await;
            };

            let capability = match decision {
                Ok(ModelTurn::Reply(text)) | Ok(ModelTurn::Invoke(Capability::SendMessage { text })) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    return self.finish(progress, &text, TurnEnd::Reply, ctx).await;
                }
                Ok(ModelTurn::Invoke(capability)) => capability,
                Err(error) => {
                    warn!(
                        event_name = "agent.orchestrator.model_failed",
                        correlation_id = %ctx.correlation_id,
                        thread_id = %state.thread_id,
                        error = %error,
                        "model decision failed"
                    );
                    let copy = if error.is_circuit_open() { UNAVAILABLE_COPY } else { APOLOGY_COPY };
                    return self.finish(progress, copy, TurnEnd::ModelUnavailable, ctx).await;
                }
            };

            let outcome = self.executor.execute(&capability, &progress.working, ctx).await;
            let ack = ChatMessage::tool(outcome.ack.clone(), self.clock.now());
            self.apply(&mut progress, outcome.delta.then(StateDelta::with_message(ack)));

            match outcome.effect {
                CapabilityEffect::Booked { slot } => {
                    let email = progress.working.lead_info.email.clone().unwrap_or_default();
                    let copy = format!(
                        "¡Perfecto! He agendado tu cita para el {}. Recibirás una invitación por correo a {}. ¡Esperamos hablar contigo pronto!",
                        describe_slot(&slot, self.executor.calendar().display_offset),
                        email
                    );
                    return self.finish(progress, &copy, TurnEnd::Booked, ctx).await;
                }
                CapabilityEffect::UnderBudget => {
                    let reason = TerminationReason::NurtureLead;
                    self.apply(
                        &mut progress,
                        StateDelta { termination: Some(reason), ..StateDelta::default() },
                    );
                    let copy = self.terminator.terminal_copy(reason);
                    return self.finish(progress, &copy, TurnEnd::Terminated(reason), ctx).await;
                }
                CapabilityEffect::Continue
                | CapabilityEffect::Sent { .. }
                | CapabilityEffect::SendFailed => {}
            }
        }
    }

    /// Only the model call is bounded by the turn deadline. Capabilities and
    /// sends already started always run to completion.
    async fn decide(
        &self,
        request: &ModelRequest,
        ctx: &TurnContext,
    ) -> Option<Result<ModelTurn, ExternalCallError<PortError>>> {
        let call =
            self.resilience.call(Dependency::LanguageModel, "decide", || self.model.decide(request));
        match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call).await.ok(),
            None => Some(call.await),
        }
    }

    async fn past_deadline(&self, progress: TurnProgress, ctx: &TurnContext) -> TurnOutcome {
        warn!(
            event_name = "agent.orchestrator.deadline_exceeded",
            correlation_id = %ctx.correlation_id,
            thread_id = %progress.working.thread_id,
            iterations = progress.iterations,
            "turn deadline passed before a reply"
        );
        self.finish(progress, APOLOGY_COPY, TurnEnd::DeadlineExceeded, ctx).await
    }

    fn apply(&self, progress: &mut TurnProgress, step: StateDelta) {
        progress.working =
            apply_delta(&progress.working, &step, self.settings.extraction_cap, self.clock.now());
        progress.delta = mem::take(&mut progress.delta).then(step);
    }

    async fn finish(
        &self,
        mut progress: TurnProgress,
        text: &str,
        ended_by: TurnEnd,
        ctx: &TurnContext,
    ) -> TurnOutcome {
        let sent = self.executor.send(&progress.working, text, ctx).await;
        let delivered = matches!(sent.effect, CapabilityEffect::Sent { .. });
        self.apply(&mut progress, sent.delta);

        if matches!(
            ended_by,
            TurnEnd::IterationCeiling | TurnEnd::ModelUnavailable | TurnEnd::DeadlineExceeded
        ) {
            self.apply(
                &mut progress,
                StateDelta { turn_failed: Some(true), ..StateDelta::default() },
            );
        }

        info!(
            event_name = "agent.orchestrator.turn_finished",
            correlation_id = %ctx.correlation_id,
            thread_id = %progress.working.thread_id,
            iterations = progress.iterations,
            ended_by = ?ended_by,
            sent = delivered,
            "turn finished"
        );

        TurnOutcome {
            delta: progress.delta,
            reply: Some(text.to_string()),
            sent: delivered,
            iterations: progress.iterations,
            ended_by,
        }
    }
}
