//! One inbound message, end to end.
//!
//! ```text
//! dedup -> breaker gate -> thread lock -> load/seed state -> append message
//!   -> terminated? -> response cache -> extraction -> terminator
//!   -> orchestrator (deadline between model calls) -> terminator -> persist -> dedup complete
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use leadflow_core::cache::{CannedKind, DedupDecision, DedupGuard, ResponseCache};
use leadflow_core::clock::SharedClock;
use leadflow_core::domain::conversation::{ConversationState, TerminationReason, ThreadId};
use leadflow_core::domain::envelope::ValidatedEnvelope;
use leadflow_core::domain::message::ChatMessage;
use leadflow_core::errors::ApplicationError;
use leadflow_core::ports::{CheckpointStore, ConversationHistory};
use leadflow_core::reducers::{apply_delta, StateDelta};
use leadflow_core::resilience::{Dependency, Resilience};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::runtime::{Orchestrator, TurnEnd};
use crate::terminator::{TerminationCheck, Terminator};
use crate::tools::TurnContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Processed,
    Duplicate,
    Cached,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TurnResult {
    pub status: TurnStatus,
    pub reply: Option<String>,
    pub thread_id: String,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub extraction_cap: u32,
    pub turn_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { extraction_cap: 3, turn_timeout: Duration::from_secs(300) }
    }
}

pub struct TurnPipeline {
    dedup: DedupGuard<TurnResult>,
    responses: ResponseCache,
    terminator: Arc<Terminator>,
    orchestrator: Orchestrator,
    history: Arc<dyn ConversationHistory>,
    checkpoints: Arc<dyn CheckpointStore>,
    resilience: Resilience,
    thread_locks: Mutex<HashMap<ThreadId, Arc<Mutex<()>>>>,
    settings: PipelineSettings,
    clock: SharedClock,
}

impl TurnPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dedup: DedupGuard<TurnResult>,
        responses: ResponseCache,
        terminator: Arc<Terminator>,
        orchestrator: Orchestrator,
        history: Arc<dyn ConversationHistory>,
        checkpoints: Arc<dyn CheckpointStore>,
        resilience: Resilience,
        settings: PipelineSettings,
        clock: SharedClock,
    ) -> Self {
        Self {
            dedup,
            responses,
            terminator,
            orchestrator,
            history,
            checkpoints,
            resilience,
            thread_locks: Mutex::new(HashMap::new()),
            settings,
            clock,
        }
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub fn responses(&self) -> &ResponseCache {
        &self.responses
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    pub async fn handle(
        &self,
        envelope: &ValidatedEnvelope,
        correlation_id: &str,
    ) -> Result<TurnResult, ApplicationError> {
        let key = match self.dedup.begin(envelope).await {
            DedupDecision::Fresh(key) => key,
            DedupDecision::Replay(previous) => {
                return Ok(TurnResult { status: TurnStatus::Duplicate, ..previous });
            }
            DedupDecision::InFlight => {
                info!(
                    event_name = "agent.pipeline.in_flight_duplicate",
                    correlation_id,
                    thread_id = %envelope.thread_id,
                    "same delivery is already being processed"
                );
                return Ok(TurnResult {
                    status: TurnStatus::Duplicate,
                    reply: None,
                    thread_id: envelope.thread_id.0.clone(),
                });
            }
        };

        if let Some(retry_after) =
            self.resilience.breakers().get(Dependency::LanguageModel).retry_after()
        {
            self.dedup.abandon(&key).await;
            return Err(ApplicationError::CircuitOpen {
                dependency: Dependency::LanguageModel.to_string(),
                retry_after_secs: retry_after.num_seconds().max(1) as u64,
            });
        }

        let lock = self.thread_lock(&envelope.thread_id).await;
        let outcome = {
            let _serialized = lock.lock().await;
            self.process(envelope, correlation_id).await
        };
        drop(lock);
        self.prune_lock(&envelope.thread_id).await;

        match &outcome {
            Ok(result) => self.dedup.complete(&key, result.clone()).await,
            Err(failure) => {
                error!(
                    event_name = "agent.pipeline.turn_failed",
                    correlation_id,
                    thread_id = %envelope.thread_id,
                    error_code = failure.code(),
                    error = %failure,
                    "turn failed before a reply was sent"
                );
                self.dedup.abandon(&key).await;
            }
        }
        outcome
    }

    async fn thread_lock(&self, thread_id: &ThreadId) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        locks.entry(thread_id.clone()).or_default().clone()
    }

    async fn prune_lock(&self, thread_id: &ThreadId) {
        let mut locks = self.thread_locks.lock().await;
        if locks.get(thread_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(thread_id);
        }
    }

    async fn process(
        &self,
        envelope: &ValidatedEnvelope,
        correlation_id: &str,
    ) -> Result<TurnResult, ApplicationError> {
        let mut ctx = TurnContext::new(correlation_id).with_deadline(self.settings.turn_timeout);
        let loaded = self.load_state(envelope, correlation_id).await?;
        let mut state = self.apply(
            &loaded,
            StateDelta::with_message(ChatMessage::customer(&envelope.message, self.clock.now())),
        );

        if state.is_terminated() {
            let reason = state.termination.unwrap_or(TerminationReason::AppointmentBooked);
            return self.finish_terminated(state, reason, &ctx).await;
        }

        if let Some(canned) = self.responses.lookup(&envelope.message, &state) {
            let sent = self.orchestrator.executor().send(&state, &canned.text, &ctx).await;
            let mut delta = sent.delta;
            if canned.kind == CannedKind::Rejection {
                delta.termination = Some(TerminationReason::NotInterested);
            }
            state = self.apply(&state, delta);
            self.persist(&state, correlation_id).await;
            info!(
                event_name = "agent.pipeline.cached_reply",
                correlation_id,
                thread_id = %state.thread_id,
                kind = ?canned.kind,
                "answered from response cache"
            );
            return Ok(self.result(&state, TurnStatus::Cached, Some(canned.text)));
        }

        let extraction = self.orchestrator.executor().extract(&state, &envelope.message, &mut ctx).await;
        let ack = ChatMessage::tool(extraction.ack, self.clock.now());
        state = self.apply(&state, extraction.delta.then(StateDelta::with_message(ack)));

        if let TerminationCheck::Terminate(reason) = self.terminator.check(&state) {
            return self.finish_terminated(state, reason, &ctx).await;
        }

        let outcome = self.orchestrator.run_turn(&state, &mut ctx).await;
        if outcome.ended_by == TurnEnd::DeadlineExceeded {
            warn!(
                event_name = "agent.pipeline.turn_timeout",
                correlation_id,
                thread_id = %state.thread_id,
                timeout_ms = self.settings.turn_timeout.as_millis() as u64,
                "turn exceeded its deadline"
            );
            self.resilience.breakers().get(Dependency::LanguageModel).record_failure();
        }
        state = self.apply(&state, outcome.delta);
        let reply = outcome.reply;

        if let TerminationCheck::Terminate(reason) = self.terminator.check(&state) {
            state = self.apply(&state, StateDelta { termination: Some(reason), ..StateDelta::default() });
        }

        self.persist(&state, correlation_id).await;
        Ok(self.result(&state, TurnStatus::Processed, reply))
    }

    async fn load_state(
        &self,
        envelope: &ValidatedEnvelope,
        correlation_id: &str,
    ) -> Result<ConversationState, ApplicationError> {
        let thread_id = &envelope.thread_id;
        let stored = self
            .resilience
            .call(Dependency::Checkpoint, "get", || self.checkpoints.get(thread_id))
            .await
            .map_err(ApplicationError::from)?;
        if let Some(state) = stored {
            return Ok(state);
        }

        let now = self.clock.now();
        let mut state = ConversationState::new(
            thread_id.clone(),
            envelope.contact_id.clone(),
            envelope.phone.clone(),
            now,
        );
        let seeded = self
            .resilience
            .call(Dependency::Crm, "conversation_state", || {
                self.history.conversation_state(
                    &envelope.contact_id,
                    envelope.conversation_id.as_deref(),
                    &envelope.phone,
                )
            })
            .await;
        match seeded {
            Ok(snapshot) => {
                state = self.apply(
                    &state,
                    StateDelta {
                        lead: snapshot.lead_info,
                        messages: snapshot.messages,
                        ..StateDelta::default()
                    },
                );
            }
            Err(failure) => warn!(
                event_name = "agent.pipeline.history_unavailable",
                correlation_id,
                thread_id = %thread_id,
                error = %failure,
                "could not seed state from conversation history; starting empty"
            ),
        }
        Ok(state)
    }

    async fn finish_terminated(
        &self,
        state: ConversationState,
        reason: TerminationReason,
        ctx: &TurnContext,
    ) -> Result<TurnResult, ApplicationError> {
        let copy = self.terminator.terminal_copy(reason);
        let sent = self.orchestrator.executor().send(&state, &copy, ctx).await;
        let state = self.apply(
            &state,
            sent.delta.then(StateDelta { termination: Some(reason), ..StateDelta::default() }),
        );
        self.persist(&state, &ctx.correlation_id).await;
        Ok(self.result(&state, TurnStatus::Terminated, Some(copy)))
    }

    async fn persist(&self, state: &ConversationState, correlation_id: &str) {
        let saved = self
            .resilience
            .call(Dependency::Checkpoint, "put", || self.checkpoints.put(state))
            .await;
        if let Err(failure) = saved {
            error!(
                event_name = "agent.pipeline.persist_failed",
                correlation_id,
                thread_id = %state.thread_id,
                error = %failure,
                "could not persist conversation state"
            );
        }
    }

    fn apply(&self, state: &ConversationState, delta: StateDelta) -> ConversationState {
        apply_delta(state, &delta, self.settings.extraction_cap, self.clock.now())
    }

    fn result(&self, state: &ConversationState, status: TurnStatus, reply: Option<String>) -> TurnResult {
        TurnResult { status, reply, thread_id: state.thread_id.0.clone() }
    }
}
