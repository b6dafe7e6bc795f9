//! In-memory fakes for the ports and a harness that wires them into an
//! orchestrator or a full pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use leadflow_core::cache::{DedupGuard, ResponseCache, SlotCache};
use leadflow_core::clock::{ManualClock, SharedClock};
use leadflow_core::domain::conversation::{ContactId, ConversationState, ThreadId};
use leadflow_core::domain::envelope::ValidatedEnvelope;
use leadflow_core::domain::lead::LeadInfo;
use leadflow_core::domain::message::ChatMessage;
use leadflow_core::domain::slot::{BookingConfirmation, BookingRequest, Slot};
use leadflow_core::ports::{
    CheckpointStore, ContactRecorder, ContactUpdate, ConversationHistory, HistorySnapshot,
    MessageSender, PortError, Scheduler, SendReceipt,
};
use leadflow_core::resilience::{BreakerRegistry, CircuitBreakerConfig, Resilience, RetryPolicy};

use crate::calendar::CalendarSettings;
use crate::conversation::{ExtractionResolver, ExtractionSettings};
use crate::llm::{ExtractionRequest, LanguageModel, ModelRequest, ModelTurn};
use crate::pipeline::{PipelineSettings, TurnPipeline};
use crate::runtime::{Orchestrator, OrchestratorSettings};
use crate::tagging::ContactUpdateQueue;
use crate::terminator::Terminator;
use crate::tools::CapabilityExecutor;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plays decisions back in order, then repeats the last one.
pub struct ScriptedModel {
    decisions: Mutex<Vec<Result<ModelTurn, PortError>>>,
    extraction: Mutex<String>,
    decide_calls: AtomicU32,
    extract_calls: AtomicU32,
    decide_delay: Mutex<Duration>,
}

impl ScriptedModel {
    pub fn new(decisions: Vec<Result<ModelTurn, PortError>>) -> Self {
        Self {
            decisions: Mutex::new(decisions),
            extraction: Mutex::new("{}".to_string()),
            decide_calls: AtomicU32::new(0),
            extract_calls: AtomicU32::new(0),
            decide_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn delay_decisions(&self, delay: Duration) {
        *lock(&self.decide_delay) = delay;
    }

    pub fn decide_calls(&self) -> u32 {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn extract_calls(&self) -> u32 {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn decide(&self, _request: &ModelRequest) -> Result<ModelTurn, PortError> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.decide_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut decisions = lock(&self.decisions);
        if decisions.len() > 1 {
            return decisions.remove(0);
        }
        decisions
            .first()
            .cloned()
            .unwrap_or_else(|| Err(PortError::Decode("no scripted decision".to_string())))
    }

    async fn extract(&self, _request: &ExtractionRequest) -> Result<String, PortError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.extraction).clone())
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<String>>,
    failure: Mutex<Option<PortError>>,
    failure_after_delivery: Mutex<Option<PortError>>,
    delay: Mutex<Duration>,
    attempts: AtomicU32,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn fail_with(&self, error: PortError) {
        *lock(&self.failure) = Some(error);
    }

    /// Delivers the message, then reports `error` as if the response was lost.
    pub fn fail_after_delivery(&self, error: PortError) {
        *lock(&self.failure_after_delivery) = Some(error);
    }

    pub fn delay_sends(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_message(
        &self,
        _contact_id: &ContactId,
        _phone: &str,
        text: &str,
    ) -> Result<SendReceipt, PortError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        let mut sent = lock(&self.sent);
        sent.push(text.to_string());
        if let Some(error) = lock(&self.failure_after_delivery).clone() {
            return Err(error);
        }
        Ok(SendReceipt { message_id: Some(format!("msg-{}", sent.len())) })
    }
}

#[derive(Default)]
pub struct FakeScheduler {
    fetches: AtomicU32,
    bookings: Mutex<Vec<BookingRequest>>,
}

impl FakeScheduler {
    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn bookings(&self) -> usize {
        lock(&self.bookings).len()
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn fetch_slots(
        &self,
        _range_start: chrono::DateTime<Utc>,
        _range_end: chrono::DateTime<Utc>,
    ) -> Result<Vec<Slot>, PortError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(offered_slots())
    }

    async fn book(&self, request: &BookingRequest) -> Result<BookingConfirmation, PortError> {
        let mut bookings = lock(&self.bookings);
        bookings.push(request.clone());
        Ok(BookingConfirmation {
            appointment_id: format!("apt-{}", bookings.len()),
            slot: request.slot.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingContacts {
    updates: Mutex<Vec<ContactUpdate>>,
}

impl RecordingContacts {
    pub fn updates(&self) -> Vec<ContactUpdate> {
        lock(&self.updates).clone()
    }
}

#[async_trait]
impl ContactRecorder for RecordingContacts {
    async fn update_contact(&self, update: &ContactUpdate) -> Result<(), PortError> {
        lock(&self.updates).push(update.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeHistory {
    snapshot: Mutex<HistorySnapshot>,
    failure: Mutex<Option<PortError>>,
}

impl FakeHistory {
    pub fn set_name(&self, name: &str) {
        lock(&self.snapshot).lead_info.name = Some(name.to_string());
    }

    pub fn fail_with(&self, error: PortError) {
        *lock(&self.failure) = Some(error);
    }
}

#[async_trait]
impl ConversationHistory for FakeHistory {
    async fn conversation_state(
        &self,
        _contact_id: &ContactId,
        _conversation_id: Option<&str>,
        _phone: &str,
    ) -> Result<HistorySnapshot, PortError> {
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        Ok(lock(&self.snapshot).clone())
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    states: Mutex<HashMap<ThreadId, ConversationState>>,
    read_failure: Mutex<Option<PortError>>,
}

impl MemoryCheckpoints {
    pub fn seed(&self, state: ConversationState) {
        lock(&self.states).insert(state.thread_id.clone(), state);
    }

    pub fn saved(&self, thread_id: &ThreadId) -> Option<ConversationState> {
        lock(&self.states).get(thread_id).cloned()
    }

    pub fn fail_reads(&self, error: PortError) {
        *lock(&self.read_failure) = Some(error);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn get(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, PortError> {
        if let Some(error) = lock(&self.read_failure).clone() {
            return Err(error);
        }
        Ok(lock(&self.states).get(thread_id).cloned())
    }

    async fn put(&self, state: &ConversationState) -> Result<(), PortError> {
        lock(&self.states).insert(state.thread_id.clone(), state.clone());
        Ok(())
    }
}

pub struct Harness {
    pub model: Arc<ScriptedModel>,
    pub sender: Arc<RecordingSender>,
    pub scheduler: Arc<FakeScheduler>,
    pub contacts: Arc<RecordingContacts>,
    pub history: Arc<FakeHistory>,
    pub checkpoints: Arc<MemoryCheckpoints>,
    pub breakers: Arc<BreakerRegistry>,
    pub clock: Arc<ManualClock>,
    max_iterations: u32,
}

impl Harness {
    pub fn new(decisions: Vec<Result<ModelTurn, PortError>>) -> Self {
        Self::with_iterations(decisions, OrchestratorSettings::default().max_iterations)
    }

    pub fn with_iterations(decisions: Vec<Result<ModelTurn, PortError>>, max_iterations: u32) -> Self {
        let clock = Arc::new(ManualClock::new(test_now()));
        let shared: SharedClock = clock.clone();
        Self {
            model: Arc::new(ScriptedModel::new(decisions)),
            sender: Arc::new(RecordingSender::default()),
            scheduler: Arc::new(FakeScheduler::default()),
            contacts: Arc::new(RecordingContacts::default()),
            history: Arc::new(FakeHistory::default()),
            checkpoints: Arc::new(MemoryCheckpoints::default()),
            breakers: Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default(), shared)),
            clock,
            max_iterations,
        }
    }

    fn shared_clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub fn resilience(&self) -> Resilience {
        Resilience::new(
            self.breakers.clone(),
            RetryPolicy { max_retries: 1, base_delay_ms: 0, max_delay_ms: 0 },
            Duration::from_secs(5),
        )
    }

    fn terminator(&self) -> Arc<Terminator> {
        Arc::new(Terminator::new(30, CalendarSettings::default().min_budget))
    }

    pub fn executor(&self) -> Arc<CapabilityExecutor> {
        let resilience = self.resilience();
        let resolver = Arc::new(ExtractionResolver::new(
            self.model.clone(),
            resilience.clone(),
            ExtractionSettings::default(),
        ));
        Arc::new(CapabilityExecutor::new(
            resolver,
            self.sender.clone(),
            self.scheduler.clone(),
            Arc::new(SlotCache::new(
                chrono::Duration::minutes(5),
                Duration::from_secs(2),
                self.shared_clock(),
            )),
            ContactUpdateQueue::new(self.contacts.clone(), resilience.clone()),
            resilience,
            CalendarSettings::default(),
            self.shared_clock(),
        ))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.model.clone(),
            self.executor(),
            self.resilience(),
            self.terminator(),
            OrchestratorSettings { max_iterations: self.max_iterations, ..OrchestratorSettings::default() },
            self.shared_clock(),
        )
    }

    pub fn pipeline(&self) -> TurnPipeline {
        self.pipeline_with(PipelineSettings::default())
    }

    pub fn pipeline_with(&self, settings: PipelineSettings) -> TurnPipeline {
        TurnPipeline::new(
            DedupGuard::new(chrono::Duration::minutes(5), self.shared_clock()),
            ResponseCache::new("María", "Outlet Media"),
            self.terminator(),
            self.orchestrator(),
            self.history.clone(),
            self.checkpoints.clone(),
            self.resilience(),
            settings,
            self.shared_clock(),
        )
    }
}

pub fn test_now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Conversation on `thread_C1` holding the given `(role, text)` messages.
pub fn state_with(messages: &[(&str, &str)]) -> ConversationState {
    let now = test_now();
    let mut state = ConversationState::new(
        ThreadId("thread_C1".to_string()),
        ContactId("C1".to_string()),
        "+15550001111",
        now,
    );
    state.messages = messages
        .iter()
        .map(|(role, text)| match *role {
            "assistant" => ChatMessage::assistant(*text, now),
            "tool" => ChatMessage::tool(*text, now),
            _ => ChatMessage::customer(*text, now),
        })
        .collect();
    state
}

pub fn qualified_lead(budget: u32) -> LeadInfo {
    LeadInfo {
        name: Some("Ana".to_string()),
        business_type: Some("clínica dental".to_string()),
        problem: Some("pocos pacientes nuevos".to_string()),
        goal: Some("llenar la agenda".to_string()),
        budget: Some(budget),
        email: Some("ana@example.com".to_string()),
    }
}

pub fn offered_slots() -> Vec<Slot> {
    let at = |day, hour, minute| {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).single().unwrap_or_else(Utc::now)
    };
    vec![
        Slot { start: at(2, 16, 0), end: at(2, 16, 30) },
        Slot { start: at(3, 20, 30), end: at(3, 21, 0) },
        Slot { start: at(4, 15, 0), end: at(4, 16, 0) },
    ]
}

pub fn envelope(contact_id: &str, message: &str) -> ValidatedEnvelope {
    ValidatedEnvelope {
        phone: "+15550001111".to_string(),
        message: message.to_string(),
        contact_id: ContactId(contact_id.to_string()),
        conversation_id: None,
        thread_id: ThreadId::resolve(None, contact_id),
        channel: Some("WhatsApp".to_string()),
    }
}
