//! Stub collaborators for route tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use leadflow_agent::llm::{ExtractionRequest, LanguageModel, ModelRequest, ModelTurn};
use leadflow_core::clock::ManualClock;
use leadflow_core::config::AppConfig;
use leadflow_core::domain::conversation::ContactId;
use leadflow_core::domain::slot::{BookingConfirmation, BookingRequest, Slot};
use leadflow_core::ports::{
    ContactRecorder, ContactUpdate, ConversationHistory, HistorySnapshot, MessageSender,
    PortError, Scheduler, SendReceipt,
};
use leadflow_db::InMemoryCheckpointStore;

use crate::bootstrap::{assemble, Collaborators, Engine};

pub struct StubModel;

#[async_trait]
impl LanguageModel for StubModel {
    async fn decide(&self, _request: &ModelRequest) -> Result<ModelTurn, PortError> {
        Ok(ModelTurn::Reply("¡Genial! ¿Cómo te llamas?".to_string()))
    }

    async fn extract(&self, _request: &ExtractionRequest) -> Result<String, PortError> {
        Ok("{}".to_string())
    }
}

#[derive(Default)]
pub struct StubCrm {
    sent: Mutex<Vec<String>>,
}

impl StubCrm {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl ConversationHistory for StubCrm {
    async fn conversation_state(
        &self,
        _contact_id: &ContactId,
        _conversation_id: Option<&str>,
        _phone: &str,
    ) -> Result<HistorySnapshot, PortError> {
        Ok(HistorySnapshot::default())
    }
}

#[async_trait]
impl MessageSender for StubCrm {
    async fn send_message(
        &self,
        _contact_id: &ContactId,
        _phone: &str,
        text: &str,
    ) -> Result<SendReceipt, PortError> {
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(text.to_string());
        Ok(SendReceipt { message_id: Some(format!("m-{}", sent.len())) })
    }
}

#[async_trait]
impl Scheduler for StubCrm {
    async fn fetch_slots(
        &self,
        _range_start: DateTime<Utc>,
        _range_end: DateTime<Utc>,
    ) -> Result<Vec<Slot>, PortError> {
        Ok(Vec::new())
    }

    async fn book(&self, request: &BookingRequest) -> Result<BookingConfirmation, PortError> {
        Ok(BookingConfirmation { appointment_id: "apt-1".to_string(), slot: request.slot.clone() })
    }
}

#[async_trait]
impl ContactRecorder for StubCrm {
    async fn update_contact(&self, _update: &ContactUpdate) -> Result<(), PortError> {
        Ok(())
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub crm: Arc<StubCrm>,
}

impl TestEngine {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.resilience.max_retries = 0;
        config.resilience.retry_base_delay_ms = 0;
        config.llm.max_retries = 0;

        let crm = Arc::new(StubCrm::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_else(Utc::now),
        ));
        let engine = assemble(
            &config,
            Collaborators {
                model: Arc::new(StubModel),
                history: crm.clone(),
                sender: crm.clone(),
                scheduler: crm.clone(),
                contacts: crm.clone(),
                checkpoints: Arc::new(InMemoryCheckpointStore::default()),
            },
            clock,
        );

        Self { engine, crm }
    }
}
