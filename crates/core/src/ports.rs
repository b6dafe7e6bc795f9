//! Interfaces of the external collaborators the dialogue engine talks to.
//!
//! Implementations live at the edges (`leadflow-db` for checkpoints,
//! `leadflow-server` for the CRM platform). Tests use in-memory fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::{ContactId, ConversationState, ThreadId};
use crate::domain::lead::LeadInfo;
use crate::domain::message::ChatMessage;
use crate::domain::slot::{BookingConfirmation, BookingRequest, Slot};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl PortError {
    /// Network-level and server-side failures may succeed on retry.
    /// Rejections and malformed payloads will not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Storage(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Rejected(_) | Self::Decode(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    pub messages: Vec<ChatMessage>,
    pub lead_info: LeadInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactUpdate {
    pub contact_id: String,
    pub tags: Vec<String>,
    pub notes: Vec<String>,
    pub custom_fields: BTreeMap<String, String>,
}

#[async_trait]
pub trait ConversationHistory: Send + Sync {
    async fn conversation_state(
        &self,
        contact_id: &ContactId,
        conversation_id: Option<&str>,
        phone: &str,
    ) -> Result<HistorySnapshot, PortError>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        contact_id: &ContactId,
        phone: &str,
        text: &str,
    ) -> Result<SendReceipt, PortError>;
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn fetch_slots(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<Slot>, PortError>;

    async fn book(&self, request: &BookingRequest) -> Result<BookingConfirmation, PortError>;
}

#[async_trait]
pub trait ContactRecorder: Send + Sync {
    async fn update_contact(&self, update: &ContactUpdate) -> Result<(), PortError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, PortError>;
    async fn put(&self, state: &ConversationState) -> Result<(), PortError>;
}

#[cfg(test)]
mod tests {
    use super::PortError;

    #[test]
    fn only_network_and_server_failures_are_transient() {
        assert!(PortError::Transport("connection reset".to_string()).is_transient());
        assert!(PortError::Status { status: 503, message: String::new() }.is_transient());
        assert!(PortError::Status { status: 429, message: String::new() }.is_transient());
        assert!(!PortError::Status { status: 422, message: String::new() }.is_transient());
        assert!(!PortError::Rejected("slot taken".to_string()).is_transient());
        assert!(!PortError::Decode("missing field".to_string()).is_transient());
    }
}
