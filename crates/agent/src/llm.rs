use async_trait::async_trait;
use leadflow_core::domain::lead::LeadInfo;
use leadflow_core::domain::message::ChatMessage;
use leadflow_core::ports::PortError;

use crate::tools::{Capability, CapabilitySpec};

/// One Decide step of the orchestrator loop.
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub capabilities: Vec<CapabilitySpec>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelTurn {
    /// Plain customer-visible text.
    Reply(String),
    Invoke(Capability),
}

/// Input for structured lead extraction from a single customer message.
#[derive(Clone, Debug)]
pub struct ExtractionRequest {
    pub message: String,
    pub context: Vec<ChatMessage>,
    pub last_assistant_message: Option<String>,
    pub current: LeadInfo,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn decide(&self, request: &ModelRequest) -> Result<ModelTurn, PortError>;

    /// Returns the raw model output, expected to hold a JSON object.
    async fn extract(&self, request: &ExtractionRequest) -> Result<String, PortError>;
}
