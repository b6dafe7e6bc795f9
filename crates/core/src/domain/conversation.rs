use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::LeadInfo;
use crate::domain::message::{ChatMessage, Role};
use crate::domain::slot::Slot;
use crate::domain::step::{derive_step, ConversationStep};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Conversation id when the platform supplied one, else a per-contact thread.
    pub fn resolve(conversation_id: Option<&str>, contact_id: &str) -> Self {
        match conversation_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self(id.to_string()),
            None => Self(format!("thread_{contact_id}")),
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    AppointmentBooked,
    NurtureLead,
    NotInterested,
    UserRejection,
    ConversationTooLong,
    ErrorState,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppointmentBooked => "appointment_booked",
            Self::NurtureLead => "nurture_lead",
            Self::NotInterested => "not_interested",
            Self::UserRejection => "user_rejection",
            Self::ConversationTooLong => "conversation_too_long",
            Self::ErrorState => "error_state",
        }
    }

    pub fn is_decline(&self) -> bool {
        matches!(self, Self::NotInterested | Self::UserRejection | Self::NurtureLead)
    }
}

/// One record per (contact, thread). Mutated only through
/// [`crate::reducers::apply_delta`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: ThreadId,
    pub contact_id: ContactId,
    pub phone: String,
    pub messages: Vec<ChatMessage>,
    pub lead_info: LeadInfo,
    pub extraction_count: u32,
    pub processed_message_hashes: BTreeSet<String>,
    pub available_slots: Vec<Slot>,
    pub calendar_shown: bool,
    pub appointment_booked: bool,
    pub booked_slot: Option<Slot>,
    pub termination: Option<TerminationReason>,
    pub last_turn_failed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(
        thread_id: ThreadId,
        contact_id: ContactId,
        phone: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            thread_id,
            contact_id,
            phone: phone.into(),
            messages: Vec::new(),
            lead_info: LeadInfo::default(),
            extraction_count: 0,
            processed_message_hashes: BTreeSet::new(),
            available_slots: Vec::new(),
            calendar_shown: false,
            appointment_booked: false,
            booked_slot: None,
            termination: None,
            last_turn_failed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_step(&self, min_budget: u32) -> ConversationStep {
        derive_step(self, min_budget)
    }

    pub fn is_terminated(&self) -> bool {
        self.appointment_booked || self.termination.is_some()
    }

    pub fn last_assistant_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|message| message.role == Role::Assistant)
    }

    /// Last assistant message sent before the most recent customer message.
    pub fn prior_assistant_message(&self) -> Option<&ChatMessage> {
        let last_customer =
            self.messages.iter().rposition(|message| message.role == Role::Customer)?;
        self.messages[..last_customer].iter().rev().find(|message| message.role == Role::Assistant)
    }

    pub fn last_customer_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|message| message.role == Role::Customer)
    }

    pub fn recent_messages(&self, window: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    pub fn has_assistant_spoken(&self) -> bool {
        self.messages.iter().any(|message| message.role == Role::Assistant)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ContactId, ConversationState, ThreadId};
    use crate::domain::message::ChatMessage;

    #[test]
    fn thread_id_falls_back_to_contact_scoped_thread() {
        assert_eq!(ThreadId::resolve(Some("conv-9"), "C1").0, "conv-9");
        assert_eq!(ThreadId::resolve(Some("  "), "C1").0, "thread_C1");
        assert_eq!(ThreadId::resolve(None, "C1").0, "thread_C1");
    }

    #[test]
    fn prior_assistant_message_skips_the_latest_assistant_reply() {
        let now = Utc::now();
        let mut state = ConversationState::new(
            ThreadId("thread_C1".to_string()),
            ContactId("C1".to_string()),
            "+15550001111",
            now,
        );
        state.messages = vec![
            ChatMessage::assistant("¿Cuál es tu presupuesto mensual?", now),
            ChatMessage::customer("500", now),
            ChatMessage::assistant("¡Perfecto! ¿Cuál es tu email?", now),
        ];

        let prior = state.prior_assistant_message().expect("prior assistant message");
        assert_eq!(prior.content, "¿Cuál es tu presupuesto mensual?");
        assert_eq!(
            state.last_assistant_message().map(|m| m.content.as_str()),
            Some("¡Perfecto! ¿Cuál es tu email?")
        );
        assert_eq!(state.recent_messages(2).len(), 2);
        assert_eq!(state.recent_messages(10).len(), 3);
    }
}
