use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::{ContactId, ThreadId};

const MAX_CONTACT_ID_LEN: usize = 50;
const MAX_MESSAGE_LEN: usize = 4096;
const ALLOWED_CHANNELS: [&str; 3] = ["WhatsApp", "SMS", "TYPE_PHONE"];

static E164_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9]\d{1,14}$").expect("phone pattern compiles"));

/// Webhook payload as delivered by the messaging platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default, rename = "type")]
    pub channel: Option<String>,
}

/// An envelope that passed validation. Only this type reaches the turn pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedEnvelope {
    pub phone: String,
    pub message: String,
    pub contact_id: ContactId,
    pub conversation_id: Option<String>,
    pub thread_id: ThreadId,
    pub channel: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid inbound envelope ({})", render_violations(.violations))]
pub struct EnvelopeError {
    pub violations: Vec<FieldViolation>,
}

fn render_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|violation| format!("{}: {}", violation.field, violation.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl InboundEnvelope {
    pub fn validate(&self) -> Result<ValidatedEnvelope, EnvelopeError> {
        let mut violations = Vec::new();

        let phone = match self.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            None => {
                violations.push(violation("phone", "is required"));
                None
            }
            Some(raw) => match normalize_phone(raw) {
                Some(phone) => Some(phone),
                None => {
                    violations.push(violation("phone", "must be an E.164 phone number"));
                    None
                }
            },
        };

        let message = match self.message.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            None => {
                violations.push(violation("message", "is required"));
                None
            }
            Some(text) if text.chars().count() > MAX_MESSAGE_LEN => {
                violations.push(violation(
                    "message",
                    &format!("must be at most {MAX_MESSAGE_LEN} characters"),
                ));
                None
            }
            Some(text) => Some(text.to_string()),
        };

        let contact_id = match self.contact_id.as_deref().map(str::trim).filter(|c| !c.is_empty())
        {
            None => {
                violations.push(violation("contactId", "is required"));
                None
            }
            Some(id) if id.chars().count() > MAX_CONTACT_ID_LEN => {
                violations.push(violation(
                    "contactId",
                    &format!("must be at most {MAX_CONTACT_ID_LEN} characters"),
                ));
                None
            }
            Some(id) => Some(id.to_string()),
        };

        if let Some(channel) = self.channel.as_deref() {
            if !ALLOWED_CHANNELS.contains(&channel) {
                violations.push(violation("type", "must be one of WhatsApp, SMS, TYPE_PHONE"));
            }
        }

        match (phone, message, contact_id) {
            (Some(phone), Some(message), Some(contact_id)) if violations.is_empty() => {
                let conversation_id = self
                    .conversation_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string);
                Ok(ValidatedEnvelope {
                    thread_id: ThreadId::resolve(conversation_id.as_deref(), &contact_id),
                    phone,
                    message,
                    contact_id: ContactId(contact_id),
                    conversation_id,
                    channel: self.channel.clone(),
                })
            }
            _ => Err(EnvelopeError { violations }),
        }
    }
}

fn violation(field: &'static str, reason: &str) -> FieldViolation {
    FieldViolation { field, reason: reason.to_string() }
}

/// Strips formatting, adds `+1` to bare ten-digit numbers and checks E.164.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let compact: String =
        raw.chars().filter(|ch| !matches!(ch, ' ' | '-' | '(' | ')' | '.')).collect();

    let candidate = if !compact.starts_with('+') && compact.len() == 10 {
        format!("+1{compact}")
    } else {
        compact
    };

    if !E164_RE.is_match(&candidate) {
        return None;
    }

    if candidate.starts_with('+') {
        Some(candidate)
    } else {
        Some(format!("+{candidate}"))
    }
}
