//! Contextual extraction: turns one customer message into a [`LeadInfo`]
//! delta, using the previous assistant message to disambiguate short replies.
//!
//! Resolution order:
//! 1. bare number right after a budget question, no model call
//! 2. bare confirmation, resolved by [`crate::confirmation`]
//! 3. low-information messages are skipped
//! 4. everything else goes to the model, unless the attempt cap is reached

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use leadflow_core::domain::conversation::ConversationState;
use leadflow_core::domain::lead::{parse_budget, LeadField, LeadInfo};
use leadflow_core::domain::message::{content_hash, normalize_message, ChatMessage, Role};
use leadflow_core::reducers::{changed_fields, merge_lead_info, StateDelta};
use leadflow_core::resilience::{Dependency, Resilience};
use regex::{Regex, RegexSet};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::confirmation::{mentions_budget, resolve_confirmation};
use crate::llm::{ExtractionRequest, LanguageModel};

static BARE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$?\d+(,\d{3})*(\.\d{2})?$").expect("bare number pattern compiles")
});

static LOW_INFORMATION: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^(hola|hi|hello|hey|buenos dias|buenas tardes|buenas noches)$",
        r"^(ok|okay|bien|perfecto|genial|excelente|entendido)$",
        r"^(si|sí|no|yes|nope)$",
        r"^(gracias|thanks|thank you)$",
        r"^(adios|adiós|bye|chao|hasta luego|nos vemos)$",
        r"^\d+$",
        r"^[.,!?¿¡]$",
        r"^(ah|oh|hmm|mmm|aja|ajá)$",
    ])
    .expect("skip patterns compile")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    LowInformation,
    AlreadyProcessed,
    AppointmentBooked,
    ExtractedThisTurn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionSource {
    BudgetShortcut,
    Confirmation,
    Model,
    Skipped(SkipReason),
    LimitReached,
    ModelUnavailable,
    Unparseable,
}

impl ExtractionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetShortcut => "budget_shortcut",
            Self::Confirmation => "confirmation",
            Self::Model => "model",
            Self::Skipped(_) => "skipped",
            Self::LimitReached => "limit_reached",
            Self::ModelUnavailable => "model_unavailable",
            Self::Unparseable => "unparseable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extraction {
    pub delta: LeadInfo,
    pub source: ExtractionSource,
    /// Whether this resolution counts against the extraction cap.
    pub counted: bool,
    /// Set when the message went through the model and must not be sent again.
    pub message_hash: Option<String>,
}

impl Extraction {
    fn local(delta: LeadInfo, source: ExtractionSource, counted: bool) -> Self {
        Self { delta, source, counted, message_hash: None }
    }

    fn skipped(reason: SkipReason) -> Self {
        Self::local(LeadInfo::default(), ExtractionSource::Skipped(reason), false)
    }

    pub fn to_state_delta(&self) -> StateDelta {
        StateDelta {
            lead: self.delta.clone(),
            extraction_increment: u32::from(self.counted),
            processed_hashes: self.message_hash.iter().cloned().collect::<BTreeSet<_>>(),
            ..StateDelta::default()
        }
    }

    /// Compressed acknowledgement appended to history instead of the payload.
    pub fn ack(&self, before: &LeadInfo) -> String {
        match self.source {
            ExtractionSource::Skipped(_) => "Skipped".to_string(),
            ExtractionSource::LimitReached => "LimitReached".to_string(),
            _ => {
                let changed = changed_fields(before, &merge_lead_info(before, &self.delta));
                if changed.is_empty() {
                    "NoInfo".to_string()
                } else {
                    let names = changed.iter().map(LeadField::as_str).collect::<Vec<_>>();
                    format!("+{}", names.join(","))
                }
            }
        }
    }
}

pub fn is_low_information(message: &str) -> bool {
    LOW_INFORMATION.is_match(&normalize_message(message))
}

/// `500`, `$1,200` or `300.00` right after a question about budget.
pub fn bare_number_budget(message: &str, prior_assistant: Option<&str>) -> Option<u32> {
    let trimmed = message.trim();
    if !BARE_NUMBER.is_match(trimmed) {
        return None;
    }
    prior_assistant.filter(|prior| mentions_budget(prior)).and_then(|_| parse_budget(trimmed))
}

fn prior_assistant_text(state: &ConversationState) -> Option<&str> {
    state
        .prior_assistant_message()
        .or_else(|| state.last_assistant_message())
        .map(|message| message.content.as_str())
}

/// Steps 1 to 3. `None` means the message needs the model.
pub fn resolve_locally(state: &ConversationState, message: &str) -> Option<Extraction> {
    if state.appointment_booked {
        return Some(Extraction::skipped(SkipReason::AppointmentBooked));
    }
    let prior = prior_assistant_text(state);

    if let Some(budget) = bare_number_budget(message, prior) {
        let delta = LeadInfo { budget: Some(budget), ..LeadInfo::default() };
        return Some(Extraction::local(delta, ExtractionSource::BudgetShortcut, true));
    }

    if let Some(delta) = resolve_confirmation(message, prior) {
        let counted = !delta.is_empty();
        return Some(Extraction::local(delta, ExtractionSource::Confirmation, counted));
    }

    if is_low_information(message) {
        return Some(Extraction::skipped(SkipReason::LowInformation));
    }

    None
}

#[derive(Clone, Debug)]
pub struct ExtractionSettings {
    pub max_attempts: u32,
    pub context_turns: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self { max_attempts: 3, context_turns: 5 }
    }
}

pub struct ExtractionResolver {
    model: Arc<dyn LanguageModel>,
    resilience: Resilience,
    settings: ExtractionSettings,
}

impl ExtractionResolver {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        resilience: Resilience,
        settings: ExtractionSettings,
    ) -> Self {
        Self { model, resilience, settings }
    }

    pub fn settings(&self) -> &ExtractionSettings {
        &self.settings
    }

    pub async fn resolve(
        &self,
        state: &ConversationState,
        message: &str,
        correlation_id: &str,
    ) -> Extraction {
        let extraction = match resolve_locally(state, message) {
            Some(local) => local,
            None => self.resolve_with_model(state, message, correlation_id).await,
        };

        info!(
            event_name = "agent.extraction.resolved",
            correlation_id,
            thread_id = %state.thread_id,
            source = extraction.source.as_str(),
            fields = ?extraction.delta.populated_fields(),
            counted = extraction.counted,
            "extraction resolved"
        );
        extraction
    }

    async fn resolve_with_model(
        &self,
        state: &ConversationState,
        message: &str,
        correlation_id: &str,
    ) -> Extraction {
        if state.extraction_count >= self.settings.max_attempts {
            return Extraction::local(LeadInfo::default(), ExtractionSource::LimitReached, false);
        }

        let hash = content_hash(message);
        if state.processed_message_hashes.contains(&hash) {
            return Extraction::skipped(SkipReason::AlreadyProcessed);
        }

        let request = ExtractionRequest {
            message: message.to_string(),
            context: conversation_context(state, self.settings.context_turns),
            last_assistant_message: prior_assistant_text(state).map(str::to_string),
            current: state.lead_info.clone(),
        };

        let raw = match self
            .resilience
            .call(Dependency::LanguageModel, "extract", || self.model.extract(&request))
            .await
        {
            Ok(raw) => raw,
            Err(error) => {
                warn!(
                    event_name = "agent.extraction.model_failed",
                    correlation_id,
                    thread_id = %state.thread_id,
                    error = %error,
                    "extraction model call failed; continuing without new fields"
                );
                return Extraction::local(
                    LeadInfo::default(),
                    ExtractionSource::ModelUnavailable,
                    false,
                );
            }
        };

        match parse_extraction(&raw) {
            Ok(delta) => Extraction {
                delta,
                source: ExtractionSource::Model,
                counted: true,
                message_hash: Some(hash),
            },
            Err(error) => {
                warn!(
                    event_name = "agent.extraction.unparseable",
                    correlation_id,
                    thread_id = %state.thread_id,
                    response_len = raw.len(),
                    error = %error,
                    "extraction response was not a JSON object"
                );
                Extraction {
                    delta: LeadInfo::default(),
                    source: ExtractionSource::Unparseable,
                    counted: true,
                    message_hash: Some(hash),
                }
            }
        }
    }
}

fn conversation_context(state: &ConversationState, turns: usize) -> Vec<ChatMessage> {
    let visible = state
        .messages
        .iter()
        .filter(|message| message.role != Role::Tool)
        .cloned()
        .collect::<Vec<_>>();
    let start = visible.len().saturating_sub(turns);
    visible[start..].to_vec()
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractionParseError {
    #[error("response contains no JSON object")]
    NoObject,
    #[error("invalid JSON: {0}")]
    Json(String),
}

/// Parses the model's JSON answer into a delta. Keys are folded onto the
/// fixed field set; unknown keys, nulls and blanks are dropped.
pub fn parse_extraction(raw: &str) -> Result<LeadInfo, ExtractionParseError> {
    let start = raw.find('{').ok_or(ExtractionParseError::NoObject)?;
    let end = raw.rfind('}').filter(|end| *end > start).ok_or(ExtractionParseError::NoObject)?;
    let object: serde_json::Map<String, Value> = serde_json::from_str(&raw[start..=end])
        .map_err(|error| ExtractionParseError::Json(error.to_string()))?;

    let mut delta = LeadInfo::default();
    for (key, value) in &object {
        let Some(field) = LeadField::from_key(key) else {
            debug!(event_name = "agent.extraction.unknown_key", key = %key, "ignoring unknown key");
            continue;
        };
        match (field, value) {
            (LeadField::Budget, Value::Number(number)) => {
                delta.budget = number
                    .as_u64()
                    .or_else(|| number.as_f64().filter(|amount| *amount >= 0.0).map(|a| a as u64))
                    .and_then(|amount| u32::try_from(amount).ok())
                    .filter(|amount| *amount > 0);
            }
            (LeadField::Budget, Value::String(text)) => {
                delta.budget = parse_budget(text).filter(|amount| *amount > 0);
            }
            (field, Value::String(text)) => delta.set_text(field, text),
            (field, Value::Number(number)) => delta.set_text(field, &number.to_string()),
            _ => {}
        }
    }
    Ok(delta)
}
