//! The closed capability set offered to the model and its executor.
//!
//! The model names a capability by string; [`Capability::from_call`] decodes
//! that into one variant or a decode error. Everything after decoding is an
//! exhaustive match.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_core::cache::SlotCache;
use leadflow_core::clock::SharedClock;
use leadflow_core::domain::conversation::{ConversationState, TerminationReason};
use leadflow_core::domain::lead::LeadInfo;
use leadflow_core::domain::message::{normalize_message, ChatMessage};
use leadflow_core::domain::slot::{BookingRequest, Slot};
use leadflow_core::ports::{MessageSender, PortError, Scheduler};
use leadflow_core::reducers::StateDelta;
use leadflow_core::resilience::{Dependency, Resilience};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::calendar::{
    check_eligibility, describe_slot, format_slot_list, offered_slots, resolve_selected_slot,
    CalendarSettings, Eligibility,
};
use crate::conversation::ExtractionResolver;
use crate::tagging::{contact_update, qualification_tags, ContactUpdateQueue, APPOINTMENT_BOOKED_TAGS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    ExtractLeadInfo { message: String },
    SendMessage { text: String },
    GetCalendarSlots { range_start: Option<DateTime<Utc>>, range_end: Option<DateTime<Utc>> },
    /// `slot` is an RFC 3339 start time or the customer's own selection text.
    BookAppointment { slot: String, name: Option<String>, email: Option<String> },
    UpdateContactRecord { tags: Vec<String>, notes: Option<String> },
}

#[derive(Deserialize)]
struct ExtractArgs {
    message: String,
}

#[derive(Deserialize)]
struct SendArgs {
    #[serde(alias = "message")]
    text: String,
}

#[derive(Deserialize)]
struct SlotArgs {
    #[serde(default, alias = "startDate")]
    range_start: Option<String>,
    #[serde(default, alias = "endDate")]
    range_end: Option<String>,
}

#[derive(Deserialize)]
struct BookArgs {
    slot: String,
    #[serde(default, alias = "leadName")]
    name: Option<String>,
    #[serde(default, alias = "leadEmail")]
    email: Option<String>,
}

#[derive(Deserialize)]
struct ContactArgs {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    notes: Option<String>,
}

fn decode_args<T: DeserializeOwned>(name: &str, arguments: &Value) -> Result<T, PortError> {
    serde_json::from_value(arguments.clone())
        .map_err(|error| PortError::Decode(format!("invalid arguments for {name}: {error}")))
}

fn parse_bound(raw: Option<String>) -> Result<Option<DateTime<Utc>>, PortError> {
    raw.filter(|value| !value.trim().is_empty())
        .map(|value| {
            DateTime::parse_from_rfc3339(value.trim())
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|error| PortError::Decode(format!("invalid range bound `{value}`: {error}")))
        })
        .transpose()
}

impl Capability {
    pub const NAMES: [&'static str; 5] = [
        "extract_lead_info",
        "send_message",
        "get_calendar_slots",
        "book_appointment",
        "update_contact",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExtractLeadInfo { .. } => "extract_lead_info",
            Self::SendMessage { .. } => "send_message",
            Self::GetCalendarSlots { .. } => "get_calendar_slots",
            Self::BookAppointment { .. } => "book_appointment",
            Self::UpdateContactRecord { .. } => "update_contact",
        }
    }

    /// Decodes a model tool call. Unknown names and malformed arguments are
    /// decode errors.
    pub fn from_call(name: &str, arguments: &Value) -> Result<Self, PortError> {
        match name {
            "extract_lead_info" => {
                let args: ExtractArgs = decode_args(name, arguments)?;
                Ok(Self::ExtractLeadInfo { message: args.message })
            }
            "send_message" => {
                let args: SendArgs = decode_args(name, arguments)?;
                Ok(Self::SendMessage { text: args.text })
            }
            "get_calendar_slots" => {
                let args: SlotArgs = decode_args(name, arguments)?;
                Ok(Self::GetCalendarSlots {
                    range_start: parse_bound(args.range_start)?,
                    range_end: parse_bound(args.range_end)?,
                })
            }
            "book_appointment" => {
                let args: BookArgs = decode_args(name, arguments)?;
                Ok(Self::BookAppointment { slot: args.slot, name: args.name, email: args.email })
            }
            "update_contact" => {
                let args: ContactArgs = decode_args(name, arguments)?;
                Ok(Self::UpdateContactRecord { tags: args.tags, notes: args.notes })
            }
            other => Err(PortError::Decode(format!("unknown capability `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// JSON-schema descriptions of every capability, in a stable order.
pub fn capability_specs() -> Vec<CapabilitySpec> {
    vec![
        CapabilitySpec {
            name: "extract_lead_info",
            description: "Extract name, business type, problem, goal, budget and email from the customer's message.",
            parameters: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }),
        },
        CapabilitySpec {
            name: "send_message",
            description: "Send the reply to the customer. Ends the turn.",
            parameters: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        },
        CapabilitySpec {
            name: "get_calendar_slots",
            description: "Fetch available appointment slots. Requires name, problem, goal, budget and email.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "range_start": { "type": "string", "description": "RFC 3339, defaults to now" },
                    "range_end": { "type": "string", "description": "RFC 3339, defaults to the configured horizon" }
                }
            }),
        },
        CapabilitySpec {
            name: "book_appointment",
            description: "Book one of the offered slots, by start time or by the customer's selection.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "slot": { "type": "string" },
                    "name": { "type": "string" },
                    "email": { "type": "string" }
                },
                "required": ["slot"]
            }),
        },
        CapabilitySpec {
            name: "update_contact",
            description: "Queue tags and a note on the CRM contact.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "notes": { "type": "string" }
                }
            }),
        },
    ]
}

/// Per-turn facts shared between the pipeline and capability calls.
#[derive(Clone, Debug, Default)]
pub struct TurnContext {
    pub correlation_id: String,
    pub extracted_this_turn: bool,
    /// Model decisions are not started or awaited past this instant.
    pub deadline: Option<Instant>,
}

impl TurnContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self { correlation_id: correlation_id.into(), extracted_this_turn: false, deadline: None }
    }

    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityEffect {
    Continue,
    Sent { text: String },
    SendFailed,
    Booked { slot: Slot },
    UnderBudget,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityOutcome {
    pub delta: StateDelta,
    pub ack: String,
    pub effect: CapabilityEffect,
}

impl CapabilityOutcome {
    fn ack(ack: impl Into<String>) -> Self {
        Self { delta: StateDelta::default(), ack: ack.into(), effect: CapabilityEffect::Continue }
    }
}

pub struct CapabilityExecutor {
    resolver: Arc<ExtractionResolver>,
    sender: Arc<dyn MessageSender>,
    scheduler: Arc<dyn Scheduler>,
    slot_cache: Arc<SlotCache>,
    contacts: ContactUpdateQueue,
    crm: Resilience,
    calendar: CalendarSettings,
    clock: SharedClock,
}

impl CapabilityExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<ExtractionResolver>,
        sender: Arc<dyn MessageSender>,
        scheduler: Arc<dyn Scheduler>,
        slot_cache: Arc<SlotCache>,
        contacts: ContactUpdateQueue,
        crm: Resilience,
        calendar: CalendarSettings,
        clock: SharedClock,
    ) -> Self {
        Self { resolver, sender, scheduler, slot_cache, contacts, crm, calendar, clock }
    }

    pub fn resolver(&self) -> &ExtractionResolver {
        &self.resolver
    }

    pub fn contacts(&self) -> &ContactUpdateQueue {
        &self.contacts
    }

    pub fn calendar(&self) -> &CalendarSettings {
        &self.calendar
    }

    pub async fn execute(
        &self,
        capability: &Capability,
        state: &ConversationState,
        ctx: &mut TurnContext,
    ) -> CapabilityOutcome {
        let outcome = match capability {
            Capability::ExtractLeadInfo { message } => self.extract(state, message, ctx).await,
            Capability::SendMessage { text } => self.send(state, text, ctx).await,
            Capability::GetCalendarSlots { range_start, range_end } => {
                self.calendar_slots(state, *range_start, *range_end).await
            }
            Capability::BookAppointment { slot, name, email } => {
                self.book(state, slot, name.as_deref(), email.as_deref(), ctx).await
            }
            Capability::UpdateContactRecord { tags, notes } => {
                self.update_contact(state, tags, notes.as_deref(), ctx)
            }
        };

        info!(
            event_name = "agent.capability.executed",
            correlation_id = %ctx.correlation_id,
            thread_id = %state.thread_id,
            capability = capability.name(),
            ack = %outcome.ack.lines().next().unwrap_or_default(),
            "capability executed"
        );
        outcome
    }

    /// Runs extraction for `message`, once per turn for the current message.
    pub async fn extract(
        &self,
        state: &ConversationState,
        message: &str,
        ctx: &mut TurnContext,
    ) -> CapabilityOutcome {
        let is_current = state
            .last_customer_message()
            .is_some_and(|current| normalize_message(&current.content) == normalize_message(message));
        if is_current && ctx.extracted_this_turn {
            return CapabilityOutcome::ack("Skipped");
        }

        let extraction = self.resolver.resolve(state, message, &ctx.correlation_id).await;
        if is_current {
            ctx.extracted_this_turn = true;
        }
        let ack = extraction.ack(&state.lead_info);

        let learned_budget =
            extraction.delta.budget.is_some() && extraction.delta.budget != state.lead_info.budget;
        if learned_budget {
            let merged = LeadInfo { budget: extraction.delta.budget, ..state.lead_info.clone() };
            let tags = qualification_tags(&merged, false, self.calendar.min_budget);
            self.contacts.queue(
                contact_update(&state.contact_id.0, &merged, tags, None, false),
                &ctx.correlation_id,
            );
        }

        CapabilityOutcome {
            delta: extraction.to_state_delta(),
            ack,
            effect: CapabilityEffect::Continue,
        }
    }

    /// Sends `text` to the customer and records it as the assistant's reply.
    pub async fn send(
        &self,
        state: &ConversationState,
        text: &str,
        ctx: &TurnContext,
    ) -> CapabilityOutcome {
        // A failed attempt may already have reached the customer.
        let sending = self.crm.without_retries();
        let result = sending
            .call(Dependency::Crm, "send_message", || {
                self.sender.send_message(&state.contact_id, &state.phone, text)
            })
            .await;

        match result {
            Ok(_) => CapabilityOutcome {
                delta: StateDelta {
                    messages: vec![ChatMessage::assistant(text, self.clock.now())],
                    turn_failed: Some(false),
                    ..StateDelta::default()
                },
                ack: "SentOK".to_string(),
                effect: CapabilityEffect::Sent { text: text.to_string() },
            },
            Err(error) => {
                warn!(
                    event_name = "agent.capability.send_failed",
                    correlation_id = %ctx.correlation_id,
                    thread_id = %state.thread_id,
                    error = %error,
                    "message send failed"
                );
                CapabilityOutcome {
                    delta: StateDelta { turn_failed: Some(true), ..StateDelta::default() },
                    ack: "SendFailed".to_string(),
                    effect: CapabilityEffect::SendFailed,
                }
            }
        }
    }

    async fn calendar_slots(
        &self,
        state: &ConversationState,
        range_start: Option<DateTime<Utc>>,
        range_end: Option<DateTime<Utc>>,
    ) -> CapabilityOutcome {
        let eligibility = check_eligibility(&state.lead_info, self.calendar.min_budget);
        if let Some(refusal) = eligibility.refusal() {
            let effect = match eligibility {
                Eligibility::UnderBudget { .. } => CapabilityEffect::UnderBudget,
                _ => CapabilityEffect::Continue,
            };
            return CapabilityOutcome { delta: StateDelta::default(), ack: refusal, effect };
        }

        let (default_start, default_end) = self.calendar.default_range(self.clock.now());
        let start = range_start.unwrap_or(default_start);
        let end = range_end.filter(|end| *end > start).unwrap_or(default_end);

        let lookup = self
            .slot_cache
            .get_or_refresh(start, end, |from, to| {
                self.crm.call(Dependency::Crm, "fetch_slots", move || self.scheduler.fetch_slots(from, to))
            })
            .await;
        let offered = offered_slots(lookup.slots, self.calendar.max_slots_shown);

        let mut ack = format!("Found {} available slots", offered.len());
        if !offered.is_empty() {
            ack.push('\n');
            ack.push_str(&format_slot_list(&offered, self.calendar.display_offset));
        }
        let shown = !offered.is_empty();
        CapabilityOutcome {
            delta: StateDelta { slots: Some(offered), calendar_shown: shown, ..StateDelta::default() },
            ack,
            effect: CapabilityEffect::Continue,
        }
    }

    async fn book(
        &self,
        state: &ConversationState,
        selection: &str,
        name: Option<&str>,
        email: Option<&str>,
        ctx: &TurnContext,
    ) -> CapabilityOutcome {
        if state.appointment_booked {
            return CapabilityOutcome::ack("Booking failed: appointment already booked");
        }
        let Some(slot) =
            resolve_selected_slot(selection, &state.available_slots, self.calendar.display_offset)
        else {
            return CapabilityOutcome::ack("Booking failed: slot was not offered");
        };
        let name = name.map(str::trim).filter(|name| !name.is_empty()).or(state.lead_info.name.as_deref());
        let email =
            email.map(str::trim).filter(|email| !email.is_empty()).or(state.lead_info.email.as_deref());
        let (Some(name), Some(email)) = (name, email) else {
            return CapabilityOutcome::ack("Booking failed: missing name or email");
        };

        let request = BookingRequest {
            contact_id: state.contact_id.0.clone(),
            slot: slot.clone(),
            name: name.to_string(),
            email: email.to_lowercase(),
            title: format!("Sales Call with {name}"),
        };
        let booking = self.crm.without_retries();
        match booking.call(Dependency::Crm, "book", || self.scheduler.book(&request)).await {
            Ok(confirmation) => {
                info!(
                    event_name = "agent.capability.booked",
                    correlation_id = %ctx.correlation_id,
                    thread_id = %state.thread_id,
                    appointment_id = %confirmation.appointment_id,
                    "appointment booked"
                );
                let description = describe_slot(&slot, self.calendar.display_offset);
                let mut tags = APPOINTMENT_BOOKED_TAGS.iter().map(|tag| tag.to_string()).collect::<Vec<_>>();
                tags.extend(qualification_tags(&state.lead_info, true, self.calendar.min_budget));
                self.contacts.queue(
                    contact_update(&state.contact_id.0, &state.lead_info, tags, Some(&description), true),
                    &ctx.correlation_id,
                );
                CapabilityOutcome {
                    delta: StateDelta {
                        appointment_booked: true,
                        booked_slot: Some(confirmation.slot),
                        termination: Some(TerminationReason::AppointmentBooked),
                        ..StateDelta::default()
                    },
                    ack: "BookedOK".to_string(),
                    effect: CapabilityEffect::Booked { slot },
                }
            }
            Err(error) => {
                warn!(
                    event_name = "agent.capability.booking_failed",
                    correlation_id = %ctx.correlation_id,
                    thread_id = %state.thread_id,
                    error = %error,
                    "booking failed"
                );
                CapabilityOutcome::ack("Booking failed: scheduling provider error")
            }
        }
    }

    fn update_contact(
        &self,
        state: &ConversationState,
        tags: &[String],
        notes: Option<&str>,
        ctx: &TurnContext,
    ) -> CapabilityOutcome {
        let mut update = contact_update(
            &state.contact_id.0,
            &state.lead_info,
            tags.to_vec(),
            None,
            notes.is_none(),
        );
        if let Some(notes) = notes.map(str::trim).filter(|notes| !notes.is_empty()) {
            update.notes.push(notes.to_string());
        }
        self.contacts.queue(update, &ctx.correlation_id);
        CapabilityOutcome::ack("UpdateQueued")
    }
}
