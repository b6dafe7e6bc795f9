//! Pure merge functions for [`ConversationState`].
//!
//! Each field of the state has one named reducer. `apply_delta` folds a
//! [`StateDelta`] into a snapshot and returns a new snapshot; nothing here
//! mutates its inputs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::{ConversationState, TerminationReason};
use crate::domain::lead::{LeadField, LeadInfo};
use crate::domain::message::ChatMessage;
use crate::domain::slot::Slot;

/// Partial update produced by one step of a turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub lead: LeadInfo,
    pub messages: Vec<ChatMessage>,
    pub processed_hashes: BTreeSet<String>,
    pub extraction_increment: u32,
    pub slots: Option<Vec<Slot>>,
    pub calendar_shown: bool,
    pub appointment_booked: bool,
    pub booked_slot: Option<Slot>,
    pub termination: Option<TerminationReason>,
    pub turn_failed: Option<bool>,
}

impl StateDelta {
    pub fn with_lead(lead: LeadInfo) -> Self {
        Self { lead, ..Self::default() }
    }

    pub fn with_message(message: ChatMessage) -> Self {
        Self { messages: vec![message], ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Combines two deltas so that applying the result equals applying
    /// `self` then `later`.
    pub fn then(self, later: StateDelta) -> StateDelta {
        StateDelta {
            lead: merge_lead_info(&self.lead, &later.lead),
            messages: append_messages(&self.messages, &later.messages),
            processed_hashes: union_hashes(&self.processed_hashes, &later.processed_hashes),
            extraction_increment: self
                .extraction_increment
                .saturating_add(later.extraction_increment),
            slots: later.slots.or(self.slots),
            calendar_shown: self.calendar_shown || later.calendar_shown,
            appointment_booked: self.appointment_booked || later.appointment_booked,
            booked_slot: later.booked_slot.or(self.booked_slot),
            termination: merge_termination(self.termination, later.termination),
            turn_failed: later.turn_failed.or(self.turn_failed),
        }
    }
}

/// Non-null wins per field; absence never clears.
pub fn merge_lead_info(current: &LeadInfo, delta: &LeadInfo) -> LeadInfo {
    LeadInfo {
        name: merge_text(&current.name, &delta.name),
        business_type: merge_text(&current.business_type, &delta.business_type),
        problem: merge_text(&current.problem, &delta.problem),
        goal: merge_text(&current.goal, &delta.goal),
        budget: delta.budget.or(current.budget),
        email: merge_text(&current.email, &delta.email),
    }
}

fn merge_text(current: &Option<String>, delta: &Option<String>) -> Option<String> {
    match delta {
        Some(value) if !value.trim().is_empty() => Some(value.clone()),
        _ => current.clone(),
    }
}

/// Field names whose value differs between `before` and `after`.
pub fn changed_fields(before: &LeadInfo, after: &LeadInfo) -> Vec<LeadField> {
    LeadField::ALL
        .into_iter()
        .filter(|field| match field {
            LeadField::Name => before.name != after.name,
            LeadField::BusinessType => before.business_type != after.business_type,
            LeadField::Problem => before.problem != after.problem,
            LeadField::Goal => before.goal != after.goal,
            LeadField::Budget => before.budget != after.budget,
            LeadField::Email => before.email != after.email,
        })
        .collect()
}

pub fn append_messages(current: &[ChatMessage], new: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut merged = Vec::with_capacity(current.len() + new.len());
    merged.extend_from_slice(current);
    merged.extend_from_slice(new);
    merged
}

pub fn union_hashes(current: &BTreeSet<String>, new: &BTreeSet<String>) -> BTreeSet<String> {
    current.union(new).cloned().collect()
}

pub fn merge_extraction_count(current: u32, increment: u32, cap: u32) -> u32 {
    current.saturating_add(increment).min(cap.max(current))
}

/// Booking is terminal: once true it stays true.
pub fn merge_booked(current: bool, delta: bool) -> bool {
    current || delta
}

pub fn replace_slots(current: &[Slot], delta: Option<&[Slot]>) -> Vec<Slot> {
    delta.map(<[Slot]>::to_vec).unwrap_or_else(|| current.to_vec())
}

/// The first recorded termination reason is kept, except that a booking
/// always takes precedence.
pub fn merge_termination(
    current: Option<TerminationReason>,
    delta: Option<TerminationReason>,
) -> Option<TerminationReason> {
    match (current, delta) {
        (_, Some(TerminationReason::AppointmentBooked)) => {
            Some(TerminationReason::AppointmentBooked)
        }
        (Some(existing), _) => Some(existing),
        (None, next) => next,
    }
}

pub fn apply_delta(
    state: &ConversationState,
    delta: &StateDelta,
    extraction_cap: u32,
    now: DateTime<Utc>,
) -> ConversationState {
    let appointment_booked = merge_booked(state.appointment_booked, delta.appointment_booked);
    let mut termination = merge_termination(state.termination, delta.termination);
    if appointment_booked {
        termination = Some(TerminationReason::AppointmentBooked);
    }

    ConversationState {
        thread_id: state.thread_id.clone(),
        contact_id: state.contact_id.clone(),
        phone: state.phone.clone(),
        messages: append_messages(&state.messages, &delta.messages),
        lead_info: merge_lead_info(&state.lead_info, &delta.lead),
        extraction_count: merge_extraction_count(
            state.extraction_count,
            delta.extraction_increment,
            extraction_cap,
        ),
        processed_message_hashes: union_hashes(
            &state.processed_message_hashes,
            &delta.processed_hashes,
        ),
        available_slots: replace_slots(&state.available_slots, delta.slots.as_deref()),
        calendar_shown: state.calendar_shown || delta.calendar_shown,
        appointment_booked,
        booked_slot: delta.booked_slot.clone().or_else(|| state.booked_slot.clone()),
        termination,
        last_turn_failed: delta.turn_failed.unwrap_or(state.last_turn_failed),
        created_at: state.created_at,
        updated_at: now,
    }
}
