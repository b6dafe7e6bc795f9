use serde::{Deserialize, Serialize};

use crate::domain::conversation::{ConversationState, TerminationReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStep {
    Greeting,
    GettingName,
    GettingProblem,
    GettingGoal,
    GettingBudget,
    GettingEmail,
    ShowingCalendar,
    Booking,
    Confirmed,
    Declined,
    Error,
}

impl ConversationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::GettingName => "getting_name",
            Self::GettingProblem => "getting_problem",
            Self::GettingGoal => "getting_goal",
            Self::GettingBudget => "getting_budget",
            Self::GettingEmail => "getting_email",
            Self::ShowingCalendar => "showing_calendar",
            Self::Booking => "booking",
            Self::Confirmed => "confirmed",
            Self::Declined => "declined",
            Self::Error => "error",
        }
    }
}

/// Recomputes the funnel position from the data alone. Nothing stores the
/// step authoritatively, so it cannot drift from `lead_info`.
pub fn derive_step(state: &ConversationState, min_budget: u32) -> ConversationStep {
    if state.appointment_booked {
        return ConversationStep::Confirmed;
    }
    match state.termination {
        Some(TerminationReason::ErrorState) => return ConversationStep::Error,
        Some(reason) if reason.is_decline() => return ConversationStep::Declined,
        _ => {}
    }
    if state.lead_info.is_under_budget(min_budget) {
        return ConversationStep::Declined;
    }
    if state.last_turn_failed {
        return ConversationStep::Error;
    }

    let lead = &state.lead_info;
    if lead.name.is_none() {
        if lead.is_empty() && !state.has_assistant_spoken() {
            return ConversationStep::Greeting;
        }
        return ConversationStep::GettingName;
    }
    if lead.problem.is_none() {
        return ConversationStep::GettingProblem;
    }
    if lead.goal.is_none() {
        return ConversationStep::GettingGoal;
    }
    if lead.budget.is_none() {
        return ConversationStep::GettingBudget;
    }
    if lead.email.is_none() {
        return ConversationStep::GettingEmail;
    }
    if state.calendar_shown && !state.available_slots.is_empty() {
        return ConversationStep::Booking;
    }
    ConversationStep::ShowingCalendar
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{derive_step, ConversationStep};
    use crate::domain::conversation::{ContactId, ConversationState, TerminationReason, ThreadId};
    use crate::domain::lead::LeadInfo;
    use crate::domain::message::ChatMessage;
    use crate::domain::slot::Slot;

    fn state() -> ConversationState {
        ConversationState::new(
            ThreadId("thread_C1".to_string()),
            ContactId("C1".to_string()),
            "+15550001111",
            Utc::now(),
        )
    }

    fn qualified_lead(budget: u32) -> LeadInfo {
        LeadInfo {
            name: Some("Ana".to_string()),
            business_type: Some("restaurante".to_string()),
            problem: Some("pocas reservas".to_string()),
            goal: Some("llenar el local".to_string()),
            budget: Some(budget),
            email: Some("ana@example.com".to_string()),
        }
    }

    #[test]
    fn empty_conversation_starts_at_greeting_then_asks_for_name() {
        let mut state = state();
        assert_eq!(derive_step(&state, 300), ConversationStep::Greeting);

        state.messages.push(ChatMessage::assistant("¡Hola! ¿Cómo te llamas?", Utc::now()));
        assert_eq!(derive_step(&state, 300), ConversationStep::GettingName);
    }

    #[test]
    fn step_follows_the_first_missing_field() {
        let mut state = state();
        state.lead_info = LeadInfo { name: Some("Ana".to_string()), ..LeadInfo::default() };
        assert_eq!(derive_step(&state, 300), ConversationStep::GettingProblem);

        state.lead_info.problem = Some("no tengo clientes".to_string());
        assert_eq!(derive_step(&state, 300), ConversationStep::GettingGoal);

        state.lead_info.goal = Some("crecer".to_string());
        assert_eq!(derive_step(&state, 300), ConversationStep::GettingBudget);

        state.lead_info.budget = Some(400);
        assert_eq!(derive_step(&state, 300), ConversationStep::GettingEmail);

        state.lead_info.email = Some("ana@example.com".to_string());
        assert_eq!(derive_step(&state, 300), ConversationStep::ShowingCalendar);
    }

    #[test]
    fn shown_slots_move_to_booking_and_a_booking_confirms() {
        let mut state = state();
        state.lead_info = qualified_lead(500);
        state.calendar_shown = true;
        let now = Utc::now();
        state.available_slots = vec![Slot { start: now, end: now }];
        assert_eq!(derive_step(&state, 300), ConversationStep::Booking);

        state.appointment_booked = true;
        assert_eq!(derive_step(&state, 300), ConversationStep::Confirmed);
    }

    #[test]
    fn under_budget_and_rejections_are_declined() {
        let mut under_budget = state();
        under_budget.lead_info = qualified_lead(250);
        assert_eq!(derive_step(&under_budget, 300), ConversationStep::Declined);

        let mut rejected = state();
        rejected.termination = Some(TerminationReason::UserRejection);
        assert_eq!(derive_step(&rejected, 300), ConversationStep::Declined);
    }

    #[test]
    fn failed_turn_surfaces_as_error_step() {
        let mut state = state();
        state.lead_info.name = Some("Ana".to_string());
        state.last_turn_failed = true;
        assert_eq!(derive_step(&state, 300), ConversationStep::Error);
    }
}
