//! Detects conversations that have reached a natural end so later turns
//! skip extraction and capabilities entirely.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex};

use leadflow_core::domain::conversation::{ConversationState, TerminationReason};
use leadflow_core::domain::message::Role;
use regex::RegexSet;
use serde::Serialize;
use tracing::info;

pub const UNAVAILABLE_COPY: &str = "Sistema temporalmente no disponible. Intenta en unos minutos.";
pub const APOLOGY_COPY: &str =
    "Lo siento, hubo un error procesando tu mensaje. Por favor intenta de nuevo.";

static BOOKING_PHRASES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)cita.*confirmada",
        r"(?i)appointment.*booked",
        r"(?i)te esperamos",
        r"(?i)nos vemos el",
        r"(?i)agendada para",
    ])
    .expect("booking phrases compile")
});

static NURTURE_PHRASES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)presupuesto.*bajo",
        r"(?i)mucho éxito con tu negocio",
        r"(?i)estamos aquí.*futuro",
    ])
    .expect("nurture phrases compile")
});

static REJECTION_ACK_PHRASES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)entiendo que no.*interesa",
        r"(?i)gracias por tu tiempo",
        r"(?i)que tengas un excelente día",
    ])
    .expect("rejection acknowledgement phrases compile")
});

static USER_REJECTION: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)^(no|nope|no gracias|no thanks)$",
        r"(?i)\bno\b.*interesa",
        r"(?i)déjame.*pensarlo",
        r"(?i)luego.*hablamos",
        r"(?i)adiós|adios|bye|chao",
        r"(?i)cancelar",
        r"(?i)ya no quiero",
    ])
    .expect("user rejection phrases compile")
});

static CALENDAR_SELECTION: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^[1-5]$",
        r"(?i)opci[óo]n\s*[1-5]",
        r"(?i)la\s+(primera|segunda|tercera|cuarta|quinta)",
        r"(?i)el\s+(lunes|martes|miércoles|jueves|viernes|sábado|domingo)",
        r"(?i)a las \d+",
        r"(?i)mañana",
    ])
    .expect("calendar selection patterns compile")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationCheck {
    Continue,
    /// Slots were offered and the lead has not picked one yet.
    WaitingForSelection,
    Terminate(TerminationReason),
}

impl TerminationCheck {
    pub fn reason(&self) -> Option<TerminationReason> {
        match self {
            Self::Terminate(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TerminatorStats {
    pub terminated: u64,
    pub by_reason: BTreeMap<&'static str, u64>,
}

pub fn is_user_rejection(message: &str) -> bool {
    USER_REJECTION.is_match(message.trim())
}

pub fn is_calendar_selection(message: &str) -> bool {
    CALENDAR_SELECTION.is_match(message.trim())
}

pub struct Terminator {
    max_messages: usize,
    min_budget: u32,
    stats: Mutex<TerminatorStats>,
}

impl Terminator {
    pub fn new(max_messages: usize, min_budget: u32) -> Self {
        Self { max_messages, min_budget, stats: Mutex::new(TerminatorStats::default()) }
    }

    pub fn check(&self, state: &ConversationState) -> TerminationCheck {
        let verdict = self.classify(state);
        if let TerminationCheck::Terminate(reason) = verdict {
            if state.termination.is_none() || reason == TerminationReason::AppointmentBooked {
                self.record(state, reason);
            }
        }
        verdict
    }

    fn classify(&self, state: &ConversationState) -> TerminationCheck {
        if state.appointment_booked {
            return TerminationCheck::Terminate(TerminationReason::AppointmentBooked);
        }
        if let Some(reason) = state.termination {
            return TerminationCheck::Terminate(reason);
        }

        if let Some(last) = state.last_assistant_message() {
            let text = last.content.as_str();
            if BOOKING_PHRASES.is_match(text) {
                return TerminationCheck::Terminate(TerminationReason::AppointmentBooked);
            }
            if NURTURE_PHRASES.is_match(text) {
                return TerminationCheck::Terminate(TerminationReason::NurtureLead);
            }
            if REJECTION_ACK_PHRASES.is_match(text) {
                return TerminationCheck::Terminate(TerminationReason::NotInterested);
            }
        }

        if let Some(customer) = state.last_customer_message() {
            let text = customer.content.as_str();
            if !is_calendar_selection(text) && is_user_rejection(text) {
                return TerminationCheck::Terminate(TerminationReason::UserRejection);
            }
        }

        if state.calendar_shown {
            return TerminationCheck::WaitingForSelection;
        }

        let dialogue = state.messages.iter().filter(|message| message.role != Role::Tool).count();
        if dialogue > self.max_messages {
            return TerminationCheck::Terminate(TerminationReason::ConversationTooLong);
        }
        TerminationCheck::Continue
    }

    /// Fixed Spanish copy sent when a conversation ends for `reason`.
    pub fn terminal_copy(&self, reason: TerminationReason) -> String {
        match reason {
            TerminationReason::AppointmentBooked => "¡Perfecto! Tu cita está confirmada. Te enviaremos un recordatorio antes de la reunión. ¡Nos vemos pronto!".to_string(),
            TerminationReason::NurtureLead => format!(
                "Entiendo. Cuando tengas un presupuesto de ${}+ mensuales, estaremos aquí para ayudarte a crecer. ¡Mucho éxito!",
                self.min_budget
            ),
            TerminationReason::NotInterested => {
                "No hay problema. Si cambias de opinión, aquí estaremos. ¡Que tengas un excelente día!".to_string()
            }
            TerminationReason::ConversationTooLong => {
                "Parece que hemos cubierto bastante. Si tienes más preguntas, no dudes en escribirnos.".to_string()
            }
            TerminationReason::UserRejection => {
                "Entiendo perfectamente. Gracias por tu tiempo. ¡Mucho éxito con tu negocio!".to_string()
            }
            TerminationReason::ErrorState => UNAVAILABLE_COPY.to_string(),
        }
    }

    pub fn stats(&self) -> TerminatorStats {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn record(&self, state: &ConversationState, reason: TerminationReason) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.terminated += 1;
            *stats.by_reason.entry(reason.as_str()).or_default() += 1;
        }
        info!(
            event_name = "agent.terminator.terminated",
            correlation_id = "terminator",
            thread_id = %state.thread_id,
            reason = reason.as_str(),
            messages = state.messages.len(),
            "conversation reached a terminal state"
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use leadflow_core::domain::conversation::{
        ContactId, ConversationState, TerminationReason, ThreadId,
    };
    use leadflow_core::domain::message::ChatMessage;

    use super::{is_calendar_selection, is_user_rejection, TerminationCheck, Terminator};

    fn state(messages: &[(&str, &str)]) -> ConversationState {
        let now = Utc::now();
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

    #[test]
    fn booking_flag_always_terminates() {
        let mut booked = state(&[("customer", "hola")]);
        booked.appointment_booked = true;
        let terminator = Terminator::new(30, 300);

        assert_eq!(
            terminator.check(&booked),
            TerminationCheck::Terminate(TerminationReason::AppointmentBooked)
        );
        assert_eq!(terminator.stats().by_reason.get("appointment_booked"), Some(&1));
    }

    #[test]
    fn terminal_phrases_in_the_last_assistant_message() {
        let terminator = Terminator::new(30, 300);
        let cases = [
            ("Tu cita quedó confirmada para el lunes", TerminationReason::AppointmentBooked),
            ("Tu presupuesto es un poco bajo por ahora", TerminationReason::NurtureLead),
            ("Entiendo que no te interesa. Gracias.", TerminationReason::NotInterested),
        ];
        for (assistant, reason) in cases {
            let state = state(&[("assistant", assistant), ("customer", "ok")]);
            assert_eq!(terminator.check(&state), TerminationCheck::Terminate(reason), "{assistant}");
        }
        assert_eq!(terminator.stats().terminated, 3);
    }

    #[test]
    fn user_rejection_is_ignored_for_calendar_selections() {
        let terminator = Terminator::new(30, 300);
        let rejecting = state(&[("assistant", "¿Cuál es tu meta?"), ("customer", "no me interesa")]);
        assert_eq!(
            terminator.check(&rejecting),
            TerminationCheck::Terminate(TerminationReason::UserRejection)
        );

        let mut choosing =
            state(&[("assistant", "Elige un horario"), ("customer", "no, mejor el lunes a las 10")]);
        choosing.calendar_shown = true;
        assert_eq!(terminator.check(&choosing), TerminationCheck::WaitingForSelection);

        assert!(is_user_rejection("  No  "));
        assert!(is_user_rejection("déjame pensarlo bien"));
        assert!(!is_user_rejection("tengo una tienda"));
        assert!(is_calendar_selection("opcion 2"));
        assert!(!is_calendar_selection("7"));
    }

    #[test]
    fn long_conversations_hit_the_safety_valve_without_counting_tool_acks() {
        let terminator = Terminator::new(4, 300);
        let mut turns = vec![("customer", "a"), ("assistant", "b"), ("customer", "c"), ("assistant", "d")];
        turns.extend([("tool", "SentOK"), ("tool", "NoInfo")]);
        assert_eq!(terminator.check(&state(&turns)), TerminationCheck::Continue);

        turns.push(("customer", "e"));
        assert_eq!(
            terminator.check(&state(&turns)),
            TerminationCheck::Terminate(TerminationReason::ConversationTooLong)
        );
    }

    #[test]
    fn lead_choosing_a_slot_is_not_cut_off_as_too_long() {
        let terminator = Terminator::new(4, 300);
        let mut choosing = state(&[
            ("customer", "hola"),
            ("assistant", "¿Cuál es tu meta?"),
            ("customer", "crecer"),
            ("assistant", "Elige un horario"),
            ("customer", "la segunda"),
        ]);
        choosing.calendar_shown = true;

        assert_eq!(terminator.check(&choosing), TerminationCheck::WaitingForSelection);
        assert_eq!(terminator.stats().terminated, 0);
    }

    #[test]
    fn interest_inside_other_words_is_not_a_rejection() {
        let terminator = Terminator::new(30, 300);
        let interested = state(&[
            ("assistant", "¿A qué te dedicas?"),
            ("customer", "tengo un negocio y me interesa crecer"),
        ]);
        assert_eq!(terminator.check(&interested), TerminationCheck::Continue);

        assert!(!is_user_rejection("Tengo un negocio y me interesa crecer"));
        assert!(!is_user_rejection("el anuncio me interesa"));
        assert!(is_user_rejection("no me interesa"));
        assert!(is_user_rejection("No, ya no me interesa"));
    }

    #[test]
    fn recorded_termination_is_sticky_and_not_recounted() {
        let terminator = Terminator::new(30, 300);
        let mut ended = state(&[("customer", "quiero info")]);
        ended.termination = Some(TerminationReason::NurtureLead);

        assert_eq!(terminator.check(&ended).reason(), Some(TerminationReason::NurtureLead));
        assert_eq!(terminator.stats().terminated, 0);
    }

    #[test]
    fn terminal_copy_uses_the_configured_minimum() {
        let terminator = Terminator::new(30, 500);
        assert!(terminator.terminal_copy(TerminationReason::NurtureLead).contains("$500+"));
        assert_eq!(
            terminator.terminal_copy(TerminationReason::ErrorState),
            "Sistema temporalmente no disponible. Intenta en unos minutos."
        );
    }
}
