//! Resolution of bare confirmations ("sí", "claro", "correct") against the
//! previous assistant message.
//!
//! This is a keyword heuristic over the *text* of the prior question. A
//! paraphrased question can defeat it, so it only ever resolves fields it can
//! read back verbatim from that text and returns an empty delta otherwise.

use std::sync::LazyLock;

use leadflow_core::domain::lead::{parse_budget, LeadInfo};
use regex::Regex;

static CONFIRMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(si|sí|yes|si\.|sí\.|claro|por supuesto|correcto|exacto|eso es|sure|correct)$")
        .expect("confirmation pattern compiles")
});

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$?\d{1,3}(?:,\d{3})+|\$?\d+").expect("amount pattern compiles")
});

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.-]+@[\w.-]+\.\w+").expect("email pattern compiles"));

static NAME_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"¿(?i:te llamas|eres|tu nombre es)\s+([A-ZÁÉÍÓÚÑ][a-záéíóúñ]+)")
        .expect("name question pattern compiles")
});

static NAME_TAG_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"¿([A-ZÁÉÍÓÚÑ][a-záéíóúñ]+),?\s+(?:eres tú|verdad)")
        .expect("name tag pattern compiles")
});

pub const BUDGET_CUES: [&str; 10] = [
    "presupuesto",
    "budget",
    "mensual",
    "mensuales",
    "al mes",
    "por mes",
    "invertir",
    "monthly",
    "per month",
    "a month",
];

const EMAIL_CUES: [&str; 3] = ["email", "correo", "@"];
const NAME_CUES: [&str; 4] = ["llamas", "nombre", "eres", "name"];
const BUSINESS_CUES: [&str; 3] = ["negocio", "tienes", "business"];
const BUSINESS_TYPES: [&str; 7] =
    ["restaurante", "tienda", "salón", "clínica", "consultorio", "spa", "gym"];

pub fn is_confirmation(message: &str) -> bool {
    CONFIRMATION.is_match(message.trim())
}

pub fn mentions_budget(text: &str) -> bool {
    contains_any(&text.to_lowercase(), &BUDGET_CUES)
}

/// `None` when `message` is not a bare confirmation. Otherwise the fields the
/// prior assistant message lets us read back, possibly none.
pub fn resolve_confirmation(message: &str, prior_assistant: Option<&str>) -> Option<LeadInfo> {
    if !is_confirmation(message) {
        return None;
    }
    let Some(prior) = prior_assistant else {
        return Some(LeadInfo::default());
    };
    let lowered = prior.to_lowercase();
    let mut delta = LeadInfo::default();

    if contains_any(&lowered, &BUDGET_CUES) {
        delta.budget = AMOUNT.find_iter(prior).filter_map(|found| parse_budget(found.as_str())).max();
    }

    if contains_any(&lowered, &EMAIL_CUES) {
        delta.email = EMAIL.find(prior).map(|found| found.as_str().to_lowercase());
    }

    if contains_any(&lowered, &NAME_CUES) {
        delta.name = NAME_QUESTION
            .captures(prior)
            .or_else(|| NAME_TAG_QUESTION.captures(prior))
            .and_then(|captures| captures.get(1))
            .map(|name| name.as_str().to_string());
    }

    if contains_any(&lowered, &BUSINESS_CUES) {
        delta.business_type = BUSINESS_TYPES
            .iter()
            .find(|business| lowered.contains(*business))
            .map(|business| (*business).to_string());
    }

    Some(delta)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
