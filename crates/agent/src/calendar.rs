//! Slot eligibility, Spanish slot presentation and customer time selection.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Timelike, Utc, Weekday};
use leadflow_core::domain::lead::{LeadField, LeadInfo};
use leadflow_core::domain::slot::Slot;
use regex::Regex;

static SLOT_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)([1-5])(?:\D|$)").expect("slot number pattern compiles"));

const ORDINALS: [(&[&str], usize); 5] = [
    (&["primer", "first", "1st"], 0),
    (&["segund", "second", "2nd"], 1),
    (&["tercer", "third", "3rd"], 2),
    (&["cuart", "fourth", "4th"], 3),
    (&["quint", "fifth", "5th"], 4),
];

#[derive(Clone, Debug)]
pub struct CalendarSettings {
    pub min_budget: u32,
    pub days_ahead: u32,
    pub max_slots_shown: usize,
    pub slot_duration_minutes: u32,
    pub display_offset: FixedOffset,
}

impl CalendarSettings {
    pub fn display_offset_from_minutes(minutes: i32) -> FixedOffset {
        FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
    }

    /// `now .. now + days_ahead`.
    pub fn default_range(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now, now + Duration::days(i64::from(self.days_ahead)))
    }
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            min_budget: 300,
            days_ahead: 7,
            max_slots_shown: 5,
            slot_duration_minutes: 30,
            display_offset: Self::display_offset_from_minutes(-360),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    UnderBudget { min_budget: u32 },
    MissingFields(Vec<LeadField>),
}

impl Eligibility {
    /// Refusal acknowledgement, `None` when slots may be fetched.
    pub fn refusal(&self) -> Option<String> {
        match self {
            Self::Eligible => None,
            Self::UnderBudget { min_budget } => {
                Some(format!("Cannot fetch slots - budget under ${min_budget}/month"))
            }
            Self::MissingFields(fields) => {
                let names = fields.iter().map(LeadField::as_str).collect::<Vec<_>>();
                Some(format!("Missing required information for calendar: {}", names.join(", ")))
            }
        }
    }
}

/// An under-budget lead is refused as such even while other fields are
/// still missing.
pub fn check_eligibility(lead: &LeadInfo, min_budget: u32) -> Eligibility {
    if lead.is_under_budget(min_budget) {
        return Eligibility::UnderBudget { min_budget };
    }
    let missing = lead.missing_for_calendar();
    if missing.is_empty() {
        Eligibility::Eligible
    } else {
        Eligibility::MissingFields(missing)
    }
}

/// Builds a slot from provider data, defaulting the end when it is missing
/// or not after the start.
pub fn slot_from_provider(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    duration_minutes: u32,
) -> Slot {
    let end = end
        .filter(|end| *end > start)
        .unwrap_or_else(|| start + Duration::minutes(i64::from(duration_minutes)));
    Slot { start, end }
}

/// First `max` slots in chronological order.
pub fn offered_slots(mut slots: Vec<Slot>, max: usize) -> Vec<Slot> {
    slots.sort_by_key(|slot| slot.start);
    slots.dedup();
    slots.truncate(max);
    slots
}

fn spanish_weekday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Lunes",
        Weekday::Tue => "Martes",
        Weekday::Wed => "Miércoles",
        Weekday::Thu => "Jueves",
        Weekday::Fri => "Viernes",
        Weekday::Sat => "Sábado",
        Weekday::Sun => "Domingo",
    }
}

fn spanish_month(month: u32) -> &'static str {
    match month {
        1 => "enero",
        2 => "febrero",
        3 => "marzo",
        4 => "abril",
        5 => "mayo",
        6 => "junio",
        7 => "julio",
        8 => "agosto",
        9 => "septiembre",
        10 => "octubre",
        11 => "noviembre",
        _ => "diciembre",
    }
}

/// `Lunes 2 de marzo a las 10:00 AM`
pub fn describe_slot(slot: &Slot, offset: FixedOffset) -> String {
    let local = slot.start.with_timezone(&offset);
    let (is_pm, hour) = local.hour12();
    format!(
        "{} {} de {} a las {}:{:02} {}",
        spanish_weekday(local.weekday()),
        local.day(),
        spanish_month(local.month()),
        hour,
        local.minute(),
        if is_pm { "PM" } else { "AM" }
    )
}

pub fn format_slot_list(slots: &[Slot], offset: FixedOffset) -> String {
    slots
        .iter()
        .enumerate()
        .map(|(index, slot)| format!("{}. {}", index + 1, describe_slot(slot, offset)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn weekday_mentioned(input: &str) -> Option<Weekday> {
    const NAMES: [(&str, Weekday); 16] = [
        ("lunes", Weekday::Mon),
        ("martes", Weekday::Tue),
        ("miércoles", Weekday::Wed),
        ("miercoles", Weekday::Wed),
        ("jueves", Weekday::Thu),
        ("viernes", Weekday::Fri),
        ("sábado", Weekday::Sat),
        ("sabado", Weekday::Sat),
        ("domingo", Weekday::Sun),
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    NAMES.iter().find(|(name, _)| input.contains(name)).map(|(_, weekday)| *weekday)
}

/// Index into `slots` of the customer's choice, or `None` when unclear.
pub fn parse_time_selection(input: &str, slots: &[Slot], offset: FixedOffset) -> Option<usize> {
    let input = input.trim().to_lowercase();
    let within = |index: usize| (index < slots.len()).then_some(index);

    if let Some(found) = SLOT_NUMBER.captures(&input).and_then(|captures| captures.get(1)) {
        if let Ok(number) = found.as_str().parse::<usize>() {
            return within(number - 1);
        }
    }

    if let Some((_, index)) =
        ORDINALS.iter().find(|(words, _)| words.iter().any(|word| input.contains(word)))
    {
        return within(*index);
    }

    let weekday = weekday_mentioned(&input)?;
    let mut matching = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.start.with_timezone(&offset).weekday() == weekday);
    match (matching.next(), matching.next()) {
        (Some((index, _)), None) => Some(index),
        _ => None,
    }
}

/// Resolves a booking argument against the offered slots: an RFC 3339 start
/// time first, then free-text selection.
pub fn resolve_selected_slot(selection: &str, slots: &[Slot], offset: FixedOffset) -> Option<Slot> {
    if let Ok(start) = DateTime::parse_from_rfc3339(selection.trim()) {
        let start = start.with_timezone(&Utc);
        return slots.iter().find(|slot| slot.start == start).cloned();
    }
    parse_time_selection(selection, slots, offset).and_then(|index| slots.get(index).cloned())
}
