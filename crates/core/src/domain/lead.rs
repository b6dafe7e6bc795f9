use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadField {
    Name,
    BusinessType,
    Problem,
    Goal,
    Budget,
    Email,
}

impl LeadField {
    pub const ALL: [LeadField; 6] = [
        LeadField::Name,
        LeadField::BusinessType,
        LeadField::Problem,
        LeadField::Goal,
        LeadField::Budget,
        LeadField::Email,
    ];

    /// Fields that must all be present before scheduling is offered.
    pub const REQUIRED_FOR_CALENDAR: [LeadField; 5] = [
        LeadField::Name,
        LeadField::Problem,
        LeadField::Goal,
        LeadField::Budget,
        LeadField::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::BusinessType => "businessType",
            Self::Problem => "problem",
            Self::Goal => "goal",
            Self::Budget => "budget",
            Self::Email => "email",
        }
    }

    /// Maps a loosely spelled key (`Business_Type`, `businesstype`, `leadEmail`)
    /// onto the fixed field set. Unknown keys yield `None`.
    pub fn from_key(key: &str) -> Option<Self> {
        let folded: String = key
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        let folded = folded.strip_prefix("lead").unwrap_or(&folded);

        match folded {
            "name" => Some(Self::Name),
            "businesstype" | "business" => Some(Self::BusinessType),
            "problem" => Some(Self::Problem),
            "goal" => Some(Self::Goal),
            "budget" => Some(Self::Budget),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// What is known about the lead. The same shape doubles as an extraction
/// delta, where `None` means "nothing new for this field".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadInfo {
    pub name: Option<String>,
    pub business_type: Option<String>,
    pub problem: Option<String>,
    pub goal: Option<String>,
    pub budget: Option<u32>,
    pub email: Option<String>,
}

impl LeadInfo {
    pub fn is_empty(&self) -> bool {
        LeadField::ALL.iter().all(|field| !self.has(*field))
    }

    pub fn has(&self, field: LeadField) -> bool {
        match field {
            LeadField::Name => self.name.is_some(),
            LeadField::BusinessType => self.business_type.is_some(),
            LeadField::Problem => self.problem.is_some(),
            LeadField::Goal => self.goal.is_some(),
            LeadField::Budget => self.budget.is_some(),
            LeadField::Email => self.email.is_some(),
        }
    }

    pub fn populated_fields(&self) -> Vec<LeadField> {
        LeadField::ALL.into_iter().filter(|field| self.has(*field)).collect()
    }

    pub fn missing_for_calendar(&self) -> Vec<LeadField> {
        LeadField::REQUIRED_FOR_CALENDAR.into_iter().filter(|field| !self.has(*field)).collect()
    }

    pub fn meets_budget(&self, min_budget: u32) -> bool {
        self.budget.is_some_and(|budget| budget >= min_budget)
    }

    pub fn is_under_budget(&self, min_budget: u32) -> bool {
        self.budget.is_some_and(|budget| budget < min_budget)
    }

    /// Sets a text field from an untrusted value. Blank strings are ignored so
    /// they can never clear knowledge through a later merge.
    pub fn set_text(&mut self, field: LeadField, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        let value = Some(trimmed.to_string());
        match field {
            LeadField::Name => self.name = value,
            LeadField::BusinessType => self.business_type = value,
            LeadField::Problem => self.problem = value,
            LeadField::Goal => self.goal = value,
            LeadField::Email => self.email = value.map(|email| email.to_lowercase()),
            LeadField::Budget => self.budget = parse_budget(trimmed),
        }
    }
}

/// Parses `$1,500`, `500.00` or `800 al mes` into whole currency units.
pub fn parse_budget(raw: &str) -> Option<u32> {
    let mut digits = String::new();
    let mut seen_digit = false;

    for ch in raw.trim().chars() {
        match ch {
            '0'..='9' => {
                digits.push(ch);
                seen_digit = true;
            }
            ',' | '$' | ' ' if !seen_digit || ch == ',' => {}
            '.' => break,
            _ if seen_digit => break,
            _ => {}
        }
    }

    digits.parse::<u32>().ok()
}
