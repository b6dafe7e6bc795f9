//! CRM contact tags, summary notes and the fire-and-forget update queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use leadflow_core::domain::lead::LeadInfo;
use leadflow_core::ports::{ContactRecorder, ContactUpdate};
use leadflow_core::resilience::{Dependency, Resilience};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const APPOINTMENT_BOOKED_TAGS: [&str; 2] = ["appointment-booked", "qualified-lead"];

/// Tags derived from what is known about the lead.
pub fn qualification_tags(lead: &LeadInfo, booked: bool, min_budget: u32) -> Vec<String> {
    let mut tags = Vec::new();
    if lead.meets_budget(min_budget) {
        tags.push("qualified-lead".to_string());
        tags.push(format!("budget-{min_budget}-plus"));
    } else if lead.is_under_budget(min_budget) {
        tags.push("under-budget".to_string());
        tags.push("nurture-lead".to_string());
    }

    if let Some(problem) = lead.problem.as_deref().map(str::to_lowercase) {
        if problem.contains("marketing") {
            tags.push("needs-marketing".to_string());
        }
        if problem.contains("sales") || problem.contains("ventas") {
            tags.push("needs-sales".to_string());
        }
    }

    if booked {
        tags.push("appointment-scheduled".to_string());
    }
    tags
}

pub fn summary_note(lead: &LeadInfo, appointment: Option<&str>) -> String {
    let or_missing = |value: Option<&String>| {
        value.map(String::as_str).unwrap_or("Not provided").to_string()
    };
    let budget = lead
        .budget
        .map(|budget| format!("${budget}/month"))
        .unwrap_or_else(|| "Not provided".to_string());

    [
        "Lead Qualification Summary:".to_string(),
        format!("Name: {}", or_missing(lead.name.as_ref())),
        format!("Business: {}", or_missing(lead.business_type.as_ref())),
        format!("Problem: {}", or_missing(lead.problem.as_ref())),
        format!("Goal: {}", or_missing(lead.goal.as_ref())),
        format!("Budget: {budget}"),
        format!("Email: {}", or_missing(lead.email.as_ref())),
        format!("Appointment: {}", appointment.unwrap_or("Not scheduled")),
    ]
    .join("\n")
}

pub fn custom_fields(lead: &LeadInfo) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    if let Some(budget) = lead.budget {
        fields.insert("budget".to_string(), budget.to_string());
    }
    for (key, value) in [
        ("problem", &lead.problem),
        ("goal", &lead.goal),
        ("business_type", &lead.business_type),
    ] {
        if let Some(value) = value {
            fields.insert(key.to_string(), value.clone());
        }
    }
    fields
}

/// Full contact update: tags plus custom fields, with the summary note when
/// `with_note` is set.
pub fn contact_update(
    contact_id: &str,
    lead: &LeadInfo,
    tags: Vec<String>,
    appointment: Option<&str>,
    with_note: bool,
) -> ContactUpdate {
    let mut unique = Vec::with_capacity(tags.len());
    for tag in tags {
        if !unique.contains(&tag) {
            unique.push(tag);
        }
    }
    ContactUpdate {
        contact_id: contact_id.to_string(),
        tags: unique,
        notes: if with_note { vec![summary_note(lead, appointment)] } else { Vec::new() },
        custom_fields: custom_fields(lead),
    }
}

/// Spawns contact updates in the background. Failures are logged and never
/// reach the turn that queued them.
#[derive(Clone)]
pub struct ContactUpdateQueue {
    recorder: Arc<dyn ContactRecorder>,
    resilience: Resilience,
}

impl ContactUpdateQueue {
    pub fn new(recorder: Arc<dyn ContactRecorder>, resilience: Resilience) -> Self {
        Self { recorder, resilience }
    }

    pub fn queue(&self, update: ContactUpdate, correlation_id: &str) -> JoinHandle<()> {
        let recorder = self.recorder.clone();
        let resilience = self.resilience.clone();
        let correlation_id = correlation_id.to_string();

        tokio::spawn(async move {
            let result = resilience
                .call(Dependency::Crm, "update_contact", || recorder.update_contact(&update))
                .await;
            match result {
                Ok(()) => debug!(
                    event_name = "agent.contact_update.applied",
                    correlation_id = %correlation_id,
                    contact_id = %update.contact_id,
                    tags = update.tags.len(),
                    "contact update applied"
                ),
                Err(error) => warn!(
                    event_name = "agent.contact_update.failed",
                    correlation_id = %correlation_id,
                    contact_id = %update.contact_id,
                    error = %error,
                    "contact update failed"
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use leadflow_core::clock::ManualClock;
    use leadflow_core::domain::lead::LeadInfo;
    use leadflow_core::ports::{ContactRecorder, ContactUpdate, PortError};
    use leadflow_core::resilience::{BreakerRegistry, CircuitBreakerConfig, Resilience, RetryPolicy};

    use super::{contact_update, qualification_tags, summary_note, ContactUpdateQueue};

    fn lead(budget: u32, problem: &str) -> LeadInfo {
        LeadInfo {
            name: Some("Ana".to_string()),
            business_type: Some("restaurante".to_string()),
            problem: Some(problem.to_string()),
            goal: None,
            budget: Some(budget),
            email: Some("ana@example.com".to_string()),
        }
    }

    #[derive(Default)]
    struct RecordingContacts {
        updates: Mutex<Vec<ContactUpdate>>,
        fail: bool,
    }

    #[async_trait]
    impl ContactRecorder for RecordingContacts {
        async fn update_contact(&self, update: &ContactUpdate) -> Result<(), PortError> {
            if self.fail {
                return Err(PortError::Rejected("contact not found".to_string()));
            }
            self.updates.lock().expect("updates lock").push(update.clone());
            Ok(())
        }
    }

    fn resilience() -> Resilience {
        let breakers = Arc::new(BreakerRegistry::new(
            CircuitBreakerConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        Resilience::new(breakers, RetryPolicy::none(), Duration::from_secs(1))
    }

    #[test]
    fn tags_follow_budget_problem_and_booking() {
        assert_eq!(
            qualification_tags(&lead(500, "Poco marketing y pocas ventas"), true, 300),
            vec!["qualified-lead", "budget-300-plus", "needs-marketing", "needs-sales", "appointment-scheduled"]
        );
        assert_eq!(
            qualification_tags(&lead(200, "no tengo clientes"), false, 300),
            vec!["under-budget", "nurture-lead"]
        );
        assert!(qualification_tags(&LeadInfo::default(), false, 300).is_empty());
    }

    #[test]
    fn summary_note_lists_every_field() {
        let note = summary_note(&lead(450, "pocas reservas"), Some("Lunes 2 de marzo a las 10:00 AM"));
        assert_eq!(
            note,
            "Lead Qualification Summary:\nName: Ana\nBusiness: restaurante\nProblem: pocas reservas\nGoal: Not provided\nBudget: $450/month\nEmail: ana@example.com\nAppointment: Lunes 2 de marzo a las 10:00 AM"
        );
    }

    #[test]
    fn contact_update_dedups_tags_and_carries_custom_fields() {
        let update = contact_update(
            "C1",
            &lead(450, "pocas reservas"),
            vec!["qualified-lead".to_string(), "qualified-lead".to_string()],
            None,
            false,
        );
        assert_eq!(update.tags, vec!["qualified-lead"]);
        assert!(update.notes.is_empty());
        assert_eq!(update.custom_fields.get("budget").map(String::as_str), Some("450"));
        assert_eq!(update.custom_fields.get("business_type").map(String::as_str), Some("restaurante"));
        assert!(!update.custom_fields.contains_key("goal"));
    }

    #[tokio::test]
    async fn queued_updates_run_in_the_background_and_swallow_failures() {
        let recorder = Arc::new(RecordingContacts::default());
        let queue = ContactUpdateQueue::new(recorder.clone(), resilience());
        let update = contact_update("C1", &lead(450, "x"), vec!["qualified-lead".to_string()], None, true);

        queue.queue(update.clone(), "req-1").await.expect("task joins");
        assert_eq!(recorder.updates.lock().expect("updates lock").as_slice(), &[update.clone()]);

        let failing = Arc::new(RecordingContacts { fail: true, ..RecordingContacts::default() });
        let queue = ContactUpdateQueue::new(failing, resilience());
        queue.queue(update, "req-2").await.expect("failure does not panic the task");
    }
}
