//! HTTP client for the CRM platform. One client implements every CRM-backed
//! port: conversation history, message delivery, calendar and contact records.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use leadflow_agent::calendar::slot_from_provider;
use leadflow_core::config::CrmConfig;
use leadflow_core::domain::conversation::ContactId;
use leadflow_core::domain::lead::{LeadField, LeadInfo};
use leadflow_core::domain::message::ChatMessage;
use leadflow_core::domain::slot::{BookingConfirmation, BookingRequest, Slot};
use leadflow_core::ports::{
    ContactRecorder, ContactUpdate, ConversationHistory, HistorySnapshot, MessageSender,
    PortError, Scheduler, SendReceipt,
};
use reqwest::{Client, Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

const MESSAGE_TYPE: &str = "SMS";
const HISTORY_LIMIT: &str = "100";
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Clone)]
pub struct CrmClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
    api_version: String,
    location_id: String,
    calendar_id: String,
    slot_duration_minutes: u32,
}

impl CrmClient {
    pub fn new(config: &CrmConfig, slot_duration_minutes: u32) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            location_id: config.location_id.clone(),
            calendar_id: config.calendar_id.clone(),
            slot_duration_minutes,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Version", self.api_version.as_str())
            .header("Accept", "application/json")
    }

    async fn execute(&self, operation: &'static str, request: RequestBuilder) -> Result<Value, PortError> {
        let response = request
            .send()
            .await
            .map_err(|error| PortError::Transport(format!("{operation}: {error}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| PortError::Transport(format!("{operation}: {error}")))?;

        if !status.is_success() {
            debug!(
                event_name = "server.crm.status",
                correlation_id = "crm",
                operation,
                status = status.as_u16(),
                "crm request returned an error status"
            );
            return Err(PortError::Status { status: status.as_u16(), message: truncated(&body) });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|error| PortError::Decode(format!("{operation}: {error}")))
    }

    async fn find_conversation_id(&self, contact_id: &ContactId) -> Result<Option<String>, PortError> {
        let request = self.request(Method::GET, "/conversations/search").query(&[
            ("locationId", self.location_id.as_str()),
            ("contactId", contact_id.0.as_str()),
            ("limit", "10"),
        ]);
        let payload = self.execute("search_conversations", request).await?;
        Ok(pick_conversation(&payload))
    }

    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, PortError> {
        let request = self
            .request(Method::GET, &format!("/conversations/{conversation_id}/messages"))
            .query(&[("limit", HISTORY_LIMIT)]);
        let payload = self.execute("conversation_messages", request).await?;
        Ok(messages_from_payload(&payload))
    }

    async fn contact_lead(&self, contact_id: &ContactId) -> Result<LeadInfo, PortError> {
        let request = self.request(Method::GET, &format!("/contacts/{}", contact_id.0));
        let payload = self.execute("get_contact", request).await?;
        Ok(lead_from_contact(payload.get("contact").unwrap_or(&payload)))
    }
}

#[async_trait]
impl ConversationHistory for CrmClient {
    async fn conversation_state(
        &self,
        contact_id: &ContactId,
        conversation_id: Option<&str>,
        _phone: &str,
    ) -> Result<HistorySnapshot, PortError> {
        let conversation_id = match conversation_id {
            Some(id) => Some(id.to_string()),
            None => self.find_conversation_id(contact_id).await?,
        };
        let messages = match conversation_id.as_deref() {
            Some(id) => self.conversation_messages(id).await?,
            None => Vec::new(),
        };
        let lead_info = self.contact_lead(contact_id).await?;

        Ok(HistorySnapshot { messages, lead_info })
    }
}

#[async_trait]
impl MessageSender for CrmClient {
    async fn send_message(
        &self,
        contact_id: &ContactId,
        _phone: &str,
        text: &str,
    ) -> Result<SendReceipt, PortError> {
        let request = self.request(Method::POST, "/conversations/messages").json(&json!({
            "type": MESSAGE_TYPE,
            "locationId": self.location_id,
            "contactId": contact_id.0,
            "message": text,
        }));
        let payload = self.execute("send_message", request).await?;

        Ok(SendReceipt { message_id: string_at(&payload, &["messageId", "id"]) })
    }
}

#[async_trait]
impl Scheduler for CrmClient {
    async fn fetch_slots(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<Slot>, PortError> {
        let start = range_start.timestamp_millis().to_string();
        let end = range_end.timestamp_millis().to_string();
        let request = self
            .request(Method::GET, &format!("/calendars/{}/free-slots", self.calendar_id))
            .query(&[("startDate", start.as_str()), ("endDate", end.as_str())]);
        let payload = self.execute("free_slots", request).await?;

        Ok(slots_from_payload(&payload, self.slot_duration_minutes))
    }

    async fn book(&self, request: &BookingRequest) -> Result<BookingConfirmation, PortError> {
        let body = json!({
            "calendarId": self.calendar_id,
            "locationId": self.location_id,
            "contactId": request.contact_id,
            "title": request.title,
            "appointmentStatus": "confirmed",
            "startTime": request.slot.start.to_rfc3339(),
            "endTime": request.slot.end.to_rfc3339(),
            "toNotify": true,
        });
        let payload = self
            .execute("book_appointment", self.request(Method::POST, "/calendars/events/appointments").json(&body))
            .await?;

        let appointment = payload.get("appointment").unwrap_or(&payload);
        let appointment_id = string_at(appointment, &["id", "appointmentId"])
            .ok_or_else(|| PortError::Decode("booking response has no appointment id".to_string()))?;

        Ok(BookingConfirmation { appointment_id, slot: request.slot.clone() })
    }
}

#[async_trait]
impl ContactRecorder for CrmClient {
    async fn update_contact(&self, update: &ContactUpdate) -> Result<(), PortError> {
        let contact_path = format!("/contacts/{}", update.contact_id);

        if !update.custom_fields.is_empty() {
            let custom_fields: Vec<Value> = update
                .custom_fields
                .iter()
                .map(|(key, value)| json!({ "key": key, "field_value": value }))
                .collect();
            let request = self
                .request(Method::PUT, &contact_path)
                .json(&json!({ "customFields": custom_fields }));
            self.execute("update_contact", request).await?;
        }

        if !update.tags.is_empty() {
            let request = self
                .request(Method::POST, &format!("{contact_path}/tags"))
                .json(&json!({ "tags": update.tags }));
            self.execute("add_tags", request).await?;
        }

        for note in &update.notes {
            let request = self
                .request(Method::POST, &format!("{contact_path}/notes"))
                .json(&json!({ "body": note }));
            self.execute("add_note", request).await?;
        }

        Ok(())
    }
}

fn truncated(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

fn string_at(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|found| match found {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
}

/// The open conversation when there is one, else the first listed.
fn pick_conversation(payload: &Value) -> Option<String> {
    let conversations = payload.get("conversations")?.as_array()?;
    let is_open = |conversation: &&Value| {
        matches!(
            conversation.get("status").and_then(Value::as_str),
            Some("open") | Some("active")
        )
    };

    conversations
        .iter()
        .find(is_open)
        .or_else(|| conversations.first())
        .and_then(|conversation| string_at(conversation, &["id"]))
}

/// Inbound messages become customer turns and outbound ones assistant turns,
/// oldest first. Messages without text are dropped.
fn messages_from_payload(payload: &Value) -> Vec<ChatMessage> {
    let raw = match payload.get("messages") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(nested) => nested.get("messages").and_then(Value::as_array).map_or(&[][..], Vec::as_slice),
        None => &[][..],
    };

    let mut messages: Vec<ChatMessage> = raw
        .iter()
        .filter_map(|item| {
            let content = ["body", "message", "text"]
                .iter()
                .filter_map(|key| item.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .find(|text| !text.is_empty())?;
            let timestamp = item
                .get("dateAdded")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|parsed| parsed.with_timezone(&Utc))
                .unwrap_or_default();
            let direction = item
                .get("direction")
                .or_else(|| item.get("type"))
                .and_then(Value::as_str)?;

            match direction {
                "inbound" => Some(ChatMessage::customer(content, timestamp)),
                "outbound" => Some(ChatMessage::assistant(content, timestamp)),
                _ => None,
            }
        })
        .collect();

    messages.sort_by_key(|message| message.timestamp);
    messages
}

/// Lead fields stored on the contact record, both as a keyed object and as
/// the platform's `[{key, value}]` list.
fn lead_from_contact(contact: &Value) -> LeadInfo {
    let mut lead = LeadInfo::default();
    if let Some(name) = string_at(contact, &["firstName", "name"]) {
        lead.set_text(LeadField::Name, &name);
    }
    if let Some(email) = string_at(contact, &["email"]) {
        lead.set_text(LeadField::Email, &email);
    }

    let mut apply = |key: &str, value: &Value| {
        let Some(field) = LeadField::from_key(key) else {
            return;
        };
        if matches!(field, LeadField::Name | LeadField::Email) {
            return;
        }
        match value {
            Value::String(text) => lead.set_text(field, text),
            Value::Number(number) => lead.set_text(field, &number.to_string()),
            _ => {}
        }
    };

    match contact.get("customFields") {
        Some(Value::Object(fields)) => {
            for (key, value) in fields {
                apply(key, value);
            }
        }
        Some(Value::Array(fields)) => {
            for field in fields {
                let key = string_at(field, &["key", "name", "id"]);
                let value = field.get("value").or_else(|| field.get("field_value"));
                if let (Some(key), Some(value)) = (key, value) {
                    apply(&key, value);
                }
            }
        }
        _ => {}
    }

    lead
}

/// Free slots arrive keyed by date, each day holding a `slots` list of start
/// times or `{startTime, endTime}` objects.
fn slots_from_payload(payload: &Value, duration_minutes: u32) -> Vec<Slot> {
    let days = payload.get("data").filter(|data| data.is_object()).unwrap_or(payload);
    let Some(days) = days.as_object() else {
        return Vec::new();
    };

    let mut slots = Vec::new();
    let mut skipped = 0_usize;
    for day in days.values() {
        let Some(entries) = day.get("slots").and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let (start, end) = match entry {
                Value::String(start) => (Some(start.as_str()), None),
                Value::Object(_) => (
                    entry.get("startTime").or_else(|| entry.get("start")).and_then(Value::as_str),
                    entry.get("endTime").or_else(|| entry.get("end")).and_then(Value::as_str),
                ),
                _ => (None, None),
            };
            match start.and_then(parse_instant) {
                Some(start) => {
                    slots.push(slot_from_provider(start, end.and_then(parse_instant), duration_minutes))
                }
                None => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        warn!(
            event_name = "server.crm.slots_skipped",
            correlation_id = "crm",
            skipped,
            "free-slot entries without a readable start time were skipped"
        );
    }
    slots.sort_by_key(|slot| slot.start);
    slots
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>().ok().and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}
