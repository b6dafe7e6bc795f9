use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn customer(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { role: Role::Customer, content: content.into(), timestamp }
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { role: Role::Assistant, content: content.into(), timestamp }
    }

    pub fn tool(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { role: Role::Tool, content: content.into(), timestamp }
    }
}

/// Trimmed, lowercased form used for hashing and canned-reply lookup.
pub fn normalize_message(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Stable content hash of a customer message, hex encoded.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize_message(text).as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::content_hash;

    #[test]
    fn content_hash_ignores_case_and_surrounding_whitespace() {
        assert_eq!(content_hash("  Quiero Vender Más "), content_hash("quiero vender más"));
        assert_ne!(content_hash("500"), content_hash("600"));
        assert_eq!(content_hash("hola").len(), 64);
    }
}
