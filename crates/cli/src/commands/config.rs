use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadflow_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub value: String,
    pub source: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());
    let entries: Vec<ConfigEntry> = effective_values(&config)
        .into_iter()
        .map(|(key, value)| ConfigEntry {
            key,
            value,
            source: field_source(key, file_doc.as_ref(), file_path.as_deref()),
        })
        .collect();

    CommandResult::success_with(
        "config",
        "effective config (source precedence: env > file > default)",
        Some(json!({ "entries": entries })),
    )
}

/// Every reported key with its printable value. Secrets never leave here in
/// clear text.
fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    let qualification = &config.qualification;
    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("llm.provider", config.llm.provider.as_str().to_string()),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("llm.api_key", redact_optional(config.llm.api_key.as_ref())),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("crm.base_url", config.crm.base_url.clone()),
        ("crm.api_key", redact(&config.crm.api_key)),
        ("crm.location_id", config.crm.location_id.clone()),
        ("crm.calendar_id", config.crm.calendar_id.clone()),
        ("crm.api_version", config.crm.api_version.clone()),
        ("crm.webhook_secret", redact_optional(config.crm.webhook_secret.as_ref())),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("qualification.agent_name", qualification.agent_name.clone()),
        ("qualification.company_name", qualification.company_name.clone()),
        ("qualification.min_budget", qualification.min_budget.to_string()),
        ("qualification.max_messages", qualification.max_messages.to_string()),
        ("calendar.days_ahead", config.calendar.days_ahead.to_string()),
        (
            "calendar.display_utc_offset_minutes",
            config.calendar.display_utc_offset_minutes.to_string(),
        ),
        ("cache.enable_deduplication", config.cache.enable_deduplication.to_string()),
        ("resilience.enable_circuit_breaker", config.resilience.enable_circuit_breaker.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", config.logging.format.as_str().to_string()),
    ]
}

fn env_key(key_path: &str) -> String {
    format!("LEADFLOW_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("leadflow.toml"), PathBuf::from("config/leadflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(key_path: &str, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    let env_key = env_key(key_path);
    if env::var_os(&env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = file_doc {
        if contains_path(doc, key_path) {
            let file_path = file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact(secret: &SecretString) -> String {
    if secret.expose_secret().trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}

fn redact_optional(secret: Option<&SecretString>) -> String {
    secret.map(redact).unwrap_or_else(|| "<unset>".to_string())
}

#[cfg(test)]
mod tests {
    use leadflow_core::config::AppConfig;

    use super::{contains_path, effective_values, env_key};

    #[test]
    fn env_keys_follow_the_section_prefix() {
        assert_eq!(env_key("crm.api_key"), "LEADFLOW_CRM_API_KEY");
        assert_eq!(
            env_key("calendar.display_utc_offset_minutes"),
            "LEADFLOW_CALENDAR_DISPLAY_UTC_OFFSET_MINUTES"
        );
    }

    #[test]
    fn secrets_are_never_rendered() {
        let mut config = AppConfig::default();
        config.crm.api_key = "pit-very-secret".to_string().into();
        config.crm.webhook_secret = Some("hook-secret".to_string().into());

        let values = effective_values(&config);
        let value_of =
            |key: &str| values.iter().find(|(name, _)| *name == key).map(|(_, value)| value.clone());

        assert_eq!(value_of("crm.api_key").as_deref(), Some("<redacted>"));
        assert_eq!(value_of("crm.webhook_secret").as_deref(), Some("<redacted>"));
        assert_eq!(value_of("llm.api_key").as_deref(), Some("<unset>"));
        assert!(values.iter().all(|(_, value)| !value.contains("secret")));
    }

    #[test]
    fn nested_toml_paths_are_found() {
        let doc: toml::Value = "[crm]\nlocation_id = \"loc-1\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "crm.location_id"));
        assert!(!contains_path(&doc, "crm.calendar_id"));
    }
}
