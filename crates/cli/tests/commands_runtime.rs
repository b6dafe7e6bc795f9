use std::env;
use std::sync::{Mutex, OnceLock};

use leadflow_cli::commands::{config, doctor, migrate};
use serde_json::Value;

const VALID_ENV: &[(&str, &str)] = &[
    ("LEADFLOW_DATABASE_URL", "sqlite::memory:"),
    ("LEADFLOW_CRM_API_KEY", "pit-test-token"),
    ("LEADFLOW_CRM_LOCATION_ID", "loc-test"),
    ("LEADFLOW_CRM_CALENDAR_ID", "cal-test"),
];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(VALID_ENV, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        let applied = payload["data"]["applied_versions"].as_array().expect("applied versions");
        assert!(!applied.is_empty());
    });
}

#[test]
fn migrate_returns_config_failure_without_crm_credentials() {
    with_env(&[("LEADFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or_default().contains("crm.api_key"));
    });
}

#[test]
fn config_redacts_secrets_and_attributes_sources() {
    with_env(VALID_ENV, || {
        let result = config::run();
        assert_eq!(result.exit_code, 0);
        assert!(!result.output.contains("pit-test-token"));

        let payload = parse_payload(&result.output);
        let entries = payload["data"]["entries"].as_array().expect("entries");
        let entry = |key: &str| {
            entries.iter().find(|entry| entry["key"] == key).cloned().expect("entry present")
        };

        let api_key = entry("crm.api_key");
        assert_eq!(api_key["value"], "<redacted>");
        assert_eq!(api_key["source"], "env (LEADFLOW_CRM_API_KEY)");

        let location = entry("crm.location_id");
        assert_eq!(location["value"], "loc-test");

        let port = entry("server.port");
        assert_eq!(port["source"], "default");
    });
}

#[test]
fn config_fails_with_exit_code_two_when_invalid() {
    with_env(&[], || {
        let result = config::run();
        assert_eq!(result.exit_code, 2);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "config");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_passes_with_valid_env() {
    with_env(VALID_ENV, || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "expected doctor pass: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");
        let checks = payload["checks"].as_array().expect("checks");
        assert!(checks.iter().all(|check| check["status"] == "pass"));
        assert!(checks.iter().any(|check| check["name"] == "database_connectivity"));
    });
}

#[test]
fn doctor_flags_missing_crm_credentials() {
    with_env(&[("LEADFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        let checks = payload["checks"].as_array().expect("checks");
        let crm = checks
            .iter()
            .find(|check| check["name"] == "crm_credentials")
            .expect("crm check present");
        assert_eq!(crm["status"], "fail");
        let database = checks
            .iter()
            .find(|check| check["name"] == "database_connectivity")
            .expect("database check present");
        assert_eq!(database["status"], "skipped");
    });
}

#[test]
fn doctor_human_output_ends_with_json_outcome() {
    with_env(&[], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("- [fail] config_validation"));

        let payload = parse_payload(last_line(&result.output));
        assert_eq!(payload["command"], "doctor");
        assert_eq!(payload["status"], "error");
    });
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let previous_values: Vec<(String, String)> =
        env::vars().filter(|(key, _)| key.starts_with("LEADFLOW_")).collect();

    for (key, _) in &previous_values {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, _) in vars {
        env::remove_var(key);
    }
    for (key, value) in previous_values {
        env::set_var(key, value);
    }
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn last_line(output: &str) -> &str {
    output.lines().last().unwrap_or_default()
}
