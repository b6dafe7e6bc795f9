use leadflow_core::config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
use leadflow_db::{connect_with_settings, ping};
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::commands::{current_thread_runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    command: &'static str,
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"command\":\"doctor\",\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        let outcome = if exit_code == 0 {
            CommandResult::success("doctor", report.summary.clone())
        } else {
            CommandResult::failure("doctor", "readiness", report.summary.clone(), exit_code)
        };
        format!("{}\n{}", render_human(&report), outcome.output)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_crm_credentials(&config));
            checks.push(check_llm_endpoint(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(crm_check_from_error(&error));
            for name in ["llm_endpoint", "database_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { command: "doctor", overall_status, summary, checks }
}

fn check_crm_credentials(config: &AppConfig) -> DoctorCheck {
    let webhook = if config.crm.webhook_secret.is_some() {
        "webhook secret set"
    } else {
        "webhook secret not set; inbound webhooks are unauthenticated"
    };
    DoctorCheck {
        name: "crm_credentials",
        status: CheckStatus::Pass,
        details: format!(
            "api key present for location `{}`, calendar `{}`; {webhook}",
            config.crm.location_id, config.crm.calendar_id
        ),
    }
}

/// A failed load names the offending key. Only `crm.*` keys fail this check.
fn crm_check_from_error(error: &ConfigError) -> DoctorCheck {
    match error {
        ConfigError::Validation(message) if message.starts_with("crm.") => DoctorCheck {
            name: "crm_credentials",
            status: CheckStatus::Fail,
            details: message.clone(),
        },
        _ => DoctorCheck {
            name: "crm_credentials",
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        },
    }
}

fn check_llm_endpoint(config: &AppConfig) -> DoctorCheck {
    let endpoint = config.llm.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
    let key_state = match (&config.llm.provider, &config.llm.api_key) {
        (LlmProvider::OpenAi, Some(key)) if !key.expose_secret().trim().is_empty() => "api key present",
        (LlmProvider::OpenAi, _) => "api key missing",
        (LlmProvider::Ollama, _) => "no api key needed",
    };
    DoctorCheck {
        name: "llm_endpoint",
        status: CheckStatus::Pass,
        details: format!(
            "{} model `{}` at {endpoint} ({key_state})",
            config.llm.provider.as_str(),
            config.llm.model
        ),
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;
        let probe = ping(&pool).await.map_err(|error| format!("database query failed: {error}"));
        pool.close().await;
        probe
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
