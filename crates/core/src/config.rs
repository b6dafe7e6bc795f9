use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub crm: CrmConfig,
    pub server: ServerConfig,
    pub qualification: QualificationConfig,
    pub calendar: CalendarConfig,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub location_id: String,
    pub calendar_id: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub webhook_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct QualificationConfig {
    pub agent_name: String,
    pub company_name: String,
    pub min_budget: u32,
    pub max_extraction_attempts: u32,
    pub max_iterations: u32,
    pub max_messages: usize,
    pub history_window: usize,
    pub extraction_context_turns: usize,
    pub turn_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CalendarConfig {
    pub days_ahead: u32,
    pub max_slots_shown: usize,
    pub slot_duration_minutes: u32,
    pub display_utc_offset_minutes: i32,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub dedup_ttl_secs: u64,
    pub slot_ttl_secs: u64,
    pub refresh_wait_secs: u64,
    pub enable_deduplication: bool,
}

#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub enable_circuit_breaker: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub crm_api_key: Option<String>,
    pub crm_location_id: Option<String>,
    pub crm_calendar_id: Option<String>,
    pub crm_webhook_secret: Option<String>,
    pub server_port: Option<u16>,
    pub enable_deduplication: Option<bool>,
    pub enable_circuit_breaker: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                temperature: 0.7,
            },
            crm: CrmConfig {
                base_url: "https://services.leadconnectorhq.com".to_string(),
                api_key: String::new().into(),
                location_id: String::new(),
                calendar_id: String::new(),
                api_version: "2021-07-28".to_string(),
                timeout_secs: 10,
                webhook_secret: None,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            qualification: QualificationConfig {
                agent_name: "María".to_string(),
                company_name: "Outlet Media".to_string(),
                min_budget: 300,
                max_extraction_attempts: 3,
                max_iterations: 25,
                max_messages: 30,
                history_window: 10,
                extraction_context_turns: 5,
                turn_timeout_secs: 300,
            },
            calendar: CalendarConfig {
                days_ahead: 7,
                max_slots_shown: 5,
                slot_duration_minutes: 30,
                display_utc_offset_minutes: -360,
            },
            cache: CacheConfig {
                dedup_ttl_secs: 600,
                slot_ttl_secs: 900,
                refresh_wait_secs: 5,
                enable_deduplication: true,
            },
            resilience: ResilienceConfig {
                call_timeout_ms: 10_000,
                max_retries: 3,
                retry_base_delay_ms: 1_000,
                retry_max_delay_ms: 8_000,
                breaker_failure_threshold: 3,
                breaker_cooldown_secs: 60,
                enable_circuit_breaker: true,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(base_url) = crm.base_url {
                self.crm.base_url = base_url;
            }
            if let Some(crm_api_key_value) = crm.api_key {
                self.crm.api_key = secret_value(crm_api_key_value);
            }
            if let Some(location_id) = crm.location_id {
                self.crm.location_id = location_id;
            }
            if let Some(calendar_id) = crm.calendar_id {
                self.crm.calendar_id = calendar_id;
            }
            if let Some(api_version) = crm.api_version {
                self.crm.api_version = api_version;
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
            if let Some(webhook_secret) = crm.webhook_secret {
                self.crm.webhook_secret = Some(secret_value(webhook_secret));
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(qualification) = patch.qualification {
            let target = &mut self.qualification;
            if let Some(agent_name) = qualification.agent_name {
                target.agent_name = agent_name;
            }
            if let Some(company_name) = qualification.company_name {
                target.company_name = company_name;
            }
            if let Some(min_budget) = qualification.min_budget {
                target.min_budget = min_budget;
            }
            if let Some(max_extraction_attempts) = qualification.max_extraction_attempts {
                target.max_extraction_attempts = max_extraction_attempts;
            }
            if let Some(max_iterations) = qualification.max_iterations {
                target.max_iterations = max_iterations;
            }
            if let Some(max_messages) = qualification.max_messages {
                target.max_messages = max_messages;
            }
            if let Some(history_window) = qualification.history_window {
                target.history_window = history_window;
            }
            if let Some(extraction_context_turns) = qualification.extraction_context_turns {
                target.extraction_context_turns = extraction_context_turns;
            }
            if let Some(turn_timeout_secs) = qualification.turn_timeout_secs {
                target.turn_timeout_secs = turn_timeout_secs;
            }
        }

        if let Some(calendar) = patch.calendar {
            if let Some(days_ahead) = calendar.days_ahead {
                self.calendar.days_ahead = days_ahead;
            }
            if let Some(max_slots_shown) = calendar.max_slots_shown {
                self.calendar.max_slots_shown = max_slots_shown;
            }
            if let Some(slot_duration_minutes) = calendar.slot_duration_minutes {
                self.calendar.slot_duration_minutes = slot_duration_minutes;
            }
            if let Some(offset) = calendar.display_utc_offset_minutes {
                self.calendar.display_utc_offset_minutes = offset;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(dedup_ttl_secs) = cache.dedup_ttl_secs {
                self.cache.dedup_ttl_secs = dedup_ttl_secs;
            }
            if let Some(slot_ttl_secs) = cache.slot_ttl_secs {
                self.cache.slot_ttl_secs = slot_ttl_secs;
            }
            if let Some(refresh_wait_secs) = cache.refresh_wait_secs {
                self.cache.refresh_wait_secs = refresh_wait_secs;
            }
            if let Some(enable_deduplication) = cache.enable_deduplication {
                self.cache.enable_deduplication = enable_deduplication;
            }
        }

        if let Some(resilience) = patch.resilience {
            let target = &mut self.resilience;
            if let Some(call_timeout_ms) = resilience.call_timeout_ms {
                target.call_timeout_ms = call_timeout_ms;
            }
            if let Some(max_retries) = resilience.max_retries {
                target.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = resilience.retry_base_delay_ms {
                target.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = resilience.retry_max_delay_ms {
                target.retry_max_delay_ms = retry_max_delay_ms;
            }
            if let Some(threshold) = resilience.breaker_failure_threshold {
                target.breaker_failure_threshold = threshold;
            }
            if let Some(cooldown) = resilience.breaker_cooldown_secs {
                target.breaker_cooldown_secs = cooldown;
            }
            if let Some(enable_circuit_breaker) = resilience.enable_circuit_breaker {
                target.enable_circuit_breaker = enable_circuit_breaker;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEADFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEADFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("LEADFLOW_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADFLOW_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("LEADFLOW_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("LEADFLOW_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("LEADFLOW_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("LEADFLOW_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("LEADFLOW_LLM_TEMPERATURE", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_CRM_BASE_URL") {
            self.crm.base_url = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_API_KEY") {
            self.crm.api_key = secret_value(value);
        }
        if let Some(value) = read_env("LEADFLOW_CRM_LOCATION_ID") {
            self.crm.location_id = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_CALENDAR_ID") {
            self.crm.calendar_id = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_API_VERSION") {
            self.crm.api_version = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("LEADFLOW_CRM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_WEBHOOK_SECRET") {
            self.crm.webhook_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("LEADFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_PORT") {
            self.server.port = parse_u16("LEADFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_AGENT_NAME") {
            self.qualification.agent_name = value;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_COMPANY_NAME") {
            self.qualification.company_name = value;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_MIN_BUDGET") {
            self.qualification.min_budget = parse_u32("LEADFLOW_QUALIFICATION_MIN_BUDGET", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_MAX_EXTRACTION_ATTEMPTS") {
            self.qualification.max_extraction_attempts =
                parse_u32("LEADFLOW_QUALIFICATION_MAX_EXTRACTION_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_MAX_ITERATIONS") {
            self.qualification.max_iterations =
                parse_u32("LEADFLOW_QUALIFICATION_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_MAX_MESSAGES") {
            self.qualification.max_messages =
                parse_usize("LEADFLOW_QUALIFICATION_MAX_MESSAGES", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_HISTORY_WINDOW") {
            self.qualification.history_window =
                parse_usize("LEADFLOW_QUALIFICATION_HISTORY_WINDOW", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_EXTRACTION_CONTEXT_TURNS") {
            self.qualification.extraction_context_turns =
                parse_usize("LEADFLOW_QUALIFICATION_EXTRACTION_CONTEXT_TURNS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_QUALIFICATION_TURN_TIMEOUT_SECS") {
            self.qualification.turn_timeout_secs =
                parse_u64("LEADFLOW_QUALIFICATION_TURN_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_CALENDAR_DAYS_AHEAD") {
            self.calendar.days_ahead = parse_u32("LEADFLOW_CALENDAR_DAYS_AHEAD", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CALENDAR_MAX_SLOTS_SHOWN") {
            self.calendar.max_slots_shown =
                parse_usize("LEADFLOW_CALENDAR_MAX_SLOTS_SHOWN", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CALENDAR_SLOT_DURATION_MINUTES") {
            self.calendar.slot_duration_minutes =
                parse_u32("LEADFLOW_CALENDAR_SLOT_DURATION_MINUTES", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CALENDAR_DISPLAY_UTC_OFFSET_MINUTES") {
            self.calendar.display_utc_offset_minutes =
                parse_i32("LEADFLOW_CALENDAR_DISPLAY_UTC_OFFSET_MINUTES", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_CACHE_DEDUP_TTL_SECS") {
            self.cache.dedup_ttl_secs = parse_u64("LEADFLOW_CACHE_DEDUP_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CACHE_SLOT_TTL_SECS") {
            self.cache.slot_ttl_secs = parse_u64("LEADFLOW_CACHE_SLOT_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CACHE_REFRESH_WAIT_SECS") {
            self.cache.refresh_wait_secs = parse_u64("LEADFLOW_CACHE_REFRESH_WAIT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CACHE_ENABLE_DEDUPLICATION") {
            self.cache.enable_deduplication =
                parse_bool("LEADFLOW_CACHE_ENABLE_DEDUPLICATION", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_RESILIENCE_CALL_TIMEOUT_MS") {
            self.resilience.call_timeout_ms =
                parse_u64("LEADFLOW_RESILIENCE_CALL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RESILIENCE_MAX_RETRIES") {
            self.resilience.max_retries = parse_u32("LEADFLOW_RESILIENCE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RESILIENCE_RETRY_BASE_DELAY_MS") {
            self.resilience.retry_base_delay_ms =
                parse_u64("LEADFLOW_RESILIENCE_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RESILIENCE_RETRY_MAX_DELAY_MS") {
            self.resilience.retry_max_delay_ms =
                parse_u64("LEADFLOW_RESILIENCE_RETRY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RESILIENCE_BREAKER_FAILURE_THRESHOLD") {
            self.resilience.breaker_failure_threshold =
                parse_u32("LEADFLOW_RESILIENCE_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RESILIENCE_BREAKER_COOLDOWN_SECS") {
            self.resilience.breaker_cooldown_secs =
                parse_u64("LEADFLOW_RESILIENCE_BREAKER_COOLDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RESILIENCE_ENABLE_CIRCUIT_BREAKER") {
            self.resilience.enable_circuit_breaker =
                parse_bool("LEADFLOW_RESILIENCE_ENABLE_CIRCUIT_BREAKER", &value)?;
        }

        let log_level =
            read_env("LEADFLOW_LOGGING_LEVEL").or_else(|| read_env("LEADFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADFLOW_LOGGING_FORMAT").or_else(|| read_env("LEADFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(crm_api_key) = overrides.crm_api_key {
            self.crm.api_key = secret_value(crm_api_key);
        }
        if let Some(location_id) = overrides.crm_location_id {
            self.crm.location_id = location_id;
        }
        if let Some(calendar_id) = overrides.crm_calendar_id {
            self.crm.calendar_id = calendar_id;
        }
        if let Some(webhook_secret) = overrides.crm_webhook_secret {
            self.crm.webhook_secret = Some(secret_value(webhook_secret));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.enable_deduplication {
            self.cache.enable_deduplication = enabled;
        }
        if let Some(enabled) = overrides.enable_circuit_breaker {
            self.resilience.enable_circuit_breaker = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_crm(&self.crm)?;
        validate_server(&self.server)?;
        validate_qualification(&self.qualification)?;
        validate_calendar(&self.calendar)?;
        validate_cache(&self.cache)?;
        validate_resilience(&self.resilience)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadflow.toml"), PathBuf::from("config/leadflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validation(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        ));
    }
    if database.max_connections == 0 {
        return Err(validation("database.max_connections must be greater than zero"));
    }
    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(validation("database.timeout_secs must be in range 1..=300"));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(validation("llm.timeout_secs must be in range 1..=300"));
    }
    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(validation("llm.temperature must be in range 0.0..=2.0"));
    }
    if llm.model.trim().is_empty() {
        return Err(validation("llm.model is required"));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(validation("llm.api_key is required for the openai provider"));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(validation("llm.base_url is required for the ollama provider"));
            }
        }
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if !crm.base_url.starts_with("http://") && !crm.base_url.starts_with("https://") {
        return Err(validation("crm.base_url must start with http:// or https://"));
    }
    if crm.api_key.expose_secret().trim().is_empty() {
        return Err(validation(
            "crm.api_key is required. Create a private integration token in the CRM location settings",
        ));
    }
    if crm.location_id.trim().is_empty() {
        return Err(validation("crm.location_id is required"));
    }
    if crm.calendar_id.trim().is_empty() {
        return Err(validation(
            "crm.calendar_id is required (the calendar that qualified leads are booked into)",
        ));
    }
    if crm.api_version.trim().is_empty() {
        return Err(validation("crm.api_version must not be empty"));
    }
    if crm.timeout_secs == 0 || crm.timeout_secs > 120 {
        return Err(validation("crm.timeout_secs must be in range 1..=120"));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(validation("server.port must be greater than zero"));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(validation("server.graceful_shutdown_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_qualification(qualification: &QualificationConfig) -> Result<(), ConfigError> {
    if qualification.agent_name.trim().is_empty() || qualification.company_name.trim().is_empty()
    {
        return Err(validation("qualification.agent_name and company_name must not be empty"));
    }
    if qualification.max_iterations == 0 {
        return Err(validation("qualification.max_iterations must be greater than zero"));
    }
    if qualification.max_messages == 0 {
        return Err(validation("qualification.max_messages must be greater than zero"));
    }
    if qualification.history_window == 0 || qualification.extraction_context_turns == 0 {
        return Err(validation(
            "qualification.history_window and extraction_context_turns must be greater than zero",
        ));
    }
    if qualification.turn_timeout_secs == 0 {
        return Err(validation("qualification.turn_timeout_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_calendar(calendar: &CalendarConfig) -> Result<(), ConfigError> {
    if calendar.days_ahead == 0 || calendar.days_ahead > 60 {
        return Err(validation("calendar.days_ahead must be in range 1..=60"));
    }
    if calendar.max_slots_shown == 0 {
        return Err(validation("calendar.max_slots_shown must be greater than zero"));
    }
    if calendar.slot_duration_minutes == 0 {
        return Err(validation("calendar.slot_duration_minutes must be greater than zero"));
    }
    if calendar.display_utc_offset_minutes.abs() > 14 * 60 {
        return Err(validation("calendar.display_utc_offset_minutes must be within ±840"));
    }
    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.dedup_ttl_secs == 0 || cache.slot_ttl_secs == 0 {
        return Err(validation("cache TTLs must be greater than zero"));
    }
    if cache.refresh_wait_secs == 0 {
        return Err(validation("cache.refresh_wait_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_resilience(resilience: &ResilienceConfig) -> Result<(), ConfigError> {
    if resilience.call_timeout_ms == 0 {
        return Err(validation("resilience.call_timeout_ms must be greater than zero"));
    }
    if resilience.retry_base_delay_ms > resilience.retry_max_delay_ms {
        return Err(validation(
            "resilience.retry_base_delay_ms must not exceed resilience.retry_max_delay_ms",
        ));
    }
    if resilience.breaker_failure_threshold == 0 {
        return Err(validation("resilience.breaker_failure_threshold must be greater than zero"));
    }
    if resilience.breaker_cooldown_secs == 0 {
        return Err(validation("resilience.breaker_cooldown_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validation("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.parse::<i32>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    crm: Option<CrmPatch>,
    server: Option<ServerPatch>,
    qualification: Option<QualificationPatch>,
    calendar: Option<CalendarPatch>,
    cache: Option<CachePatch>,
    resilience: Option<ResiliencePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    location_id: Option<String>,
    calendar_id: Option<String>,
    api_version: Option<String>,
    timeout_secs: Option<u64>,
    webhook_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct QualificationPatch {
    agent_name: Option<String>,
    company_name: Option<String>,
    min_budget: Option<u32>,
    max_extraction_attempts: Option<u32>,
    max_iterations: Option<u32>,
    max_messages: Option<usize>,
    history_window: Option<usize>,
    extraction_context_turns: Option<usize>,
    turn_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarPatch {
    days_ahead: Option<u32>,
    max_slots_shown: Option<usize>,
    slot_duration_minutes: Option<u32>,
    display_utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    dedup_ttl_secs: Option<u64>,
    slot_ttl_secs: Option<u64>,
    refresh_wait_secs: Option<u64>,
    enable_deduplication: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ResiliencePatch {
    call_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    breaker_failure_threshold: Option<u32>,
    breaker_cooldown_secs: Option<u64>,
    enable_circuit_breaker: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const CRM_VARS: [&str; 3] =
        ["LEADFLOW_CRM_API_KEY", "LEADFLOW_CRM_LOCATION_ID", "LEADFLOW_CRM_CALENDAR_ID"];

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn set_crm_credentials(api_key: &str) {
        env::set_var("LEADFLOW_CRM_API_KEY", api_key);
        env::set_var("LEADFLOW_CRM_LOCATION_ID", "loc-123");
        env::set_var("LEADFLOW_CRM_CALENDAR_ID", "cal-456");
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CRM_API_KEY", "pit-from-env");
        env::set_var("TEST_WEBHOOK_SECRET", "hook-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadflow.toml");
            fs::write(
                &path,
                r#"
[crm]
api_key = "${TEST_CRM_API_KEY}"
location_id = "loc-1"
calendar_id = "cal-1"
webhook_secret = "${TEST_WEBHOOK_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.crm.api_key.expose_secret() == "pit-from-env",
                "crm api key should be loaded from environment",
            )?;
            ensure(
                config
                    .crm
                    .webhook_secret
                    .as_ref()
                    .is_some_and(|secret| secret.expose_secret() == "hook-from-env"),
                "webhook secret should be loaded from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_CRM_API_KEY", "TEST_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_crm_credentials("pit-test");
        env::set_var("LEADFLOW_LOG_LEVEL", "warn");
        env::set_var("LEADFLOW_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&CRM_VARS);
        clear_vars(&["LEADFLOW_LOG_LEVEL", "LEADFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_crm_credentials("pit-from-env");
        env::set_var("LEADFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("LEADFLOW_QUALIFICATION_MIN_BUDGET", "500");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[crm]
api_key = "pit-from-file"

[qualification]
min_budget = 400
max_messages = 40

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.crm.api_key.expose_secret() == "pit-from-env",
                "env api key should win over file and defaults",
            )?;
            ensure(config.qualification.min_budget == 500, "env min budget should win over file")?;
            ensure(config.qualification.max_messages == 40, "file value should win over default")?;
            ensure(config.qualification.max_iterations == 25, "untouched default should remain")?;
            Ok(())
        })();

        clear_vars(&CRM_VARS);
        clear_vars(&["LEADFLOW_DATABASE_URL", "LEADFLOW_QUALIFICATION_MIN_BUDGET"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        clear_vars(&CRM_VARS);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => {
                return Err("expected validation failure but config load succeeded".to_string())
            }
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("crm.api_key")
        );
        ensure(has_message, "validation failure should mention crm.api_key")
    }

    #[test]
    fn openai_provider_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_crm_credentials("pit-test");
        env::set_var("LEADFLOW_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("openai without api key should fail".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("llm.api_key")),
                "validation failure should mention llm.api_key",
            )?;

            let config = AppConfig::load(LoadOptions {
                overrides: ConfigOverrides {
                    llm_provider: Some(LlmProvider::Ollama),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.llm.provider == LlmProvider::Ollama, "override should switch provider")
        })();

        clear_vars(&CRM_VARS);
        clear_vars(&["LEADFLOW_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn malformed_numeric_env_value_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_crm_credentials("pit-test");
        env::set_var("LEADFLOW_CACHE_DEDUP_TTL_SECS", "ten minutes");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. })
                if key == "LEADFLOW_CACHE_DEDUP_TTL_SECS" =>
            {
                Ok(())
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("non-numeric TTL should be rejected".to_string()),
        };

        clear_vars(&CRM_VARS);
        clear_vars(&["LEADFLOW_CACHE_DEDUP_TTL_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_crm_credentials("pit-secret-value");
        env::set_var("LEADFLOW_CRM_WEBHOOK_SECRET", "hook-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("pit-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("hook-secret-value"),
                "debug output should not contain webhook secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            ensure(config.resilience.breaker_cooldown_secs == 60, "default cooldown is 60s")?;
            Ok(())
        })();

        clear_vars(&CRM_VARS);
        clear_vars(&["LEADFLOW_CRM_WEBHOOK_SECRET"]);
        result
    }
}
