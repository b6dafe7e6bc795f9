use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use leadflow_agent::calendar::CalendarSettings;
use leadflow_agent::conversation::{ExtractionResolver, ExtractionSettings};
use leadflow_agent::prompt::PromptSettings;
use leadflow_agent::tagging::ContactUpdateQueue;
use leadflow_agent::terminator::Terminator;
use leadflow_agent::tools::CapabilityExecutor;
use leadflow_agent::{LanguageModel, Orchestrator, OrchestratorSettings, PipelineSettings, TurnPipeline};
use leadflow_core::cache::{DedupGuard, ResponseCache, SlotCache};
use leadflow_core::clock::{system_clock, SharedClock};
use leadflow_core::config::{AppConfig, ConfigError, LoadOptions};
use leadflow_core::ports::{
    CheckpointStore, ContactRecorder, ConversationHistory, MessageSender, Scheduler,
};
use leadflow_core::resilience::{BreakerRegistry, CircuitBreakerConfig, Resilience, RetryPolicy};
use leadflow_db::{
    connect_with_settings, is_memory_url, migrations, DbPool, InMemoryCheckpointStore,
    SqlCheckpointStore,
};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::crm::CrmClient;
use crate::health::{self, HealthState};
use crate::llm::ChatCompletionsModel;
use crate::webhook::{self, WebhookState};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Engine,
}

/// The turn pipeline and the breakers it shares with the health probe.
pub struct Engine {
    pub pipeline: Arc<TurnPipeline>,
    pub breakers: Arc<BreakerRegistry>,
}

/// Everything the engine talks to across a process boundary.
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub history: Arc<dyn ConversationHistory>,
    pub sender: Arc<dyn MessageSender>,
    pub scheduler: Arc<dyn Scheduler>,
    pub contacts: Arc<dyn ContactRecorder>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("http client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl Application {
    pub fn router(&self) -> Router {
        let health_state =
            HealthState { db_pool: self.db_pool.clone(), breakers: self.engine.breakers.clone() };
        let webhook_state = WebhookState {
            pipeline: self.engine.pipeline.clone(),
            webhook_secret: self.config.crm.webhook_secret.clone(),
        };

        health::router(health_state)
            .merge(webhook::router(webhook_state))
            .layer(TraceLayer::new_for_http())
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let checkpoints: Arc<dyn CheckpointStore> = if is_memory_url(&config.database.url) {
        Arc::new(InMemoryCheckpointStore::default())
    } else {
        Arc::new(SqlCheckpointStore::new(db_pool.clone()))
    };
    let crm = Arc::new(
        CrmClient::new(&config.crm, config.calendar.slot_duration_minutes)
            .map_err(BootstrapError::HttpClient)?,
    );
    let model = Arc::new(ChatCompletionsModel::new(&config.llm).map_err(BootstrapError::HttpClient)?);

    let engine = assemble(
        &config,
        Collaborators {
            model,
            history: crm.clone(),
            sender: crm.clone(),
            scheduler: crm.clone(),
            contacts: crm,
            checkpoints,
        },
        system_clock(),
    );
    info!(
        event_name = "system.bootstrap.engine_ready",
        correlation_id = "bootstrap",
        llm_provider = config.llm.provider.as_str(),
        llm_model = %config.llm.model,
        deduplication = config.cache.enable_deduplication,
        circuit_breaker = config.resilience.enable_circuit_breaker,
        "turn pipeline assembled"
    );

    Ok(Application { config, db_pool, engine })
}

/// Wires configuration and collaborators into a turn pipeline.
pub fn assemble(config: &AppConfig, collaborators: Collaborators, clock: SharedClock) -> Engine {
    let resilience_config = &config.resilience;
    let qualification = &config.qualification;

    let breakers = Arc::new(BreakerRegistry::new(
        CircuitBreakerConfig {
            failure_threshold: resilience_config.breaker_failure_threshold,
            cooldown: chrono_seconds(resilience_config.breaker_cooldown_secs),
            enabled: resilience_config.enable_circuit_breaker,
        },
        clock.clone(),
    ));
    let retry = RetryPolicy {
        max_retries: resilience_config.max_retries,
        base_delay_ms: resilience_config.retry_base_delay_ms,
        max_delay_ms: resilience_config.retry_max_delay_ms,
    };
    let crm_resilience = Resilience::new(
        breakers.clone(),
        retry.clone(),
        Duration::from_millis(resilience_config.call_timeout_ms),
    );
    let model_resilience = Resilience::new(
        breakers.clone(),
        RetryPolicy { max_retries: config.llm.max_retries, ..retry },
        Duration::from_secs(config.llm.timeout_secs),
    );

    let calendar = CalendarSettings {
        min_budget: qualification.min_budget,
        days_ahead: config.calendar.days_ahead,
        max_slots_shown: config.calendar.max_slots_shown,
        slot_duration_minutes: config.calendar.slot_duration_minutes,
        display_offset: CalendarSettings::display_offset_from_minutes(
            config.calendar.display_utc_offset_minutes,
        ),
    };
    let resolver = Arc::new(ExtractionResolver::new(
        collaborators.model.clone(),
        model_resilience.clone(),
        ExtractionSettings {
            max_attempts: qualification.max_extraction_attempts,
            context_turns: qualification.extraction_context_turns,
        },
    ));
    let slot_cache = Arc::new(SlotCache::new(
        chrono_seconds(config.cache.slot_ttl_secs),
        Duration::from_secs(config.cache.refresh_wait_secs),
        clock.clone(),
    ));
    let executor = Arc::new(CapabilityExecutor::new(
        resolver,
        collaborators.sender,
        collaborators.scheduler,
        slot_cache,
        ContactUpdateQueue::new(collaborators.contacts, crm_resilience.clone()),
        crm_resilience.clone(),
        calendar,
        clock.clone(),
    ));

    let terminator = Arc::new(Terminator::new(qualification.max_messages, qualification.min_budget));
    let orchestrator = Orchestrator::new(
        collaborators.model,
        executor,
        model_resilience,
        terminator.clone(),
        OrchestratorSettings {
            max_iterations: qualification.max_iterations,
            history_window: qualification.history_window,
            extraction_cap: qualification.max_extraction_attempts,
            prompt: PromptSettings {
                agent_name: qualification.agent_name.clone(),
                company_name: qualification.company_name.clone(),
            },
        },
        clock.clone(),
    );

    let dedup = if config.cache.enable_deduplication {
        DedupGuard::new(chrono_seconds(config.cache.dedup_ttl_secs), clock.clone())
    } else {
        DedupGuard::disabled(clock.clone())
    };
    let pipeline = TurnPipeline::new(
        dedup,
        ResponseCache::new(&qualification.agent_name, &qualification.company_name),
        terminator,
        orchestrator,
        collaborators.history,
        collaborators.checkpoints,
        crm_resilience,
        PipelineSettings {
            extraction_cap: qualification.max_extraction_attempts,
            turn_timeout: Duration::from_secs(qualification.turn_timeout_secs),
        },
        clock,
    );

    Engine { pipeline: Arc::new(pipeline), breakers }
}

fn chrono_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or_else(|_| chrono::Duration::days(365))
}
