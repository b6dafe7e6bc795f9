pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ports;
pub mod reducers;
pub mod resilience;

pub use cache::{DedupDecision, DedupGuard, DedupKey, ResponseCache, SlotCache, SlotLookup};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use domain::conversation::{ContactId, ConversationState, TerminationReason, ThreadId};
pub use domain::envelope::{EnvelopeError, InboundEnvelope, ValidatedEnvelope};
pub use domain::lead::{LeadField, LeadInfo};
pub use domain::message::{ChatMessage, Role};
pub use domain::slot::{BookingConfirmation, BookingRequest, Slot};
pub use domain::step::{derive_step, ConversationStep};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ports::{
    CheckpointStore, ContactRecorder, ContactUpdate, ConversationHistory, HistorySnapshot,
    MessageSender, PortError, Scheduler, SendReceipt,
};
pub use reducers::{apply_delta, StateDelta};
pub use resilience::{
    BreakerRegistry, CircuitBreakerConfig, CircuitState, Dependency, ExternalCallError,
    Resilience, RetryPolicy,
};
