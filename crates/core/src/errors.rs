use thiserror::Error;

use crate::domain::envelope::EnvelopeError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Validation(#[from] EnvelopeError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("{dependency} call failed: {message}")]
    ExternalService { dependency: String, message: String },
    #[error("{stage} exceeded its deadline")]
    Timeout { stage: String },
    #[error("{dependency} circuit is open; retry after {retry_after_secs}s")]
    CircuitOpen { dependency: String, retry_after_secs: u64 },
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String, retry_after_secs: Option<u64> },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Unauthorized { .. } => "The request is not authorized.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Unauthorized { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Unauthorized { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }

    /// Internal diagnosis code, distinct per failure family.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Domain(DomainError::Validation(_)) => "validation_error",
            Self::Domain(DomainError::InvariantViolation(_)) => "invariant_violation",
            Self::Persistence(_) => "persistence_error",
            Self::ExternalService { .. } => "external_service_error",
            Self::Timeout { .. } => "timeout_error",
            Self::CircuitOpen { .. } => "circuit_breaker_open",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Validation(error)) => {
                Self::BadRequest { message: error.to_string(), correlation_id: unassigned }
            }
            ApplicationError::Domain(DomainError::InvariantViolation(_)) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: unassigned,
            },
            ApplicationError::Persistence(message)
            | ApplicationError::ExternalService { message, .. } => {
                Self::ServiceUnavailable { message, correlation_id: unassigned, retry_after_secs: None }
            }
            ApplicationError::Timeout { stage } => Self::ServiceUnavailable {
                message: format!("{stage} timed out"),
                correlation_id: unassigned,
                retry_after_secs: None,
            },
            ApplicationError::CircuitOpen { dependency, retry_after_secs } => {
                Self::ServiceUnavailable {
                    message: format!("{dependency} is temporarily unavailable"),
                    correlation_id: unassigned,
                    retry_after_secs: Some(retry_after_secs),
                }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::envelope::InboundEnvelope;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn validation_error_maps_to_bad_request_with_field_detail() {
        let envelope_error =
            InboundEnvelope::default().validate().expect_err("empty envelope is invalid");
        let interface =
            ApplicationError::from(DomainError::from(envelope_error)).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest { ref message, ref correlation_id }
                if correlation_id == "req-1" && message.contains("contactId")
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn circuit_open_carries_retry_after_hint() {
        let interface = ApplicationError::CircuitOpen {
            dependency: "language_model".to_owned(),
            retry_after_secs: 42,
        }
        .into_interface("req-2");

        assert!(matches!(
            interface,
            InterfaceError::ServiceUnavailable { retry_after_secs: Some(42), .. }
        ));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn timeout_and_external_failures_share_the_unavailable_copy_but_not_the_code() {
        let timeout = ApplicationError::Timeout { stage: "turn".to_owned() };
        let external = ApplicationError::ExternalService {
            dependency: "crm".to_owned(),
            message: "502 bad gateway".to_owned(),
        };

        assert_ne!(timeout.code(), external.code());
        assert_eq!(
            timeout.into_interface("req-3").user_message(),
            external.into_interface("req-4").user_message()
        );
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("invalid api key".to_owned()).into_interface("req-5");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
