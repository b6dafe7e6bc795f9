use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use leadflow_agent::{TurnPipeline, TurnStatus};
use leadflow_core::domain::envelope::InboundEnvelope;
use leadflow_core::errors::{ApplicationError, DomainError, InterfaceError};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

const SECRET_HEADER: &str = "x-webhook-secret";
const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct WebhookState {
    pub pipeline: Arc<TurnPipeline>,
    pub webhook_secret: Option<SecretString>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookReply {
    pub status: TurnStatus,
    pub reply: Option<String>,
    pub thread_id: String,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookError {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/webhook/message", post(receive_message)).with_state(state)
}

async fn receive_message(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    payload: Result<Json<InboundEnvelope>, JsonRejection>,
) -> Response {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if !authorized(&headers, state.webhook_secret.as_ref()) {
        warn!(
            event_name = "server.webhook.unauthorized",
            correlation_id = %correlation_id,
            "webhook secret missing or wrong"
        );
        return error_response(InterfaceError::Unauthorized {
            message: "webhook secret mismatch".to_string(),
            correlation_id,
        });
    }

    let Json(raw) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(InterfaceError::BadRequest {
                message: rejection.body_text(),
                correlation_id,
            });
        }
    };

    let envelope = match raw.validate() {
        Ok(envelope) => envelope,
        Err(error) => {
            info!(
                event_name = "server.webhook.invalid_envelope",
                correlation_id = %correlation_id,
                violations = error.violations.len(),
                "inbound envelope rejected"
            );
            return error_response(
                ApplicationError::from(DomainError::from(error)).into_interface(correlation_id),
            );
        }
    };

    info!(
        event_name = "server.webhook.received",
        correlation_id = %correlation_id,
        thread_id = %envelope.thread_id,
        contact_id = %envelope.contact_id,
        message_len = envelope.message.chars().count(),
        "inbound message accepted"
    );

    match state.pipeline.handle(&envelope, &correlation_id).await {
        Ok(result) => (
            StatusCode::OK,
            Json(WebhookReply {
                status: result.status,
                reply: result.reply,
                thread_id: result.thread_id,
                correlation_id,
            }),
        )
            .into_response(),
        Err(error) => {
            warn!(
                event_name = "server.webhook.turn_failed",
                correlation_id = %correlation_id,
                thread_id = %envelope.thread_id,
                code = error.code(),
                error = %error,
                "turn could not be processed"
            );
            error_response(error.into_interface(correlation_id))
        }
    }
}

fn authorized(headers: &HeaderMap, secret: Option<&SecretString>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided| provided == secret.expose_secret())
}

fn error_response(error: InterfaceError) -> Response {
    let (status, detail, retry_after) = match &error {
        InterfaceError::BadRequest { message, .. } => {
            (StatusCode::BAD_REQUEST, Some(message.clone()), None)
        }
        InterfaceError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, None, None),
        InterfaceError::ServiceUnavailable { retry_after_secs, .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, None, *retry_after_secs)
        }
        InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
    };
    let body = WebhookError {
        error: error.user_message(),
        detail,
        correlation_id: error.correlation_id().to_string(),
    };

    let mut response = (status, Json(body)).into_response();
    if let Some(seconds) = retry_after {
        response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    response
}
