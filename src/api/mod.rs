//! HTTP management surface under `/notification_center`.

mod events;
mod rules;

use crate::codes::CodeRegistry;
use crate::error::Error;
use crate::model::{Channel, Severity};
use crate::rules::RuleManager;
use crate::store::EventStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

pub use events::{EventView, parse_event_query};

/// Header carrying the authenticated caller, set by the gateway.
pub const AUTH_USER_HEADER: &str = "x-auth-user";

#[derive(Clone)]
pub struct AppState {
    pub rules: RuleManager,
    pub events: Arc<dyn EventStore>,
    pub registry: Arc<CodeRegistry>,
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/channels", get(list_channels))
        .route("/severities", get(list_severities))
        .route("/codes", get(list_codes))
        .route("/rules", get(rules::list).post(rules::create))
        .route(
            "/rules/{id}",
            get(rules::fetch).put(rules::replace).delete(rules::remove),
        )
        .route("/events", get(events::list))
        .route("/events/{id}", get(events::fetch))
        .route("/events/{id}/read", put(events::acknowledge));

    Router::new()
        .nest("/notification_center", routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// List responses are wrapped as `{"data": [...]}`.
#[derive(Debug, Serialize)]
pub struct DataList<T> {
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for DataList<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

async fn list_channels() -> Json<DataList<&'static str>> {
    Json(Channel::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>().into())
}

async fn list_severities() -> Json<DataList<&'static str>> {
    Json(Severity::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>().into())
}

async fn list_codes(State(state): State<AppState>) -> Json<DataList<crate::codes::CodeBinding>> {
    Json(state.registry.all().into_iter().cloned().collect::<Vec<_>>().into())
}

/// Errors as returned to HTTP callers.
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    Unauthorized(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

impl ApiError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ApiError::Core(Error::validation(field, message))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, field) = match self {
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, "unauthorized", message, None),
            ApiError::Core(Error::Validation { field, message }) => {
                (StatusCode::BAD_REQUEST, "invalid_param", message, Some(field))
            }
            ApiError::Core(e @ Error::UnknownCode(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_param", e.to_string(), Some("code".to_string()))
            }
            ApiError::Core(e @ Error::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found", e.to_string(), None)
            }
            ApiError::Core(e) => {
                error!("request failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string(), None)
            }
        };
        (
            status,
            Json(json!({ "code": code, "message": message, "field": field })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
