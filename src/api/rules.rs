//! Rule management endpoints.

use super::{ApiError, ApiResult, AppState, DataList};
use crate::model::{Rule, RuleDraft, RuleId};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub(super) struct ListParams {
    enabled: Option<String>,
}

fn parse_rule_id(raw: &str) -> ApiResult<RuleId> {
    raw.parse()
        .map_err(|_| ApiError::invalid("rule_id", format!("Invalid rule id ({raw})")))
}

fn draft_from(body: Result<Json<RuleDraft>, JsonRejection>) -> ApiResult<RuleDraft> {
    body.map(|Json(draft)| draft)
        .map_err(|e| ApiError::invalid("body", e.body_text()))
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<DataList<Rule>>> {
    let enabled = match params.enabled.as_deref() {
        None | Some("") => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(other) => {
            return Err(ApiError::invalid(
                "enabled",
                format!("Invalid enabled value ({other})"),
            ));
        }
    };
    Ok(Json(state.rules.list(enabled).await?.into()))
}

pub(super) async fn create(
    State(state): State<AppState>,
    body: Result<Json<RuleDraft>, JsonRejection>,
) -> ApiResult<Json<Rule>> {
    let rule = state.rules.create(draft_from(body)?).await?;
    Ok(Json(rule))
}

pub(super) async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(state.rules.get(parse_rule_id(&id)?).await?))
}

pub(super) async fn replace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<RuleDraft>, JsonRejection>,
) -> ApiResult<Json<Rule>> {
    let id = parse_rule_id(&id)?;
    let rule = state.rules.update(id, draft_from(body)?).await?;
    Ok(Json(rule))
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.rules.delete(parse_rule_id(&id)?).await?;
    Ok(Json(json!({})))
}
