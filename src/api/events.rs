//! Event listing and acknowledgement endpoints. Times on the wire are seconds.

use super::{AUTH_USER_HEADER, ApiError, ApiResult, AppState, DataList};
use crate::model::event::{micros_to_secs, now_micros, secs_to_micros};
use crate::model::{Channel, Event, EventId, Severity};
use crate::store::{EventQuery, SortOrder};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// An event as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView {
    pub event_id: EventId,
    pub trace_id: String,
    pub cluster: String,
    pub code: String,
    pub channel: Channel,
    pub facility: String,
    pub severity: Severity,
    pub message: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub detail: HashMap<String, String>,
    pub recipients: BTreeSet<String>,
    pub acknowledged_by: Option<String>,
    /// Seconds since the Unix epoch.
    pub acknowledged_at: Option<i64>,
}

impl From<Event> for EventView {
    fn from(e: Event) -> Self {
        Self {
            event_id: e.event_id,
            trace_id: e.trace_id,
            cluster: e.cluster,
            code: e.code,
            channel: e.channel,
            facility: e.facility,
            severity: e.severity,
            message: e.message,
            timestamp: micros_to_secs(e.timestamp),
            detail: e.detail,
            recipients: e.recipients,
            acknowledged_by: e.acknowledged_by,
            acknowledged_at: e.acknowledged_at.map(micros_to_secs),
        }
    }
}

/// Last microsecond of `secs`, so the whole final second is included.
/// Saturates at the far end of the range.
fn end_of_second(secs: i64) -> i64 {
    match secs_to_micros(secs.saturating_add(1)) {
        i64::MAX => i64::MAX,
        next => next - 1,
    }
}

fn non_negative(params: &HashMap<String, String>, field: &str) -> ApiResult<Option<i64>> {
    match params.get(field).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => match raw.parse::<i64>() {
            Ok(n) if n >= 0 => Ok(Some(n)),
            _ => Err(ApiError::invalid(
                field,
                format!("{field} must be a non-negative integer ({raw})"),
            )),
        },
    }
}

fn text(params: &HashMap<String, String>, field: &str) -> Option<String> {
    params.get(field).filter(|v| !v.is_empty()).cloned()
}

/// Turn raw query parameters into an [`EventQuery`], validating each one.
pub fn parse_event_query(params: &HashMap<String, String>) -> ApiResult<EventQuery> {
    let channel = text(params, "channel")
        .map(|c| {
            c.parse::<Channel>()
                .map_err(|_| ApiError::invalid("channel", format!("Invalid channel supplied ({c})")))
        })
        .transpose()?;
    let severity = text(params, "severity")
        .map(|s| {
            s.parse::<Severity>().map_err(|_| {
                ApiError::invalid("severity", format!("Invalid severity supplied ({s})"))
            })
        })
        .transpose()?;

    if let Some(order_by) = text(params, "order_by")
        && order_by != "timestamp"
    {
        return Err(ApiError::invalid(
            "order_by",
            format!("Only timestamp ordering is supported ({order_by})"),
        ));
    }
    let ordering = match text(params, "ordering").as_deref() {
        None => SortOrder::default(),
        Some("asc") => SortOrder::Asc,
        Some("desc") => SortOrder::Desc,
        Some(other) => {
            return Err(ApiError::invalid(
                "ordering",
                format!("ordering must be asc or desc ({other})"),
            ));
        }
    };

    let min_time = non_negative(params, "min_time")?;
    let max_time = non_negative(params, "max_time")?;
    if let (Some(min), Some(max)) = (min_time, max_time)
        && min > max
    {
        return Err(ApiError::invalid("min_time", "min_time must not exceed max_time"));
    }

    Ok(EventQuery {
        channel,
        facility: text(params, "facility"),
        severity,
        trace_id: text(params, "trace_id"),
        recipient: text(params, "recipient"),
        min_time: min_time.map(secs_to_micros),
        max_time: max_time.map(end_of_second),
        ordering,
        limit: non_negative(params, "limit")?.map(|n| n as u64),
        offset: non_negative(params, "offset")?.unwrap_or(0) as u64,
    })
}

fn parse_event_id(raw: &str) -> ApiResult<EventId> {
    raw.parse()
        .map_err(|_| ApiError::invalid("event_id", format!("Invalid event id ({raw})")))
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<DataList<EventView>>> {
    let query = parse_event_query(&params)?;
    let events = state.events.query_events(&query).await?;
    Ok(Json(
        events.into_iter().map(EventView::from).collect::<Vec<_>>().into(),
    ))
}

pub(super) async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EventView>> {
    let id = parse_event_id(&id)?;
    let event = state
        .events
        .get_event(id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("event {id}")))?;
    Ok(Json(event.into()))
}

pub(super) async fn acknowledge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EventView>> {
    let user = headers
        .get(AUTH_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing caller identity".to_string()))?
        .to_string();
    let id = parse_event_id(&id)?;

    let event = state
        .events
        .acknowledge_event(id, &user, now_micros())
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("event {id}")))?;
    Ok(Json(event.into()))
}
