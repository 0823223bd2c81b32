//! Event store on Postgres.
//!
//! Rows carry the hour bucket of their timestamp so range scans hit the
//! `(time_bucket, ts)` index.

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Channel, Event, EventId, Severity};
use crate::store::{EventQuery, EventStore, SortOrder};
use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "event_id, ts, trace_id, cluster, code, channel, facility, severity, message, detail, recipients, acknowledged_by, acknowledged_at";

#[async_trait]
impl EventStore for Db {
    async fn upsert_event(&self, event: &Event) -> Result<()> {
        let recipients: Vec<String> = event.recipients.iter().cloned().collect();
        sqlx::query(
            "INSERT INTO nc_events (event_id, time_bucket, ts, trace_id, cluster, code, channel, facility, severity, message, detail, recipients)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event.event_id.0)
        .bind(event.time_bucket())
        .bind(event.timestamp)
        .bind(&event.trace_id)
        .bind(&event.cluster)
        .bind(&event.code)
        .bind(event.channel.as_str())
        .bind(&event.facility)
        .bind(event.severity.as_str())
        .bind(&event.message)
        .bind(serde_json::to_value(&event.detail)?)
        .bind(recipients)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM nc_events WHERE event_id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(EventRow::try_into_event).transpose()
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM nc_events WHERE TRUE"));

        if let Some(channel) = query.channel {
            qb.push(" AND channel = ").push_bind(channel.as_str());
        }
        if let Some(facility) = &query.facility {
            qb.push(" AND facility = ").push_bind(facility.clone());
        }
        if let Some(severity) = query.severity {
            qb.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(trace_id) = &query.trace_id {
            qb.push(" AND trace_id = ").push_bind(trace_id.clone());
        }
        if let Some(recipient) = &query.recipient {
            qb.push(" AND ")
                .push_bind(recipient.clone())
                .push(" = ANY(recipients)");
        }
        if let Some(min) = query.min_time {
            qb.push(" AND time_bucket >= ")
                .push_bind(crate::model::event::time_bucket(min))
                .push(" AND ts >= ")
                .push_bind(min);
        }
        if let Some(max) = query.max_time {
            qb.push(" AND time_bucket <= ")
                .push_bind(crate::model::event::time_bucket(max))
                .push(" AND ts <= ")
                .push_bind(max);
        }

        qb.push(match query.ordering {
            SortOrder::Asc => " ORDER BY ts ASC, event_id ASC",
            SortOrder::Desc => " ORDER BY ts DESC, event_id DESC",
        });
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        qb.push(" OFFSET ").push_bind(query.offset as i64);

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn acknowledge_event(&self, id: EventId, user: &str, at: i64) -> Result<Option<Event>> {
        let rows_affected = sqlx::query(
            "UPDATE nc_events SET acknowledged_by = $1, acknowledged_at = $2 WHERE event_id = $3",
        )
        .bind(user)
        .bind(at)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(None);
        }
        self.get_event(id).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    ts: i64,
    trace_id: String,
    cluster: String,
    code: String,
    channel: String,
    facility: String,
    severity: String,
    message: String,
    detail: serde_json::Value,
    recipients: Vec<String>,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<i64>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event> {
        let detail: HashMap<String, String> = serde_json::from_value(self.detail)?;
        Ok(Event {
            event_id: EventId(self.event_id),
            trace_id: self.trace_id,
            cluster: self.cluster,
            code: self.code,
            channel: self.channel.parse::<Channel>().map_err(Error::Other)?,
            facility: self.facility,
            severity: self.severity.parse::<Severity>().map_err(Error::Other)?,
            message: self.message,
            timestamp: self.ts,
            detail,
            recipients: self.recipients.into_iter().collect(),
            acknowledged_by: self.acknowledged_by,
            acknowledged_at: self.acknowledged_at,
        })
    }
}
