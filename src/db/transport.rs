//! Postgres-backed transport log.
//!
//! Offsets are allocated from a per-partition counter row that stays locked
//! until the appending transaction commits, so offsets become visible in
//! order. A `pg_notify` on commit wakes waiting consumers.

use super::Db;
use crate::error::Result;
use crate::model::Channel;
use crate::model::event::now_micros;
use crate::telemetry::metrics;
use crate::transport::{
    Delivery, OutboundMessage, Transport, assigned_partitions, partition_for, topic_name,
};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::postgres::PgListener;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NOTIFY_CHANNEL: &str = "axnc_transport";
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PgTransport {
    db: Db,
    partitions: u32,
    session_timeout: Duration,
    appended: Arc<Notify>,
}

impl PgTransport {
    pub fn new(db: Db, partitions: u32) -> Self {
        Self {
            db,
            partitions: partitions.max(1),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            appended: Arc::new(Notify::new()),
        }
    }

    /// Members silent for longer than this lose their partitions. Workers
    /// size it with `WorkerConfig::session_timeout`.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Forward append notifications to waiting consumers until the task is aborted.
    pub async fn listen(&self) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(self.db.pool()).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        let appended = Arc::clone(&self.appended);
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(n) => {
                        debug!(topic = n.payload(), "transport append notified");
                        appended.notify_waiters();
                    }
                    Err(e) => {
                        warn!("PgListener error: {e}, consumers fall back to polling");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    fn record(&self, topic: &str, operation: &'static str) {
        metrics::transport_operations().add(
            1,
            &[
                KeyValue::new("topic", topic.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

#[async_trait]
impl Transport for PgTransport {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, batch: &[OutboundMessage]) -> Result<usize> {
        let mut tx = self.db.pool().begin().await?;
        let now = now_micros();
        let mut seen = HashSet::new();
        let mut topics = HashSet::new();
        let mut written = 0;

        for msg in batch {
            if !seen.insert(msg.dedup_key.as_str()) {
                continue;
            }
            let exists: Option<(i32,)> =
                sqlx::query_as("SELECT 1 FROM nc_transport_log WHERE dedup_key = $1")
                    .bind(&msg.dedup_key)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                continue;
            }

            let topic = topic_name(msg.topic);
            let partition = partition_for(&msg.key, self.partitions) as i32;
            let (offset,): (i64,) = sqlx::query_as(
                "INSERT INTO nc_transport_partitions (topic, partition, next_offset)
                 VALUES ($1, $2, 1)
                 ON CONFLICT (topic, partition)
                 DO UPDATE SET next_offset = nc_transport_partitions.next_offset + 1
                 RETURNING next_offset - 1",
            )
            .bind(&topic)
            .bind(partition)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO nc_transport_log (topic, partition, msg_offset, msg_key, dedup_key, payload, appended_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&topic)
            .bind(partition)
            .bind(offset)
            .bind(&msg.key)
            .bind(&msg.dedup_key)
            .bind(&msg.payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            topics.insert(topic);
            written += 1;
        }

        // NOTIFY is transactional; consumers wake only after commit.
        for topic in &topics {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(NOTIFY_CHANNEL)
                .bind(topic)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        for topic in &topics {
            self.record(topic, "append");
        }
        Ok(written)
    }

    async fn join(&self, group: &str, topic: Channel, member: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO nc_consumer_members (group_name, topic, member_id, heartbeat_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (group_name, topic, member_id) DO UPDATE SET heartbeat_at = now()",
        )
        .bind(group)
        .bind(topic_name(topic))
        .bind(member)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        group: &str,
        topic: Channel,
        member: &str,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        let topic_str = topic_name(topic);
        self.join(group, topic, member).await?;

        sqlx::query(
            "DELETE FROM nc_consumer_members
             WHERE group_name = $1 AND topic = $2
             AND heartbeat_at < now() - make_interval(secs => $3)",
        )
        .bind(group)
        .bind(&topic_str)
        .bind(self.session_timeout.as_secs_f64())
        .execute(self.db.pool())
        .await?;

        let members: Vec<(String,)> = sqlx::query_as(
            "SELECT member_id FROM nc_consumer_members
             WHERE group_name = $1 AND topic = $2 ORDER BY member_id",
        )
        .bind(group)
        .bind(&topic_str)
        .fetch_all(self.db.pool())
        .await?;
        let members: Vec<String> = members.into_iter().map(|(m,)| m).collect();

        let owned: Vec<i32> = assigned_partitions(&members, member, self.partitions)
            .into_iter()
            .map(|p| p as i32)
            .collect();
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(i32, i64, String, serde_json::Value, i64)> = sqlx::query_as(
            "SELECT l.partition, l.msg_offset, l.msg_key, l.payload, l.appended_at
             FROM nc_transport_log l
             LEFT JOIN nc_consumer_offsets o
               ON o.group_name = $1 AND o.topic = l.topic AND o.partition = l.partition
             WHERE l.topic = $2 AND l.partition = ANY($3)
               AND l.msg_offset >= COALESCE(o.next_offset, 0)
             ORDER BY l.partition, l.msg_offset
             LIMIT $4",
        )
        .bind(group)
        .bind(&topic_str)
        .bind(&owned)
        .bind(max as i64)
        .fetch_all(self.db.pool())
        .await?;

        self.record(&topic_str, "fetch");
        Ok(rows
            .into_iter()
            .map(|(partition, offset, key, payload, appended_at)| Delivery {
                topic,
                partition: partition as u32,
                offset,
                key,
                payload,
                appended_at,
            })
            .collect())
    }

    async fn heartbeat(&self, group: &str, topic: Channel, member: &str) -> Result<()> {
        let refreshed = sqlx::query(
            "UPDATE nc_consumer_members SET heartbeat_at = now()
             WHERE group_name = $1 AND topic = $2 AND member_id = $3",
        )
        .bind(group)
        .bind(topic_name(topic))
        .bind(member)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        if refreshed == 0 {
            warn!(group, member, "session expired while busy, rejoining");
            self.join(group, topic, member).await?;
        }
        Ok(())
    }

    async fn commit(&self, group: &str, delivery: &Delivery) -> Result<()> {
        let topic = topic_name(delivery.topic);
        sqlx::query(
            "INSERT INTO nc_consumer_offsets (group_name, topic, partition, next_offset)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (group_name, topic, partition)
             DO UPDATE SET next_offset = GREATEST(nc_consumer_offsets.next_offset, EXCLUDED.next_offset)",
        )
        .bind(group)
        .bind(&topic)
        .bind(delivery.partition as i32)
        .bind(delivery.offset + 1)
        .execute(self.db.pool())
        .await?;
        self.record(&topic, "commit");
        Ok(())
    }

    async fn leave(&self, group: &str, topic: Channel, member: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM nc_consumer_members WHERE group_name = $1 AND topic = $2 AND member_id = $3",
        )
        .bind(group)
        .bind(topic_name(topic))
        .bind(member)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn wait(&self, _topic: Channel, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }

    async fn purge_expired(&self, retention: Duration) -> Result<u64> {
        let retention = i64::try_from(retention.as_micros()).unwrap_or(i64::MAX);
        let cutoff = now_micros().saturating_sub(retention);
        let removed = sqlx::query("DELETE FROM nc_transport_log WHERE appended_at < $1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        self.record("*", "purge");
        Ok(removed)
    }
}
