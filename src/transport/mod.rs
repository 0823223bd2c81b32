//! Transport: a durable, partitioned, append-only log with one topic per
//! channel and consumer-group offsets.
//!
//! Ordering is per partition only. Consumers read at-least-once: a message
//! is delivered again until its group commits past it.

pub mod memory;

use crate::error::Result;
use crate::model::Channel;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryTransport;

/// Documented per-fetch cap for this system.
pub const MAX_FETCH: usize = 100;

/// A message to append.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: Channel,
    /// Partitioning key.
    pub key: String,
    /// Appends with a dedup key already in the log are ignored.
    pub dedup_key: String,
    pub payload: serde_json::Value,
}

/// A message read by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: Channel,
    pub partition: u32,
    pub offset: i64,
    pub key: String,
    pub payload: serde_json::Value,
    /// Append time, microseconds since the Unix epoch.
    pub appended_at: i64,
}

/// The log between the producer and the channel handlers.
///
/// Within a group each partition is read by at most one member at a time;
/// membership changes rebalance partitions round-robin over members sorted
/// by id. `fetch` returns messages at or after the group's committed offset
/// on the member's partitions, so a member must commit (or abandon, on
/// shutdown) every message of a batch before fetching again.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Partitions per topic.
    fn partitions(&self) -> u32;

    /// Append a batch atomically: either every new message is written or none is.
    /// Returns how many messages were new (not deduplicated).
    async fn append(&self, batch: &[OutboundMessage]) -> Result<usize>;

    /// Register `member` in `group` for `topic`, triggering a rebalance.
    async fn join(&self, group: &str, topic: Channel, member: &str) -> Result<()>;

    /// Read up to `max` messages from the partitions assigned to `member`.
    ///
    /// Fetching refreshes the member's session and re-registers it if the
    /// session had expired.
    async fn fetch(
        &self,
        group: &str,
        topic: Channel,
        member: &str,
        max: usize,
    ) -> Result<Vec<Delivery>>;

    /// Refresh `member`'s session without fetching. Busy members call this
    /// so a long batch does not cost them their partitions.
    async fn heartbeat(&self, group: &str, topic: Channel, member: &str) -> Result<()>;

    /// Mark `delivery` and everything before it on its partition as consumed.
    async fn commit(&self, group: &str, delivery: &Delivery) -> Result<()>;

    /// Remove `member` from `group`, triggering a rebalance.
    async fn leave(&self, group: &str, topic: Channel, member: &str) -> Result<()>;

    /// Wait until new messages may be available on `topic`, or `timeout` elapses.
    async fn wait(&self, _topic: Channel, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Drop messages older than `retention`. Returns how many were removed.
    async fn purge_expired(&self, retention: Duration) -> Result<u64>;
}

/// Topic name for a channel.
pub fn topic_name(channel: Channel) -> String {
    format!("axnc.{channel}")
}

/// Consumer group for a channel's handler.
pub fn group_name(channel: Channel) -> String {
    format!("axnc-{channel}-handler")
}

/// Partition for a key: 32-bit FNV-1a, stable across processes and releases.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions.max(1)
}

/// Partitions owned by `member` given the full member list.
pub fn assigned_partitions(members: &[String], member: &str, partitions: u32) -> Vec<u32> {
    let mut sorted: Vec<&String> = members.iter().collect();
    sorted.sort();
    sorted.dedup();
    let Some(index) = sorted.iter().position(|m| m.as_str() == member) else {
        return Vec::new();
    };
    (0..partitions)
        .filter(|p| (*p as usize) % sorted.len() == index)
        .collect()
}
