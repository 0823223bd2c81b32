//! In-process transport with the same semantics as the Postgres log.
//! Used by tests and by single-process deployments.

use super::{Delivery, OutboundMessage, Transport, assigned_partitions, partition_for};
use crate::error::{Error, Result};
use crate::model::Channel;
use crate::model::event::now_micros;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Stored {
    offset: i64,
    key: String,
    dedup_key: String,
    payload: serde_json::Value,
    appended_at: i64,
}

#[derive(Default)]
struct State {
    logs: HashMap<(Channel, u32), Vec<Stored>>,
    next_offsets: HashMap<(Channel, u32), i64>,
    dedup: HashSet<String>,
    members: HashMap<(String, Channel), BTreeSet<String>>,
    committed: HashMap<(String, Channel, u32), i64>,
    heartbeats: HashMap<String, u64>,
}

pub struct MemoryTransport {
    partitions: u32,
    state: Mutex<State>,
    appended: Notify,
    failing_appends: AtomicU32,
}

impl MemoryTransport {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            failing_appends: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` appends fail with a transport error.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Every retained message on a topic, ordered by partition then offset.
    pub fn messages(&self, topic: Channel) -> Vec<Delivery> {
        let state = self.lock();
        (0..self.partitions)
            .flat_map(|p| {
                state
                    .logs
                    .get(&(topic, p))
                    .into_iter()
                    .flatten()
                    .map(move |m| to_delivery(topic, p, m))
            })
            .collect()
    }

    /// The group's next offset to read on a partition, if it ever committed.
    pub fn committed(&self, group: &str, topic: Channel, partition: u32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic, partition))
            .copied()
    }

    /// Heartbeats sent by all members of `group`.
    pub fn heartbeats(&self, group: &str) -> u64 {
        self.lock().heartbeats.get(group).copied().unwrap_or(0)
    }

    /// Whether a dedup key is still remembered.
    pub fn remembers(&self, dedup_key: &str) -> bool {
        self.lock().dedup.contains(dedup_key)
    }

    /// Messages on a topic not yet committed by `group`.
    pub fn lag(&self, group: &str, topic: Channel) -> usize {
        let state = self.lock();
        (0..self.partitions)
            .map(|p| {
                let from = state
                    .committed
                    .get(&(group.to_string(), topic, p))
                    .copied()
                    .unwrap_or(0);
                state
                    .logs
                    .get(&(topic, p))
                    .map_or(0, |log| log.iter().filter(|m| m.offset >= from).count())
            })
            .sum()
    }
}

fn to_delivery(topic: Channel, partition: u32, m: &Stored) -> Delivery {
    Delivery {
        topic,
        partition,
        offset: m.offset,
        key: m.key.clone(),
        payload: m.payload.clone(),
        appended_at: m.appended_at,
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, batch: &[OutboundMessage]) -> Result<usize> {
        let failing = self.failing_appends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_appends.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Transport("injected append failure".to_string()));
        }

        let written = {
            let mut state = self.lock();
            let now = now_micros();
            let mut written = 0;
            for msg in batch {
                if !state.dedup.insert(msg.dedup_key.clone()) {
                    continue;
                }
                let partition = partition_for(&msg.key, self.partitions);
                let next = state.next_offsets.entry((msg.topic, partition)).or_insert(0);
                let offset = *next;
                *next += 1;
                state
                    .logs
                    .entry((msg.topic, partition))
                    .or_default()
                    .push(Stored {
                        offset,
                        key: msg.key.clone(),
                        dedup_key: msg.dedup_key.clone(),
                        payload: msg.payload.clone(),
                        appended_at: now,
                    });
                written += 1;
            }
            written
        };

        if written > 0 {
            self.appended.notify_waiters();
        }
        Ok(written)
    }

    async fn join(&self, group: &str, topic: Channel, member: &str) -> Result<()> {
        self.lock()
            .members
            .entry((group.to_string(), topic))
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn fetch(
        &self,
        group: &str,
        topic: Channel,
        member: &str,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        let mut state = self.lock();
        let members: Vec<String> = {
            let group_members = state
                .members
                .entry((group.to_string(), topic))
                .or_default();
            group_members.insert(member.to_string());
            group_members.iter().cloned().collect()
        };

        let mut out = Vec::new();
        for partition in assigned_partitions(&members, member, self.partitions) {
            let from = state
                .committed
                .get(&(group.to_string(), topic, partition))
                .copied()
                .unwrap_or(0);
            let Some(log) = state.logs.get(&(topic, partition)) else {
                continue;
            };
            for m in log.iter().filter(|m| m.offset >= from) {
                if out.len() >= max {
                    return Ok(out);
                }
                out.push(to_delivery(topic, partition, m));
            }
        }
        Ok(out)
    }

    async fn heartbeat(&self, group: &str, topic: Channel, member: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .members
            .entry((group.to_string(), topic))
            .or_default()
            .insert(member.to_string());
        *state.heartbeats.entry(group.to_string()).or_default() += 1;
        Ok(())
    }

    async fn commit(&self, group: &str, delivery: &Delivery) -> Result<()> {
        let mut state = self.lock();
        let next = delivery.offset + 1;
        let entry = state
            .committed
            .entry((group.to_string(), delivery.topic, delivery.partition))
            .or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    async fn leave(&self, group: &str, topic: Channel, member: &str) -> Result<()> {
        if let Some(members) = self.lock().members.get_mut(&(group.to_string(), topic)) {
            members.remove(member);
        }
        Ok(())
    }

    async fn wait(&self, _topic: Channel, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }

    async fn purge_expired(&self, retention: Duration) -> Result<u64> {
        let retention = i64::try_from(retention.as_micros()).unwrap_or(i64::MAX);
        let cutoff = now_micros().saturating_sub(retention);
        let mut state = self.lock();
        let mut expired = Vec::new();
        for log in state.logs.values_mut() {
            let (gone, kept): (Vec<Stored>, Vec<Stored>) =
                log.drain(..).partition(|m| m.appended_at < cutoff);
            *log = kept;
            expired.extend(gone.into_iter().map(|m| m.dedup_key));
        }
        for key in &expired {
            state.dedup.remove(key);
        }
        Ok(expired.len() as u64)
    }
}
