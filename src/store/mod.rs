//! Persistence seams: the rules store and the event store.
//!
//! Postgres implementations live in [`crate::db`]; [`memory`] holds the
//! in-process versions used by tests and single-process runs.

pub mod memory;

use crate::error::Result;
use crate::model::{Channel, Event, EventId, Rule, RuleId, RuleSpec, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{MemoryEventStore, MemoryRuleStore};

/// Persisted routing rules. Validation happens before a spec reaches the store.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create_rule(&self, spec: RuleSpec) -> Result<Rule>;

    /// List rules, optionally filtered by `enabled`, ordered by creation time.
    async fn list_rules(&self, enabled: Option<bool>) -> Result<Vec<Rule>>;

    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>>;

    /// Replace a rule's content. Fails with `NotFound` for unknown ids.
    async fn update_rule(&self, id: RuleId, spec: RuleSpec) -> Result<Rule>;

    /// Remove a rule. Returns whether a row was removed.
    async fn delete_rule(&self, id: RuleId) -> Result<bool>;
}

/// Persisted copies of dispatched events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert keyed by `event_id`. Storing the same event again changes nothing.
    async fn upsert_event(&self, event: &Event) -> Result<()>;

    async fn get_event(&self, id: EventId) -> Result<Option<Event>>;

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>>;

    /// Stamp `acknowledged_by` / `acknowledged_at` (microseconds).
    /// Returns the updated event, or `None` for unknown ids.
    async fn acknowledge_event(&self, id: EventId, user: &str, at: i64) -> Result<Option<Event>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters for listing stored events. Times are microseconds, both bounds inclusive.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub channel: Option<Channel>,
    pub facility: Option<String>,
    pub severity: Option<Severity>,
    pub trace_id: Option<String>,
    pub recipient: Option<String>,
    pub min_time: Option<i64>,
    pub max_time: Option<i64>,
    pub ordering: SortOrder,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        self.channel.is_none_or(|c| event.channel == c)
            && self.facility.as_ref().is_none_or(|f| &event.facility == f)
            && self.severity.is_none_or(|s| event.severity == s)
            && self.trace_id.as_ref().is_none_or(|t| &event.trace_id == t)
            && self
                .recipient
                .as_ref()
                .is_none_or(|r| event.recipients.contains(r))
            && self.min_time.is_none_or(|t| event.timestamp >= t)
            && self.max_time.is_none_or(|t| event.timestamp <= t)
    }
}
