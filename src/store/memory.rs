//! In-memory rule and event stores.

use super::{EventQuery, EventStore, RuleStore, SortOrder};
use crate::error::{Error, Result};
use crate::model::{Event, EventId, Rule, RuleId, RuleSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<Vec<Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn create_rule(&self, spec: RuleSpec) -> Result<Rule> {
        let now = chrono::Utc::now().timestamp();
        let rule = Rule {
            rule_id: RuleId::new(),
            spec,
            create_time: now,
            last_modified_time: now,
        };
        self.rules.write().await.push(rule.clone());
        Ok(rule)
    }

    async fn list_rules(&self, enabled: Option<bool>) -> Result<Vec<Rule>> {
        let rules = self.rules.read().await;
        Ok(rules
            .iter()
            .filter(|r| enabled.is_none_or(|e| r.spec.enabled == e))
            .cloned()
            .collect())
    }

    async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        let rules = self.rules.read().await;
        Ok(rules.iter().find(|r| r.rule_id == id).cloned())
    }

    async fn update_rule(&self, id: RuleId, spec: RuleSpec) -> Result<Rule> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.rule_id == id)
            .ok_or_else(|| Error::NotFound(format!("rule {id}")))?;
        rule.spec = spec;
        rule.last_modified_time = chrono::Utc::now().timestamp();
        Ok(rule.clone())
    }

    async fn delete_rule(&self, id: RuleId) -> Result<bool> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.rule_id != id);
        Ok(rules.len() != before)
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<EventId, Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_event(&self, event: &Event) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.event_id)
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events.values().filter(|e| query.matches(e)).cloned().collect();
        matched.sort_by_key(|e| (e.timestamp, e.event_id));
        if query.ordering == SortOrder::Desc {
            matched.reverse();
        }
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(matched
            .into_iter()
            .skip(query.offset as usize)
            .take(limit)
            .collect())
    }

    async fn acknowledge_event(&self, id: EventId, user: &str, at: i64) -> Result<Option<Event>> {
        let mut events = self.events.write().await;
        Ok(events.get_mut(&id).map(|event| {
            event.acknowledged_by = Some(user.to_string());
            event.acknowledged_at = Some(at);
            event.clone()
        }))
    }
}
