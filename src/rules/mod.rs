//! Rule engine and rule management.
//!
//! The engine reads enabled rules from the store on every `route` call, so a
//! committed rule change is visible to the next produced event.

pub mod resolve;
pub mod validate;

use crate::codes::{CodeRegistry, pattern_matches};
use crate::directory::UserDirectory;
use crate::error::{Error, Result};
use crate::model::{Channel, Event, Routing, Rule, RuleDraft, RuleId, RuleSpec};
use crate::store::RuleStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

pub use validate::validate_draft;

/// True when `codes` is empty or any entry matches `code`.
pub fn codes_match(codes: &[String], code: &str) -> bool {
    codes.is_empty() || codes.iter().any(|p| pattern_matches(p, code))
}

/// A rule applies when both its codes and its severities match.
pub fn rule_matches(spec: &RuleSpec, event: &Event) -> bool {
    codes_match(&spec.codes, &event.code) && spec.severities.contains(&event.severity)
}

pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    registry: Arc<CodeRegistry>,
    directory: Arc<UserDirectory>,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn RuleStore>,
        registry: Arc<CodeRegistry>,
        directory: Arc<UserDirectory>,
    ) -> Self {
        Self {
            store,
            registry,
            directory,
        }
    }

    /// Recipients per channel for `event` from the enabled rules.
    ///
    /// Rules referencing codes the registry no longer knows are skipped and
    /// reported in `Routing::skipped_rules`.
    pub async fn route(&self, event: &Event) -> Result<Routing> {
        let rules = self.store.list_rules(Some(true)).await?;
        let mut raw: BTreeMap<Channel, BTreeSet<String>> = BTreeMap::new();
        let mut skipped = Vec::new();

        for rule in &rules {
            if let Some(code) = rule.spec.codes.iter().find(|c| !self.registry.resolves(c)) {
                warn!(rule_id = %rule.rule_id, code = %code, "rule references an unknown code, skipping");
                metrics::rules_skipped().add(1, &[KeyValue::new("rule_id", rule.rule_id.to_string())]);
                skipped.push(rule.rule_id);
                continue;
            }
            if !rule_matches(&rule.spec, event) {
                continue;
            }
            for channel in &rule.spec.channels {
                raw.entry(*channel)
                    .or_default()
                    .extend(rule.spec.recipients.iter().cloned());
            }
        }

        Ok(self.resolve(event, raw, skipped))
    }

    /// Route to an explicit recipient list on every user-facing channel,
    /// bypassing the rules.
    pub fn route_explicit(&self, event: &Event, recipients: &[String]) -> Routing {
        let raw = Channel::USER_FACING
            .into_iter()
            .map(|c| (c, recipients.iter().cloned().collect()))
            .collect();
        self.resolve(event, raw, Vec::new())
    }

    fn resolve(
        &self,
        event: &Event,
        raw: BTreeMap<Channel, BTreeSet<String>>,
        skipped_rules: Vec<RuleId>,
    ) -> Routing {
        let directory = self.directory.snapshot();
        let mut bindings = BTreeMap::new();
        let mut everyone = BTreeSet::new();

        for (channel, tokens) in raw {
            let concrete: BTreeSet<String> = tokens
                .iter()
                .flat_map(|t| resolve::expand(t, event, &directory))
                .collect();
            if channel.is_user_facing() {
                bindings.insert(channel, resolve::filter_for(channel, &concrete, &directory));
            }
            everyone.extend(concrete);
        }

        bindings.insert(
            Channel::UiStore,
            resolve::filter_for(Channel::UiStore, &everyone, &directory),
        );
        bindings.insert(Channel::SupportArchive, BTreeSet::new());

        Routing {
            bindings,
            skipped_rules,
        }
    }
}

/// Validated CRUD over the rules store.
#[derive(Clone)]
pub struct RuleManager {
    store: Arc<dyn RuleStore>,
    registry: Arc<CodeRegistry>,
}

impl RuleManager {
    pub fn new(store: Arc<dyn RuleStore>, registry: Arc<CodeRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn create(&self, draft: RuleDraft) -> Result<Rule> {
        let spec = validate_draft(draft, &self.registry)?;
        self.store.create_rule(spec).await
    }

    pub async fn list(&self, enabled: Option<bool>) -> Result<Vec<Rule>> {
        self.store.list_rules(enabled).await
    }

    pub async fn get(&self, id: RuleId) -> Result<Rule> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rule {id}")))
    }

    pub async fn update(&self, id: RuleId, draft: RuleDraft) -> Result<Rule> {
        let spec = validate_draft(draft, &self.registry)?;
        self.store.update_rule(id, spec).await
    }

    /// Returns whether a rule was removed; deleting an unknown id is not an error.
    pub async fn delete(&self, id: RuleId) -> Result<bool> {
        self.store.delete_rule(id).await
    }
}
