//! Tests for rule validation, rule management and routing.

use axnc_rs::codes::CodeRegistry;
use axnc_rs::directory::{StaticUsers, UserDirectory, UserRecord};
use axnc_rs::error::Error;
use axnc_rs::model::event::now_micros;
use axnc_rs::model::{Channel, Event, EventId, RuleDraft, RuleSpec, Severity};
use axnc_rs::rules::{RuleEngine, RuleManager, codes_match, validate_draft};
use axnc_rs::store::{MemoryRuleStore, RuleStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

fn registry() -> Arc<CodeRegistry> {
    Arc::new(CodeRegistry::embedded().expect("embedded catalogue"))
}

fn draft(codes: &[&str], severities: &[&str], channels: &[&str], recipients: &[&str]) -> RuleDraft {
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
    RuleDraft {
        name: "test rule".to_string(),
        enabled: true,
        codes: owned(codes),
        severities: owned(severities),
        channels: owned(channels),
        recipients: owned(recipients),
    }
}

fn event(code: &str, severity: Severity, detail: &[(&str, &str)]) -> Event {
    Event {
        event_id: EventId::new(),
        trace_id: "trace".to_string(),
        cluster: "cluster-1".to_string(),
        code: code.to_string(),
        channel: Channel::Email,
        facility: "axops.jobs".to_string(),
        severity,
        message: "msg".to_string(),
        timestamp: now_micros(),
        detail: detail
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        recipients: BTreeSet::new(),
        acknowledged_by: None,
        acknowledged_at: None,
    }
}

struct Fixture {
    store: Arc<MemoryRuleStore>,
    manager: RuleManager,
    engine: RuleEngine,
}

fn fixture(users: Vec<UserRecord>) -> Fixture {
    let registry = registry();
    let store = Arc::new(MemoryRuleStore::new());
    let directory = Arc::new(UserDirectory::new(Arc::new(StaticUsers(users))));
    Fixture {
        manager: RuleManager::new(store.clone(), registry.clone()),
        engine: RuleEngine::new(store.clone(), registry, directory),
        store,
    }
}

async fn fixture_loaded(users: Vec<UserRecord>) -> Fixture {
    let registry = registry();
    let store = Arc::new(MemoryRuleStore::new());
    let directory = Arc::new(
        UserDirectory::load(Arc::new(StaticUsers(users)))
            .await
            .unwrap(),
    );
    Fixture {
        manager: RuleManager::new(store.clone(), registry.clone()),
        engine: RuleEngine::new(store.clone(), registry, directory),
        store,
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn field_of(result: axnc_rs::error::Result<RuleSpec>) -> (String, String) {
    match result {
        Err(Error::Validation { field, message }) => (field, message),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn valid_draft_becomes_typed_spec() {
    let spec = validate_draft(
        draft(&["job.*"], &["warning", "critical"], &["email", "slack"], &["ops@example.com"]),
        &registry(),
    )
    .unwrap();
    assert_eq!(spec.severities, vec![Severity::Warning, Severity::Critical]);
    assert_eq!(spec.channels, vec![Channel::Email, Channel::Slack]);
}

#[test]
fn draft_without_channels_is_rejected() {
    let (field, message) = field_of(validate_draft(draft(&[], &["info"], &[], &["a@x"]), &registry()));
    assert_eq!(field, "channels");
    assert_eq!(message, "Must specify at least one channel");
}

#[test]
fn draft_with_unknown_channel_names_it() {
    let (field, message) = field_of(validate_draft(
        draft(&[], &["info"], &["email", "pager"], &["a@x"]),
        &registry(),
    ));
    assert_eq!(field, "channels");
    assert_eq!(message, "Invalid channel supplied (pager)");
}

#[test]
fn draft_with_unknown_severity_names_it() {
    let (field, message) = field_of(validate_draft(
        draft(&[], &["fatal"], &["email"], &["a@x"]),
        &registry(),
    ));
    assert_eq!(field, "severities");
    assert_eq!(message, "Invalid severity supplied (fatal)");
}

#[test]
fn draft_without_recipients_is_rejected() {
    let (field, _) = field_of(validate_draft(draft(&[], &["info"], &["email"], &[]), &registry()));
    assert_eq!(field, "recipients");
}

#[test]
fn draft_with_unknown_code_or_dead_prefix_is_rejected() {
    let (field, message) = field_of(validate_draft(
        draft(&["job.nope"], &["info"], &["email"], &["a@x"]),
        &registry(),
    ));
    assert_eq!(field, "codes");
    assert_eq!(message, "Invalid code supplied (job.nope)");

    let (field, _) = field_of(validate_draft(
        draft(&["widget.*"], &["info"], &["email"], &["a@x"]),
        &registry(),
    ));
    assert_eq!(field, "codes");
}

#[test]
fn empty_codes_match_everything() {
    assert!(codes_match(&[], "job.failure"));
    assert!(codes_match(&["job.*".to_string()], "job.failure"));
    assert!(!codes_match(&["deployment.*".to_string()], "job.failure"));
}

// ---------------------------------------------------------------------------
// Management
// ---------------------------------------------------------------------------

#[tokio::test]
async fn created_rule_round_trips_through_its_own_body() {
    let fx = fixture(vec![]);
    let created = fx
        .manager
        .create(draft(&["job.*"], &["warning"], &["email"], &["ops@example.com"]))
        .await
        .unwrap();

    let fetched = fx.manager.get(created.rule_id).await.unwrap();
    let body = serde_json::to_value(&fetched).unwrap();
    let again: RuleDraft = serde_json::from_value(body).unwrap();
    let recreated = fx.manager.create(again).await.unwrap();

    assert_ne!(recreated.rule_id, created.rule_id);
    assert_eq!(recreated.spec, created.spec);
}

#[tokio::test]
async fn list_filters_by_enabled() {
    let fx = fixture(vec![]);
    let mut disabled = draft(&[], &["info"], &["email"], &["a@x"]);
    disabled.enabled = false;
    fx.manager.create(disabled).await.unwrap();
    fx.manager
        .create(draft(&[], &["info"], &["email"], &["b@x"]))
        .await
        .unwrap();

    assert_eq!(fx.manager.list(None).await.unwrap().len(), 2);
    assert_eq!(fx.manager.list(Some(true)).await.unwrap().len(), 1);
    assert_eq!(fx.manager.list(Some(false)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_of_unknown_rule_is_not_found_and_delete_is_idempotent() {
    let fx = fixture(vec![]);
    let missing = axnc_rs::model::RuleId::new();
    let err = fx
        .manager
        .update(missing, draft(&[], &["info"], &["email"], &["a@x"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let rule = fx
        .manager
        .create(draft(&[], &["info"], &["email"], &["a@x"]))
        .await
        .unwrap();
    assert!(fx.manager.delete(rule.rule_id).await.unwrap());
    assert!(!fx.manager.delete(rule.rule_id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn matching_rule_binds_recipients_per_channel() {
    let fx = fixture(vec![]);
    fx.manager
        .create(draft(
            &["job.*"],
            &["warning", "critical"],
            &["email", "slack"],
            &["ops@example.com", "#alerts@chat"],
        ))
        .await
        .unwrap();

    let routing = fx
        .engine
        .route(&event("job.failure", Severity::Warning, &[]))
        .await
        .unwrap();

    assert_eq!(routing.recipients(Channel::Email), Some(&set(&["ops@example.com"])));
    assert_eq!(routing.recipients(Channel::Slack), Some(&set(&["#alerts@chat"])));
    assert_eq!(routing.recipients(Channel::UiStore), Some(&BTreeSet::new()));
    assert_eq!(routing.recipients(Channel::SupportArchive), Some(&BTreeSet::new()));
}

#[tokio::test]
async fn severity_mismatch_contributes_nothing() {
    let fx = fixture(vec![]);
    fx.manager
        .create(draft(&["job.*"], &["critical"], &["email"], &["ops@example.com"]))
        .await
        .unwrap();

    let routing = fx
        .engine
        .route(&event("job.failure", Severity::Warning, &[]))
        .await
        .unwrap();
    assert!(routing.recipients(Channel::Email).is_none());
    assert!(routing.recipients(Channel::UiStore).is_some());
}

#[tokio::test]
async fn overlapping_rules_deduplicate_recipients() {
    let fx = fixture(vec![]);
    for recipients in [["a@x", "b@x"], ["b@x", "c@x"]] {
        fx.manager
            .create(draft(&[], &["warning"], &["email"], &recipients))
            .await
            .unwrap();
    }

    let routing = fx
        .engine
        .route(&event("job.failure", Severity::Warning, &[]))
        .await
        .unwrap();
    assert_eq!(routing.recipients(Channel::Email), Some(&set(&["a@x", "b@x", "c@x"])));
}

#[tokio::test]
async fn disabled_rules_are_ignored() {
    let fx = fixture(vec![]);
    let mut rule = draft(&[], &["warning"], &["email"], &["a@x"]);
    rule.enabled = false;
    fx.manager.create(rule).await.unwrap();

    let routing = fx
        .engine
        .route(&event("job.failure", Severity::Warning, &[]))
        .await
        .unwrap();
    assert!(routing.recipients(Channel::Email).is_none());
}

#[tokio::test]
async fn labels_resolve_from_detail_and_unbound_labels_drop() {
    let fx = fixture(vec![]);
    fx.manager
        .create(draft(
            &[],
            &["warning"],
            &["email"],
            &["<submitter>", "author", "<committer>"],
        ))
        .await
        .unwrap();

    let routing = fx
        .engine
        .route(&event(
            "job.failure",
            Severity::Warning,
            &[("submitter", "sam@example.com"), ("author", "al@example.com, ann@example.com")],
        ))
        .await
        .unwrap();
    assert_eq!(
        routing.recipients(Channel::Email),
        Some(&set(&["al@example.com", "ann@example.com", "sam@example.com"]))
    );
}

#[tokio::test]
async fn groups_expand_and_preferences_filter() {
    let fx = fixture_loaded(vec![
        UserRecord::new("ann@example.com").in_group("oncall"),
        UserRecord::new("bob@example.com")
            .in_group("oncall")
            .opt_out(Channel::Email),
        UserRecord::new("cy@example.com").in_group("oncall").inactive(),
    ])
    .await;
    fx.manager
        .create(draft(&[], &["warning"], &["email", "slack"], &["oncall@group"]))
        .await
        .unwrap();

    let routing = fx
        .engine
        .route(&event("job.failure", Severity::Warning, &[]))
        .await
        .unwrap();
    assert_eq!(routing.recipients(Channel::Email), Some(&set(&["ann@example.com"])));
    assert_eq!(
        routing.recipients(Channel::Slack),
        Some(&set(&["ann@example.com", "bob@example.com"]))
    );
    assert_eq!(
        routing.recipients(Channel::UiStore),
        Some(&set(&["ann@example.com", "bob@example.com"]))
    );
}

#[tokio::test]
async fn rule_with_vanished_code_is_skipped_and_reported() {
    let fx = fixture(vec![]);
    // Written straight to the store, as if the code was removed after the rule was saved.
    let stale = fx
        .store
        .create_rule(RuleSpec {
            name: "stale".to_string(),
            enabled: true,
            codes: vec!["legacy.code".to_string()],
            severities: vec![Severity::Warning],
            channels: vec![Channel::Email],
            recipients: vec!["a@x".to_string()],
        })
        .await
        .unwrap();

    let routing = fx
        .engine
        .route(&event("job.failure", Severity::Warning, &[]))
        .await
        .unwrap();
    assert_eq!(routing.skipped_rules, vec![stale.rule_id]);
    assert!(routing.recipients(Channel::Email).is_none());
}

#[tokio::test]
async fn explicit_recipients_bypass_rules() {
    let fx = fixture(vec![]);
    fx.manager
        .create(draft(&[], &["warning"], &["email"], &["rule@example.com"]))
        .await
        .unwrap();

    let e = event("job.failure", Severity::Warning, &[]);
    let routing = fx
        .engine
        .route_explicit(&e, &["direct@example.com".to_string(), "#ops@chat".to_string()]);
    assert_eq!(routing.recipients(Channel::Email), Some(&set(&["direct@example.com"])));
    assert_eq!(routing.recipients(Channel::Slack), Some(&set(&["#ops@chat"])));
}
