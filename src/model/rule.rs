//! Routing rules and the rule engine's output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::vocab::{Channel, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RuleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A rule body as submitted by a client, before validation.
///
/// Vocabulary fields stay as strings so validation can name the offending
/// entry. Unknown fields (such as a fetched rule's `rule_id`) are ignored,
/// which lets a fetched rule be posted back as-is.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub severities: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// The validated, typed content of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub enabled: bool,
    /// Exact codes or prefix patterns ending in `*`. Empty matches every code.
    pub codes: Vec<String>,
    pub severities: Vec<Severity>,
    pub channels: Vec<Channel>,
    pub recipients: Vec<String>,
}

/// A persisted rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: RuleId,
    #[serde(flatten)]
    pub spec: RuleSpec,
    /// Seconds since the Unix epoch.
    pub create_time: i64,
    /// Seconds since the Unix epoch.
    pub last_modified_time: i64,
}

/// Rule engine output: recipients per destination channel.
///
/// Ephemeral; attached to an event before the transport write and never
/// persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    pub bindings: BTreeMap<Channel, BTreeSet<String>>,
    /// Enabled rules skipped because they reference codes the registry no longer knows.
    pub skipped_rules: Vec<RuleId>,
}

impl Routing {
    pub fn recipients(&self, channel: Channel) -> Option<&BTreeSet<String>> {
        self.bindings.get(&channel)
    }
}
