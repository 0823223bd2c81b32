//! Codes registry: the catalogue of event codes.
//!
//! Each code binds a channel, facility, severity and message template.
//! The catalogue is embedded in the binary and never mutated after boot, so
//! callers cannot choose an event's channel or severity themselves.

use crate::error::{Error, Result};
use crate::model::{Channel, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const INVALID_SLACK: &str = "configuration.notification.invalid.slack";
pub const INVALID_SMTP: &str = "configuration.notification.invalid.smtp";
pub const INVALID_RULE: &str = "configuration.invalid.rule";

const EMBEDDED: &str = include_str!("codes.toml");

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct CodesFile {
    code: Vec<CodeBinding>,
}

/// The server-side definition of one event code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBinding {
    pub code: String,
    pub channel: Channel,
    pub facility: String,
    pub severity: Severity,
    /// Template with `{key}` placeholders filled from the event detail.
    #[serde(rename = "message")]
    pub template: String,
    /// Exempt from the per-code throttle on `email` and `slack`.
    #[serde(default)]
    pub no_limit: bool,
}

impl CodeBinding {
    pub fn new(
        code: impl Into<String>,
        channel: Channel,
        facility: impl Into<String>,
        severity: Severity,
        template: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            channel,
            facility: facility.into(),
            severity,
            template: template.into(),
            no_limit: false,
        }
    }

    pub fn unthrottled(mut self) -> Self {
        self.no_limit = true;
        self
    }
}

/// Registry of code bindings, indexed by code.
#[derive(Debug, Clone)]
pub struct CodeRegistry {
    bindings: BTreeMap<String, CodeBinding>,
}

impl CodeRegistry {
    /// Load the catalogue compiled into the binary.
    pub fn embedded() -> Result<Self> {
        let file: CodesFile = toml::from_str(EMBEDDED)
            .map_err(|e| Error::Config(format!("bad embedded code catalogue: {e}")))?;
        Self::from_bindings(file.code)
    }

    /// Build a registry from explicit bindings. Duplicate codes are rejected.
    pub fn from_bindings(bindings: impl IntoIterator<Item = CodeBinding>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for binding in bindings {
            if binding.code.is_empty() || binding.code.contains('*') {
                return Err(Error::Config(format!(
                    "invalid event code in catalogue: {:?}",
                    binding.code
                )));
            }
            if map.contains_key(&binding.code) {
                return Err(Error::Config(format!(
                    "duplicate event code in catalogue: {}",
                    binding.code
                )));
            }
            map.insert(binding.code.clone(), binding);
        }
        Ok(Self { bindings: map })
    }

    /// Look up a code's binding.
    pub fn lookup(&self, code: &str) -> Result<&CodeBinding> {
        self.bindings
            .get(code)
            .ok_or_else(|| Error::UnknownCode(code.to_string()))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.bindings.contains_key(code)
    }

    /// All bindings, ordered by code.
    pub fn all(&self) -> Vec<&CodeBinding> {
        self.bindings.values().collect()
    }

    /// Whether a rule code entry refers to at least one registered code.
    pub fn resolves(&self, pattern: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(_) => self.bindings.keys().any(|code| pattern_matches(pattern, code)),
            None => self.contains(pattern),
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Match a rule code entry against an event code.
///
/// A trailing `*` matches by prefix; any other `*` is a literal character.
pub fn pattern_matches(pattern: &str, code: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => code.starts_with(prefix),
        None => pattern == code,
    }
}
