//! User directory: who exists, which groups they belong to, and which
//! channels they accept.
//!
//! Users and groups are owned by the gateway. The directory keeps an
//! in-process snapshot and reloads it periodically, so recipient resolution
//! never blocks on the user service.

use crate::error::{Error, Result};
use crate::model::Channel;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// A user as reported by the user service.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    /// Login name; always an e-mail address.
    pub username: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Per-channel opt-outs: a value of `"no"` under `email` or `slack`.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

fn default_state() -> String {
    "active".to_string()
}

impl UserRecord {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            state: default_state(),
            groups: Vec::new(),
            settings: HashMap::new(),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn opt_out(mut self, channel: Channel) -> Self {
        self.settings
            .insert(channel.as_str().to_string(), "no".to_string());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.state = "inactive".to_string();
        self
    }
}

/// Delivery preferences of a known user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preferences {
    pub active: bool,
    pub email: bool,
    pub slack: bool,
}

impl Preferences {
    pub fn accepts(&self, channel: Channel) -> bool {
        self.active
            && match channel {
                Channel::Email => self.email,
                Channel::Slack => self.slack,
                Channel::UiStore | Channel::SupportArchive => true,
            }
    }
}

/// Immutable view of the directory at one point in time.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    users: HashMap<String, Preferences>,
    groups: HashMap<String, BTreeSet<String>>,
}

impl DirectorySnapshot {
    pub fn from_records(records: impl IntoIterator<Item = UserRecord>) -> Self {
        let mut users = HashMap::new();
        let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();
        for record in records {
            let opted_in = |channel: Channel| {
                record
                    .settings
                    .get(channel.as_str())
                    .is_none_or(|v| v != "no")
            };
            users.insert(
                record.username.clone(),
                Preferences {
                    active: record.state == "active",
                    email: opted_in(Channel::Email),
                    slack: opted_in(Channel::Slack),
                },
            );
            for group in &record.groups {
                groups
                    .entry(group.clone())
                    .or_default()
                    .insert(record.username.clone());
            }
        }
        Self { users, groups }
    }

    pub fn preferences(&self, username: &str) -> Option<Preferences> {
        self.users.get(username).copied()
    }

    pub fn is_known(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Members of a group; empty for unknown groups.
    pub fn members(&self, group: &str) -> impl Iterator<Item = &String> {
        self.groups.get(group).into_iter().flatten()
    }
}

/// Where directory snapshots come from.
#[async_trait]
pub trait UserSource: Send + Sync {
    async fn load_users(&self) -> Result<Vec<UserRecord>>;
}

/// A fixed user list. Used when no user service is configured, and in tests.
pub struct StaticUsers(pub Vec<UserRecord>);

#[async_trait]
impl UserSource for StaticUsers {
    async fn load_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.0.clone())
    }
}

/// Loads users from the gateway's user endpoint (`{"data": [...]}`).
pub struct HttpUserSource {
    url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    data: Vec<UserRecord>,
}

impl HttpUserSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl UserSource for HttpUserSource {
    async fn load_users(&self) -> Result<Vec<UserRecord>> {
        let resp = self.http.get(&self.url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::Dependency {
                service: "user directory".to_string(),
                message: format!("returned {status}"),
                retryable: status.is_server_error(),
            });
        }
        let list: UserList = resp.json().await?;
        Ok(list.data)
    }
}

/// Shared directory handle with a swappable snapshot.
pub struct UserDirectory {
    source: Arc<dyn UserSource>,
    snapshot: RwLock<Arc<DirectorySnapshot>>,
}

impl UserDirectory {
    pub fn new(source: Arc<dyn UserSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(DirectorySnapshot::default())),
        }
    }

    /// A directory that knows nobody and never changes.
    pub fn empty() -> Self {
        Self::new(Arc::new(StaticUsers(Vec::new())))
    }

    /// Build a directory and load it once.
    pub async fn load(source: Arc<dyn UserSource>) -> Result<Self> {
        let directory = Self::new(source);
        directory.refresh().await?;
        Ok(directory)
    }

    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Reload from the source. The previous snapshot stays in place on error.
    pub async fn refresh(&self) -> Result<()> {
        let records = self.source.load_users().await?;
        let count = records.len();
        let next = Arc::new(DirectorySnapshot::from_records(records));
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
        info!(users = count, "user directory refreshed");
        Ok(())
    }

    /// Refresh every `interval` until `shutdown` flips to true.
    pub async fn run_refresh(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.refresh().await {
                warn!("user directory refresh failed: {e}");
            }
        }
    }
}
