//! Chat channel: posts to chat channels and direct messages.
//!
//! The OAuth token comes from the tools service and is cached for two
//! minutes. A missing token is reported as a misconfiguration event and the
//! delivery is dropped.

use super::{ChannelHandler, HandleContext};
use crate::codes::INVALID_SLACK;
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};
use crate::model::event::format_timestamp;
use crate::model::{Channel, Event};
use crate::producer::{Produce, ProduceRequest};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const TOKEN_TTL: Duration = Duration::from_secs(120);

const CHAT_SUFFIX: &str = "@chat";

/// Where the chat OAuth token is configured.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `None` when no token is configured.
    async fn fetch_token(&self) -> Result<Option<SecretString>>;
}

/// Reads the token from `GET {tools}/tools?category=notification&type=slack`.
pub struct ToolsTokenSource {
    client: reqwest::Client,
    url: String,
}

impl ToolsTokenSource {
    pub fn new(tools_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/tools", tools_url.trim_end_matches('/')),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolList {
    #[serde(default)]
    data: Vec<ToolEntry>,
}

#[derive(Debug, Deserialize)]
struct ToolEntry {
    #[serde(default)]
    oauth_token: Option<String>,
}

#[async_trait]
impl TokenSource for ToolsTokenSource {
    async fn fetch_token(&self) -> Result<Option<SecretString>> {
        let tools: ToolList = self
            .client
            .get(&self.url)
            .query(&[("category", "notification"), ("type", "slack")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(tools
            .data
            .into_iter()
            .filter_map(|t| t.oauth_token)
            .find(|t| !t.is_empty())
            .map(SecretString::from))
    }
}

/// Caches the token lookup. Concurrent callers share one refresh.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    ttl: Duration,
    cached: Mutex<Option<(Option<SecretString>, Instant)>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_ttl(source, TOKEN_TTL)
    }

    pub fn with_ttl(source: Arc<dyn TokenSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<Option<SecretString>> {
        let mut cached = self.cached.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref()
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(token.clone());
        }
        let token = self.source.fetch_token().await?;
        debug!(configured = token.is_some(), "chat token refreshed");
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

/// The subset of the chat service API the handler uses.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Post to a channel name or a user id.
    async fn post_message(&self, token: &SecretString, channel: &str, text: &str) -> Result<()>;

    /// User id for an e-mail address, `None` when unknown.
    async fn lookup_user_by_email(
        &self,
        token: &SecretString,
        email: &str,
    ) -> Result<Option<String>>;
}

pub struct SlackApi {
    client: reqwest::Client,
    base_url: String,
}

impl SlackApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user: Option<SlackUser>,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
}

fn slack_error(error: Option<String>) -> Error {
    Error::Dependency {
        service: "slack".to_string(),
        message: error.unwrap_or_else(|| "unknown error".to_string()),
        retryable: false,
    }
}

#[async_trait]
impl ChatApi for SlackApi {
    async fn post_message(&self, token: &SecretString, channel: &str, text: &str) -> Result<()> {
        let resp: SlackResponse = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(token.expose_secret())
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.ok {
            Ok(())
        } else {
            Err(slack_error(resp.error))
        }
    }

    async fn lookup_user_by_email(
        &self,
        token: &SecretString,
        email: &str,
    ) -> Result<Option<String>> {
        let resp: SlackResponse = self
            .client
            .get(format!("{}/users.lookupByEmail", self.base_url))
            .bearer_auth(token.expose_secret())
            .query(&[("email", email)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match resp {
            SlackResponse { ok: true, user, .. } => Ok(user.map(|u| u.id)),
            SlackResponse { error, .. } if error.as_deref() == Some("users_not_found") => Ok(None),
            SlackResponse { error, .. } => Err(slack_error(error)),
        }
    }
}

pub struct ChatHandler {
    tokens: TokenCache,
    api: Arc<dyn ChatApi>,
    producer: Arc<dyn Produce>,
}

impl ChatHandler {
    pub fn new(tokens: TokenCache, api: Arc<dyn ChatApi>, producer: Arc<dyn Produce>) -> Self {
        Self {
            tokens,
            api,
            producer,
        }
    }

    async fn report_missing_token(&self, event: &Event, ctx: &HandleContext) {
        let request = ProduceRequest::new(INVALID_SLACK)
            .trace_id(ctx.trace_id.clone())
            .detail("triggered_by", event.event_id.to_string());
        match self.producer.produce(request).await {
            Ok(id) => warn!(event_id = %event.event_id, report_id = %id, "no chat token configured, dropping"),
            Err(e) => error!(event_id = %event.event_id, "no chat token configured and report failed: {e}"),
        }
    }

    async fn deliver(&self, token: &SecretString, recipient: &str, body: &str) -> Result<()> {
        if let Some(channel) = recipient.strip_suffix(CHAT_SUFFIX) {
            return self.api.post_message(token, channel, body).await;
        }
        match self.api.lookup_user_by_email(token, recipient).await? {
            Some(user_id) => self.api.post_message(token, &user_id, body).await,
            None => {
                warn!(recipient, "unknown chat user, skipping");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for ChatHandler {
    fn channel(&self) -> Channel {
        Channel::Slack
    }

    async fn handle(&self, event: &Event, ctx: &HandleContext) -> Result<()> {
        if event.recipients.iter().all(|r| r.is_empty()) {
            debug!(event_id = %event.event_id, "no chat recipients");
            return Ok(());
        }

        let Some(token) = self.tokens.token().await? else {
            self.report_missing_token(event, ctx).await;
            return Ok(());
        };

        let body = render_chat_body(event);
        let mut delivered = 0;
        for recipient in event.recipients.iter().filter(|r| !r.is_empty()) {
            match self.deliver(&token, recipient, &body).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(event_id = %event.event_id, recipient = %recipient, "chat delivery failed: {e}"),
            }
        }
        info!(event_id = %event.event_id, delivered, "chat notifications attempted");
        Ok(())
    }
}

pub fn render_chat_body(event: &Event) -> String {
    let mut body = format!(
        ">*Event:* {}\n>*Severity:* {}\n>*Channel:* {}\n>*Timestamp:* {}\n>*Cluster:* {}\n>>>*Details:*\n",
        event.message,
        event.severity,
        event.channel,
        format_timestamp(event.timestamp),
        event.cluster,
    );
    for (key, value) in event.sorted_detail() {
        body.push_str(&format!("{key}: {value}\n"));
    }
    body
}
