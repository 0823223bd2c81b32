//! Email channel: renders an HTML message and hands it to the notification service.
//!
//! A rejection that retrying cannot fix is reported as a misconfiguration
//! event before the delivery is dropped.

use super::{ChannelHandler, HandleContext};
use crate::codes::INVALID_SMTP;
use crate::error::{Error, Result};
use crate::model::event::format_timestamp;
use crate::model::{Channel, Event};
use crate::producer::{Produce, ProduceRequest};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Body accepted by the notification service's email endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Sends through `POST {base}/v1/notifications/email`.
pub struct NotificationServiceSender {
    client: reqwest::Client,
    endpoint: String,
}

impl NotificationServiceSender {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/notifications/email", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl EmailSender for NotificationServiceSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let resp = self.client.post(&self.endpoint).json(message).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(Error::Dependency {
            service: "notification-service".to_string(),
            message: format!("{status}: {text}"),
            retryable: !status.is_client_error(),
        })
    }
}

pub struct EmailHandler {
    sender: Arc<dyn EmailSender>,
    producer: Arc<dyn Produce>,
}

impl EmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>, producer: Arc<dyn Produce>) -> Self {
        Self { sender, producer }
    }

    async fn report_rejection(&self, event: &Event, ctx: &HandleContext, cause: &Error) {
        let request = ProduceRequest::new(INVALID_SMTP)
            .trace_id(ctx.trace_id.clone())
            .detail("triggered_by", event.event_id.to_string())
            .detail("reason", cause.to_string());
        match self.producer.produce(request).await {
            Ok(id) => warn!(event_id = %event.event_id, report_id = %id, "email rejected: {cause}"),
            Err(e) => error!(event_id = %event.event_id, "email rejected ({cause}) and report failed: {e}"),
        }
    }
}

#[async_trait]
impl ChannelHandler for EmailHandler {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn handle(&self, event: &Event, ctx: &HandleContext) -> Result<()> {
        let to: Vec<String> = event
            .recipients
            .iter()
            .filter(|r| !r.is_empty())
            .cloned()
            .collect();
        if to.is_empty() {
            debug!(event_id = %event.event_id, "no email recipients");
            return Ok(());
        }

        let message = EmailMessage {
            to,
            subject: subject(event),
            body: render_email_body(event),
            html: true,
        };
        if let Err(e) = self.sender.send(&message).await {
            if !e.is_retryable() {
                self.report_rejection(event, ctx, &e).await;
            }
            return Err(e);
        }
        info!(event_id = %event.event_id, recipients = message.to.len(), "email sent");
        Ok(())
    }
}

/// `"[WARNING] Job Build-42 Failed"`.
pub fn subject(event: &Event) -> String {
    format!(
        "[{}] {}",
        event.severity.as_str().to_uppercase(),
        title_case(&event.message)
    )
}

/// Upper-case the first letter of every whitespace-separated word.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word_start = true;
    for c in text.chars() {
        if word_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        word_start = c.is_whitespace();
    }
    out
}

pub fn render_email_body(event: &Event) -> String {
    let mut body = String::new();
    body.push_str("<html><body>\n");
    for (label, value) in [
        ("Event", event.message.as_str()),
        ("Severity", event.severity.as_str()),
        ("Channel", event.channel.as_str()),
    ] {
        body.push_str(&format!("<p><b>{label}:</b> {}</p>\n", escape_html(value)));
    }
    body.push_str(&format!(
        "<p><b>Timestamp:</b> {}</p>\n",
        format_timestamp(event.timestamp)
    ));
    body.push_str(&format!(
        "<p><b>Cluster:</b> {}</p>\n",
        escape_html(&event.cluster)
    ));

    body.push_str("<h4>Details</h4>\n<table>\n");
    for (key, value) in event.sorted_detail() {
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            escape_html(key),
            render_value(value)
        ));
    }
    body.push_str("</table>\n</body></html>\n");
    body
}

/// Wrap http(s) URLs as links; escape everything else.
fn render_value(value: &str) -> String {
    match url::Url::parse(value) {
        Ok(link) if matches!(link.scheme(), "http" | "https") => {
            let href = escape_html(value);
            format!("<a href=\"{href}\">{href}</a>")
        }
        _ => escape_html(value),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
