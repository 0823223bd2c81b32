//! Event producer: builds events from the codes registry, routes them, and
//! appends the per-channel fan-out to the transport as one batch.

use crate::codes::{CodeBinding, CodeRegistry, INVALID_RULE, INVALID_SLACK, INVALID_SMTP};
use crate::error::{Error, Result};
use crate::model::event::now_micros;
use crate::model::{Channel, Event, EventId, RuleId, Routing};
use crate::retry::RetryPolicy;
use crate::rules::RuleEngine;
use crate::telemetry::{dispatch, metrics};
use crate::transport::{OutboundMessage, Transport};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{Instrument, info, warn};

/// Builder for a produce call.
#[derive(Debug, Clone, Default)]
pub struct ProduceRequest {
    pub code: String,
    /// Reuse an existing id to make a repeated call a no-op.
    pub event_id: Option<EventId>,
    pub trace_id: Option<String>,
    /// When non-empty, replaces rule evaluation for the user-facing channels.
    pub recipients: Vec<String>,
    pub detail: HashMap<String, String>,
}

impl ProduceRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients.extend(recipients.into_iter().map(Into::into));
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// The narrow capability handed to code that emits events.
#[async_trait]
pub trait Produce: Send + Sync {
    /// Validate, route and append an event. Nothing is appended on failure.
    async fn produce(&self, request: ProduceRequest) -> Result<EventId>;

    /// Recipients per channel for an already-built event. An event carrying
    /// recipients is routed to exactly those.
    async fn route_for(&self, event: &Event) -> Result<Routing>;
}

/// How long a code's email and chat fan-out suppresses the next one.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(600);

/// Last user-facing fan-out per code, in event µs.
struct Throttle {
    window_micros: i64,
    last: Mutex<HashMap<String, i64>>,
}

impl Throttle {
    fn new(window: Duration) -> Self {
        Self {
            window_micros: i64::try_from(window.as_micros()).unwrap_or(i64::MAX),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the code's slot at `at`. Returns `None` when throttled,
    /// otherwise the previous claim so a failed append can give it back.
    fn admit(&self, code: &str, at: i64) -> Option<Option<i64>> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(code) {
            Some(&prev) if at.saturating_sub(prev) < self.window_micros => None,
            _ => Some(last.insert(code.to_string(), at)),
        }
    }

    fn restore(&self, code: &str, at: i64, previous: Option<i64>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.get(code) != Some(&at) {
            return;
        }
        match previous {
            Some(prev) => last.insert(code.to_string(), prev),
            None => last.remove(code),
        };
    }
}

pub struct EventProducer {
    registry: Arc<CodeRegistry>,
    engine: Arc<RuleEngine>,
    transport: Arc<dyn Transport>,
    cluster: String,
    substitutions: Vec<(String, String)>,
    retry: RetryPolicy,
    throttle: Throttle,
}

impl EventProducer {
    pub fn new(
        registry: Arc<CodeRegistry>,
        engine: Arc<RuleEngine>,
        transport: Arc<dyn Transport>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            engine,
            transport,
            cluster: cluster.into(),
            substitutions: Vec::new(),
            retry: RetryPolicy::default(),
            throttle: Throttle::new(THROTTLE_WINDOW),
        }
    }

    /// `%%NAME%%` placeholders replaced inside detail values.
    pub fn with_substitutions(mut self, substitutions: Vec<(String, String)>) -> Self {
        self.substitutions = substitutions;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// A zero window disables throttling.
    pub fn with_throttle_window(mut self, window: Duration) -> Self {
        self.throttle = Throttle::new(window);
        self
    }

    /// Build the event for a request. Channel and severity come from the registry.
    pub fn build_event(&self, request: &ProduceRequest) -> Result<Event> {
        if request.code.trim().is_empty() {
            return Err(Error::validation("code", "Must specify an event code"));
        }
        let binding = self.registry.lookup(&request.code)?;

        let detail: HashMap<String, String> = request
            .detail
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, &self.substitutions)))
            .collect();
        let event_id = request.event_id.unwrap_or_default();
        let trace_id = request
            .trace_id
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| event_id.to_string());

        Ok(Event {
            event_id,
            trace_id,
            cluster: self.cluster.clone(),
            code: binding.code.clone(),
            channel: binding.channel,
            facility: binding.facility.clone(),
            severity: binding.severity,
            message: render_message(binding, &detail),
            timestamp: now_micros(),
            detail,
            recipients: request.recipients.iter().cloned().collect(),
            acknowledged_by: None,
            acknowledged_at: None,
        })
    }

    async fn prepare(&self, request: &ProduceRequest) -> Result<(Event, Routing)> {
        let event = self.build_event(request)?;
        let routing = self.route_for(&event).await?;
        Ok((event, routing))
    }

    async fn append(&self, event: &Event, routing: &Routing) -> Result<()> {
        let limited = !is_loop_guarded(&event.code)
            && reaches_user_facing(routing)
            && !self
                .registry
                .lookup(&event.code)
                .map(|b| b.no_limit)
                .unwrap_or(false);
        let claim = if limited {
            self.throttle.admit(&event.code, event.timestamp)
        } else {
            Some(None)
        };
        let throttled = claim.is_none();
        if throttled {
            info!(event_id = %event.event_id, code = %event.code, "throttling email and chat fan-out");
        }

        let batch = fan_out(event, routing, throttled)?;
        let written = self
            .retry
            .run("transport.append", || self.transport.append(&batch))
            .await;
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                if let (true, Some(previous)) = (limited, claim) {
                    self.throttle.restore(&event.code, event.timestamp, previous);
                }
                return Err(e);
            }
        };
        info!(
            event_id = %event.event_id,
            code = %event.code,
            messages = batch.len(),
            written,
            throttled,
            "event appended"
        );
        Ok(())
    }

    async fn publish(&self, request: ProduceRequest) -> Result<EventId> {
        let (event, routing) = self.prepare(&request).await?;
        dispatch::record_event_ids(
            &tracing::Span::current(),
            &event.event_id.to_string(),
            &event.trace_id,
        );
        self.append(&event, &routing).await?;

        for rule_id in &routing.skipped_rules {
            self.report_invalid_rule(*rule_id, &event).await;
        }
        Ok(event.event_id)
    }

    /// Emit `configuration.invalid.rule` for a rule skipped while routing `cause`.
    /// Rules skipped while routing the report itself are not reported again.
    async fn report_invalid_rule(&self, rule_id: RuleId, cause: &Event) {
        let request = ProduceRequest::new(INVALID_RULE)
            .trace_id(cause.trace_id.clone())
            .detail("rule_id", rule_id.to_string())
            .detail("triggered_by", cause.event_id.to_string());
        let outcome = async {
            let (event, routing) = self.prepare(&request).await?;
            self.append(&event, &routing).await
        }
        .await;
        if let Err(e) = outcome {
            warn!(rule_id = %rule_id, "failed to report invalid rule: {e}");
        }
    }
}

#[async_trait]
impl Produce for EventProducer {
    async fn produce(&self, request: ProduceRequest) -> Result<EventId> {
        let code = request.code.clone();
        let span = dispatch::start_produce_span(&code);
        let start = Instant::now();

        let result = self.publish(request).instrument(span).await;

        let label = match &result {
            Ok(_) => "ok",
            Err(Error::Validation { .. } | Error::UnknownCode(_)) => "invalid",
            Err(_) => "error",
        };
        metrics::events_produced().add(
            1,
            &[
                KeyValue::new("code", code),
                KeyValue::new("result", label),
            ],
        );
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "event.produce")],
        );
        result
    }

    async fn route_for(&self, event: &Event) -> Result<Routing> {
        if event.recipients.is_empty() {
            self.engine.route(event).await
        } else {
            let recipients: Vec<String> = event.recipients.iter().cloned().collect();
            Ok(self.engine.route_explicit(event, &recipients))
        }
    }
}

/// Misconfiguration events must not be delivered over the channel that failed.
pub fn is_loop_guarded(code: &str) -> bool {
    code == INVALID_SLACK || code == INVALID_SMTP
}

fn reaches_user_facing(routing: &Routing) -> bool {
    Channel::ALL
        .into_iter()
        .filter(|c| c.is_user_facing())
        .any(|c| routing.recipients(c).is_some_and(|r| !r.is_empty()))
}

/// One transport message per destination channel.
///
/// User-facing channels get a message only when they have recipients and the
/// event is neither throttled nor loop-guarded; `ui-store` and
/// `support-archive` always get one. Archive messages are keyed by cluster,
/// the rest by event id.
pub fn fan_out(event: &Event, routing: &Routing, throttled: bool) -> Result<Vec<OutboundMessage>> {
    let mut batch = Vec::new();
    for channel in Channel::ALL {
        let recipients = routing.recipients(channel).cloned().unwrap_or_default();
        if channel.is_user_facing()
            && (throttled || recipients.is_empty() || is_loop_guarded(&event.code))
        {
            continue;
        }

        let mut copy = event.clone();
        copy.recipients = recipients;
        let key = match channel {
            Channel::SupportArchive => event.cluster.clone(),
            _ => event.event_id.to_string(),
        };
        batch.push(OutboundMessage {
            topic: channel,
            key,
            dedup_key: format!("{}:{}", event.event_id, channel),
            payload: serde_json::to_value(&copy)?,
        });
    }
    Ok(batch)
}

/// Fill `{key}` tokens in the binding's template from `detail`.
/// Missing keys render as empty; anything that is not a token is kept.
pub fn render_message(binding: &CodeBinding, detail: &HashMap<String, String>) -> String {
    let template = binding.template.as_str();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' && is_token(&after[..close]) => {
                if let Some(value) = detail.get(&after[..close]) {
                    out.push_str(value);
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_token(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Replace every `(placeholder, value)` pair inside `value`.
pub fn substitute(value: &str, substitutions: &[(String, String)]) -> String {
    substitutions
        .iter()
        .fold(value.to_string(), |acc, (placeholder, replacement)| {
            if acc.contains(placeholder.as_str()) {
                acc.replace(placeholder.as_str(), replacement)
            } else {
                acc
            }
        })
}
