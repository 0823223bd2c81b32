//! Channel handlers and the consumer worker that drives them.
//!
//! A [`HandlerWorker`] runs one or more group members for a channel. Each
//! member fetches from its assigned partitions, hands every message to the
//! channel's [`ChannelHandler`], and commits according to the outcome.

pub mod archive;
pub mod chat;
pub mod email;
pub mod ui_store;

use crate::error::{Error, Result};
use crate::model::{Channel, Event};
use crate::retry::RetryPolicy;
use crate::telemetry::{dispatch, metrics};
use crate::transport::{Delivery, MAX_FETCH, Transport, group_name};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

pub use archive::{ArchiveHandler, ArchiveSink, FileSink, TracingSink};
pub use chat::{ChatApi, ChatHandler, SlackApi, TokenCache, TokenSource, ToolsTokenSource};
pub use email::{EmailHandler, EmailMessage, EmailSender, NotificationServiceSender};
pub use ui_store::UiStoreHandler;

/// Per-delivery context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandleContext {
    /// Fresh for every delivery; distinct from the event's own trace id.
    pub trace_id: String,
}

/// A consumer specialised to one channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    fn channel(&self) -> Channel;

    /// Handle one event. Retryable errors leave the message uncommitted.
    async fn handle(&self, event: &Event, ctx: &HandleContext) -> Result<()>;
}

/// Tuning for a handler worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages per fetch, capped at [`MAX_FETCH`].
    pub fetch_max: usize,
    /// Fallback poll interval when no append notification arrives.
    pub poll_interval: Duration,
    /// Deadline for one handler call.
    pub call_deadline: Duration,
    /// Handler attempts per message before it is skipped.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Group members run by this worker.
    pub members: usize,
    /// How often a member refreshes its session while busy.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_max: MAX_FETCH,
            poll_interval: Duration::from_secs(1),
            call_deadline: Duration::from_secs(30),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            members: 1,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Session timeout for the transport: the longest one message can hold a
    /// member (every attempt at its deadline plus every backoff) and one
    /// missed heartbeat.
    pub fn session_timeout(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.call_deadline
            .saturating_mul(attempts)
            .saturating_add(self.max_backoff.saturating_mul(attempts - 1))
            .saturating_add(self.heartbeat_interval)
    }

    fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_backoff,
            max_delay: self.max_backoff,
            multiplier: 2,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled and committed.
    Handled,
    /// Committed without successful handling.
    Dropped,
    /// Left uncommitted because of shutdown; it will be redelivered.
    Abandoned,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Disposition::Handled => "ok",
            Disposition::Dropped => "dropped",
            Disposition::Abandoned => "abandoned",
        }
    }
}

pub struct HandlerWorker {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ChannelHandler>,
    config: WorkerConfig,
    shutdown: watch::Sender<bool>,
    group: String,
}

impl HandlerWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn ChannelHandler>,
        config: WorkerConfig,
    ) -> Self {
        let group = group_name(handler.channel());
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            handler,
            config,
            shutdown,
            group,
        }
    }

    pub fn channel(&self) -> Channel {
        self.handler.channel()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Stop fetching; in-flight handler calls finish before members exit.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run every member until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let channel = self.channel();
        let mut members = JoinSet::new();
        for index in 0..self.config.members.max(1) {
            let worker = Arc::clone(&self);
            let member = format!("{channel}-{}-{index}", Uuid::new_v4().simple());
            members.spawn(async move { worker.consume(member).await });
        }
        info!(channel = %channel, members = members.len(), "handler worker started");

        while let Some(joined) = members.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(channel = %channel, "member stopped: {e}"),
                Err(e) => error!(channel = %channel, "member task failed: {e}"),
            }
        }
        info!(channel = %channel, "handler worker stopped");
        Ok(())
    }

    async fn consume(&self, member: String) -> Result<()> {
        let topic = self.channel();
        let mut shutdown = self.shutdown.subscribe();
        self.transport.join(&self.group, topic, &member).await?;
        debug!(member = %member, group = %self.group, "joined consumer group");
        let heartbeat = tokio::spawn(keep_alive(
            Arc::clone(&self.transport),
            self.group.clone(),
            topic,
            member.clone(),
            self.config.heartbeat_interval,
        ));

        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.poll_once(&member, &mut shutdown).await {
                Ok(0) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!(member = %member, "fetch failed, will retry: {e}");
                    true
                }
            };
            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.transport.wait(topic, self.config.poll_interval) => {}
                }
            }
        }

        heartbeat.abort();
        self.transport.leave(&self.group, topic, &member).await?;
        debug!(member = %member, group = %self.group, "left consumer group");
        Ok(())
    }

    /// Fetch one batch for `member` and process it in order.
    /// Returns how many deliveries were fetched.
    pub async fn poll_once(
        &self,
        member: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<usize> {
        let deliveries = self
            .transport
            .fetch(
                &self.group,
                self.channel(),
                member,
                self.config.fetch_max.min(MAX_FETCH),
            )
            .await?;
        let fetched = deliveries.len();

        for delivery in &deliveries {
            if *shutdown.borrow() {
                break;
            }
            if self.process(delivery, shutdown).await? == Disposition::Abandoned {
                break;
            }
        }
        Ok(fetched)
    }

    /// Handle one delivery and commit according to the outcome.
    pub async fn process(
        &self,
        delivery: &Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Disposition> {
        let handling_trace = Uuid::new_v4().to_string();
        let channel = self.channel();
        let span = dispatch::start_handle_span(
            channel.as_str(),
            delivery.partition,
            delivery.offset,
            &handling_trace,
        );
        let start = Instant::now();

        let disposition = async {
            let event: Event = match serde_json::from_value(delivery.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    error!(offset = delivery.offset, "undecodable message, dropping: {e}");
                    return Disposition::Dropped;
                }
            };
            tracing::Span::current().record("event.id", event.event_id.to_string());

            let ctx = HandleContext {
                trace_id: handling_trace.clone(),
            };
            let policy = self.config.backoff();
            let mut attempt = 0;
            loop {
                attempt += 1;
                let e = match self.attempt(&event, &ctx).await {
                    Ok(()) => return Disposition::Handled,
                    Err(e) => e,
                };
                if !e.is_retryable() {
                    warn!(event_id = %event.event_id, "handler failed, dropping: {e}");
                    return Disposition::Dropped;
                }
                if attempt >= policy.max_attempts.max(1) {
                    error!(
                        event_id = %event.event_id,
                        attempts = attempt,
                        "retry budget exhausted, skipping message: {e}"
                    );
                    return Disposition::Dropped;
                }

                self.count(channel, "retry");
                let delay = policy.delay_for(attempt);
                warn!(event_id = %event.event_id, attempt, delay_ms = delay.as_millis() as u64, "handler failed, retrying: {e}");
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Disposition::Abandoned;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        .instrument(span.clone())
        .await;

        if disposition != Disposition::Abandoned {
            self.transport.commit(&self.group, delivery).await?;
        }
        dispatch::record_outcome(&span, disposition.as_str());
        self.count(channel, disposition.as_str());
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", format!("handle.{channel}"))],
        );
        Ok(disposition)
    }

    async fn attempt(&self, event: &Event, ctx: &HandleContext) -> Result<()> {
        match tokio::time::timeout(self.config.call_deadline, self.handler.handle(event, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} handler exceeded {:?}",
                self.channel(),
                self.config.call_deadline
            ))),
        }
    }

    fn count(&self, channel: Channel, outcome: &'static str) {
        metrics::handler_outcomes().add(
            1,
            &[
                KeyValue::new("channel", channel.as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// Refresh a member's session on a fixed interval until aborted.
async fn keep_alive(
    transport: Arc<dyn Transport>,
    group: String,
    topic: Channel,
    member: String,
    every: Duration,
) {
    let mut ticks = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        if let Err(e) = transport.heartbeat(&group, topic, &member).await {
            warn!(member = %member, "heartbeat failed: {e}");
        }
    }
}
