//! Support-archive channel: best-effort plain-text dump of every event.

use super::{ChannelHandler, HandleContext};
use crate::error::Result;
use crate::model::event::format_timestamp;
use crate::model::{Channel, Event};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Where archive records go.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn write(&self, record: &str) -> Result<()>;
}

/// Emits each record as an `info` log line on the `axnc::archive` target.
pub struct TracingSink;

#[async_trait]
impl ArchiveSink for TracingSink {
    async fn write(&self, record: &str) -> Result<()> {
        info!(target: "axnc::archive", "{record}");
        Ok(())
    }
}

/// Appends records to a file, opened per write.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ArchiveSink for FileSink {
    async fn write(&self, record: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct ArchiveHandler {
    sink: Arc<dyn ArchiveSink>,
}

impl ArchiveHandler {
    pub fn new(sink: Arc<dyn ArchiveSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ChannelHandler for ArchiveHandler {
    fn channel(&self) -> Channel {
        Channel::SupportArchive
    }

    /// Never fails: a sink error is logged and the message is still committed.
    async fn handle(&self, event: &Event, _ctx: &HandleContext) -> Result<()> {
        if let Err(e) = self.sink.write(&render_archive_record(event)).await {
            error!(event_id = %event.event_id, "archive write failed: {e}");
        }
        Ok(())
    }
}

pub fn render_archive_record(event: &Event) -> String {
    let recipients: Vec<&str> = event.recipients.iter().map(String::as_str).collect();
    let mut record = format!(
        "event_id: {}\ntrace_id: {}\ncluster: {}\ncode: {}\nchannel: {}\nfacility: {}\nseverity: {}\nmessage: {}\ntimestamp: {} ({})\nrecipients: {}\n",
        event.event_id,
        event.trace_id,
        event.cluster,
        event.code,
        event.channel,
        event.facility,
        event.severity,
        event.message,
        event.timestamp,
        format_timestamp(event.timestamp),
        recipients.join(","),
    );
    record.push_str("detail:\n");
    for (key, value) in event.sorted_detail() {
        record.push_str(&format!("  {key}: {value}\n"));
    }
    record.push_str("---\n");
    record
}
