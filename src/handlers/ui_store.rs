//! UI-store channel: persists events for the management API.

use super::{ChannelHandler, HandleContext};
use crate::error::Result;
use crate::model::{Channel, Event};
use crate::store::EventStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct UiStoreHandler {
    store: Arc<dyn EventStore>,
}

impl UiStoreHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

/// The stored form of an event: an empty recipient set becomes `{""}`.
pub fn normalize_for_store(event: &Event) -> Event {
    let mut stored = event.clone();
    if stored.recipients.is_empty() {
        stored.recipients.insert(String::new());
    }
    stored
}

#[async_trait]
impl ChannelHandler for UiStoreHandler {
    fn channel(&self) -> Channel {
        Channel::UiStore
    }

    async fn handle(&self, event: &Event, _ctx: &HandleContext) -> Result<()> {
        self.store.upsert_event(&normalize_for_store(event)).await?;
        debug!(event_id = %event.event_id, "event stored");
        Ok(())
    }
}
