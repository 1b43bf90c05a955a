use crate::bus::BusMessage;
use crate::error::PluginError;
use crate::plugin::{MessageContext, Plugin, PluginSpec};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Terminal consumer: accepts every message and publishes nothing.
#[derive(Debug)]
pub struct Sink {
    name: String,
    bytes: AtomicU64,
}

impl Sink {
    pub const TYPE_NAME: &'static str = "pipeline.plugin.Sink";

    pub fn create(spec: &PluginSpec) -> Result<Box<dyn Plugin>, PluginError> {
        Ok(Box::new(Sink {
            name: spec.name.clone(),
            bytes: AtomicU64::new(0),
        }))
    }
}

#[async_trait]
impl Plugin for Sink {
    async fn on_message(
        &self,
        message: &BusMessage,
        _context: &MessageContext,
    ) -> Result<Option<String>, PluginError> {
        self.bytes
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
        tracing::debug!(plugin = %self.name, message_id = %message.id, "Message consumed");
        Ok(None)
    }

    async fn shutdown(&self) {
        tracing::debug!(
            plugin = %self.name,
            bytes = self.bytes.load(Ordering::Relaxed),
            "Sink closed"
        );
    }
}
