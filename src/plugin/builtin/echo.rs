use crate::bus::BusMessage;
use crate::error::PluginError;
use crate::plugin::{MessageContext, Plugin, PluginSpec};
use async_trait::async_trait;

/// Republishes every input payload unchanged.
#[derive(Debug, Default)]
pub struct Echo;

impl Echo {
    pub const TYPE_NAME: &'static str = "pipeline.plugin.Echo";

    pub fn create(_spec: &PluginSpec) -> Result<Box<dyn Plugin>, PluginError> {
        Ok(Box::new(Echo))
    }
}

#[async_trait]
impl Plugin for Echo {
    async fn on_message(
        &self,
        message: &BusMessage,
        _context: &MessageContext,
    ) -> Result<Option<String>, PluginError> {
        Ok(Some(message.payload.clone()))
    }
}
