//! `pipeline.plugin.Fake`: accepts every message and produces nothing.
//!
//! Build with `cargo build -p pipeline-plugin-fake` and copy the resulting
//! `libfake` shared library into the pipeline's plugin directory.

use async_trait::async_trait;
use plugin_pipeline::bus::BusMessage;
use plugin_pipeline::error::PluginError;
use plugin_pipeline::plugin::{MessageContext, Plugin, PluginRegistrar, PluginSpec};

pub const TYPE_NAME: &str = "pipeline.plugin.Fake";

pub struct Fake {
    name: String,
}

impl Fake {
    pub fn create(spec: &PluginSpec) -> Result<Box<dyn Plugin>, PluginError> {
        Ok(Box::new(Fake {
            name: spec.name.clone(),
        }))
    }
}

#[async_trait]
impl Plugin for Fake {
    async fn on_message(
        &self,
        message: &BusMessage,
        _context: &MessageContext,
    ) -> Result<Option<String>, PluginError> {
        tracing::trace!(plugin = %self.name, message_id = %message.id, "Fake plugin received message");
        Ok(None)
    }
}

fn register(registrar: &mut dyn PluginRegistrar) {
    registrar.register_plugin(TYPE_NAME, Fake::create);
}

plugin_pipeline::declare_plugin!(register);
