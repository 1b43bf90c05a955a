//! Transform plugins and the machinery that loads them.
//!
//! # Architecture
//!
//! - **Contract**: a [`Plugin`] only transforms payloads. Subscription, publishing,
//!   status and operation counting live in [`PluginInstance`], which holds the
//!   bus capability instead of inheriting it.
//! - **Factories**: every plugin type is a [`PluginFactory`] taking one validated
//!   [`PluginSpec`]. Compiled-in types live in a [`FactoryRegistry`].
//! - **Loading**: [`TransformLoader`] resolves `pipeline.plugin.*` types child-first
//!   from shared libraries in the plugin directory, so replacing a library and
//!   sending `update` swaps the code without a restart.
//!
//! # Modules
//!
//! - `builtin`: the host-provided plugin types
//! - `context`: per-process message context threaded into every invocation
//! - `descriptor`: declarative plugin identity and its resolved form
//! - `dylib`: shared-library declaration ABI and shadow-copy loading
//! - `instance`: a running plugin bound to its input subscription
//! - `loader`: code resolution order and instantiation

use crate::bus::BusMessage;
use crate::error::PluginError;
use async_trait::async_trait;
use std::fmt;

pub mod builtin;
pub mod context;
pub mod descriptor;
pub mod dylib;
pub mod instance;
pub mod loader;

pub use context::MessageContext;
pub use descriptor::{Destinations, PluginDescriptor, PluginSpec};
pub use dylib::{PluginDeclaration, PluginRegistrar, ABI_VERSION, HOST_VERSION};
pub use instance::PluginInstance;
pub use loader::{CodeSource, FactoryRegistry, TransformLoader, PLUGIN_NAMESPACE};

/// The work a plugin type performs on each message of its input stream.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Handle one message. A returned payload is published to the output destination.
    async fn on_message(
        &self,
        message: &BusMessage,
        context: &MessageContext,
    ) -> Result<Option<String>, PluginError>;

    /// Release transform-held resources. Called at most once, after delivery has stopped.
    async fn shutdown(&self) {}
}

/// Constructor registered for a plugin type.
pub type PluginFactory = fn(&PluginSpec) -> Result<Box<dyn Plugin>, PluginError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Ok,
    Failed,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Ok => f.write_str("OK"),
            PluginStatus::Failed => f.write_str("FAILED"),
        }
    }
}
