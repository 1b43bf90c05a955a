//! Control-message protocol: parsing, validation and descriptor persistence.

pub mod message;
pub mod persistence;

pub use message::{Action, ControlMessage};
pub use persistence::{DescriptorStore, PersistedDescriptor};

/// What a successfully handled control message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlOutcome {
    pub action: Action,
    pub name: String,
    /// False when the registry changed but the startup directory could not follow.
    pub persisted: bool,
}
