//! Plugin types compiled into the host.

pub mod echo;
pub mod sink;
pub mod value_transform;
pub mod xml_transform;

pub use echo::Echo;
pub use sink::Sink;
pub use value_transform::{EnrichmentRule, ValueLookup, XmlValueTransform};
pub use xml_transform::XmlTransform;

use super::FactoryRegistry;

/// Register every built-in type under its `pipeline.plugin.*` identifier.
pub fn register_builtins(registry: &mut FactoryRegistry) {
    registry.register(Echo::TYPE_NAME, Echo::create);
    registry.register(Sink::TYPE_NAME, Sink::create);
    registry.register(XmlTransform::TYPE_NAME, XmlTransform::create);
    registry.register(XmlValueTransform::TYPE_NAME, XmlValueTransform::create);
}
