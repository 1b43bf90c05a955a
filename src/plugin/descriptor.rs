use crate::bus::{Destination, NameResolver};
use crate::error::LoadError;
use serde::{Deserialize, Serialize};

/// Declarative identity of a plugin as carried by a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub name: String,
    pub type_name: String,
    /// Opaque plugin configuration, passed through verbatim
    pub work: String,
    pub input: String,
    pub output: String,
    pub reply_to: String,
    pub version: String,
    /// Optional external library location searched before the host table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            work: String::new(),
            input: String::new(),
            output: String::new(),
            reply_to: String::new(),
            version: crate::PROTOCOL_VERSION.to_string(),
            archive: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub input: Destination,
    pub output: Option<Destination>,
    pub reply_to: Option<Destination>,
}

/// The validated configuration handed to a plugin factory.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub name: String,
    pub type_name: String,
    pub work: String,
    pub destinations: Destinations,
}

impl PluginSpec {
    /// Resolve the descriptor's logical destinations. The input is mandatory.
    pub fn resolve(
        descriptor: &PluginDescriptor,
        resolver: &dyn NameResolver,
    ) -> Result<Self, LoadError> {
        let lookup = |logical: &str| {
            resolver
                .resolve(logical)
                .map_err(|source| LoadError::Destination {
                    logical: logical.to_string(),
                    source,
                })
        };
        let optional = |logical: &str| {
            if logical.trim().is_empty() {
                Ok(None)
            } else {
                lookup(logical).map(Some)
            }
        };

        Ok(Self {
            name: descriptor.name.clone(),
            type_name: descriptor.type_name.clone(),
            work: descriptor.work.clone(),
            destinations: Destinations {
                input: lookup(&descriptor.input)?,
                output: optional(&descriptor.output)?,
                reply_to: optional(&descriptor.reply_to)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StaticResolver;

    #[test]
    fn test_resolve_binds_logical_names() {
        let resolver = StaticResolver::default().bind("in", "queue://in");
        let mut descriptor = PluginDescriptor::new("echo1", "pipeline.plugin.Echo");
        descriptor.input = "in".into();
        descriptor.output = "out".into();

        let spec = PluginSpec::resolve(&descriptor, &resolver).unwrap();
        assert_eq!(spec.destinations.input.address(), "queue://in");
        assert_eq!(spec.destinations.output.unwrap().address(), "out");
        assert!(spec.destinations.reply_to.is_none());
    }

    #[test]
    fn test_missing_input_is_a_destination_error() {
        let descriptor = PluginDescriptor::new("echo1", "pipeline.plugin.Echo");
        let err = PluginSpec::resolve(&descriptor, &StaticResolver::default()).unwrap_err();
        assert!(matches!(err, LoadError::Destination { .. }));
    }
}
