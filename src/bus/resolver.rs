use super::{Destination, NameResolver};
use crate::error::BusError;
use std::collections::HashMap;

/// Resolves logical destination names from a fixed table.
///
/// In lenient mode a name missing from the table resolves to itself.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    bindings: HashMap<String, String>,
    strict: bool,
}

impl StaticResolver {
    pub fn new(bindings: HashMap<String, String>, strict: bool) -> Self {
        Self { bindings, strict }
    }

    pub fn bind(mut self, logical: impl Into<String>, address: impl Into<String>) -> Self {
        self.bindings.insert(logical.into(), address.into());
        self
    }
}

impl NameResolver for StaticResolver {
    fn resolve(&self, logical: &str) -> Result<Destination, BusError> {
        let logical = logical.trim();
        if logical.is_empty() {
            return Err(BusError::Resolution(String::new()));
        }

        match self.bindings.get(logical) {
            Some(address) => Ok(Destination::new(address.clone())),
            None if self.strict => Err(BusError::Resolution(logical.to_string())),
            None => Ok(Destination::new(logical)),
        }
    }
}
