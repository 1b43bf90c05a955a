use crate::bus::{BusMessage, Properties, CORRELATION_ID};
use crate::config::ContextConfig;
use serde::Serialize;

/// Identity stamped onto every message a plugin publishes.
///
/// Built once when the engine starts and shared by every plugin invocation.
#[derive(Debug, Clone, Serialize)]
pub struct MessageContext {
    pub app_name: String,
    pub hostname: String,
    pub user: String,
    pub correlation_id: String,
}

impl MessageContext {
    pub fn from_config(config: &ContextConfig) -> Self {
        let hostname = config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            app_name: config.app_name.clone(),
            hostname,
            user,
            correlation_id: config
                .correlation_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Properties for a message produced in response to `incoming`.
    pub fn outgoing_properties(&self, incoming: Option<&BusMessage>) -> Properties {
        let correlation_id = incoming
            .and_then(BusMessage::correlation_id)
            .unwrap_or(&self.correlation_id);

        let mut properties = Properties::new();
        properties.insert("app".to_string(), self.app_name.clone());
        properties.insert("user".to_string(), self.user.clone());
        properties.insert("host".to_string(), self.hostname.clone());
        properties.insert(CORRELATION_ID.to_string(), correlation_id.to_string());
        properties
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Destination;

    fn context() -> MessageContext {
        MessageContext::from_config(&ContextConfig {
            app_name: "Pipeline Plugin".into(),
            hostname: Some("node-7".into()),
            correlation_id: Some("default-cid".into()),
        })
    }

    #[test]
    fn test_incoming_correlation_id_wins() {
        let mut properties = Properties::new();
        properties.insert(CORRELATION_ID.into(), "abc-123".into());
        let incoming = BusMessage::new(Destination::new("in"), "x", properties);

        let outgoing = context().outgoing_properties(Some(&incoming));
        assert_eq!(outgoing[CORRELATION_ID], "abc-123");
        assert_eq!(outgoing["host"], "node-7");
        assert_eq!(outgoing["app"], "Pipeline Plugin");
    }

    #[test]
    fn test_default_correlation_id_used_when_missing() {
        let incoming = BusMessage::new(Destination::new("in"), "x", Properties::new());
        let outgoing = context().outgoing_properties(Some(&incoming));
        assert_eq!(outgoing[CORRELATION_ID], "default-cid");
    }
}
