//! Message-bus boundary.
//!
//! The engine and its plugins only see the [`MessageBus`] and [`NameResolver`]
//! capabilities. [`memory::InMemoryBus`] and [`resolver::StaticResolver`] are the
//! in-process implementations used by the binary and the tests.

use crate::error::BusError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod resolver;

pub use memory::InMemoryBus;
pub use resolver::StaticResolver;

pub const CORRELATION_ID: &str = "correlation_id";

/// Bus-native address of a message stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Properties = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: String,
    pub destination: Destination,
    pub payload: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(destination: Destination, payload: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            destination,
            payload: payload.into(),
            properties,
            timestamp: Utc::now(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .get(CORRELATION_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Callback invoked for every message delivered on a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: BusMessage);
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn subscribe(
        &self,
        destination: &Destination,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;

    async fn publish(
        &self,
        destination: &Destination,
        payload: String,
        properties: Properties,
    ) -> Result<(), BusError>;

    /// Whether the listener infrastructure is accepting subscriptions.
    fn is_running(&self) -> bool;
}

pub trait NameResolver: Send + Sync + 'static {
    fn resolve(&self, logical: &str) -> Result<Destination, BusError>;
}

/// Live delivery of one destination to one handler.
///
/// Deliveries run on a dedicated task, one message at a time. [`Subscription::cancel`]
/// waits for that task, so once it returns the handler is never invoked again.
pub struct Subscription {
    destination: Destination,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Drive `receiver` into `handler` until cancelled or the sender side closes.
    pub fn spawn(
        destination: Destination,
        mut receiver: mpsc::UnboundedReceiver<BusMessage>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let task_destination = destination.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => handler.on_message(message).await,
                        None => break,
                    },
                }
            }
            tracing::debug!(destination = %task_destination, "Subscription delivery loop ended");
        });

        Self {
            destination,
            token,
            task: Some(task),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
            && self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(destination = %self.destination, "Subscription handler panicked");
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("destination", &self.destination)
            .field("active", &self.is_active())
            .finish()
    }
}
