use super::{MessageContext, Plugin, PluginDescriptor, PluginSpec, PluginStatus};
use crate::bus::{BusMessage, Destination, MessageBus, MessageHandler, Subscription};
use crate::error::PluginError;
use crate::state::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::Instrument;

#[derive(Debug, Default)]
struct PluginState {
    failed: AtomicBool,
    stopped: AtomicBool,
    operations: AtomicU64,
}

/// Management-plane view of one instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSnapshot {
    pub name: String,
    pub type_name: String,
    pub input: String,
    pub output: String,
    pub reply_to: String,
    pub status: String,
    pub operations: u64,
    pub started_at: DateTime<Utc>,
}

/// A plugin bound to the bus: owns the input subscription, the status and the
/// operation counter.
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    spec: PluginSpec,
    plugin: Arc<dyn Plugin>,
    state: Arc<PluginState>,
    bus: Arc<dyn MessageBus>,
    context: Arc<MessageContext>,
    metrics: Option<Arc<Metrics>>,
    subscription: Mutex<Option<Subscription>>,
    started_at: DateTime<Utc>,
}

impl PluginInstance {
    pub fn new(
        descriptor: PluginDescriptor,
        spec: PluginSpec,
        plugin: Box<dyn Plugin>,
        bus: Arc<dyn MessageBus>,
        context: Arc<MessageContext>,
    ) -> Self {
        Self {
            descriptor,
            spec,
            plugin: Arc::from(plugin),
            state: Arc::new(PluginState::default()),
            bus,
            context,
            metrics: None,
            subscription: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> PluginStatus {
        if self.state.failed.load(Ordering::SeqCst) {
            PluginStatus::Failed
        } else {
            PluginStatus::Ok
        }
    }

    pub fn operation_count(&self) -> u64 {
        self.state.operations.load(Ordering::SeqCst)
    }

    pub async fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .await
            .as_ref()
            .map_or(false, Subscription::is_active)
    }

    /// Subscribe to the input destination; deliveries start once this returns `Ok`.
    pub async fn init(&self) -> Result<(), PluginError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Ok(());
        }

        let listener = Arc::new(self.listener());

        match self
            .bus
            .subscribe(&self.spec.destinations.input, listener)
            .await
        {
            Ok(sub) => {
                tracing::info!(
                    plugin = %self.descriptor.name,
                    input = %self.spec.destinations.input,
                    "Plugin listening"
                );
                *subscription = Some(sub);
                Ok(())
            }
            Err(e) => {
                self.state.failed.store(true, Ordering::SeqCst);
                tracing::error!(
                    plugin = %self.descriptor.name,
                    error = %e,
                    "Failed to start message consumer"
                );
                Err(PluginError::Init {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Cancel the subscription and release the transform. Safe to call more than once.
    pub async fn stop(&self) {
        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.cancel().await;
        }

        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            self.plugin.shutdown().await;
            tracing::info!(plugin = %self.descriptor.name, "Plugin stopped");
        }
    }

    /// Human-readable one-line summary.
    pub fn info(&self) -> String {
        format!(
            "name={},type={},input={},output={},replyto={},status={},operations={},started={}",
            self.descriptor.name,
            self.descriptor.type_name,
            self.descriptor.input,
            self.descriptor.output,
            self.descriptor.reply_to,
            self.status(),
            self.operation_count(),
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            name: self.descriptor.name.clone(),
            type_name: self.descriptor.type_name.clone(),
            input: self.descriptor.input.clone(),
            output: self.descriptor.output.clone(),
            reply_to: self.descriptor.reply_to.clone(),
            status: self.status().to_string(),
            operations: self.operation_count(),
            started_at: self.started_at,
        }
    }

    /// Run one message through the transform outside of a subscription.
    /// Does nothing once the instance has been stopped.
    pub async fn on_message(&self, message: BusMessage) {
        if self.state.stopped.load(Ordering::SeqCst) {
            tracing::debug!(plugin = %self.descriptor.name, message_id = %message.id, "Plugin stopped; message ignored");
            return;
        }
        self.listener().on_message(message).await;
    }

    fn listener(&self) -> InstanceListener {
        InstanceListener {
            name: self.descriptor.name.clone(),
            plugin: self.plugin.clone(),
            state: self.state.clone(),
            bus: self.bus.clone(),
            output: self.spec.destinations.output.clone(),
            reply_to: self.spec.destinations.reply_to.clone(),
            context: self.context.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.descriptor.name)
            .field("type", &self.descriptor.type_name)
            .field("status", &self.status())
            .field("operations", &self.operation_count())
            .finish()
    }
}

struct InstanceListener {
    name: String,
    plugin: Arc<dyn Plugin>,
    state: Arc<PluginState>,
    bus: Arc<dyn MessageBus>,
    output: Option<Destination>,
    reply_to: Option<Destination>,
    context: Arc<MessageContext>,
    metrics: Option<Arc<Metrics>>,
}

impl InstanceListener {
    async fn process(&self, message: &BusMessage) -> Result<(), PluginError> {
        let transformed = AssertUnwindSafe(self.plugin.on_message(message, &self.context))
            .catch_unwind()
            .await;
        let result = match transformed {
            Ok(result) => result,
            Err(panic) => {
                // Delivery continues; the status stays FAILED from here on.
                self.state.failed.store(true, Ordering::SeqCst);
                return Err(PluginError::Panicked {
                    reason: panic_reason(panic.as_ref()),
                });
            }
        };
        let Some(payload) = result? else {
            return Ok(());
        };

        match &self.output {
            Some(output) => {
                let properties = self.context.outgoing_properties(Some(message));
                self.bus.publish(output, payload, properties).await?;
            }
            None => {
                tracing::warn!(plugin = %self.name, "Result dropped: no output destination");
            }
        }
        Ok(())
    }

    async fn notify_failure(&self, message: &BusMessage, error: &PluginError) {
        let Some(reply_to) = &self.reply_to else {
            return;
        };
        let notice = format!(
            "plugin={},message={},error={}",
            self.name, message.id, error
        );
        let properties = self.context.outgoing_properties(Some(message));
        if let Err(e) = self.bus.publish(reply_to, notice, properties).await {
            tracing::warn!(plugin = %self.name, error = %e, "Failed to publish failure notice");
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl MessageHandler for InstanceListener {
    async fn on_message(&self, message: BusMessage) {
        let span = tracing::info_span!("plugin_message", plugin = %self.name, message_id = %message.id);
        let start = Instant::now();

        match self.process(&message).instrument(span.clone()).await {
            Ok(()) => {
                self.state.operations.fetch_add(1, Ordering::SeqCst);
                if let Some(metrics) = &self.metrics {
                    metrics.record_plugin_operation(start.elapsed());
                }
                tracing::debug!(
                    parent: &span,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Transform performed"
                );
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_plugin_failure();
                }
                tracing::error!(parent: &span, error = %e, "Transform failed");
                self.notify_failure(&message, &e).await;
            }
        }
    }
}
