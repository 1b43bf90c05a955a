//! The pipeline engine: owns the plugin registry, applies control messages and
//! answers management reads.
//!
//! Control messages are applied one at a time by the control flow (see
//! [`lifecycle`]); management reads go straight to the registry and never wait
//! on plugin I/O.

use crate::bus::{MessageBus, NameResolver, StaticResolver};
use crate::config::{Config, EngineConfig};
use crate::control::{Action, ControlMessage, ControlOutcome, DescriptorStore};
use crate::error::{ControlError, LoadError};
use crate::plugin::instance::PluginSnapshot;
use crate::plugin::{FactoryRegistry, MessageContext, PluginDescriptor, PluginInstance, TransformLoader};
use crate::state::{Metrics, PluginRegistry};
use crate::PROTOCOL_VERSION;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::Instrument;

pub mod lifecycle;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub version: String,
    pub message_count: u64,
    pub plugins: Vec<PluginSnapshot>,
}

pub struct Pipeline {
    engine: EngineConfig,
    bus: Arc<dyn MessageBus>,
    resolver: Arc<dyn NameResolver>,
    loader: TransformLoader,
    registry: PluginRegistry,
    store: DescriptorStore,
    context: Arc<MessageContext>,
    metrics: Arc<Metrics>,
    message_count: AtomicU64,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        bus: Arc<dyn MessageBus>,
        resolver: Arc<dyn NameResolver>,
        factories: FactoryRegistry,
    ) -> Self {
        let engine = config.engine.clone();
        let context = Arc::new(MessageContext::from_config(&config.context));
        let metrics = Arc::new(Metrics::new());
        let loader = TransformLoader::new(
            engine.plugin_dir.clone(),
            engine.scratch_dir(),
            factories,
            bus.clone(),
            resolver.clone(),
            context.clone(),
        )
        .with_metrics(metrics.clone());

        Self {
            store: DescriptorStore::new(engine.startup_dir.clone()),
            engine,
            bus,
            resolver,
            loader,
            registry: PluginRegistry::new(),
            context,
            metrics,
            message_count: AtomicU64::new(0),
        }
    }

    /// Engine with the built-in plugin types and a resolver built from `config.destinations`.
    pub fn with_builtins(config: &Config, bus: Arc<dyn MessageBus>) -> Self {
        let resolver = StaticResolver::new(config.destinations.clone(), config.strict_destinations);
        Self::new(config, bus, Arc::new(resolver), FactoryRegistry::with_builtins())
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    /// Apply one control message. Every call counts as a processed message.
    pub async fn handle_control(&self, xml: &str) -> Result<ControlOutcome, ControlError> {
        self.handle(xml).await.1
    }

    /// [`Pipeline::handle_control`] with every outcome logged; never fails.
    pub async fn process_control(&self, xml: &str) {
        let sequence = self.message_count.load(Ordering::SeqCst) + 1;
        let span = tracing::info_span!("control_message", sequence);

        async {
            let (message, result) = self.handle(xml).await;
            let action = message.as_ref().map(|m| m.action.as_str());
            let name = message.as_ref().map(|m| m.name());
            let plugin_type = message.as_ref().map(|m| m.descriptor.type_name.as_str());
            match result {
                Ok(outcome) => {
                    tracing::info!(
                        action = %outcome.action,
                        name = %outcome.name,
                        plugin_type,
                        persisted = outcome.persisted,
                        "Control message applied"
                    );
                }
                Err(e @ ControlError::Persistence { .. }) => {
                    tracing::warn!(
                        action,
                        name,
                        plugin_type,
                        kind = %e.kind(),
                        error = %e,
                        "Control message applied but not persisted"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        action,
                        name,
                        plugin_type,
                        kind = %e.kind(),
                        error = %e,
                        "Control message rejected"
                    );
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Parse and apply, handing back the parsed message (when parsing got that
    /// far) so callers can report against it.
    async fn handle(
        &self,
        xml: &str,
    ) -> (Option<ControlMessage>, Result<ControlOutcome, ControlError>) {
        self.message_count.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_control_message();

        let (message, result) = match ControlMessage::parse(xml, self.engine.validated) {
            Ok(message) => {
                let result = self.apply(&message).await;
                (Some(message), result)
            }
            Err(e) => (None, Err(e)),
        };
        if let Err(e) = &result {
            self.metrics.record_control_failure(e.kind());
        }
        self.metrics.set_active_plugins(self.registry.len());
        (message, result)
    }

    async fn apply(&self, message: &ControlMessage) -> Result<ControlOutcome, ControlError> {
        tracing::info!(
            action = %message.action,
            name = %message.name(),
            plugin_type = %message.descriptor.type_name,
            "Control message received"
        );
        message.check_version(PROTOCOL_VERSION)?;

        match message.action {
            Action::New => self.create(message).await,
            Action::Update => self.update(message).await,
            Action::Stop => self.remove(message).await,
        }
    }

    async fn create(&self, message: &ControlMessage) -> Result<ControlOutcome, ControlError> {
        let name = message.name();
        if self.registry.contains(name) {
            return Err(ControlError::NameConflict {
                name: name.to_string(),
            });
        }

        let instance = self.start_instance(&message.descriptor).await?;
        if let Err(rejected) = self.registry.insert_new(instance) {
            rejected.stop().await;
            return Err(ControlError::NameConflict {
                name: name.to_string(),
            });
        }
        self.persist(message).await
    }

    /// Stop-first replacement. If the new instance cannot start, the name is left
    /// absent and its descriptor removed.
    async fn update(&self, message: &ControlMessage) -> Result<ControlOutcome, ControlError> {
        let name = message.name();
        let Some(current) = self.registry.get(name) else {
            return Err(ControlError::NameNotFound {
                name: name.to_string(),
            });
        };
        current.stop().await;
        self.registry.remove(name);

        let instance = match self.start_instance(&message.descriptor).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(plugin = %name, "Update failed; plugin left stopped");
                self.forget(name).await;
                return Err(e);
            }
        };
        if let Err(rejected) = self.registry.insert_new(instance) {
            rejected.stop().await;
            return Err(ControlError::NameConflict {
                name: name.to_string(),
            });
        }
        self.persist(message).await
    }

    async fn remove(&self, message: &ControlMessage) -> Result<ControlOutcome, ControlError> {
        let name = message.name();
        let Some(instance) = self.registry.get(name) else {
            return Err(ControlError::NameNotFound {
                name: name.to_string(),
            });
        };
        instance.stop().await;
        self.registry.remove(name);

        if !self.engine.persisted {
            return Ok(outcome(message, false));
        }
        self.store
            .remove(name)
            .await
            .map_err(|source| ControlError::Persistence {
                name: name.to_string(),
                source,
            })?;
        Ok(outcome(message, true))
    }

    async fn start_instance(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Arc<PluginInstance>, ControlError> {
        let name = descriptor.name.as_str();
        let instance = self
            .loader
            .load(descriptor)
            .map_err(|e| ControlError::from_load(name, e))?;

        if let Err(e) = instance.init().await {
            instance.stop().await;
            return Err(ControlError::from_load(
                name,
                LoadError::Construction {
                    type_name: descriptor.type_name.clone(),
                    source: e,
                },
            ));
        }
        Ok(Arc::new(instance))
    }

    async fn persist(&self, message: &ControlMessage) -> Result<ControlOutcome, ControlError> {
        if !self.engine.persisted {
            return Ok(outcome(message, false));
        }
        let name = message.name();
        let xml = message.to_persisted_xml()?;
        self.store
            .save(name, &xml)
            .await
            .map_err(|source| ControlError::Persistence {
                name: name.to_string(),
                source,
            })?;
        Ok(outcome(message, true))
    }

    async fn forget(&self, name: &str) {
        if !self.engine.persisted {
            return;
        }
        if let Err(e) = self.store.remove(name).await {
            tracing::warn!(plugin = %name, error = %e, "Failed to remove persisted descriptor");
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.registry.len()
    }

    /// Comma-joined registered names.
    pub fn plugin_names(&self) -> String {
        self.registry.names().join(",")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Empty when no plugin has that name.
    pub fn plugin_info(&self, name: &str) -> String {
        self.registry
            .get(name)
            .map(|instance| instance.info())
            .unwrap_or_default()
    }

    pub fn plugin_operation_count(&self, name: &str) -> u64 {
        self.registry
            .get(name)
            .map_or(0, |instance| instance.operation_count())
    }

    /// Stop and unregister without touching the persisted descriptor.
    /// Returns 0 on success, 1 when no plugin has that name.
    pub async fn kill_plugin(&self, name: &str) -> i32 {
        match self.registry.remove(name) {
            Some(instance) => {
                instance.stop().await;
                self.metrics.set_active_plugins(self.registry.len());
                tracing::info!(plugin = %name, "Killed plugin");
                0
            }
            None => 1,
        }
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let mut plugins: Vec<PluginSnapshot> = self
            .registry
            .instances()
            .iter()
            .map(|instance| instance.snapshot())
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        PipelineSnapshot {
            version: PROTOCOL_VERSION.to_string(),
            message_count: self.message_count(),
            plugins,
        }
    }

    pub fn snapshot_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

fn outcome(message: &ControlMessage, persisted: bool) -> ControlOutcome {
    ControlOutcome {
        action: message.action,
        name: message.name().to_string(),
        persisted,
    }
}
