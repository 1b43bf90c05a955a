use super::Pipeline;
use crate::bus::{BusMessage, MessageHandler};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};

/// Moves control messages off the bus delivery task into the engine's queue.
struct ControlForwarder {
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[async_trait]
impl MessageHandler for ControlForwarder {
    async fn on_message(&self, message: BusMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Control queue closed; dropping control message");
        }
    }
}

impl Pipeline {
    /// Create the startup and plugin directories.
    pub async fn prepare_dirs(&self) -> Result<()> {
        if self.engine.persisted {
            self.store.ensure_dir().await?;
        }
        tokio::fs::create_dir_all(&self.engine.plugin_dir).await?;
        Ok(())
    }

    /// Poll the bus until it reports running, up to the configured timeout.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.engine.ready_timeout();
        while !self.bus.is_running() {
            if Instant::now() >= deadline {
                return Err(PipelineError::Timeout(format!(
                    "message bus after {}ms",
                    self.engine.ready_timeout_ms
                )));
            }
            sleep(self.engine.ready_poll_interval()).await;
        }
        Ok(())
    }

    /// Re-apply every persisted descriptor in directory order.
    /// Returns how many were applied successfully.
    pub async fn replay_persisted(&self) -> Result<usize> {
        if !self.engine.persisted {
            return Ok(0);
        }

        let descriptors = self.store.load_all().await?;
        let total = descriptors.len();
        let mut applied = 0;
        for descriptor in descriptors {
            match self.handle_control(&descriptor.contents).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    tracing::error!(
                        path = %descriptor.path.display(),
                        kind = %e.kind(),
                        error = %e,
                        "Failed to replay persisted descriptor"
                    );
                }
            }
        }
        tracing::info!(applied, total, "Persisted descriptors replayed");
        Ok(applied)
    }

    /// Drive the control stream until shutdown.
    ///
    /// The control subscription is taken first so nothing published during
    /// startup is lost, but queued messages are only applied after the replay
    /// of persisted descriptors has finished.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.prepare_dirs().await?;

        let control = self.resolver.resolve(&self.engine.control_destination)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self
            .bus
            .subscribe(&control, std::sync::Arc::new(ControlForwarder { tx }))
            .await?;

        if let Err(e) = self.wait_until_ready().await {
            subscription.cancel().await;
            return Err(e);
        }
        self.replay_persisted().await?;

        tracing::info!(
            version = self.version(),
            control = %control,
            startup_dir = %self.engine.startup_dir.display(),
            plugin_dir = %self.engine.plugin_dir.display(),
            app = %self.context.app_name,
            host = %self.context.hostname,
            user = %self.context.user,
            correlation_id = %self.context.correlation_id,
            plugins = self.plugin_count(),
            "Pipeline running"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                message = rx.recv() => match message {
                    Some(message) => self.process_control(&message.payload).await,
                    None => {
                        tracing::warn!("Control subscription ended");
                        break;
                    }
                },
            }
        }

        subscription.cancel().await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop every plugin concurrently. Persisted descriptors are kept for the next start.
    pub async fn shutdown(&self) {
        let instances = self.registry.drain();
        let count = instances.len();
        join_all(instances.iter().map(|instance| instance.stop())).await;
        self.metrics.set_active_plugins(0);
        tracing::info!(stopped = count, "Pipeline stopped");
    }
}
