use super::{BusMessage, Destination, MessageBus, MessageHandler, Properties, Subscription};
use crate::error::BusError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process-local topic bus: every subscriber of a destination receives each
/// message published to it after the subscription was made.
pub struct InMemoryBus {
    topics: DashMap<String, Vec<(u64, mpsc::UnboundedSender<BusMessage>)>>,
    next_id: AtomicU64,
    running: AtomicBool,
    closed: AtomicBool,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// A bus whose listener infrastructure has not reported ready yet.
    pub fn starting() -> Self {
        let bus = Self::new();
        bus.running.store(false, Ordering::SeqCst);
        bus
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop accepting traffic and end every delivery loop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.topics.clear();
    }

    pub fn subscriber_count(&self, destination: &Destination) -> usize {
        self.topics
            .get(destination.address())
            .map(|subscribers| subscribers.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(
        &self,
        destination: &Destination,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(destination.address().to_string())
            .or_default()
            .push((id, tx));

        tracing::debug!(destination = %destination, subscriber = id, "Subscribed");
        Ok(Subscription::spawn(destination.clone(), rx, handler))
    }

    async fn publish(
        &self,
        destination: &Destination,
        payload: String,
        properties: Properties,
    ) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let message = BusMessage::new(destination.clone(), payload, properties);
        if let Some(mut subscribers) = self.topics.get_mut(destination.address()) {
            subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
            tracing::trace!(
                destination = %destination,
                delivered = subscribers.len(),
                "Published message"
            );
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Collector {
        seen: Mutex<Vec<String>>,
        notify: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn on_message(&self, message: BusMessage) {
            self.seen.lock().await.push(message.payload);
            let _ = self.notify.send(());
        }
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Collector {
                seen: Mutex::new(Vec::new()),
                notify: tx,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = InMemoryBus::new();
        let topic = Destination::new("trades");
        let (first, mut first_rx) = collector();
        let (second, mut second_rx) = collector();

        let _a = bus.subscribe(&topic, first.clone()).await.unwrap();
        let _b = bus.subscribe(&topic, second.clone()).await.unwrap();

        bus.publish(&topic, "hello".into(), Properties::new())
            .await
            .unwrap();

        first_rx.recv().await.unwrap();
        second_rx.recv().await.unwrap();
        assert_eq!(*first.seen.lock().await, vec!["hello".to_string()]);
        assert_eq!(*second.seen.lock().await, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_delivery() {
        let bus = InMemoryBus::new();
        let topic = Destination::new("trades");
        let (handler, mut rx) = collector();

        let subscription = bus.subscribe(&topic, handler.clone()).await.unwrap();
        bus.publish(&topic, "one".into(), Properties::new())
            .await
            .unwrap();
        rx.recv().await.unwrap();

        subscription.cancel().await;
        bus.publish(&topic, "two".into(), Properties::new())
            .await
            .unwrap();

        assert_eq!(bus.subscriber_count(&topic), 0);
        assert_eq!(*handler.seen.lock().await, vec!["one".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_traffic() {
        let bus = InMemoryBus::new();
        let topic = Destination::new("trades");
        bus.close();

        let (handler, _rx) = collector();
        assert!(matches!(
            bus.subscribe(&topic, handler).await,
            Err(BusError::Closed)
        ));
        assert!(matches!(
            bus.publish(&topic, "x".into(), Properties::new()).await,
            Err(BusError::Closed)
        ));
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_starting_bus_reports_not_running() {
        let bus = InMemoryBus::starting();
        assert!(!bus.is_running());
        bus.mark_running();
        assert!(bus.is_running());
    }
}
