//! Notification fan-out to local subscribers and peer instances.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::events::{NotificationEvent, NotificationEventType, TransportEnvelope};
use crate::subscribers::{
    SubscribeOptions, SubscriberId, SubscriberRegistry, UnsubscribeOptions,
};
use crate::transport::{PubSubTransport, TransportError, TransportMessage};

/// Delivers notifications to the subscriber registry and, when a transport
/// is configured, to the other orchestrator instances sharing it.
///
/// A subscriber's error or panic is logged and counted; it never stops
/// delivery to the remaining subscribers nor reaches the notifying caller.
pub struct NotificationHub {
    registry: SubscriberRegistry,
    transport: Option<Arc<dyn PubSubTransport>>,
    config: OrchestratorConfig,
    in_flight: AtomicUsize,
    listening: Mutex<HashSet<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationHub {
    /// Hub delivering to local subscribers only.
    pub fn local(config: OrchestratorConfig) -> Self {
        Self::build(config, None)
    }

    /// Hub that also exchanges notifications with peers over `transport`.
    pub fn distributed(config: OrchestratorConfig, transport: Arc<dyn PubSubTransport>) -> Self {
        Self::build(config, Some(transport))
    }

    fn build(config: OrchestratorConfig, transport: Option<Arc<dyn PubSubTransport>>) -> Self {
        Self {
            registry: SubscriberRegistry::new(),
            transport,
            config,
            in_flight: AtomicUsize::new(0),
            listening: Mutex::new(HashSet::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn is_distributed(&self) -> bool {
        self.transport.is_some()
    }

    /// Steps started by this instance that have not settled yet.
    pub fn in_flight_steps(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Registers a subscriber and, when distributed, starts listening on the
    /// workflow's channel.
    ///
    /// Registry changes that can start or stop listening hold the
    /// `listening` lock, so the registry and the channel set agree.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<SubscriberId, TransportError> {
        let mut listening = self.listening.lock().await;
        let workflow_id = options.workflow_id.clone();
        let id = self.registry.subscribe(options).await;
        self.listen(&mut listening, &workflow_id).await?;
        Ok(id)
    }

    /// Removes a subscriber and stops listening on the workflow's channel
    /// once it has no subscriber left.
    pub async fn unsubscribe(&self, options: UnsubscribeOptions) -> Result<bool, TransportError> {
        let mut listening = self.listening.lock().await;
        let workflow_id = options.workflow_id.clone();
        let removed = self.registry.unsubscribe(options).await;
        self.release(&mut listening, &workflow_id).await?;
        Ok(removed)
    }

    /// Delivers an event emitted by this instance.
    pub async fn notify(&self, event: NotificationEvent) {
        self.track(event.event_type);
        metrics::counter!(
            "orchestrator_notifications_total",
            "event_type" => event.event_type.as_str()
        )
        .increment(1);

        self.deliver(&event).await;
        self.publish(&event).await;
        self.clear_finished(&event).await;
    }

    async fn deliver(&self, event: &NotificationEvent) {
        let subscribers = self
            .registry
            .subscribers_for(&event.workflow_id, event.transaction_id.as_ref())
            .await;

        for registration in subscribers {
            let outcome = AssertUnwindSafe(registration.subscriber.handle(event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::counter!("orchestrator_subscriber_failures_total").increment(1);
                    warn!(
                        subscriber_id = %registration.id,
                        workflow_id = %event.workflow_id,
                        event_type = %event.event_type,
                        error = %e,
                        "subscriber failed"
                    );
                }
                Err(_) => {
                    metrics::counter!("orchestrator_subscriber_failures_total").increment(1);
                    error!(
                        subscriber_id = %registration.id,
                        workflow_id = %event.workflow_id,
                        event_type = %event.event_type,
                        "subscriber panicked"
                    );
                }
            }
        }
    }

    async fn publish(&self, event: &NotificationEvent) {
        let Some(transport) = &self.transport else {
            return;
        };

        let envelope = TransportEnvelope {
            instance_id: self.config.instance_id.clone(),
            data: event.clone(),
        };
        let channel = self.config.channel_for(&event.workflow_id);
        let published = match serde_json::to_string(&envelope) {
            Ok(payload) => transport.publish(&channel, payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            warn!(channel = %channel, event_type = %event.event_type, error = %e, "failed to publish notification");
        }
    }

    /// Handles a message from the transport.
    pub async fn receive(&self, message: TransportMessage) {
        let envelope: TransportEnvelope = match serde_json::from_str(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "dropping malformed notification");
                return;
            }
        };

        if envelope.instance_id == self.config.instance_id {
            return;
        }

        let event = envelope.data;
        debug!(
            from = %envelope.instance_id,
            workflow_id = %event.workflow_id,
            event_type = %event.event_type,
            "received peer notification"
        );
        self.deliver(&event).await;
        self.clear_finished(&event).await;
    }

    /// Drops the subscribers scoped to a finished transaction, leaving the
    /// workflow's channel if none remain.
    async fn clear_finished(&self, event: &NotificationEvent) {
        if event.event_type != NotificationEventType::Finish {
            return;
        }
        let Some(transaction_id) = &event.transaction_id else {
            return;
        };

        let mut listening = self.listening.lock().await;
        self.registry
            .clear_transaction(&event.workflow_id, transaction_id)
            .await;
        if let Err(e) = self.release(&mut listening, &event.workflow_id).await {
            warn!(workflow_id = %event.workflow_id, error = %e, "failed to leave channel");
        }
    }

    /// Starts consuming the transport's messages and listens on the
    /// channels of every workflow that already has subscribers.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };

        {
            let mut pump = self.pump.lock().await;
            if pump.is_none() {
                *pump = Some(spawn_pump(Arc::downgrade(self), transport.as_ref()));
            }
        }

        let mut listening = self.listening.lock().await;
        for workflow_id in self.registry.workflow_ids().await {
            self.listen(&mut listening, &workflow_id).await?;
        }
        info!(instance_id = %self.config.instance_id, "notification hub started");
        Ok(())
    }

    /// Waits until every step started by this instance has settled.
    pub async fn drain(&self) {
        loop {
            let in_flight = self.in_flight_steps();
            if in_flight == 0 {
                return;
            }
            debug!(in_flight, "waiting for in-flight steps");
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }

    /// Stops consuming the transport and leaves every channel.
    pub async fn stop(&self) -> Result<(), TransportError> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }

        let Some(transport) = &self.transport else {
            return Ok(());
        };
        let channels: Vec<String> = self.listening.lock().await.drain().collect();
        for channel in channels {
            transport.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    async fn listen(
        &self,
        listening: &mut HashSet<String>,
        workflow_id: &str,
    ) -> Result<(), TransportError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        let channel = self.config.channel_for(workflow_id);
        if !listening.contains(&channel) {
            transport.subscribe(&channel).await?;
            listening.insert(channel);
        }
        Ok(())
    }

    /// Leaves the workflow's channel once it has no local subscriber.
    async fn release(
        &self,
        listening: &mut HashSet<String>,
        workflow_id: &str,
    ) -> Result<(), TransportError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        if self.registry.has_subscribers(workflow_id).await {
            return Ok(());
        }
        let channel = self.config.channel_for(workflow_id);
        if listening.remove(&channel) {
            transport.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    fn track(&self, event_type: NotificationEventType) {
        if event_type == NotificationEventType::StepBegin {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
        } else if event_type.settles_step() {
            // Steps resumed from another instance settle here without a begin.
            let _ = self
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        } else {
            return;
        }
        metrics::gauge!("orchestrator_in_flight_steps").set(self.in_flight_steps() as f64);
    }
}

fn spawn_pump(hub: Weak<NotificationHub>, transport: &dyn PubSubTransport) -> JoinHandle<()> {
    let mut messages = transport.messages();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => {
                    let Some(hub) = hub.upgrade() else {
                        break;
                    };
                    hub.receive(message).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification pump lagged behind transport");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::{EventSubscriber, SubscriberError, subscriber_fn};
    use crate::transport::{InMemoryBroker, InMemoryPubSub};
    use common::TransactionId;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, Arc<dyn EventSubscriber>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = subscriber_fn(move |event: NotificationEvent| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(format!(
                    "{}:{}",
                    event.event_type,
                    event.transaction_id.map(String::from).unwrap_or_default()
                ));
                Ok(())
            }
        });
        (seen, subscriber)
    }

    fn event(event_type: NotificationEventType, transaction_id: &str) -> NotificationEvent {
        let mut event = NotificationEvent::new(event_type, "checkout");
        event.transaction_id = Some(TransactionId::new(transaction_id));
        event
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_stop_delivery() {
        let hub = NotificationHub::local(OrchestratorConfig::default());
        let (seen, good) = recorder();

        hub.subscribe(SubscribeOptions::new(
            "checkout",
            subscriber_fn(|_event| async { Err(SubscriberError::from("broken")) }),
        ))
        .await
        .unwrap();
        hub.subscribe(SubscribeOptions::new(
            "checkout",
            subscriber_fn(|event: NotificationEvent| async move {
                if event.event_type == NotificationEventType::Begin {
                    panic!("subscriber bug");
                }
                Ok(())
            }),
        ))
        .await
        .unwrap();
        hub.subscribe(SubscribeOptions::new("checkout", good))
            .await
            .unwrap();

        hub.notify(event(NotificationEventType::Begin, "tx1")).await;

        assert_eq!(*seen.lock().unwrap(), vec!["begin:tx1"]);
    }

    #[tokio::test]
    async fn scoped_subscribers_only_see_their_transaction() {
        let hub = NotificationHub::local(OrchestratorConfig::default());
        let (seen, subscriber) = recorder();
        hub.subscribe(SubscribeOptions::new("checkout", subscriber).for_transaction("tx1"))
            .await
            .unwrap();

        hub.notify(event(NotificationEventType::Begin, "tx2")).await;
        hub.notify(event(NotificationEventType::Begin, "tx1")).await;

        assert_eq!(*seen.lock().unwrap(), vec!["begin:tx1"]);
    }

    #[tokio::test]
    async fn finish_clears_transaction_subscribers() {
        let hub = NotificationHub::local(OrchestratorConfig::default());
        let (_, scoped) = recorder();
        let (_, any) = recorder();
        hub.subscribe(SubscribeOptions::new("checkout", scoped).for_transaction("tx1"))
            .await
            .unwrap();
        hub.subscribe(SubscribeOptions::new("checkout", any))
            .await
            .unwrap();

        hub.notify(event(NotificationEventType::Finish, "tx1")).await;

        assert_eq!(hub.registry().count("checkout").await, 1);
    }

    #[tokio::test]
    async fn tracks_in_flight_steps() {
        let hub = NotificationHub::local(OrchestratorConfig::default());

        hub.notify(event(NotificationEventType::StepBegin, "tx1")).await;
        hub.notify(event(NotificationEventType::StepBegin, "tx2")).await;
        assert_eq!(hub.in_flight_steps(), 2);

        hub.notify(event(NotificationEventType::StepAwaiting, "tx1")).await;
        hub.notify(event(NotificationEventType::StepSuccess, "tx2")).await;
        hub.notify(event(NotificationEventType::StepSuccess, "tx3")).await;
        assert_eq!(hub.in_flight_steps(), 0);

        hub.drain().await;
    }

    async fn distributed_hub() -> (Arc<NotificationHub>, Arc<InMemoryPubSub>) {
        let transport = Arc::new(InMemoryBroker::new().connect().await);
        let hub = Arc::new(NotificationHub::distributed(
            OrchestratorConfig::default(),
            transport.clone(),
        ));
        (hub, transport)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listening_follows_concurrent_subscription_changes() {
        let (hub, transport) = distributed_hub().await;

        let mut tasks = Vec::new();
        for i in 0..64 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                let (_, subscriber) = recorder();
                let id = hub
                    .subscribe(SubscribeOptions::new("checkout", subscriber).with_id(format!("s{i}")))
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    hub.unsubscribe(UnsubscribeOptions::by_id("checkout", id))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(hub.registry().count("checkout").await, 32);
        assert_eq!(transport.channels().await, vec!["orchestrator:checkout"]);

        for i in (1..64).step_by(2) {
            hub.unsubscribe(UnsubscribeOptions::by_id("checkout", format!("s{i}")))
                .await
                .unwrap();
        }
        assert!(transport.channels().await.is_empty());
    }

    #[tokio::test]
    async fn finish_leaves_channel_without_subscribers() {
        let (hub, transport) = distributed_hub().await;
        let (_, scoped) = recorder();
        hub.subscribe(SubscribeOptions::new("checkout", scoped).for_transaction("tx1"))
            .await
            .unwrap();
        assert_eq!(transport.channels().await, vec!["orchestrator:checkout"]);

        hub.notify(event(NotificationEventType::Finish, "tx2")).await;
        assert_eq!(transport.channels().await, vec!["orchestrator:checkout"]);

        hub.notify(event(NotificationEventType::Finish, "tx1")).await;
        assert!(!hub.registry().has_subscribers("checkout").await);
        assert!(transport.channels().await.is_empty());
    }

    #[tokio::test]
    async fn peers_receive_each_others_notifications_once() {
        let broker = InMemoryBroker::new();
        let a = Arc::new(NotificationHub::distributed(
            OrchestratorConfig::default().with_instance_id("a"),
            Arc::new(broker.connect().await),
        ));
        let b = Arc::new(NotificationHub::distributed(
            OrchestratorConfig::default().with_instance_id("b"),
            Arc::new(broker.connect().await),
        ));
        a.start().await.unwrap();
        b.start().await.unwrap();

        let (seen_a, sub_a) = recorder();
        let (seen_b, sub_b) = recorder();
        a.subscribe(SubscribeOptions::new("checkout", sub_a)).await.unwrap();
        b.subscribe(SubscribeOptions::new("checkout", sub_b)).await.unwrap();

        a.notify(event(NotificationEventType::Begin, "tx1")).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while seen_b.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(*seen_a.lock().unwrap(), vec!["begin:tx1"]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["begin:tx1"]);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
