//! Subscriber registry for workflow notifications.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::TransactionId;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::NotificationEvent;

/// Error returned by a subscriber. It is logged and never reaches the
/// caller of the operation that emitted the event.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl From<&str> for SubscriberError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for SubscriberError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Receives workflow notifications.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle(&self, event: &NotificationEvent) -> Result<(), SubscriberError>;
}

struct FnSubscriber<F>(F);

#[async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(NotificationEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SubscriberError>> + Send,
{
    async fn handle(&self, event: &NotificationEvent) -> Result<(), SubscriberError> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as a subscriber.
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn EventSubscriber>
where
    F: Fn(NotificationEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
{
    Arc::new(FnSubscriber(f))
}

/// Identifier a subscriber is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration request.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub workflow_id: String,
    /// Restricts delivery to one transaction; all transactions when absent.
    pub transaction_id: Option<TransactionId>,
    pub subscriber: Arc<dyn EventSubscriber>,
    /// Id to register under; generated when absent.
    pub subscriber_id: Option<SubscriberId>,
}

impl SubscribeOptions {
    pub fn new(workflow_id: impl Into<String>, subscriber: Arc<dyn EventSubscriber>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: None,
            subscriber,
            subscriber_id: None,
        }
    }

    pub fn for_transaction(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_id(mut self, subscriber_id: impl Into<SubscriberId>) -> Self {
        self.subscriber_id = Some(subscriber_id.into());
        self
    }
}

/// How a subscriber is addressed for removal.
#[derive(Clone)]
pub enum SubscriberRef {
    Id(SubscriberId),
    Handle(Arc<dyn EventSubscriber>),
}

/// Removal request.
#[derive(Clone)]
pub struct UnsubscribeOptions {
    pub workflow_id: String,
    pub transaction_id: Option<TransactionId>,
    pub subscriber: SubscriberRef,
}

impl UnsubscribeOptions {
    pub fn by_id(workflow_id: impl Into<String>, subscriber_id: impl Into<SubscriberId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: None,
            subscriber: SubscriberRef::Id(subscriber_id.into()),
        }
    }

    pub fn by_handle(workflow_id: impl Into<String>, subscriber: Arc<dyn EventSubscriber>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: None,
            subscriber: SubscriberRef::Handle(subscriber),
        }
    }

    pub fn for_transaction(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// A registered subscriber.
#[derive(Clone)]
pub struct Registration {
    pub id: SubscriberId,
    pub subscriber: Arc<dyn EventSubscriber>,
}

impl Registration {
    fn matches(&self, subscriber: &SubscriberRef) -> bool {
        match subscriber {
            SubscriberRef::Id(id) => &self.id == id,
            SubscriberRef::Handle(handle) => same_subscriber(&self.subscriber, handle),
        }
    }
}

fn same_subscriber(a: &Arc<dyn EventSubscriber>, b: &Arc<dyn EventSubscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Default)]
struct WorkflowSubscribers {
    any: Vec<Registration>,
    by_transaction: HashMap<TransactionId, Vec<Registration>>,
}

impl WorkflowSubscribers {
    fn bucket_mut(&mut self, transaction_id: Option<&TransactionId>) -> &mut Vec<Registration> {
        match transaction_id {
            Some(id) => self.by_transaction.entry(id.clone()).or_default(),
            None => &mut self.any,
        }
    }

    fn is_empty(&self) -> bool {
        self.any.is_empty() && self.by_transaction.is_empty()
    }
}

/// Subscribers per workflow, split into a workflow-wide bucket and
/// per-transaction buckets.
///
/// Buckets are never spliced in place: every change builds a filtered copy
/// and swaps it in under the write lock, and delivery works on a snapshot
/// taken under the read lock.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<HashMap<String, WorkflowSubscribers>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber, replacing any registration with the same id
    /// or the same handle in that bucket.
    pub async fn subscribe(&self, options: SubscribeOptions) -> SubscriberId {
        let id = options.subscriber_id.unwrap_or_default();
        let registration = Registration {
            id: id.clone(),
            subscriber: options.subscriber,
        };

        let mut inner = self.inner.write().await;
        let bucket = inner
            .entry(options.workflow_id)
            .or_default()
            .bucket_mut(options.transaction_id.as_ref());

        let mut next: Vec<Registration> = bucket
            .iter()
            .filter(|r| r.id != id && !same_subscriber(&r.subscriber, &registration.subscriber))
            .cloned()
            .collect();
        next.push(registration);
        *bucket = next;

        id
    }

    /// Removes a subscriber. Returns true if one was removed.
    pub async fn unsubscribe(&self, options: UnsubscribeOptions) -> bool {
        let mut inner = self.inner.write().await;
        let Some(workflow) = inner.get_mut(&options.workflow_id) else {
            return false;
        };

        let bucket = match &options.transaction_id {
            Some(id) => match workflow.by_transaction.get_mut(id) {
                Some(bucket) => bucket,
                None => return false,
            },
            None => &mut workflow.any,
        };

        let before = bucket.len();
        let next: Vec<Registration> = bucket
            .iter()
            .filter(|r| !r.matches(&options.subscriber))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *bucket = next;

        if let Some(id) = &options.transaction_id
            && workflow.by_transaction.get(id).is_some_and(Vec::is_empty)
        {
            workflow.by_transaction.remove(id);
        }
        if workflow.is_empty() {
            inner.remove(&options.workflow_id);
        }

        removed
    }

    /// Subscribers to deliver an event to: the transaction's own
    /// subscribers first, then the workflow-wide ones.
    pub async fn subscribers_for(
        &self,
        workflow_id: &str,
        transaction_id: Option<&TransactionId>,
    ) -> Vec<Registration> {
        let inner = self.inner.read().await;
        let Some(workflow) = inner.get(workflow_id) else {
            return Vec::new();
        };

        let scoped = transaction_id
            .and_then(|id| workflow.by_transaction.get(id))
            .into_iter()
            .flatten();
        scoped.chain(workflow.any.iter()).cloned().collect()
    }

    /// Drops the subscribers scoped to a transaction.
    pub async fn clear_transaction(&self, workflow_id: &str, transaction_id: &TransactionId) {
        let mut inner = self.inner.write().await;
        if let Some(workflow) = inner.get_mut(workflow_id) {
            workflow.by_transaction.remove(transaction_id);
            if workflow.is_empty() {
                inner.remove(workflow_id);
            }
        }
    }

    /// Returns true if the workflow has any subscriber left.
    pub async fn has_subscribers(&self, workflow_id: &str) -> bool {
        self.inner.read().await.contains_key(workflow_id)
    }

    /// Ids of the workflows with at least one subscriber.
    pub async fn workflow_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Number of registrations for a workflow across all buckets.
    pub async fn count(&self, workflow_id: &str) -> usize {
        self.inner.read().await.get(workflow_id).map_or(0, |w| {
            w.any.len() + w.by_transaction.values().map(Vec::len).sum::<usize>()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn EventSubscriber> {
        subscriber_fn(|_event| async { Ok(()) })
    }

    fn ids(registrations: &[Registration]) -> Vec<&str> {
        registrations.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn generates_ids_when_absent() {
        let registry = SubscriberRegistry::new();
        let a = registry.subscribe(SubscribeOptions::new("checkout", noop())).await;
        let b = registry.subscribe(SubscribeOptions::new("checkout", noop())).await;

        assert_ne!(a, b);
        assert_eq!(registry.count("checkout").await, 2);
    }

    #[tokio::test]
    async fn transaction_subscribers_come_first() {
        let registry = SubscriberRegistry::new();
        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).with_id("any-1"))
            .await;
        registry
            .subscribe(
                SubscribeOptions::new("checkout", noop())
                    .for_transaction("tx1")
                    .with_id("tx1-1"),
            )
            .await;
        registry
            .subscribe(
                SubscribeOptions::new("checkout", noop())
                    .for_transaction("tx2")
                    .with_id("tx2-1"),
            )
            .await;
        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).with_id("any-2"))
            .await;

        let tx1 = TransactionId::new("tx1");
        let delivered = registry.subscribers_for("checkout", Some(&tx1)).await;
        assert_eq!(ids(&delivered), vec!["tx1-1", "any-1", "any-2"]);

        let workflow_only = registry.subscribers_for("checkout", None).await;
        assert_eq!(ids(&workflow_only), vec!["any-1", "any-2"]);

        assert!(registry.subscribers_for("refund", Some(&tx1)).await.is_empty());
    }

    #[tokio::test]
    async fn resubscribing_replaces_by_id_and_handle() {
        let registry = SubscriberRegistry::new();
        let handle = noop();

        registry
            .subscribe(SubscribeOptions::new("checkout", handle.clone()).with_id("audit"))
            .await;
        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).with_id("audit"))
            .await;
        assert_eq!(registry.count("checkout").await, 1);

        registry
            .subscribe(SubscribeOptions::new("checkout", handle.clone()))
            .await;
        registry
            .subscribe(SubscribeOptions::new("checkout", handle.clone()))
            .await;
        assert_eq!(registry.count("checkout").await, 2);
    }

    #[tokio::test]
    async fn unsubscribe_by_id_and_by_handle() {
        let registry = SubscriberRegistry::new();
        let handle = noop();
        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).with_id("audit"))
            .await;
        registry
            .subscribe(SubscribeOptions::new("checkout", handle.clone()).for_transaction("tx1"))
            .await;

        assert!(
            registry
                .unsubscribe(UnsubscribeOptions::by_id("checkout", "audit"))
                .await
        );
        assert!(
            registry
                .unsubscribe(UnsubscribeOptions::by_handle("checkout", handle).for_transaction("tx1"))
                .await
        );
        assert!(!registry.has_subscribers("checkout").await);
    }

    #[tokio::test]
    async fn unsubscribing_unknown_subscriber_is_noop() {
        let registry = SubscriberRegistry::new();
        assert!(
            !registry
                .unsubscribe(UnsubscribeOptions::by_id("checkout", "missing"))
                .await
        );

        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).with_id("audit"))
            .await;
        assert!(
            !registry
                .unsubscribe(UnsubscribeOptions::by_id("checkout", "missing").for_transaction("tx1"))
                .await
        );
        assert_eq!(registry.count("checkout").await, 1);
    }

    #[tokio::test]
    async fn clear_transaction_keeps_workflow_subscribers() {
        let registry = SubscriberRegistry::new();
        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).with_id("any"))
            .await;
        registry
            .subscribe(SubscribeOptions::new("checkout", noop()).for_transaction("tx1"))
            .await;

        registry
            .clear_transaction("checkout", &TransactionId::new("tx1"))
            .await;

        assert_eq!(registry.count("checkout").await, 1);
        assert_eq!(registry.workflow_ids().await, vec!["checkout".to_string()]);
    }
}
