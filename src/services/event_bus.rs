//! Process-wide pub/sub over named event channels.
//!
//! Local delivery is synchronous: `publish()` runs every matching handler
//! before it returns, one delivery at a time in subscription order. Each
//! delivery executes on a spawned task (the runtime's worker pool) and is
//! awaited, so a panicking handler is isolated without breaking the
//! synchronous guarantee, and deliveries to one subscription can never
//! complete out of publish order for a single publisher. Duplicates are
//! still possible end to end, so consumers dedup on event id.
//!
//! Remote delivery is best-effort and asynchronous: events queue into a
//! bounded channel that a background task drains to an HTTP sink with
//! bounded retry; exhaustion never fails the publisher. The drain loop only
//! runs once [`EventBus::drive`] (or [`EventBus::listen`]) has started it.
//! A process that configures a remote sink but never drives the bus sends
//! nothing; [`EventBus::ensure_driven`] turns that mistake into a loud
//! startup error instead of silence.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

use super::event_store::EventStore;
use super::events::{Event, EventPayload, SequenceNumber};
use super::retry::RetryPolicy;

/// Async event handler. Receives an owned copy of the event.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Remote fanout target.
#[derive(Debug, Clone)]
pub struct RemoteSinkConfig {
    /// URL events are POSTed to as JSON.
    pub endpoint: String,
    pub retry: RetryPolicy,
    /// Bound on the in-flight remote queue; overflow drops (best-effort).
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the raw broadcast stream.
    pub channel_capacity: usize,
    /// Whether published events are appended to the store.
    pub persist_events: bool,
    pub remote: Option<RemoteSinkConfig>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            persist_events: true,
            remote: None,
        }
    }
}

struct Subscription {
    id: Uuid,
    pattern: String,
    handler: EventHandler,
}

/// Handle returned by subscribe; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(pub Uuid);

/// Background task started by [`EventBus::drive`] for remote fanout.
pub struct DriveHandle {
    pub remote_drain: Option<JoinHandle<()>>,
}

/// Central event bus.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: AtomicU64,
    store: Option<Arc<dyn EventStore>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    driven: AtomicBool,
    process_id: Uuid,
    remote_tx: Option<mpsc::Sender<Event>>,
    remote_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        let (remote_tx, remote_rx) = match &config.remote {
            Some(remote) => {
                let (tx, rx) = mpsc::channel(remote.queue_capacity);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        Self {
            sender,
            sequence: AtomicU64::new(0),
            store: None,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            driven: AtomicBool::new(false),
            process_id: Uuid::new_v4(),
            remote_tx,
            remote_rx: Mutex::new(remote_rx),
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish an event.
    ///
    /// Local subscribers are served before this returns, in subscription
    /// order; remote fanout is queued for the background drain. Never fails
    /// toward the caller: store and remote-transport trouble is logged.
    pub async fn publish(&self, payload: EventPayload) -> Event {
        let mut event = Event::new(payload);

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        event.sequence = SequenceNumber(seq);
        if event.source_process_id.is_none() {
            event.source_process_id = Some(self.process_id);
        }

        if self.config.persist_events {
            if let Some(ref store) = self.store {
                if let Err(e) = store.append(&event).await {
                    let msg = e.to_string();
                    if msg.contains("UNIQUE constraint failed: events.sequence") {
                        // Sequence collision with another process: re-sync and retry once.
                        if let Ok(Some(latest)) = store.latest_sequence().await {
                            let new_seq = latest.0 + 1;
                            self.sequence.store(new_seq + 1, Ordering::SeqCst);
                            event.sequence = SequenceNumber(new_seq);
                            if let Err(e2) = store.append(&event).await {
                                tracing::warn!("Failed to persist event after sequence re-sync: {e2}");
                            }
                        }
                    } else {
                        tracing::warn!("Failed to persist event: {e}");
                    }
                }
            }
        }

        // Raw stream consumers (best-effort; no subscribers is fine).
        let _ = self.sender.send(event.clone());

        self.dispatch_local(&event).await;

        // Remote queue is bounded and best-effort; the drain loop owns
        // actual delivery.
        if let Some(ref tx) = self.remote_tx {
            if !self.driven.load(Ordering::SeqCst) {
                tracing::error!(
                    channel = %event.channel(),
                    "Remote sink configured but the bus is not driven; events will queue \
                     and never leave this process. Call drive() or listen() during startup."
                );
            }
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::warn!(channel = %event.channel(), "Remote event queue full, dropping: {e}");
            }
        }

        event
    }

    /// Run every matching handler to completion, one at a time in
    /// subscription order. Each delivery is spawned onto the worker pool
    /// and awaited: a panic aborts that delivery only.
    async fn dispatch_local(&self, event: &Event) {
        let handlers: Vec<EventHandler> = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .filter(|s| pattern_matches(&s.pattern, event.payload.type_name()))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            let delivery = event.clone();
            if let Err(e) = tokio::spawn(async move { handler(delivery).await }).await {
                tracing::warn!(channel = %event.channel(), "Event handler aborted: {e}");
            }
        }
    }

    /// Register a handler for channels matching `pattern`.
    ///
    /// Patterns match the event type name: `"*"` matches everything,
    /// `"task.*"` matches by prefix, anything else matches exactly.
    pub async fn subscribe(&self, pattern: impl Into<String>, handler: EventHandler) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        self.subscriptions.write().await.push(Subscription {
            id,
            pattern: pattern.into(),
            handler,
        });
        SubscriptionHandle(id)
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.write().await.retain(|s| s.id != handle.0);
    }

    /// Raw broadcast receiver, for loops that consume the stream directly.
    pub fn subscribe_stream(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Fail loudly when a remote sink is configured but nothing drains it.
    /// Call this at the end of process startup. Local handlers need no
    /// drain loop: publish serves them synchronously.
    pub async fn ensure_driven(&self) -> DomainResult<()> {
        if self.remote_tx.is_some() && !self.driven.load(Ordering::SeqCst) {
            return Err(DomainError::ValidationFailed(
                "Remote event sink configured but the bus is not driven; \
                 call EventBus::drive() before serving"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_driven(&self) -> bool {
        self.driven.load(Ordering::SeqCst)
    }

    /// Start the remote-delivery drain loop in the background. Without it,
    /// nothing ever leaves the process; local delivery is unaffected.
    pub async fn drive(self: &Arc<Self>) -> DriveHandle {
        self.driven.store(true, Ordering::SeqCst);

        let remote_drain = match (self.config.remote.clone(), self.remote_rx.lock().await.take()) {
            (Some(remote), Some(mut rx)) => Some(tokio::spawn(async move {
                let client = reqwest::Client::new();
                while let Some(event) = rx.recv().await {
                    let outcome = remote
                        .retry
                        .run(event.sequence.0, || {
                            let client = client.clone();
                            let endpoint = remote.endpoint.clone();
                            let event = event.clone();
                            async move {
                                let response = client
                                    .post(&endpoint)
                                    .json(&event)
                                    .send()
                                    .await
                                    .map_err(|e| e.to_string())?;
                                response.error_for_status().map_err(|e| e.to_string())?;
                                Ok::<(), String>(())
                            }
                        })
                        .await;
                    if let Err(e) = outcome {
                        // At-most-once remote: exhausted retries drop the event.
                        tracing::warn!(
                            sequence = event.sequence.0,
                            channel = %event.channel(),
                            "Remote event delivery failed after retries: {e}"
                        );
                    }
                }
            })),
            _ => None,
        };

        DriveHandle { remote_drain }
    }

    /// Drive the bus and block on the remote drain loop. The blocking
    /// variant of [`Self::drive`] for processes whose main loop IS the bus.
    /// Returns immediately when no remote sink is configured.
    pub async fn listen(self: &Arc<Self>) {
        let handle = self.drive().await;
        if let Some(drain) = handle.remote_drain {
            let _ = drain.await;
        }
    }

    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn store(&self) -> Option<Arc<dyn EventStore>> {
        self.store.clone()
    }

    /// Initialize the sequence counter from the store so restarts do not
    /// reuse sequence numbers. Call during startup, before drive().
    pub async fn initialize_sequence_from_store(&self) {
        if let Some(ref store) = self.store {
            match store.latest_sequence().await {
                Ok(Some(latest)) => {
                    self.sequence.store(latest.0 + 1, Ordering::SeqCst);
                    tracing::info!("EventBus: initialized sequence from store at {}", latest.0 + 1);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("EventBus: failed to read latest sequence from store: {e}");
                }
            }
        }
    }
}

fn pattern_matches(pattern: &str, type_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return type_name == prefix || type_name.starts_with(&format!("{prefix}."));
    }
    pattern == type_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "task.completed"));
        assert!(pattern_matches("task.*", "task.completed"));
        assert!(pattern_matches("task.completed", "task.completed"));
        assert!(!pattern_matches("task.completed", "task.failed"));
        assert!(!pattern_matches("task.*", "phase.transitioned"));
        assert!(pattern_matches("phase.approval.*", "phase.approval.granted"));
        // Sibling prefixes must not leak: tasks.* is not task.*.
        assert!(!pattern_matches("task.*", "tasks.unblocked"));
    }

    #[tokio::test]
    async fn test_sequence_assignment() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let mut rx = bus.subscribe_stream();

        bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
        bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;

        assert_eq!(rx.recv().await.unwrap().sequence.0, 0);
        assert_eq!(rx.recv().await.unwrap().sequence.0, 1);
        assert_eq!(bus.current_sequence().0, 2);
    }

    #[tokio::test]
    async fn test_local_delivery_is_synchronous() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("task.*", counting_handler(Arc::clone(&counter))).await;

        // No drive loop, no sleep: publish has already run the handler by
        // the time it returns.
        bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Unrelated channel does not fire the handler.
        bus.publish(EventPayload::PhaseGateRejected {
            ticket_id: Uuid::new_v4(),
            failing_criteria: vec![],
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_subscription_fifo_for_single_publisher() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_by_handler = Arc::clone(&seen);
        bus.subscribe(
            "*",
            Arc::new(move |event: Event| {
                let seen = Arc::clone(&seen_by_handler);
                Box::pin(async move {
                    // An artificial stall must not let a later delivery
                    // overtake this one.
                    if event.sequence.0 == 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    }
                    seen.lock().await.push(event.sequence.0);
                })
            }),
        )
        .await;

        for _ in 0..3 {
            bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
        }

        assert_eq!(*seen.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "*",
            Arc::new(|_event| {
                Box::pin(async move {
                    panic!("handler blew up");
                })
            }),
        )
        .await;
        bus.subscribe("*", counting_handler(Arc::clone(&counter))).await;

        bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
        // The panicking neighbor did not stop the second handler, and
        // publish still returned normally.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_driven_guards_remote_sink_only() {
        // Local-only bus: subscriptions work without any drain loop.
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("*", counting_handler(Arc::clone(&counter))).await;
        assert!(bus.ensure_driven().await.is_ok());

        // A configured remote sink without a drain loop is a startup error.
        let remote_bus = Arc::new(EventBus::new(EventBusConfig {
            remote: Some(RemoteSinkConfig {
                endpoint: "http://127.0.0.1:9/events".to_string(),
                retry: RetryPolicy::new(0, 1, 1),
                queue_capacity: 8,
            }),
            ..EventBusConfig::default()
        }));
        assert!(remote_bus.ensure_driven().await.is_err());
        let _handle = remote_bus.drive().await;
        assert!(remote_bus.ensure_driven().await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = bus.subscribe("*", counting_handler(Arc::clone(&counter))).await;

        bus.unsubscribe(handle).await;
        bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
