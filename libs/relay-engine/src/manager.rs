use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::beacon::Beacon;
use relay_api::record::{CommitScope, Message, TopicPartition};
use relay_api::transport::{
    ConsumerCallbacks, MessageCallback, PartitionCallback, Transport, TransportConsumer,
};

use crate::consumer::TopicConsumer;
use crate::error::EngineError;
use crate::sync::{lock, read, write};

/// Default grace period between `start` and the first subscription.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a [`TopicManager`].
///
/// ```text
/// Created → Starting → Subscribing → Running → Stopping → Stopped
///                          └──────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    /// Deferred bootstrap scheduled, waiting out the grace period.
    Starting,
    /// Pattern compiled, transport consumer being created and subscribed.
    Subscribing,
    Running,
    Stopping,
    Stopped,
    /// Bootstrap hit a transport error.
    Failed,
}

/// Extension points for partition rebalances. Both default to no-ops.
pub trait PartitionListener: Send + Sync {
    fn on_partitions_assigned(&self, _assigned: &[TopicPartition]) {}

    fn on_partitions_revoked(&self, _revoked: &[TopicPartition]) {}
}

#[derive(Debug, Default)]
pub struct NoopPartitionListener;

impl PartitionListener for NoopPartitionListener {}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub startup_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// Topic name → interested consumers, plus the alternation pattern over its keys.
#[derive(Default)]
struct Routes {
    topicmap: BTreeMap<String, Vec<Weak<TopicConsumer>>>,
    pattern: String,
}

/// Owns the single transport subscription and fans records out to consumers.
///
/// - Consumes every subscribed topic through one transport consumer.
/// - Forwards each record to all consumers subscribed to its topic,
///   counting one reference per recipient.
///
/// Consumers are held weakly: whoever runs a consumer owns it, and a dropped
/// consumer simply stops being routed.
pub struct TopicManager {
    transport: Arc<dyn Transport>,
    beacon: Beacon,
    config: ManagerConfig,
    listener: Arc<dyn PartitionListener>,
    /// Registered consumers by id.
    sources: RwLock<BTreeMap<u64, Weak<TopicConsumer>>>,
    routes: Arc<RwLock<Routes>>,
    consumer: RwLock<Option<Arc<dyn TransportConsumer>>>,
    /// Serializes bootstrap, update and stop.
    lifecycle: tokio::sync::Mutex<()>,
    bootstrap: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    state: watch::Sender<ManagerState>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for TopicManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicManager")
            .field("state", &self.state())
            .field("sources", &self.live_sources())
            .field("pattern", &self.pattern())
            .finish()
    }
}

impl TopicManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        parent: &Beacon,
        config: ManagerConfig,
        listener: Arc<dyn PartitionListener>,
    ) -> Self {
        let (state, _) = watch::channel(ManagerState::Created);
        Self {
            transport,
            beacon: parent.new_child("TopicManager"),
            config,
            listener,
            sources: RwLock::new(BTreeMap::new()),
            routes: Arc::new(RwLock::new(Routes::default())),
            consumer: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            bootstrap: Mutex::new(None),
            cancel: CancellationToken::new(),
            state,
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    /// Diagnostic label: type name and consumer count.
    pub fn label(&self) -> String {
        format!("TopicManager({})", self.live_sources())
    }

    fn live_sources(&self) -> usize {
        read(&self.sources, "sources")
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Current subscription pattern (empty before the first compile).
    pub fn pattern(&self) -> String {
        read(&self.routes, "routes").pattern.clone()
    }

    /// Consumers routed for `topic` as of the last compile.
    pub fn consumers_for(&self, topic: &str) -> Vec<Arc<TopicConsumer>> {
        Self::route(&self.routes, topic)
    }

    fn route(routes: &RwLock<Routes>, topic: &str) -> Vec<Arc<TopicConsumer>> {
        read(routes, "routes")
            .topicmap
            .get(topic)
            .map(|consumers| consumers.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Register a consumer and link it under the manager's beacon.
    ///
    /// Takes effect on the subscription at bootstrap, or on the next `update`.
    pub fn add_source(&self, source: &Arc<TopicConsumer>) -> Result<(), EngineError> {
        let mut sources = write(&self.sources, "sources");
        if sources.contains_key(&source.id()) || source.mark_registered() {
            return Err(EngineError::DuplicateSource(source.to_string()));
        }
        source.attach(self.beacon.new_child(source.to_string()));
        sources.insert(source.id(), Arc::downgrade(source));
        tracing::debug!(source = %source, count = sources.len(), "source registered");
        Ok(())
    }

    /// Deregister a consumer. Returns whether it was registered here.
    ///
    /// Dispatch stops reaching it right away; the subscription pattern only
    /// shrinks on the next `update`.
    pub fn remove_source(&self, source: &TopicConsumer) -> bool {
        let removed = write(&self.sources, "sources").remove(&source.id());
        if removed.is_none() {
            return false;
        }
        for consumers in write(&self.routes, "routes").topicmap.values_mut() {
            consumers.retain(|w| !std::ptr::eq(w.as_ptr(), source));
        }
        source.detach();
        tracing::debug!(source = %source, "source removed");
        true
    }

    /// Rebuild the topic map from the registered consumers and return the
    /// new subscription pattern.
    ///
    /// Only name-listed descriptors are routed; pattern descriptors are not expanded.
    pub fn compile_pattern(&self) -> String {
        let mut sources = write(&self.sources, "sources");
        sources.retain(|_, w| w.strong_count() > 0);
        let mut topicmap: BTreeMap<String, Vec<Weak<TopicConsumer>>> = BTreeMap::new();
        for source in sources.values().filter_map(Weak::upgrade) {
            let Some(topics) = source.topic().topics() else {
                tracing::debug!(source = %source, "pattern descriptor not routed");
                continue;
            };
            for topic in topics {
                let entry = topicmap.entry(topic.clone()).or_default();
                if !entry.iter().any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(&source))) {
                    entry.push(Arc::downgrade(&source));
                }
            }
        }
        drop(sources);

        let pattern = topicmap
            .keys()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        let mut routes = write(&self.routes, "routes");
        routes.topicmap = topicmap;
        routes.pattern = pattern.clone();
        pattern
    }

    /// Build the dispatch callback handed to the transport.
    ///
    /// The callback reads the shared topic map, so later compiles are picked
    /// up without rebuilding it.
    pub fn message_handler(&self) -> MessageCallback {
        let routes = self.routes.clone();
        Arc::new(move |message: Arc<Message>| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let routes = routes.clone();
            Box::pin(async move {
                let sources = Self::route(&routes, &message.topic);
                if sources.is_empty() {
                    tracing::trace!(topic = %message.topic, offset = message.offset, "no sources for record");
                    return;
                }
                // Count every recipient before the first delivery, so no
                // consumer can release the record down to zero early.
                message.incref_bulk(sources.len());
                tracing::trace!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    recipients = sources.len(),
                    "dispatching record"
                );
                for source in sources {
                    source.deliver(message.clone()).await;
                }
            })
        })
    }

    // -----------------------------------------------------------------------
    // Offsets
    // -----------------------------------------------------------------------

    /// Acknowledge the record's offset unless it was already acknowledged.
    pub fn ack_message(&self, message: &Message) -> Result<(), EngineError> {
        if message.mark_acked() {
            return Ok(());
        }
        if let Err(e) = self.ack_offset(&message.tp(), message.offset) {
            message.clear_acked();
            return Err(e);
        }
        Ok(())
    }

    pub fn ack_offset(&self, tp: &TopicPartition, offset: u64) -> Result<(), EngineError> {
        self.transport_consumer()?.ack(tp, offset)?;
        Ok(())
    }

    pub async fn commit(&self, scope: &CommitScope) -> Result<bool, EngineError> {
        let consumer = self.transport_consumer()?;
        Ok(consumer.commit(scope).await?)
    }

    /// Drop one reference to `message`; acknowledge it when the last one goes.
    ///
    /// Returns whether this call acknowledged the record.
    pub fn release(&self, message: &Message) -> Result<bool, EngineError> {
        if !message.decref() {
            return Ok(false);
        }
        self.ack_message(message)?;
        Ok(true)
    }

    fn transport_consumer(&self) -> Result<Arc<dyn TransportConsumer>, EngineError> {
        read(&self.consumer, "transport consumer")
            .clone()
            .ok_or(EngineError::NotStarted)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Schedule the deferred bootstrap and return immediately.
    ///
    /// After the grace period the pattern is compiled and the transport
    /// consumer is created, subscribed and started. Consumers registered
    /// later need an explicit `update`.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut slot = lock(&self.bootstrap, "bootstrap");
        let state = self.state();
        if state != ManagerState::Created {
            return Err(EngineError::InvalidState { op: "start", state });
        }
        self.set_state(ManagerState::Starting);
        tracing::info!(
            manager = %self.label(),
            grace_ms = self.config.startup_grace.as_millis() as u64,
            "scheduled deferred start"
        );
        *slot = Some(tokio::spawn(self.clone().delayed_start()));
        Ok(())
    }

    async fn delayed_start(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!("deferred start cancelled during grace period");
                return;
            }
            _ = tokio::time::sleep(self.config.startup_grace) => {}
        }

        let _guard = self.lifecycle.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.subscribe_and_start().await {
            tracing::error!(manager = %self.label(), error = %e, "deferred start failed");
            self.beacon.report(&e);
            *lock(&self.last_error, "last error") = Some(e.to_string());
            self.set_state(ManagerState::Failed);
        }
    }

    async fn subscribe_and_start(&self) -> Result<(), EngineError> {
        self.set_state(ManagerState::Subscribing);
        let pattern = self.compile_pattern();
        let consumer = self.create_consumer()?;
        *write(&self.consumer, "transport consumer") = Some(consumer.clone());

        consumer
            .subscribe(&pattern)
            .await
            .map_err(|e| EngineError::from(e).with_context("subscribe"))?;
        consumer
            .start()
            .await
            .map_err(|e| EngineError::from(e).with_context("start"))?;

        self.set_state(ManagerState::Running);
        tracing::info!(manager = %self.label(), %pattern, "subscribed");
        Ok(())
    }

    fn create_consumer(&self) -> Result<Arc<dyn TransportConsumer>, EngineError> {
        let listener = self.listener.clone();
        let on_partitions_assigned: PartitionCallback = Arc::new(move |assigned: &[TopicPartition]| {
            tracing::info!(count = assigned.len(), "partitions assigned");
            listener.on_partitions_assigned(assigned);
        });
        let listener = self.listener.clone();
        let on_partitions_revoked: PartitionCallback = Arc::new(move |revoked: &[TopicPartition]| {
            tracing::info!(count = revoked.len(), "partitions revoked");
            listener.on_partitions_revoked(revoked);
        });

        let consumer = self.transport.create_consumer(ConsumerCallbacks {
            on_message: self.message_handler(),
            on_partitions_revoked,
            on_partitions_assigned,
            beacon: self.beacon.clone(),
        })?;
        Ok(consumer)
    }

    /// Recompile the pattern and resubscribe. Only valid while running.
    pub async fn update(&self) -> Result<(), EngineError> {
        let _guard = self.lifecycle.lock().await;
        let state = self.state();
        if state != ManagerState::Running {
            return Err(EngineError::InvalidState { op: "update", state });
        }
        let pattern = self.compile_pattern();
        self.transport_consumer()?
            .subscribe(&pattern)
            .await
            .map_err(|e| EngineError::from(e).with_context("subscribe"))?;
        tracing::info!(manager = %self.label(), %pattern, "subscription updated");
        Ok(())
    }

    /// Cancel a pending bootstrap and stop the transport consumer, if any.
    ///
    /// Safe to call in any state; stopping twice is a no-op.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let bootstrap = lock(&self.bootstrap, "bootstrap").take();
        if let Some(handle) = bootstrap {
            let _ = handle.await;
        }

        let _guard = self.lifecycle.lock().await;
        if self.state() == ManagerState::Stopped {
            return Ok(());
        }
        self.set_state(ManagerState::Stopping);

        let consumer = write(&self.consumer, "transport consumer").take();
        let result = match consumer {
            Some(consumer) => consumer
                .stop()
                .await
                .map_err(|e| EngineError::from(e).with_context("stop")),
            None => Ok(()),
        };
        self.set_state(ManagerState::Stopped);
        tracing::info!(manager = %self.label(), "stopped");
        result
    }

    /// Wait for the deferred start to finish.
    ///
    /// Resolves `Ok` once running; fails if bootstrap failed or the manager
    /// was stopped first.
    pub async fn wait_running(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state == ManagerState::Created {
            return Err(EngineError::InvalidState {
                op: "wait for running",
                state,
            });
        }
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| {
                matches!(
                    s,
                    ManagerState::Running
                        | ManagerState::Failed
                        | ManagerState::Stopping
                        | ManagerState::Stopped
                )
            })
            .await
            .map_err(|_| EngineError::Bootstrap("manager dropped".into()))?;

        match state {
            ManagerState::Running => Ok(()),
            ManagerState::Failed => {
                let msg = lock(&self.last_error, "last error")
                    .clone()
                    .unwrap_or_else(|| "unknown error".into());
                Err(EngineError::Bootstrap(msg))
            }
            state => Err(EngineError::InvalidState {
                op: "wait for running",
                state,
            }),
        }
    }

    fn set_state(&self, state: ManagerState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            tracing::debug!(from = ?prev, to = ?state, "manager state changed");
        }
    }
}
