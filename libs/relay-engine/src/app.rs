use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::beacon::Beacon;
use relay_api::error::ServiceError;
use relay_api::format::{Event, Serializer};
use relay_api::transport::Transport;

use crate::config::RelayConfig;
use crate::consumer::TopicConsumer;
use crate::error::EngineError;
use crate::manager::{
    ManagerConfig, ManagerState, NoopPartitionListener, PartitionListener, TopicManager,
};
use crate::topic::{Subscribable, Topic, TopicOptions};

/// Async callback run for every event a stream pulls.
pub type StreamHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`StreamHandler`].
pub fn handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    Arc::new(move |event: Event| -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send>> {
        Box::pin(f(event))
    })
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Name used in logs; defaults to the descriptor's string form.
    pub name: Option<String>,
}

impl StreamOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// A running stream processor: its consumer plus the task draining it.
pub struct StreamHandle {
    name: String,
    consumer: Arc<TopicConsumer>,
    sources: Arc<TopicManager>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("name", &self.name)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl StreamHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer(&self) -> &Arc<TopicConsumer> {
        &self.consumer
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop pulling, wait for the in-flight event, and deregister the consumer.
    ///
    /// Events still queued are never handled; their records are released so
    /// the offsets behind them can still be acknowledged.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
        self.sources.remove_source(&self.consumer);

        let pending = self.consumer.close().await;
        for message in pending.iter().filter_map(|event| event.message.as_ref()) {
            if let Err(e) = self.sources.release(message) {
                tracing::error!(stream = %self.name, error = %e, "failed to release record");
            }
        }
        tracing::info!(stream = %self.name, released = pending.len(), "stream stopped");
    }
}

struct AppInner {
    id: Arc<str>,
    serializer: Arc<dyn Serializer>,
    beacon: Beacon,
    sources: Arc<TopicManager>,
}

/// Application handle: the serializer, the topic manager and the root of the
/// supervision tree. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("id", &self.inner.id)
            .field("sources", &self.inner.sources)
            .finish()
    }
}

pub struct AppBuilder {
    id: String,
    serializer: Arc<dyn Serializer>,
    transport: Arc<dyn Transport>,
    manager: ManagerConfig,
    listener: Arc<dyn PartitionListener>,
}

impl AppBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.manager.startup_grace = grace;
        self
    }

    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager = config;
        self
    }

    pub fn partition_listener(mut self, listener: Arc<dyn PartitionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn build(self) -> App {
        let beacon = Beacon::root(format!("App({})", self.id));
        let sources = Arc::new(TopicManager::new(
            self.transport,
            &beacon,
            self.manager,
            self.listener,
        ));
        App {
            inner: Arc::new(AppInner {
                id: Arc::from(self.id),
                serializer: self.serializer,
                beacon,
                sources,
            }),
        }
    }
}

impl App {
    pub fn builder(serializer: Arc<dyn Serializer>, transport: Arc<dyn Transport>) -> AppBuilder {
        AppBuilder {
            id: "relay".to_string(),
            serializer,
            transport,
            manager: ManagerConfig::default(),
            listener: Arc::new(NoopPartitionListener),
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        serializer: Arc<dyn Serializer>,
        transport: Arc<dyn Transport>,
    ) -> App {
        Self::builder(serializer, transport)
            .id(config.app_id.clone())
            .manager_config(config.manager_config())
            .build()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn id_arc(&self) -> Arc<str> {
        self.inner.id.clone()
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.inner.serializer
    }

    pub fn beacon(&self) -> &Beacon {
        &self.inner.beacon
    }

    /// The topic manager.
    pub fn sources(&self) -> &Arc<TopicManager> {
        &self.inner.sources
    }

    pub fn topic(&self, options: TopicOptions) -> Result<Topic, EngineError> {
        Topic::new(self, options)
    }

    /// Create a consumer for `topic`, register it, and spawn a task feeding
    /// its events to `handler`.
    ///
    /// Every event's record is released once the handler returns, whether it
    /// failed or not; handler errors are logged and the stream keeps going.
    pub fn stream(
        &self,
        topic: &Topic,
        handler: StreamHandler,
        options: StreamOptions,
    ) -> Result<StreamHandle, EngineError> {
        let name = options.name.unwrap_or_else(|| topic.to_string());
        let consumer = topic.subscribe();
        let sources = self.inner.sources.clone();
        sources.add_source(&consumer)?;

        if sources.state() == ManagerState::Running {
            tracing::warn!(stream = %name, "stream registered after startup; call update() to subscribe");
        }

        let token = CancellationToken::new();
        let handle = spawn_stream(
            name.clone(),
            consumer.clone(),
            sources.clone(),
            handler,
            token.clone(),
        );
        tracing::info!(stream = %name, topic = %topic, "stream started");

        Ok(StreamHandle {
            name,
            consumer,
            sources,
            token,
            handle,
        })
    }

    /// Start the topic manager (deferred subscription).
    pub fn start(&self) -> Result<(), EngineError> {
        self.inner.sources.start()
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.inner.sources.stop().await
    }
}

// ---------------------------------------------------------------------------
// Stream task
// ---------------------------------------------------------------------------

fn spawn_stream(
    name: String,
    consumer: Arc<TopicConsumer>,
    sources: Arc<TopicManager>,
    handler: StreamHandler,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = consumer.get() => event,
            };
            let message = event.message.clone();

            if let Err(e) = handler(event).await {
                tracing::error!(stream = %name, consumer = %consumer.beacon_path(), error = %e, "stream handler error");
            }
            if let Some(message) = message {
                if let Err(e) = sources.release(&message) {
                    tracing::error!(stream = %name, error = %e, "failed to release record");
                }
            }
        }
    })
}
