use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use relay_api::beacon::Beacon;
use relay_api::error::ServiceError;
use relay_api::format::{Event, Request};
use relay_api::record::Message;

use crate::app::App;
use crate::sync::lock;
use crate::topic::Topic;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Pull side of a consumer: an endless sequence of events.
pub trait PullSource: Send + Sync {
    /// Wait for the next event. Cancel-safe: a dropped call loses nothing.
    fn next_event(&self) -> Pin<Box<dyn Future<Output = Event> + Send + '_>>;
}

/// Called when a record addressed to a consumer cannot be decoded.
///
/// The record has already been dropped for that consumer; hooks only report.
pub trait DecodeErrorHook: Send + Sync {
    fn on_key_decode_error(&self, consumer: &TopicConsumer, error: &ServiceError, message: &Message) {
        tracing::error!(
            consumer = %consumer.beacon_path(),
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = ?message.key,
            error = %error,
            "cannot decode key"
        );
    }

    fn on_value_decode_error(
        &self,
        consumer: &TopicConsumer,
        error: &ServiceError,
        message: &Message,
    ) {
        tracing::error!(
            consumer = %consumer.beacon_path(),
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = ?message.key,
            value = ?message.value,
            error = %error,
            "cannot decode value"
        );
    }
}

/// Default hook: log and move on.
#[derive(Debug, Default)]
pub struct LogDecodeErrors;

impl DecodeErrorHook for LogDecodeErrors {}

/// Per-subscriber endpoint: decodes records addressed to it and queues the events.
///
/// Registered with at most one manager at a time.
pub struct TopicConsumer {
    id: u64,
    topic: Topic,
    app: App,
    tx: mpsc::UnboundedSender<Event>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    queued: AtomicUsize,
    registered: AtomicBool,
    /// Set by `close`; held while sending so no event slips in behind the drain.
    closed: Mutex<bool>,
    beacon: Mutex<Option<Beacon>>,
    hook: Arc<dyn DecodeErrorHook>,
    decode_errors: AtomicU64,
}

impl fmt::Debug for TopicConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicConsumer")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl fmt::Display for TopicConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicConsumer: {}", self.topic)
    }
}

impl TopicConsumer {
    pub fn new(topic: Topic) -> Self {
        Self::with_hook(topic, Arc::new(LogDecodeErrors))
    }

    pub fn with_hook(topic: Topic, hook: Arc<dyn DecodeErrorHook>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
            app: topic.app().clone(),
            topic,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            queued: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            closed: Mutex::new(false),
            beacon: Mutex::new(None),
            hook,
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Events waiting to be pulled.
    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Records dropped because the key or value failed to decode.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed, "consumer closed")
    }

    /// Path in the supervision tree, or the plain label when unregistered.
    pub fn beacon_path(&self) -> String {
        match lock(&self.beacon, "consumer beacon").as_ref() {
            Some(beacon) => beacon.path(),
            None => self.to_string(),
        }
    }

    /// Decode `message` and queue the resulting event.
    ///
    /// Decode failures never propagate: the hook is told, the record is
    /// dropped for this consumer and its reference released.
    pub async fn deliver(&self, message: Arc<Message>) {
        if self.is_closed() {
            self.release(&message);
            return;
        }
        let serializer = self.app.serializer();

        let decoded = serializer
            .loads_key(self.topic.key_type(), message.key.as_deref())
            .await;
        let key = match decoded {
            Ok(key) => key,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.hook.on_key_decode_error(self, &e, &message);
                self.release(&message);
                return;
            }
        };

        let request = Request {
            app_id: self.app.id_arc(),
            key,
            message,
        };
        let decoded = serializer
            .loads_value(self.topic.value_type(), &request)
            .await;
        match decoded {
            Ok(value) => {
                let Request { key, message, .. } = request;
                self.put(Event::new(key, value, message));
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.hook.on_value_decode_error(self, &e, &request.message);
                self.release(&request.message);
            }
        }
    }

    /// Queue an already decoded event. After `close` the event's record is
    /// released instead.
    pub fn put(&self, event: Event) {
        let closed = lock(&self.closed, "consumer closed");
        if *closed {
            drop(closed);
            if let Some(message) = &event.message {
                self.release(message);
            }
            return;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        // The receiver lives in `self`, so the channel cannot be closed.
        if self.tx.send(event).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Stop accepting events and hand back everything still queued.
    ///
    /// Waits for a pull in progress to finish.
    pub async fn close(&self) -> Vec<Event> {
        *lock(&self.closed, "consumer closed") = true;
        let mut rx = self.rx.lock().await;
        let mut pending = Vec::new();
        while let Ok(event) = rx.try_recv() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            pending.push(event);
        }
        pending
    }

    /// Wait for the next event (FIFO).
    pub async fn get(&self) -> Event {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(event) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                event
            }
            // Unreachable while `self.tx` exists.
            None => std::future::pending().await,
        }
    }

    fn release(&self, message: &Message) {
        if let Err(e) = self.app.sources().release(message) {
            tracing::error!(consumer = %self.beacon_path(), error = %e, "failed to release record");
        }
    }

    /// Claim registration. Returns the previous flag.
    pub(crate) fn mark_registered(&self) -> bool {
        self.registered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn attach(&self, beacon: Beacon) {
        *lock(&self.beacon, "consumer beacon") = Some(beacon);
    }

    pub(crate) fn detach(&self) {
        if let Some(beacon) = lock(&self.beacon, "consumer beacon").take() {
            beacon.detach();
        }
        self.registered.store(false, Ordering::Release);
    }
}

impl Drop for TopicConsumer {
    fn drop(&mut self) {
        let beacon = match self.beacon.get_mut() {
            Ok(beacon) => beacon.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(beacon) = beacon {
            beacon.detach();
        }
    }
}

impl PullSource for TopicConsumer {
    fn next_event(&self) -> Pin<Box<dyn Future<Output = Event> + Send + '_>> {
        Box::pin(self.get())
    }
}
