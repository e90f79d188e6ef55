use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use codec_json::JsonSerializer;
use relay_api::error::ServiceError;
use relay_api::format::{Event, Payload, Request, Serializer, TypeBinding};
use relay_api::record::{CommitScope, Message, TopicPartition};
use relay_api::transport::{ConsumerCallbacks, Transport, TransportConsumer};
use relay_engine::{
    handler, App, EngineError, ManagerState, PartitionListener, StreamHandle, StreamOptions,
    Subscribable, TopicOptions,
};
use transport_memory::MemoryTransport;

const GRACE: Duration = Duration::from_secs(2);

fn app_with(transport: &MemoryTransport) -> App {
    App::builder(Arc::new(JsonSerializer), Arc::new(transport.clone()))
        .id("it")
        .startup_grace(GRACE)
        .build()
}

/// Stream whose handler forwards every event into a channel.
fn forwarding_stream(
    app: &App,
    options: TopicOptions,
) -> (StreamHandle, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let topic = app.topic(options).unwrap();
    let stream = topic
        .stream(
            handler(move |event| {
                let tx = tx.clone();
                async move {
                    tx.send(event)
                        .map_err(|_| ServiceError::logic("receiver dropped"))
                }
            }),
            StreamOptions::default(),
        )
        .unwrap();
    (stream, rx)
}

/// Poll `check` on the paused clock until it holds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

fn json(bytes: &[u8]) -> Option<Vec<u8>> {
    Some(bytes.to_vec())
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_after_grace_period() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let (_stream, mut rx) = forwarding_stream(
        &app,
        TopicOptions::topics(["orders"])
            .key_type(TypeBinding::Text)
            .value_type(TypeBinding::Json),
    );

    let started = tokio::time::Instant::now();
    app.start().unwrap();
    assert_eq!(app.sources().state(), ManagerState::Starting);
    assert_eq!(transport.consumers_created(), 0);

    app.sources().wait_running().await.unwrap();
    assert!(started.elapsed() >= GRACE);
    assert_eq!(app.sources().pattern(), "orders");
    assert_eq!(transport.running_consumers(), 1);

    let (tp, offset) = transport.produce("orders", Some(b"k1".to_vec()), json(br#"{"id": 7}"#));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.key, Payload::Text("k1".into()));
    assert_eq!(event.value, Payload::Json(serde_json::json!({"id": 7})));
    assert_eq!(event.message.as_ref().unwrap().offset, offset);

    eventually("record acked", || transport.acked_offset(&tp) == Some(offset + 1)).await;

    app.stop().await.unwrap();
    assert_eq!(app.sources().state(), ManagerState::Stopped);
    assert_eq!(transport.running_consumers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backlog_is_delivered_on_start() {
    let transport = MemoryTransport::new();
    transport.produce("orders", None, json(b"1"));
    transport.produce("orders", None, json(b"2"));

    let app = app_with(&transport);
    let (_stream, mut rx) =
        forwarding_stream(&app, TopicOptions::topics(["orders"]).value_type(TypeBinding::Json));
    app.start().unwrap();

    assert_eq!(rx.recv().await.unwrap().value, Payload::Json(serde_json::json!(1)));
    assert_eq!(rx.recv().await.unwrap().value, Payload::Json(serde_json::json!(2)));
    app.stop().await.unwrap();
}

/// Records the reference count each value decode observes.
#[derive(Default)]
struct RefcountSerializer {
    inner: JsonSerializer,
    seen: Mutex<Vec<usize>>,
}

impl Serializer for RefcountSerializer {
    fn loads_key<'a>(
        &'a self,
        key_type: Option<TypeBinding>,
        raw: Option<&'a [u8]>,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, ServiceError>> + Send + 'a>> {
        self.inner.loads_key(key_type, raw)
    }

    fn loads_value<'a>(
        &'a self,
        value_type: Option<TypeBinding>,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Payload, ServiceError>> + Send + 'a>> {
        self.seen.lock().unwrap().push(request.message.refcount());
        self.inner.loads_value(value_type, request)
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_recipient_counted_before_first_delivery() {
    let transport = MemoryTransport::new();
    let counting = Arc::new(RefcountSerializer::default());
    let app = App::builder(counting.clone(), Arc::new(transport.clone()))
        .startup_grace(GRACE)
        .build();

    // Registered without streams, so nothing releases the record.
    let c1 = app.topic(TopicOptions::topics(["a", "b"])).unwrap().subscribe();
    let c2 = app.topic(TopicOptions::topics(["b", "c"])).unwrap().subscribe();
    app.sources().add_source(&c1).unwrap();
    app.sources().add_source(&c2).unwrap();

    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    transport.produce("b", None, json(b"{}"));
    eventually("both consumers queued", || c1.queue_len() == 1 && c2.queue_len() == 1).await;
    assert_eq!(*counting.seen.lock().unwrap(), [2, 2]);

    let event = c1.get().await;
    assert_eq!(event.message.unwrap().refcount(), 2);
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_record_acked_once_after_every_recipient_releases() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let (_s1, mut rx1) = forwarding_stream(&app, TopicOptions::topics(["orders"]));
    let (_s2, mut rx2) = forwarding_stream(&app, TopicOptions::topics(["orders"]));
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let (tp, offset) = transport.produce("orders", None, Some(b"v".to_vec()));
    rx1.recv().await.unwrap();
    rx2.recv().await.unwrap();

    eventually("record acked", || transport.acked_offset(&tp) == Some(offset + 1)).await;
    assert_eq!(transport.ack_calls(), 1);
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_key_decode_failure_drops_and_releases() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let (stream, mut rx) = forwarding_stream(
        &app,
        TopicOptions::topics(["orders"]).key_type(TypeBinding::Json),
    );
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let (tp, offset) = transport.produce("orders", Some(b"not json".to_vec()), json(b"{}"));
    eventually("dropped record acked", || transport.acked_offset(&tp) == Some(offset + 1)).await;
    assert_eq!(stream.consumer().decode_errors(), 1);
    assert!(rx.try_recv().is_err());

    transport.produce("orders", Some(b"\"ok\"".to_vec()), json(b"{}"));
    assert_eq!(rx.recv().await.unwrap().key, Payload::Json(serde_json::json!("ok")));
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ack_message_is_idempotent() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let m = Message::new("orders", 0, 0, None, None);
    app.sources().ack_message(&m).unwrap();
    app.sources().ack_message(&m).unwrap();

    assert!(m.is_acked());
    assert_eq!(transport.ack_calls(), 1);
    assert_eq!(transport.acked_offset(&TopicPartition::new("orders", 0)), Some(1));
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_commit_acked_offsets() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let tp = TopicPartition::new("orders", 0);
    app.sources().ack_offset(&tp, 0).unwrap();
    app.sources().ack_offset(&tp, 1).unwrap();

    let scope = CommitScope::Topics(BTreeSet::from(["orders".to_string()]));
    assert!(app.sources().commit(&scope).await.unwrap());
    assert_eq!(transport.committed_offset(&tp), Some(2));
    assert!(!app.sources().commit(&scope).await.unwrap());
    app.stop().await.unwrap();
}

/// Stream whose handler reports each offset, then waits on `gate`.
fn gated_stream(
    app: &App,
    options: TopicOptions,
    gate: Arc<Notify>,
) -> (StreamHandle, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = app
        .topic(options)
        .unwrap()
        .stream(
            handler(move |event| {
                let tx = tx.clone();
                let gate = gate.clone();
                async move {
                    if let Some(m) = &event.message {
                        let _ = tx.send(m.offset);
                    }
                    gate.notified().await;
                    Ok(())
                }
            }),
            StreamOptions::default(),
        )
        .unwrap();
    (stream, rx)
}

#[tokio::test(start_paused = true)]
async fn test_commit_never_skips_a_record_still_in_flight() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let gate = Arc::new(Notify::new());
    let (stream, mut handled) = gated_stream(
        &app,
        TopicOptions::topics(["orders"]).key_type(TypeBinding::Json),
        gate.clone(),
    );
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let (tp, _) = transport.produce("orders", Some(b"\"a\"".to_vec()), json(b"{}"));
    transport.produce("orders", Some(b"not json".to_vec()), json(b"{}"));
    assert_eq!(handled.recv().await, Some(0));
    eventually("offset 1 dropped", || stream.consumer().decode_errors() == 1).await;

    // offset 1 is acked, offset 0 is still in the handler
    assert_eq!(transport.ack_calls(), 1);
    assert_eq!(transport.acked_offset(&tp), None);
    let scope = CommitScope::Partition(tp.clone());
    assert!(!app.sources().commit(&scope).await.unwrap());
    assert_eq!(transport.committed_offset(&tp), None);

    gate.notify_one();
    eventually("both offsets acked", || transport.acked_offset(&tp) == Some(2)).await;
    assert!(app.sources().commit(&scope).await.unwrap());
    assert_eq!(transport.committed_offset(&tp), Some(2));
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopping_a_stream_releases_queued_records() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let gate = Arc::new(Notify::new());
    let (stream, mut handled) =
        gated_stream(&app, TopicOptions::topics(["orders"]), gate.clone());
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let consumer = stream.consumer().clone();
    let mut tp = None;
    for v in [b"0", b"1", b"2"] {
        tp = Some(transport.produce("orders", None, Some(v.to_vec())).0);
    }
    let tp = tp.unwrap();
    assert_eq!(handled.recv().await, Some(0));
    eventually("two records queued", || consumer.queue_len() == 2).await;

    let stopping = tokio::spawn(stream.stop());
    tokio::time::sleep(Duration::from_millis(10)).await;
    gate.notify_one();
    stopping.await.unwrap();

    assert!(handled.try_recv().is_err());
    assert_eq!(consumer.queue_len(), 0);
    assert!(consumer.is_closed());
    assert_eq!(transport.acked_offset(&tp), Some(3));
    assert_eq!(transport.ack_calls(), 3);
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_grace_period_never_subscribes() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let (_stream, _rx) = forwarding_stream(&app, TopicOptions::topics(["orders"]));

    app.start().unwrap();
    tokio::time::sleep(GRACE / 4).await;
    app.stop().await.unwrap();
    tokio::time::sleep(GRACE * 2).await;

    assert_eq!(transport.consumers_created(), 0);
    assert_eq!(transport.running_consumers(), 0);
    assert_eq!(app.sources().state(), ManagerState::Stopped);
    assert!(app.sources().wait_running().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_late_registration_needs_update() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let (_a, _rx_a) = forwarding_stream(&app, TopicOptions::topics(["a"]));
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    let (_b, mut rx_b) = forwarding_stream(&app, TopicOptions::topics(["b"]));
    transport.produce("b", None, Some(b"late".to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_b.try_recv().is_err());
    assert_eq!(app.sources().pattern(), "a");

    app.sources().update().await.unwrap();
    assert_eq!(app.sources().pattern(), "a|b");
    let event = rx_b.recv().await.unwrap();
    assert_eq!(event.value, Payload::Bytes(b"late".to_vec()));
    app.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_stream_no_longer_routed() {
    let transport = MemoryTransport::new();
    let app = app_with(&transport);
    let (a, _rx_a) = forwarding_stream(&app, TopicOptions::topics(["a"]));
    let (_b, mut rx_b) = forwarding_stream(&app, TopicOptions::topics(["b"]));
    app.start().unwrap();
    app.sources().wait_running().await.unwrap();

    a.stop().await;
    app.sources().update().await.unwrap();
    assert_eq!(app.sources().pattern(), "b");
    assert_eq!(app.sources().label(), "TopicManager(1)");

    transport.produce("b", None, Some(b"x".to_vec()));
    assert!(rx_b.recv().await.is_some());
    app.stop().await.unwrap();
}

#[derive(Default)]
struct RecordingListener {
    assigned: Mutex<Vec<TopicPartition>>,
    revoked: Mutex<Vec<TopicPartition>>,
}

impl PartitionListener for RecordingListener {
    fn on_partitions_assigned(&self, assigned: &[TopicPartition]) {
        self.assigned.lock().unwrap().extend_from_slice(assigned);
    }

    fn on_partitions_revoked(&self, revoked: &[TopicPartition]) {
        self.revoked.lock().unwrap().extend_from_slice(revoked);
    }
}

#[tokio::test(start_paused = true)]
async fn test_partition_listener_sees_rebalances() {
    let transport = MemoryTransport::with_partitions(2);
    transport.create_topic("orders", 2);
    let listener = Arc::new(RecordingListener::default());
    let app = App::builder(Arc::new(JsonSerializer), Arc::new(transport.clone()))
        .startup_grace(GRACE)
        .partition_listener(listener.clone())
        .build();
    let (_stream, _rx) = forwarding_stream(&app, TopicOptions::topics(["orders"]));

    app.start().unwrap();
    app.sources().wait_running().await.unwrap();
    let expected = vec![
        TopicPartition::new("orders", 0),
        TopicPartition::new("orders", 1),
    ];
    assert_eq!(*listener.assigned.lock().unwrap(), expected);
    assert!(listener.revoked.lock().unwrap().is_empty());

    app.stop().await.unwrap();
    assert_eq!(*listener.revoked.lock().unwrap(), expected);
}

struct UnreachableTransport;

impl Transport for UnreachableTransport {
    fn create_consumer(
        &self,
        _callbacks: ConsumerCallbacks,
    ) -> Result<Arc<dyn TransportConsumer>, ServiceError> {
        Err(ServiceError::transport("broker unreachable"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_failure_is_reported() {
    let app = App::builder(Arc::new(JsonSerializer), Arc::new(UnreachableTransport))
        .startup_grace(GRACE)
        .build();
    app.start().unwrap();

    let err = app.sources().wait_running().await.unwrap_err();
    assert!(matches!(err, EngineError::Bootstrap(_)));
    assert!(err.to_string().contains("broker unreachable"));
    assert_eq!(app.sources().state(), ManagerState::Failed);
    assert!(matches!(
        app.sources().ack_offset(&TopicPartition::new("a", 0), 1),
        Err(EngineError::NotStarted)
    ));

    app.stop().await.unwrap();
    assert_eq!(app.sources().state(), ManagerState::Stopped);
}
