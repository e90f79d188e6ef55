use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::beacon::Beacon;
use crate::error::ServiceError;
use crate::record::{CommitScope, Message, TopicPartition};

/// Invoked by the transport exactly once per delivered record.
pub type MessageCallback =
    Arc<dyn Fn(Arc<Message>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Invoked by the transport on every group rebalance.
pub type PartitionCallback = Arc<dyn Fn(&[TopicPartition]) + Send + Sync>;

/// Everything a transport needs to drive a consumer on behalf of the engine.
pub struct ConsumerCallbacks {
    pub on_message: MessageCallback,
    pub on_partitions_revoked: PartitionCallback,
    pub on_partitions_assigned: PartitionCallback,
    /// Parent node for the transport consumer in the supervision tree.
    pub beacon: Beacon,
}

/// A consumer-group member bound to one subscription pattern.
///
/// Owned exclusively by the topic manager.
pub trait TransportConsumer: Send + Sync {
    /// Replace the subscription with every topic matching `pattern`.
    fn subscribe<'a>(
        &'a self,
        pattern: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>>;

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    /// Mark `offset` of `tp` as processed.
    fn ack(&self, tp: &TopicPartition, offset: u64) -> Result<(), ServiceError>;

    /// Commit acknowledged offsets. Returns whether anything was committed.
    fn commit<'a>(
        &'a self,
        scope: &'a CommitScope,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ServiceError>> + Send + 'a>>;
}

/// Builds transport consumers.
pub trait Transport: Send + Sync {
    fn create_consumer(
        &self,
        callbacks: ConsumerCallbacks,
    ) -> Result<Arc<dyn TransportConsumer>, ServiceError>;
}
