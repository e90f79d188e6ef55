use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A (topic, partition) pair: the unit of assignment and offset tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// What a commit covers: one partition, or every assigned partition of a set of topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitScope {
    Partition(TopicPartition),
    Topics(BTreeSet<String>),
}

/// Raw record pulled from the transport. Key and value are undecoded bytes.
///
/// `refcount` tracks how many consumers still have to process the record;
/// the offset may only be acknowledged once it drops back to zero.
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp_ms: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    acked: AtomicBool,
    refcount: AtomicUsize,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("acked", &self.is_acked())
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        offset: u64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp_ms: now_ms(),
            key,
            value,
            acked: AtomicBool::new(false),
            refcount: AtomicUsize::new(0),
        }
    }

    pub fn tp(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Add one reference per recipient in a single atomic step.
    pub fn incref_bulk(&self, recipients: usize) {
        self.refcount.fetch_add(recipients, Ordering::AcqRel);
    }

    /// Drop one reference. Returns `true` for the holder that released the last one.
    ///
    /// Releasing a record that holds no references is a no-op returning `false`.
    pub fn decref(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev == 1)
            .unwrap_or(false)
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Set the acked flag. Returns the previous value, so exactly one caller sees `false`.
    pub fn mark_acked(&self) -> bool {
        self.acked.swap(true, Ordering::AcqRel)
    }

    /// Clear the acked flag (used when the transport rejected the ack).
    pub fn clear_acked(&self) {
        self.acked.store(false, Ordering::Release);
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("orders", 0, 7, Some(b"k".to_vec()), Some(b"v".to_vec()))
    }

    #[test]
    fn test_refcount_last_release_wins() {
        let m = msg();
        m.incref_bulk(3);
        assert_eq!(m.refcount(), 3);
        assert!(!m.decref());
        assert!(!m.decref());
        assert!(m.decref());
        assert_eq!(m.refcount(), 0);
    }

    #[test]
    fn test_decref_at_zero_is_noop() {
        let m = msg();
        assert!(!m.decref());
        assert_eq!(m.refcount(), 0);
    }

    #[test]
    fn test_mark_acked_once() {
        let m = msg();
        assert!(!m.mark_acked());
        assert!(m.mark_acked());
        m.clear_acked();
        assert!(!m.is_acked());
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(msg().tp().to_string(), "orders[0]");
    }
}
