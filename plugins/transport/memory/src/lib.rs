use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::beacon::Beacon;
use relay_api::error::ServiceError;
use relay_api::record::{CommitScope, Message, TopicPartition};
use relay_api::transport::{ConsumerCallbacks, Transport, TransportConsumer};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!(lock = what, "memory transport lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Log — topics, partitions, group members
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Stored {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct Log {
    /// topic → partitions → records (index = offset).
    topics: BTreeMap<String, Vec<Vec<Stored>>>,
    members: Vec<Weak<Member>>,
}

impl Log {
    fn partitions_matching(&self, pattern: &Regex) -> BTreeSet<TopicPartition> {
        self.topics
            .iter()
            .filter(|(name, _)| pattern.is_match(name))
            .flat_map(|(name, parts)| {
                (0..parts.len() as u32).map(move |p| TopicPartition::new(name.clone(), p))
            })
            .collect()
    }

    fn live_members(&mut self) -> Vec<Arc<Member>> {
        self.members.retain(|m| m.strong_count() > 0);
        self.members.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Acknowledgements for one partition.
///
/// `next` only advances across a gap-free run, so an offset acked ahead of
/// an earlier in-flight record waits in `ahead` until the gap closes.
struct PartitionAcks {
    next: u64,
    ahead: BTreeSet<u64>,
}

impl PartitionAcks {
    fn starting_at(next: u64) -> Self {
        Self {
            next,
            ahead: BTreeSet::new(),
        }
    }

    fn ack(&mut self, offset: u64) {
        if offset < self.next {
            return;
        }
        self.ahead.insert(offset);
        while self.ahead.remove(&self.next) {
            self.next += 1;
        }
    }
}

/// Group-level offsets. `committed` holds the next offset to read.
#[derive(Default)]
struct Offsets {
    acked: BTreeMap<TopicPartition, PartitionAcks>,
    committed: BTreeMap<TopicPartition, u64>,
    ack_calls: u64,
}

struct Shared {
    default_partitions: u32,
    log: Mutex<Log>,
    offsets: Mutex<Offsets>,
    consumers_created: AtomicU64,
}

/// Pick the partition for a key. Keyless records go to partition 0.
fn partition_for(key: Option<&[u8]>, partitions: usize) -> u32 {
    match key {
        None => 0,
        Some(k) => {
            let mut hasher = DefaultHasher::new();
            k.hash(&mut hasher);
            (hasher.finish() % partitions.max(1) as u64) as u32
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Member — one consumer in the single consumer group
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Membership {
    pattern: Option<Regex>,
    running: bool,
    /// Assigned partitions and the next offset to deliver for each.
    positions: BTreeMap<TopicPartition, u64>,
}

#[derive(Default)]
struct Rebalance {
    revoked: Vec<TopicPartition>,
    assigned: Vec<TopicPartition>,
}

struct Member {
    callbacks: ConsumerCallbacks,
    beacon: Beacon,
    tx: mpsc::UnboundedSender<Arc<Message>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Message>>>>,
    membership: Mutex<Membership>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Member {
    /// Recompute the assignment against the log. Caller holds the log lock.
    fn rebalance(&self, log: &Log, offsets: &Offsets) -> Rebalance {
        let mut m = lock(&self.membership, "membership");
        let target = match (&m.pattern, m.running) {
            (Some(pattern), true) => log.partitions_matching(pattern),
            _ => BTreeSet::new(),
        };
        let current: BTreeSet<TopicPartition> = m.positions.keys().cloned().collect();

        let revoked: Vec<_> = current.difference(&target).cloned().collect();
        let assigned: Vec<_> = target.difference(&current).cloned().collect();
        for tp in &revoked {
            m.positions.remove(tp);
        }
        for tp in &assigned {
            let position = offsets.committed.get(tp).copied().unwrap_or(0);
            m.positions.insert(tp.clone(), position);
        }
        Rebalance { revoked, assigned }
    }

    /// Push every record past the current positions into the delivery channel.
    fn pump(&self, log: &Log) {
        let mut m = lock(&self.membership, "membership");
        if !m.running {
            return;
        }
        for (tp, position) in m.positions.iter_mut() {
            let Some(records) = log
                .topics
                .get(&tp.topic)
                .and_then(|parts| parts.get(tp.partition as usize))
            else {
                continue;
            };
            while let Some(stored) = records.get(*position as usize) {
                let message = Message::new(
                    tp.topic.clone(),
                    tp.partition,
                    *position,
                    stored.key.clone(),
                    stored.value.clone(),
                );
                if self.tx.send(Arc::new(message)).is_err() {
                    return;
                }
                *position += 1;
            }
        }
    }

    fn notify(&self, rebalance: Rebalance) {
        if !rebalance.revoked.is_empty() {
            tracing::debug!(beacon = %self.beacon.path(), count = rebalance.revoked.len(), "partitions revoked");
            (self.callbacks.on_partitions_revoked)(&rebalance.revoked);
        }
        if !rebalance.assigned.is_empty() {
            tracing::debug!(beacon = %self.beacon.path(), count = rebalance.assigned.len(), "partitions assigned");
            (self.callbacks.on_partitions_assigned)(&rebalance.assigned);
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.membership, "membership").running
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.token.cancel();
        self.beacon.detach();
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryTransport
// ═══════════════════════════════════════════════════════════════

/// In-process partitioned log with a single consumer group.
///
/// Topics are created on first produce (or explicitly with `create_topic`);
/// keyed records are hashed onto partitions. Consumers are assigned every
/// partition of every topic their pattern matches, starting from the
/// group's committed offset.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("topics", &self.topics())
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Auto-created topics get `partitions` partitions.
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_partitions: partitions.max(1),
                log: Mutex::new(Log::default()),
                offsets: Mutex::new(Offsets::default()),
                consumers_created: AtomicU64::new(0),
            }),
        }
    }

    /// Create a topic. No-op if it already exists.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let pending = {
            let mut log = lock(&self.shared.log, "log");
            if log.topics.contains_key(name) {
                return;
            }
            log.topics
                .insert(name.to_string(), vec![Vec::new(); partitions.max(1) as usize]);
            self.rebalance_all(&mut log)
        };
        for (member, rebalance) in pending {
            member.notify(rebalance);
        }
    }

    /// Append a record and deliver it to running consumers assigned its partition.
    pub fn produce(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> (TopicPartition, u64) {
        let (tp, offset, pending) = {
            let mut log = lock(&self.shared.log, "log");
            let created = !log.topics.contains_key(topic);
            let partitions = log
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.shared.default_partitions as usize]);

            let partition = partition_for(key.as_deref(), partitions.len());
            let records = &mut partitions[partition as usize];
            let offset = records.len() as u64;
            records.push(Stored { key, value });

            let pending = if created {
                self.rebalance_all(&mut log)
            } else {
                Vec::new()
            };
            let members = log.live_members();
            for member in &members {
                member.pump(&log);
            }
            (TopicPartition::new(topic, partition), offset, pending)
        };
        for (member, rebalance) in pending {
            member.notify(rebalance);
        }
        tracing::trace!(tp = %tp, offset, "produced record");
        (tp, offset)
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.shared.log, "log").topics.keys().cloned().collect()
    }

    /// Next offset after the gap-free run of acknowledged records.
    /// `None` while offset zero is still unacknowledged.
    pub fn acked_offset(&self, tp: &TopicPartition) -> Option<u64> {
        lock(&self.shared.offsets, "offsets")
            .acked
            .get(tp)
            .map(|acks| acks.next)
            .filter(|next| *next > 0)
    }

    pub fn committed_offset(&self, tp: &TopicPartition) -> Option<u64> {
        lock(&self.shared.offsets, "offsets").committed.get(tp).copied()
    }

    /// How many times any consumer called `ack`.
    pub fn ack_calls(&self) -> u64 {
        lock(&self.shared.offsets, "offsets").ack_calls
    }

    pub fn consumers_created(&self) -> u64 {
        self.shared.consumers_created.load(Ordering::Relaxed)
    }

    pub fn running_consumers(&self) -> usize {
        let mut log = lock(&self.shared.log, "log");
        log.live_members().iter().filter(|m| m.is_running()).count()
    }

    fn rebalance_all(&self, log: &mut Log) -> Vec<(Arc<Member>, Rebalance)> {
        let members = log.live_members();
        let offsets = lock(&self.shared.offsets, "offsets");
        members
            .into_iter()
            .map(|member| {
                let rebalance = member.rebalance(log, &offsets);
                (member, rebalance)
            })
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn create_consumer(
        &self,
        callbacks: ConsumerCallbacks,
    ) -> Result<Arc<dyn TransportConsumer>, ServiceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let beacon = callbacks.beacon.new_child("MemoryConsumer");
        let member = Arc::new(Member {
            callbacks,
            beacon,
            tx,
            rx: Mutex::new(Some(rx)),
            membership: Mutex::new(Membership::default()),
            token: CancellationToken::new(),
            task: Mutex::new(None),
        });
        lock(&self.shared.log, "log")
            .members
            .push(Arc::downgrade(&member));
        self.shared.consumers_created.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new(MemoryConsumer {
            member,
            shared: self.shared.clone(),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryConsumer — TransportConsumer impl
// ═══════════════════════════════════════════════════════════════

/// Consumer handle. Can be started once; `stop` is final.
pub struct MemoryConsumer {
    member: Arc<Member>,
    shared: Arc<Shared>,
}

impl MemoryConsumer {
    fn reassign(&self) -> Rebalance {
        let log = lock(&self.shared.log, "log");
        let rebalance = {
            let offsets = lock(&self.shared.offsets, "offsets");
            self.member.rebalance(&log, &offsets)
        };
        self.member.pump(&log);
        rebalance
    }
}

impl TransportConsumer for MemoryConsumer {
    fn subscribe<'a>(
        &'a self,
        pattern: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            let compiled = if pattern.is_empty() {
                None
            } else {
                let anchored = format!("^(?:{pattern})$");
                Some(Regex::new(&anchored).map_err(|e| {
                    ServiceError::config(format!("invalid subscription pattern '{pattern}': {e}"))
                })?)
            };
            lock(&self.member.membership, "membership").pattern = compiled;

            let rebalance = self.reassign();
            tracing::debug!(beacon = %self.member.beacon.path(), %pattern, "subscribed");
            self.member.notify(rebalance);
            Ok(())
        })
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let mut rx = lock(&self.member.rx, "rx")
                .take()
                .ok_or_else(|| ServiceError::logic("memory consumer already started"))?;

            let on_message = self.member.callbacks.on_message.clone();
            let token = self.member.token.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        message = rx.recv() => match message {
                            Some(message) => on_message(message).await,
                            None => break,
                        },
                    }
                }
            });
            *lock(&self.member.task, "task") = Some(handle);

            lock(&self.member.membership, "membership").running = true;
            let rebalance = self.reassign();
            tracing::info!(beacon = %self.member.beacon.path(), "memory consumer started");
            self.member.notify(rebalance);
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let was_running = {
                let mut m = lock(&self.member.membership, "membership");
                std::mem::replace(&mut m.running, false)
            };
            if was_running {
                let rebalance = self.reassign();
                self.member.notify(rebalance);
            }

            self.member.token.cancel();
            let handle = lock(&self.member.task, "task").take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            tracing::info!(beacon = %self.member.beacon.path(), "memory consumer stopped");
            Ok(())
        })
    }

    fn ack(&self, tp: &TopicPartition, offset: u64) -> Result<(), ServiceError> {
        let mut guard = lock(&self.shared.offsets, "offsets");
        let offsets = &mut *guard;
        offsets.ack_calls += 1;
        let start = offsets.committed.get(tp).copied().unwrap_or(0);
        offsets
            .acked
            .entry(tp.clone())
            .or_insert_with(|| PartitionAcks::starting_at(start))
            .ack(offset);
        Ok(())
    }

    fn commit<'a>(
        &'a self,
        scope: &'a CommitScope,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut offsets = lock(&self.shared.offsets, "offsets");
            let pending: Vec<(TopicPartition, u64)> = offsets
                .acked
                .iter()
                .filter(|(tp, _)| match scope {
                    CommitScope::Partition(p) => *tp == p,
                    CommitScope::Topics(topics) => topics.contains(&tp.topic),
                })
                .filter(|(tp, acks)| acks.next > offsets.committed.get(*tp).copied().unwrap_or(0))
                .map(|(tp, acks)| (tp.clone(), acks.next))
                .collect();

            let changed = !pending.is_empty();
            for (tp, offset) in pending {
                tracing::debug!(%tp, offset, "committed");
                offsets.committed.insert(tp, offset);
            }
            Ok(changed)
        })
    }
}
