use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::poison_err;
use crate::error::Result;
use crate::queue::{
    partition_hash, ClaimId, Claimed, ConsumerConfig, DequeueStrategy, QueueClientFactory,
    QueueConsumer, QueueEntry, QueueProducer, StreamConsumer, StreamEvent,
};
use crate::shared::{QueueName, StreamId};
use crate::transaction::{Transaction, TransactionAware};

struct LogEntry<T> {
    seq: u64,
    hash_keys: BTreeMap<String, u32>,
    item: T,
}

/// Acknowledged and claimed entries of one consumer group.
#[derive(Debug, Default)]
struct GroupState {
    acked: HashSet<u64>,
    /// Entry sequence to the instance holding it.
    claimed: HashMap<u64, u32>,
}

/// An append-only log with per consumer group progress.
struct Log<T> {
    entries: Vec<LogEntry<T>>,
    groups: HashMap<u64, GroupState>,
}

impl<T> Default for Log<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            groups: HashMap::new(),
        }
    }
}

fn owns(config: &ConsumerConfig, seq: u64, hash_keys: &BTreeMap<String, u32>) -> bool {
    let size = u64::from(config.group_size);
    let instance = u64::from(config.instance_id);
    match config.dequeue_strategy {
        DequeueStrategy::Fifo => true,
        DequeueStrategy::RoundRobin => seq % size == instance,
        DequeueStrategy::Hash => {
            let hash = config
                .hash_key
                .as_ref()
                .and_then(|key| hash_keys.get(key))
                .copied()
                .unwrap_or_default();
            u64::from(hash) % size == instance
        }
    }
}

impl<T: Clone> Log<T> {
    fn append(&mut self, hash_keys: BTreeMap<String, u32>, item: T) {
        let seq = self.entries.len() as u64;
        self.entries.push(LogEntry {
            seq,
            hash_keys,
            item,
        });
    }

    /// Claims up to `max` entries this member may consume, in log order.
    fn claim(&mut self, config: &ConsumerConfig, max: usize) -> Vec<(u64, T)> {
        let Log { entries, groups } = self;
        let group = groups.entry(config.group_id).or_default();
        let mut claimed = Vec::new();
        for entry in entries.iter() {
            if claimed.len() >= max {
                break;
            }
            if group.acked.contains(&entry.seq)
                || group.claimed.contains_key(&entry.seq)
                || !owns(config, entry.seq, &entry.hash_keys)
            {
                continue;
            }
            group.claimed.insert(entry.seq, config.instance_id);
            claimed.push((entry.seq, entry.item.clone()));
        }
        claimed
    }

    fn ack(&mut self, group_id: u64, seqs: &[u64]) {
        let group = self.groups.entry(group_id).or_default();
        for seq in seqs {
            group.claimed.remove(seq);
            group.acked.insert(*seq);
        }
    }

    fn release(&mut self, group_id: u64, seqs: &[u64]) {
        let group = self.groups.entry(group_id).or_default();
        for seq in seqs {
            group.claimed.remove(seq);
        }
    }

    fn acked(&self, group_id: u64) -> usize {
        self.groups.get(&group_id).map_or(0, |g| g.acked.len())
    }
}

#[derive(Default)]
struct Storage {
    queues: HashMap<QueueName, Log<Vec<u8>>>,
    streams: HashMap<QueueName, Log<StreamEvent>>,
}

fn queue_log<'a>(storage: &'a mut Storage, key: &QueueName) -> &'a mut Log<Vec<u8>> {
    storage.queues.entry(key.clone()).or_default()
}

fn stream_log<'a>(storage: &'a mut Storage, key: &QueueName) -> &'a mut Log<StreamEvent> {
    storage.streams.entry(key.clone()).or_default()
}

type LogSelector<T> = for<'a, 'b> fn(&'a mut Storage, &'b QueueName) -> &'a mut Log<T>;

/// In-memory queue and stream storage.
///
/// FIFO members take any entry not claimed by another member of their group, ROUND_ROBIN
/// members take entries whose sequence modulo the group size is their instance id, and HASH
/// members those whose partition hash for the group's key is. Stream events are partitioned on
/// the hash of their header values.
#[derive(Clone, Default)]
pub struct InMemoryQueueService {
    storage: Arc<Mutex<Storage>>,
}

impl fmt::Debug for InMemoryQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryQueueService").finish()
    }
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry outside of any transaction.
    pub fn enqueue(&self, queue: &QueueName, entry: QueueEntry) {
        if let Ok(mut storage) = self.storage.lock() {
            queue_log(&mut storage, queue).append(entry.hash_keys, entry.data);
        }
    }

    /// Appends an event to a stream.
    pub fn append_stream(&self, stream: &StreamId, event: StreamEvent) {
        let hash_keys = event
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), partition_hash(v)))
            .collect();
        if let Ok(mut storage) = self.storage.lock() {
            stream_log(&mut storage, &QueueName::from_stream(stream)).append(hash_keys, event);
        }
    }

    /// Number of entries ever written to the queue.
    pub fn len(&self, queue: &QueueName) -> usize {
        self.storage
            .lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|log| log.entries.len()))
            .unwrap_or_default()
    }

    /// Number of entries of the queue acknowledged by the consumer group.
    pub fn acked(&self, queue: &QueueName, group_id: u64) -> usize {
        self.storage
            .lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|log| log.acked(group_id)))
            .unwrap_or_default()
    }

    /// Number of events of the stream acknowledged by the consumer group.
    pub fn stream_acked(&self, stream: &StreamId, group_id: u64) -> usize {
        self.storage
            .lock()
            .ok()
            .and_then(|s| {
                s.streams
                    .get(&QueueName::from_stream(stream))
                    .map(|log| log.acked(group_id))
            })
            .unwrap_or_default()
    }

    fn consumer<T, K>(
        &self,
        key: QueueName,
        id: K,
        config: &ConsumerConfig,
        select: LogSelector<T>,
    ) -> LogConsumer<T, K> {
        LogConsumer {
            storage: Arc::clone(&self.storage),
            key,
            id,
            config: config.clone(),
            state: Mutex::new(ConsumerState::default()),
            select,
        }
    }
}

#[async_trait]
impl QueueClientFactory for InMemoryQueueService {
    async fn create_consumer(
        &self,
        queue: &QueueName,
        config: &ConsumerConfig,
        num_groups: usize,
    ) -> Result<Arc<dyn QueueConsumer>> {
        debug!(queue = %queue, group = config.group_id, num_groups, "Creating in-memory queue consumer");
        Ok(Arc::new(self.consumer(
            queue.clone(),
            queue.clone(),
            config,
            queue_log,
        )))
    }

    async fn create_stream_consumer(
        &self,
        stream: &StreamId,
        config: &ConsumerConfig,
    ) -> Result<Arc<dyn StreamConsumer>> {
        Ok(Arc::new(self.consumer(
            QueueName::from_stream(stream),
            stream.clone(),
            config,
            stream_log,
        )))
    }

    async fn create_producer(&self, queue: &QueueName) -> Result<Arc<dyn QueueProducer>> {
        Ok(Arc::new(InMemoryProducer {
            storage: Arc::clone(&self.storage),
            queue: queue.clone(),
            buffer: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug, Default)]
struct ConsumerState {
    next_claim: u64,
    /// Claimed by this consumer in the current transaction.
    in_flight: Vec<(ClaimId, u64)>,
    /// Claimed, released from the transaction by a rollback.
    rolled_back: Vec<(ClaimId, u64)>,
}

impl ConsumerState {
    fn in_flight_seqs(&self) -> impl Iterator<Item = u64> + '_ {
        self.in_flight.iter().map(|(_, seq)| *seq)
    }
}

struct LogConsumer<T, K> {
    storage: Arc<Mutex<Storage>>,
    key: QueueName,
    id: K,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    select: LogSelector<T>,
}

impl<T: Clone + Send + 'static, K: Send + Sync> LogConsumer<T, K> {
    fn take(&self, max: usize) -> Result<Claimed<T>> {
        let mut storage = self.storage.lock().map_err(poison_err)?;
        let claimed = (self.select)(&mut storage, &self.key).claim(&self.config, max);
        let mut state = self.state.lock().map_err(poison_err)?;
        let claim = ClaimId(state.next_claim);
        state.next_claim += 1;
        let items = claimed
            .into_iter()
            .map(|(seq, item)| {
                state.in_flight.push((claim, seq));
                item
            })
            .collect();
        Ok(Claimed::new(claim, items))
    }

    fn reclaim_entries(&self, claim: ClaimId) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut state.rolled_back)
            .into_iter()
            .partition(|(id, _)| *id == claim);
        state.rolled_back = others;
        state.in_flight.extend(mine);
        Ok(())
    }

    fn release_all(&self) -> Result<()> {
        let seqs: Vec<u64> = {
            let mut state = self.state.lock().map_err(poison_err)?;
            let mut entries = std::mem::take(&mut state.in_flight);
            entries.append(&mut state.rolled_back);
            entries.into_iter().map(|(_, seq)| seq).collect()
        };
        let mut storage = self.storage.lock().map_err(poison_err)?;
        (self.select)(&mut storage, &self.key).release(self.config.group_id, &seqs);
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Send + 'static, K: Send + Sync> TransactionAware for LogConsumer<T, K> {
    fn name(&self) -> String {
        format!("{}#{}", self.key, self.config.instance_id)
    }

    async fn start_tx(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        state
            .in_flight_seqs()
            .map(|seq| format!("{}#{}#{seq}", self.key, self.config.group_id).into_bytes())
            .collect()
    }

    async fn commit_tx(&self) -> Result<()> {
        Ok(())
    }

    async fn post_tx_commit(&self) -> Result<()> {
        let seqs: Vec<u64> = std::mem::take(&mut self.state.lock().map_err(poison_err)?.in_flight)
            .into_iter()
            .map(|(_, seq)| seq)
            .collect();
        let mut storage = self.storage.lock().map_err(poison_err)?;
        (self.select)(&mut storage, &self.key).ack(self.config.group_id, &seqs);
        Ok(())
    }

    async fn rollback_tx(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let in_flight = std::mem::take(&mut state.in_flight);
        state.rolled_back.extend(in_flight);
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for LogConsumer<Vec<u8>, QueueName> {
    fn queue_name(&self) -> &QueueName {
        &self.id
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn dequeue(&self, max: usize, _timeout: Duration) -> Result<Claimed<Vec<u8>>> {
        self.take(max)
    }

    async fn reclaim(&self, claim: ClaimId) -> Result<()> {
        self.reclaim_entries(claim)
    }

    async fn close(&self) -> Result<()> {
        self.release_all()
    }
}

#[async_trait]
impl StreamConsumer for LogConsumer<StreamEvent, StreamId> {
    fn stream_id(&self) -> &StreamId {
        &self.id
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn poll(&self, max: usize, _timeout: Duration) -> Result<Claimed<StreamEvent>> {
        self.take(max)
    }

    async fn reclaim(&self, claim: ClaimId) -> Result<()> {
        self.reclaim_entries(claim)
    }

    async fn close(&self) -> Result<()> {
        self.release_all()
    }
}

/// Buffers entries until the transaction commits.
struct InMemoryProducer {
    storage: Arc<Mutex<Storage>>,
    queue: QueueName,
    buffer: Mutex<Vec<QueueEntry>>,
}

#[async_trait]
impl TransactionAware for InMemoryProducer {
    fn name(&self) -> String {
        self.queue.to_string()
    }

    async fn start_tx(&self, _tx: &Transaction) -> Result<()> {
        self.buffer.lock().map_err(poison_err)?.clear();
        Ok(())
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    async fn commit_tx(&self) -> Result<()> {
        Ok(())
    }

    async fn post_tx_commit(&self) -> Result<()> {
        let entries = std::mem::take(&mut *self.buffer.lock().map_err(poison_err)?);
        let mut storage = self.storage.lock().map_err(poison_err)?;
        let log = queue_log(&mut storage, &self.queue);
        for entry in entries {
            log.append(entry.hash_keys, entry.data);
        }
        Ok(())
    }

    async fn rollback_tx(&self) -> Result<()> {
        self.buffer.lock().map_err(poison_err)?.clear();
        Ok(())
    }
}

#[async_trait]
impl QueueProducer for InMemoryProducer {
    fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    async fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        self.buffer.lock().map_err(poison_err)?.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::shared::FlowletId;

    const NO_WAIT: Duration = Duration::ZERO;

    fn queue() -> QueueName {
        FlowletId::new("ns", "app", "flow", "source").queue("out")
    }

    fn config(instance_id: u32, size: u32, strategy: DequeueStrategy) -> ConsumerConfig {
        let hash_key = (strategy == DequeueStrategy::Hash).then(|| "user".to_string());
        ConsumerConfig::new(9, instance_id, size, strategy, hash_key).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_preserves_order() {
        let service = InMemoryQueueService::new();
        for i in 0..5u8 {
            service.enqueue(&queue(), QueueEntry::new(vec![i]));
        }
        let consumer = service
            .create_consumer(&queue(), &config(0, 1, DequeueStrategy::Fifo), 1)
            .await
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let batch = consumer.dequeue(2, NO_WAIT).await.unwrap();
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.items.into_iter().flatten());
            consumer.post_tx_commit().await.unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(service.acked(&queue(), 9), 5);
    }

    #[tokio::test]
    async fn test_hash_group_partitions_without_loss() {
        let service = InMemoryQueueService::new();
        let mut expected = BTreeSet::new();
        for i in 0..40u8 {
            let user = format!("user-{}", i % 7);
            service.enqueue(
                &queue(),
                QueueEntry::new(vec![i]).with_hash_key("user", partition_hash(&user)),
            );
            expected.insert(i);
        }

        let mut union = Vec::new();
        for instance in 0..3 {
            let consumer = service
                .create_consumer(&queue(), &config(instance, 3, DequeueStrategy::Hash), 1)
                .await
                .unwrap();
            let batch = consumer.dequeue(100, NO_WAIT).await.unwrap();
            consumer.post_tx_commit().await.unwrap();
            union.extend(batch.items.into_iter().flatten());
        }

        assert_eq!(union.len(), expected.len());
        assert_eq!(union.into_iter().collect::<BTreeSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_round_robin_deals_by_sequence() {
        let service = InMemoryQueueService::new();
        for i in 0..6u8 {
            service.enqueue(&queue(), QueueEntry::new(vec![i]));
        }
        let second = service
            .create_consumer(&queue(), &config(1, 2, DequeueStrategy::RoundRobin), 1)
            .await
            .unwrap();
        let batch: Vec<u8> = second
            .dequeue(10, NO_WAIT)
            .await
            .unwrap()
            .items
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(batch, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_rollback_keeps_claim_until_reclaimed() {
        let service = InMemoryQueueService::new();
        service.enqueue(&queue(), QueueEntry::new(vec![1]));
        let first = service
            .create_consumer(&queue(), &config(0, 2, DequeueStrategy::Fifo), 1)
            .await
            .unwrap();
        let other = service
            .create_consumer(&queue(), &config(1, 2, DequeueStrategy::Fifo), 1)
            .await
            .unwrap();

        let claimed = first.dequeue(1, NO_WAIT).await.unwrap();
        assert_eq!(claimed.len(), 1);
        first.rollback_tx().await.unwrap();
        assert!(first.tx_changes().is_empty());

        // still claimed: neither member sees it again through dequeue
        assert!(other.dequeue(1, NO_WAIT).await.unwrap().is_empty());
        assert!(first.dequeue(1, NO_WAIT).await.unwrap().is_empty());
        assert_eq!(service.acked(&queue(), 9), 0);

        first.reclaim(claimed.claim).await.unwrap();
        assert_eq!(first.tx_changes().len(), 1);
        first.post_tx_commit().await.unwrap();
        assert_eq!(service.acked(&queue(), 9), 1);
    }

    #[tokio::test]
    async fn test_reclaim_takes_only_its_own_claim() {
        let service = InMemoryQueueService::new();
        for i in 0..3u8 {
            service.enqueue(&queue(), QueueEntry::new(vec![i]));
        }
        let consumer = service
            .create_consumer(&queue(), &config(0, 1, DequeueStrategy::Fifo), 1)
            .await
            .unwrap();

        let first = consumer.dequeue(1, NO_WAIT).await.unwrap();
        consumer.rollback_tx().await.unwrap();
        let second = consumer.dequeue(2, NO_WAIT).await.unwrap();
        consumer.rollback_tx().await.unwrap();
        assert_ne!(first.claim, second.claim);
        assert_eq!(second.items, vec![vec![1], vec![2]]);

        consumer.reclaim(first.claim).await.unwrap();
        assert_eq!(consumer.tx_changes().len(), 1);
        consumer.post_tx_commit().await.unwrap();
        assert_eq!(service.acked(&queue(), 9), 1);

        // the second claim is still held back, not acknowledged and not redelivered
        assert!(consumer.dequeue(5, NO_WAIT).await.unwrap().is_empty());
        consumer.reclaim(second.claim).await.unwrap();
        consumer.post_tx_commit().await.unwrap();
        assert_eq!(service.acked(&queue(), 9), 3);
    }

    #[tokio::test]
    async fn test_close_releases_claims() {
        let service = InMemoryQueueService::new();
        service.enqueue(&queue(), QueueEntry::new(vec![1]));
        let first = service
            .create_consumer(&queue(), &config(0, 1, DequeueStrategy::Fifo), 1)
            .await
            .unwrap();
        first.dequeue(1, NO_WAIT).await.unwrap();
        first.rollback_tx().await.unwrap();
        first.close().await.unwrap();

        let fresh = service
            .create_consumer(&queue(), &config(0, 1, DequeueStrategy::Fifo), 1)
            .await
            .unwrap();
        assert_eq!(fresh.dequeue(1, NO_WAIT).await.unwrap().items, vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_producer_visible_on_commit() {
        let service = InMemoryQueueService::new();
        let producer = service.create_producer(&queue()).await.unwrap();
        let tx = Transaction {
            id: 1,
            timeout: Duration::from_secs(1),
        };

        producer.start_tx(&tx).await.unwrap();
        producer.enqueue(QueueEntry::new(vec![1])).await.unwrap();
        producer.rollback_tx().await.unwrap();
        assert_eq!(service.len(&queue()), 0);

        producer.start_tx(&tx).await.unwrap();
        producer.enqueue(QueueEntry::new(vec![2])).await.unwrap();
        producer.post_tx_commit().await.unwrap();
        assert_eq!(service.len(&queue()), 1);
    }
}
