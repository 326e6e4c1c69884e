//! Queue and stream storage interfaces, and the suppliers that own consumer and producer handles.
//!
//! Storage is external: the runtime only sees [`QueueClientFactory`] and the handles it creates.
//! Handles are never mutated. A [`ConsumerSupplier`] closes its handle and asks the factory for a
//! fresh one whenever the instance suspends, resumes or changes its group size, while staying
//! registered in the instance's transaction context as a single participant.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::schema::{Field, Schema, Typed};
use crate::shared::{ComponentError, Consumer, QueueName, StreamId};
use crate::transaction::{Transaction, TransactionAware};

/// How a consumer group splits a queue among its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DequeueStrategy {
    /// Any member takes the next unclaimed entry; a single member sees full order.
    #[default]
    Fifo,
    /// Entries are dealt out by sequence number.
    RoundRobin,
    /// Entries go to the member selected by their partition hash for the group's key.
    Hash,
}

/// Membership of one instance in a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerConfig {
    pub group_id: u64,
    pub instance_id: u32,
    pub group_size: u32,
    pub dequeue_strategy: DequeueStrategy,
    pub hash_key: Option<String>,
}

impl ConsumerConfig {
    pub fn new(
        group_id: u64,
        instance_id: u32,
        group_size: u32,
        dequeue_strategy: DequeueStrategy,
        hash_key: Option<String>,
    ) -> Result<Self> {
        Self::check(instance_id, group_size)?;
        if dequeue_strategy == DequeueStrategy::Hash && hash_key.is_none() {
            return Err(Consumer::config_error("HASH dequeue strategy requires a hash key"));
        }
        Ok(Self {
            group_id,
            instance_id,
            group_size,
            dequeue_strategy,
            hash_key,
        })
    }

    /// Same membership with a different group size.
    pub fn with_group_size(&self, group_size: u32) -> Result<Self> {
        Self::check(self.instance_id, group_size)?;
        Ok(Self {
            group_size,
            ..self.clone()
        })
    }

    fn check(instance_id: u32, group_size: u32) -> Result<()> {
        if group_size == 0 {
            return Err(Consumer::config_error("consumer group size must be positive"));
        }
        if instance_id >= group_size {
            return Err(Consumer::config_error(format!(
                "instance id {instance_id} is out of range for group size {group_size}"
            )));
        }
        Ok(())
    }
}

/// Partition hash of a value, as used by HASH consumer groups.
pub fn partition_hash(value: &str) -> u32 {
    let digest = Sha256::digest(value.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// An entry written to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueEntry {
    /// Partition key to hash, read by HASH consumers keyed on that partition key.
    pub hash_keys: BTreeMap<String, u32>,
    pub data: Vec<u8>,
}

impl QueueEntry {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            hash_keys: BTreeMap::new(),
            data,
        }
    }

    pub fn with_hash_key(mut self, key: impl Into<String>, hash: u32) -> Self {
        self.hash_keys.insert(key.into(), hash);
        self
    }
}

/// An event ingested into a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl Typed for StreamEvent {
    fn schema() -> Schema {
        Schema::record(
            "StreamEvent",
            vec![
                Field::new("headers", Schema::map(Schema::String)),
                Field::new("body", Schema::Bytes),
                Field::new("timestamp", Schema::Long),
            ],
        )
    }
}

/// Identifies the entries handed out by one dequeue or poll of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId(pub u64);

/// The entries of one dequeue, under the claim that takes them back after a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed<T> {
    pub claim: ClaimId,
    pub items: Vec<T>,
}

impl<T> Claimed<T> {
    pub fn new(claim: ClaimId, items: Vec<T>) -> Self {
        Self { claim, items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Transactional consumer of one queue for one consumer group member.
///
/// Entries returned by [`dequeue`](QueueConsumer::dequeue) are acknowledged when the enclosing
/// transaction commits. After a rollback they stay claimed by this consumer until their claim is
/// reclaimed, or released to the group when the consumer closes.
#[async_trait]
pub trait QueueConsumer: TransactionAware {
    fn queue_name(&self) -> &QueueName;

    fn config(&self) -> &ConsumerConfig;

    /// Up to `max` entries; an empty result means nothing is ready.
    async fn dequeue(&self, max: usize, timeout: Duration) -> Result<Claimed<Vec<u8>>>;

    /// Takes the rolled back entries of `claim` into the current transaction, so the next commit
    /// acknowledges them. Entries of other claims stay where they are.
    async fn reclaim(&self, claim: ClaimId) -> Result<()>;

    /// Releases entries claimed but not acknowledged.
    async fn close(&self) -> Result<()>;
}

/// Transactional consumer of one stream for one consumer group member.
#[async_trait]
pub trait StreamConsumer: TransactionAware {
    fn stream_id(&self) -> &StreamId;

    fn config(&self) -> &ConsumerConfig;

    async fn poll(&self, max: usize, timeout: Duration) -> Result<Claimed<StreamEvent>>;

    /// See [`QueueConsumer::reclaim`].
    async fn reclaim(&self, claim: ClaimId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Transactional producer of one queue. Enqueued entries become visible on commit.
#[async_trait]
pub trait QueueProducer: TransactionAware {
    fn queue_name(&self) -> &QueueName;

    async fn enqueue(&self, entry: QueueEntry) -> Result<()>;
}

/// The queue and stream storage engine.
#[async_trait]
pub trait QueueClientFactory: Send + Sync {
    /// `num_groups` is the number of consumer groups reading the queue.
    async fn create_consumer(
        &self,
        queue: &QueueName,
        config: &ConsumerConfig,
        num_groups: usize,
    ) -> Result<Arc<dyn QueueConsumer>>;

    async fn create_stream_consumer(
        &self,
        stream: &StreamId,
        config: &ConsumerConfig,
    ) -> Result<Arc<dyn StreamConsumer>>;

    async fn create_producer(&self, queue: &QueueName) -> Result<Arc<dyn QueueProducer>>;
}

/// The live handle of a [`ConsumerSupplier`].
#[derive(Clone)]
pub enum ConsumerHandle {
    Queue(Arc<dyn QueueConsumer>),
    Stream(Arc<dyn StreamConsumer>),
}

impl ConsumerHandle {
    pub async fn reclaim(&self, claim: ClaimId) -> Result<()> {
        match self {
            ConsumerHandle::Queue(c) => c.reclaim(claim).await,
            ConsumerHandle::Stream(c) => c.reclaim(claim).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            ConsumerHandle::Queue(c) => c.close().await,
            ConsumerHandle::Stream(c) => c.close().await,
        }
    }
}

#[async_trait]
impl TransactionAware for ConsumerHandle {
    fn name(&self) -> String {
        match self {
            ConsumerHandle::Queue(c) => c.name(),
            ConsumerHandle::Stream(c) => c.name(),
        }
    }

    async fn start_tx(&self, tx: &Transaction) -> Result<()> {
        match self {
            ConsumerHandle::Queue(c) => c.start_tx(tx).await,
            ConsumerHandle::Stream(c) => c.start_tx(tx).await,
        }
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        match self {
            ConsumerHandle::Queue(c) => c.tx_changes(),
            ConsumerHandle::Stream(c) => c.tx_changes(),
        }
    }

    async fn commit_tx(&self) -> Result<()> {
        match self {
            ConsumerHandle::Queue(c) => c.commit_tx().await,
            ConsumerHandle::Stream(c) => c.commit_tx().await,
        }
    }

    async fn post_tx_commit(&self) -> Result<()> {
        match self {
            ConsumerHandle::Queue(c) => c.post_tx_commit().await,
            ConsumerHandle::Stream(c) => c.post_tx_commit().await,
        }
    }

    async fn rollback_tx(&self) -> Result<()> {
        match self {
            ConsumerHandle::Queue(c) => c.rollback_tx().await,
            ConsumerHandle::Stream(c) => c.rollback_tx().await,
        }
    }
}

#[derive(Debug, Clone)]
enum Source {
    Queue { num_groups: usize },
    Stream(StreamId),
}

/// Owns the consumer handle of one edge and recreates it on demand.
pub struct ConsumerSupplier {
    factory: Arc<dyn QueueClientFactory>,
    queue_name: QueueName,
    source: Source,
    config: RwLock<ConsumerConfig>,
    consumer: RwLock<Option<ConsumerHandle>>,
}

impl fmt::Debug for ConsumerSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSupplier")
            .field("queue_name", &self.queue_name)
            .field("source", &self.source)
            .field("config", &self.config())
            .finish()
    }
}

impl ConsumerSupplier {
    /// Supplier for a flowlet queue read by `num_groups` consumer groups.
    pub fn queue(
        factory: Arc<dyn QueueClientFactory>,
        queue_name: QueueName,
        config: ConsumerConfig,
        num_groups: usize,
    ) -> Self {
        Self {
            factory,
            queue_name,
            source: Source::Queue { num_groups },
            config: RwLock::new(config),
            consumer: RwLock::new(None),
        }
    }

    /// Supplier for a stream.
    pub fn stream(
        factory: Arc<dyn QueueClientFactory>,
        stream: StreamId,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            factory,
            queue_name: QueueName::from_stream(&stream),
            source: Source::Stream(stream),
            config: RwLock::new(config),
            consumer: RwLock::new(None),
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.source, Source::Stream(_))
    }

    pub fn config(&self) -> ConsumerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Creates a fresh handle, closing the previous one.
    pub async fn open(&self) -> Result<()> {
        self.close().await?;
        let config = self.config();
        let handle = match &self.source {
            Source::Queue { num_groups } => ConsumerHandle::Queue(
                self.factory
                    .create_consumer(&self.queue_name, &config, *num_groups)
                    .await?,
            ),
            Source::Stream(stream) => ConsumerHandle::Stream(
                self.factory.create_stream_consumer(stream, &config).await?,
            ),
        };
        debug!(queue = %self.queue_name, instance = config.instance_id, group_size = config.group_size, "Opened consumer");
        *self.consumer.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// The current handle. Fails when the supplier is closed.
    pub fn get(&self) -> Result<ConsumerHandle> {
        self.consumer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                Consumer::internal_error(format!("consumer for {} is not open", self.queue_name))
            })
    }

    pub fn is_open(&self) -> bool {
        self.consumer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn close(&self) -> Result<()> {
        let handle = self
            .consumer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.close().await?;
            debug!(queue = %self.queue_name, "Closed consumer");
        }
        Ok(())
    }

    /// Switches to a new group size. An open handle is replaced by a fresh one.
    pub async fn change_instances(&self, group_size: u32) -> Result<()> {
        let config = self.config().with_group_size(group_size)?;
        let was_open = self.is_open();
        self.close().await?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        info!(queue = %self.queue_name, group_size, "Consumer group size changed");
        if was_open {
            self.open().await?;
        }
        Ok(())
    }

    fn current(&self) -> Option<ConsumerHandle> {
        self.consumer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TransactionAware for ConsumerSupplier {
    fn name(&self) -> String {
        self.queue_name.to_string()
    }

    async fn start_tx(&self, tx: &Transaction) -> Result<()> {
        match self.current() {
            Some(handle) => handle.start_tx(tx).await,
            None => Ok(()),
        }
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        self.current()
            .map(|handle| handle.tx_changes())
            .unwrap_or_default()
    }

    async fn commit_tx(&self) -> Result<()> {
        match self.current() {
            Some(handle) => handle.commit_tx().await,
            None => Ok(()),
        }
    }

    async fn post_tx_commit(&self) -> Result<()> {
        match self.current() {
            Some(handle) => handle.post_tx_commit().await,
            None => Ok(()),
        }
    }

    async fn rollback_tx(&self) -> Result<()> {
        match self.current() {
            Some(handle) => handle.rollback_tx().await,
            None => Ok(()),
        }
    }
}

/// Owns the producer handle of one output queue.
pub struct ProducerSupplier {
    factory: Arc<dyn QueueClientFactory>,
    queue_name: QueueName,
    producer: RwLock<Option<Arc<dyn QueueProducer>>>,
}

impl fmt::Debug for ProducerSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSupplier")
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

impl ProducerSupplier {
    pub fn new(factory: Arc<dyn QueueClientFactory>, queue_name: QueueName) -> Self {
        Self {
            factory,
            queue_name,
            producer: RwLock::new(None),
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    pub async fn open(&self) -> Result<()> {
        let producer = self.factory.create_producer(&self.queue_name).await?;
        *self.producer.write().unwrap_or_else(PoisonError::into_inner) = Some(producer);
        Ok(())
    }

    pub fn close(&self) {
        self.producer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn get(&self) -> Result<Arc<dyn QueueProducer>> {
        self.current().ok_or_else(|| {
            Consumer::internal_error(format!("producer for {} is not open", self.queue_name))
        })
    }

    fn current(&self) -> Option<Arc<dyn QueueProducer>> {
        self.producer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TransactionAware for ProducerSupplier {
    fn name(&self) -> String {
        self.queue_name.to_string()
    }

    async fn start_tx(&self, tx: &Transaction) -> Result<()> {
        match self.current() {
            Some(producer) => producer.start_tx(tx).await,
            None => Ok(()),
        }
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        self.current()
            .map(|producer| producer.tx_changes())
            .unwrap_or_default()
    }

    async fn commit_tx(&self) -> Result<()> {
        match self.current() {
            Some(producer) => producer.commit_tx().await,
            None => Ok(()),
        }
    }

    async fn post_tx_commit(&self) -> Result<()> {
        match self.current() {
            Some(producer) => producer.post_tx_commit().await,
            None => Ok(()),
        }
    }

    async fn rollback_tx(&self) -> Result<()> {
        match self.current() {
            Some(producer) => producer.rollback_tx().await,
            None => Ok(()),
        }
    }
}

/// Receives stream property changes. Callbacks must not block.
pub trait StreamPropertyListener: Send + Sync {
    fn ttl_changed(&self, _stream: &StreamId, _ttl: Duration) {}

    fn generation_changed(&self, _stream: &StreamId, _generation: u64) {}

    fn threshold_changed(&self, _stream: &StreamId, _threshold_mb: u64) {}

    fn deleted(&self, _stream: &StreamId) {}
}

/// Push notifications of stream property changes.
#[async_trait]
pub trait StreamCoordinatorClient: Send + Sync {
    /// Subscribes `listener` to `stream`. Cancelling the returned token ends the subscription.
    async fn subscribe(
        &self,
        stream: &StreamId,
        listener: Arc<dyn StreamPropertyListener>,
    ) -> Result<CancellationToken>;
}
