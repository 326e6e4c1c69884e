//! Output emission.
//!
//! [`OutputEmitterFactory::create`] resolves a named output of the flowlet to the queue carrying
//! it, and registers a [`ProducerSupplier`] for that queue so the instance can open it and enlist
//! it in every transaction.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::Result;
use crate::flow::QueueSpecificationTable;
use crate::metrics::{names, pending_context, tags, MetricsContext};
use crate::queue::{partition_hash, ProducerSupplier, QueueClientFactory, QueueEntry};
use crate::schema::{self, Schema, Typed};
use crate::shared::{ComponentError, Emitter, FlowletId, Node, QueueName};

/// Creates typed emitters for the outputs of one flowlet.
pub struct OutputEmitterFactory {
    flowlet: FlowletId,
    queue_specs: Arc<QueueSpecificationTable>,
    factory: Arc<dyn QueueClientFactory>,
    metrics: Arc<dyn MetricsContext>,
    flowlet_metrics: Arc<dyn MetricsContext>,
    producers: Mutex<BTreeMap<QueueName, Arc<ProducerSupplier>>>,
}

impl fmt::Debug for OutputEmitterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputEmitterFactory")
            .field("flowlet", &self.flowlet)
            .field("producers", &self.producers().len())
            .finish()
    }
}

impl OutputEmitterFactory {
    /// `metrics` is the context of this instance. `flowlet_metrics` is the context of the
    /// flowlet as a whole, under which pending entries are counted.
    pub fn new(
        flowlet: FlowletId,
        queue_specs: Arc<QueueSpecificationTable>,
        factory: Arc<dyn QueueClientFactory>,
        metrics: Arc<dyn MetricsContext>,
        flowlet_metrics: Arc<dyn MetricsContext>,
    ) -> Self {
        Self {
            flowlet,
            queue_specs,
            factory,
            metrics,
            flowlet_metrics,
            producers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Emitter for `output` carrying `T`. Fails with a configuration error when no edge of the
    /// flow leaves this flowlet under that name and schema.
    pub fn create<T: Typed>(&self, output: &str) -> Result<OutputEmitter<T>> {
        let schema = T::schema();
        let source = Node::flowlet(&self.flowlet.flowlet);

        let mut queues = Vec::new();
        let mut consumers = Vec::new();
        for (target, specs) in self.queue_specs.row(&source) {
            for spec in specs {
                if spec.queue_name.simple_name() == output && spec.output_schema == schema {
                    if !queues.contains(&spec.queue_name) {
                        queues.push(spec.queue_name.clone());
                    }
                    consumers.push(target.to_string());
                }
            }
        }
        if queues.is_empty() {
            return Err(Emitter::config_error(format!(
                "no queue for output '{output}' of {} with schema {schema:?}",
                self.flowlet
            )));
        }

        let producers = {
            let mut registered = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
            queues
                .into_iter()
                .map(|queue| {
                    Arc::clone(registered.entry(queue.clone()).or_insert_with(|| {
                        Arc::new(ProducerSupplier::new(Arc::clone(&self.factory), queue))
                    }))
                })
                .collect::<Vec<_>>()
        };
        debug!(flowlet = %self.flowlet, output, consumers = ?consumers, "Resolved output emitter");

        Ok(OutputEmitter {
            output: output.to_string(),
            schema,
            producers,
            metrics: self.metrics.child(tags::QUEUE, output),
            pending: consumers
                .iter()
                .map(|consumer| pending_context(&*self.flowlet_metrics, output, consumer))
                .collect(),
            _marker: PhantomData,
        })
    }

    /// Every producer registered by the emitters created so far.
    pub fn producers(&self) -> Vec<Arc<ProducerSupplier>> {
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Writes typed events to one output of a flowlet.
pub struct OutputEmitter<T> {
    output: String,
    schema: Schema,
    producers: Vec<Arc<ProducerSupplier>>,
    metrics: Arc<dyn MetricsContext>,
    pending: Vec<Arc<dyn MetricsContext>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for OutputEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            output: self.output.clone(),
            schema: self.schema.clone(),
            producers: self.producers.clone(),
            metrics: Arc::clone(&self.metrics),
            pending: self.pending.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for OutputEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputEmitter")
            .field("output", &self.output)
            .field("schema", &self.schema)
            .finish()
    }
}

impl<T: Typed> OutputEmitter<T> {
    pub fn output(&self) -> &str {
        &self.output
    }

    pub async fn emit(&self, value: T) -> Result<()> {
        self.write(&value, QueueEntry::new(Vec::new())).await
    }

    /// Emits `value` with the hash of `partition_value` under `key`, routing it to one member
    /// of every HASH consumer group keyed on `key`.
    pub async fn emit_partitioned(&self, value: T, key: &str, partition_value: &str) -> Result<()> {
        let entry = QueueEntry::new(Vec::new()).with_hash_key(key, partition_hash(partition_value));
        self.write(&value, entry).await
    }

    async fn write(&self, value: &T, mut entry: QueueEntry) -> Result<()> {
        entry.data = schema::encode(&self.schema, value)?;
        for producer in &self.producers {
            producer.get()?.enqueue(entry.clone()).await?;
        }
        self.metrics.increment(names::PROCESS_EVENTS_OUT, 1);
        for consumer in &self.pending {
            consumer.increment(names::QUEUE_PENDING, 1);
        }
        Ok(())
    }
}
