//! Input readers of process methods.
//!
//! Each consumer supplier is read through a [`SupplierReader`], which also accounts for the
//! dequeue in metrics. A process method fed by several edges reads them through a
//! [`RoundRobinQueueReader`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::Result;
use crate::metrics::{names, tags, MetricsContext};
use crate::process::InputContext;
use crate::queue::{ClaimId, ConsumerHandle, ConsumerSupplier, StreamEvent};
use crate::schema::{self, Typed};

/// A dequeued batch with its delivery context. Payloads are encoded with their source schema
/// fingerprint and decoded on every invocation.
#[derive(Clone)]
pub struct InputDatum {
    events: Vec<Vec<u8>>,
    context: InputContext,
    claim: Option<(ConsumerHandle, ClaimId)>,
}

impl fmt::Debug for InputDatum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDatum")
            .field("size", &self.events.len())
            .field("context", &self.context)
            .finish()
    }
}

impl InputDatum {
    pub fn new(origin: impl Into<String>, events: Vec<Vec<u8>>) -> Self {
        Self {
            events,
            context: InputContext::new(origin),
            claim: None,
        }
    }

    /// Ties the datum to the consumer and claim it was dequeued under, so it can be redelivered.
    pub fn with_claim(mut self, consumer: ConsumerHandle, claim: ClaimId) -> Self {
        self.claim = Some((consumer, claim));
        self
    }

    pub fn events(&self) -> &[Vec<u8>] {
        &self.events
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn context(&self) -> &InputContext {
        &self.context
    }

    /// Marks one more delivery attempt of the same input.
    pub fn increment_retry(&mut self) {
        self.context.retry_count += 1;
    }

    pub fn reset_retry(&mut self) {
        self.context.retry_count = 0;
    }

    /// Takes the entries of this datum back into the current transaction after a rollback, so
    /// committing that transaction acknowledges them. Other data read from the same consumer are
    /// left alone.
    pub async fn reclaim(&self) -> Result<()> {
        match &self.claim {
            Some((consumer, claim)) => consumer.reclaim(*claim).await,
            None => Ok(()),
        }
    }
}

/// A source of input for one process method.
#[async_trait]
pub trait QueueReader: Send + Sync {
    /// Dequeues up to `max` events. `None` means nothing is ready.
    async fn dequeue(&self, max: usize, timeout: Duration) -> Result<Option<InputDatum>>;
}

/// Reads one consumer supplier and records the dequeue: events in and tuples read for this
/// flowlet, and one less pending entry on the producer side.
pub struct SupplierReader {
    supplier: Arc<ConsumerSupplier>,
    metrics: Arc<dyn MetricsContext>,
    producer_metrics: Option<Arc<dyn MetricsContext>>,
}

impl SupplierReader {
    /// `producer_metrics` is the [pending context](crate::metrics::pending_context) of the
    /// edge. Streams have none.
    pub fn new(
        supplier: Arc<ConsumerSupplier>,
        metrics: Arc<dyn MetricsContext>,
        producer_metrics: Option<Arc<dyn MetricsContext>>,
    ) -> Self {
        Self {
            supplier,
            metrics,
            producer_metrics,
        }
    }
}

#[async_trait]
impl QueueReader for SupplierReader {
    async fn dequeue(&self, max: usize, timeout: Duration) -> Result<Option<InputDatum>> {
        let handle = self.supplier.get()?;
        let (claim, events) = match &handle {
            ConsumerHandle::Queue(consumer) => {
                let claimed = consumer.dequeue(max, timeout).await?;
                (claimed.claim, claimed.items)
            }
            ConsumerHandle::Stream(consumer) => {
                let schema = StreamEvent::schema();
                let claimed = consumer.poll(max, timeout).await?;
                let events = claimed
                    .items
                    .iter()
                    .map(|event| schema::encode(&schema, event))
                    .collect::<Result<Vec<_>>>()?;
                (claimed.claim, events)
            }
        };
        if events.is_empty() {
            return Ok(None);
        }

        let queue_name = self.supplier.queue_name();
        let count = events.len() as i64;
        trace!(queue = %queue_name, count, "Dequeued events");
        self.metrics.increment(names::PROCESS_EVENTS_IN, count);
        self.metrics
            .child(tags::QUEUE, queue_name.simple_name())
            .increment(names::PROCESS_TUPLES_READ, count);
        if let Some(producer) = &self.producer_metrics {
            producer.increment(names::QUEUE_PENDING, -count);
        }

        Ok(Some(
            InputDatum::new(queue_name.simple_name(), events).with_claim(handle, claim),
        ))
    }
}

/// Presents several readers as one, cycling through them.
///
/// Every call starts at the reader after the one visited last, so sources with data are served
/// in turn. A full rotation without data reports nothing ready.
pub struct RoundRobinQueueReader {
    readers: Vec<Box<dyn QueueReader>>,
    next: AtomicUsize,
}

impl RoundRobinQueueReader {
    pub fn new(readers: Vec<Box<dyn QueueReader>>) -> Self {
        Self {
            readers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

#[async_trait]
impl QueueReader for RoundRobinQueueReader {
    async fn dequeue(&self, max: usize, timeout: Duration) -> Result<Option<InputDatum>> {
        let len = self.readers.len();
        let start = self.next.load(Ordering::Relaxed);
        for offset in 0..len {
            let idx = (start + offset) % len;
            self.next.store((idx + 1) % len, Ordering::Relaxed);
            if let Some(datum) = self.readers[idx].dequeue(max, timeout).await? {
                return Ok(Some(datum));
            }
        }
        Ok(None)
    }
}
