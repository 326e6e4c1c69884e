//! Flowlet metrics.
//!
//! Emission goes through [`MetricsContext`], a tagged handle that can spawn child contexts (per
//! queue, per producer flowlet, ...). [`RecorderMetrics`] forwards to the `metrics` crate facade,
//! so any installed recorder (Prometheus or otherwise) picks the values up.
//!
//! | Metric | Kind | Description |
//! |--------|------|-------------|
//! | `process.events.in` | counter | events dequeued by a process method |
//! | `process.tuples.read` | counter | same as above, per queue |
//! | `process.events.out` | counter | events emitted on an output |
//! | `process.events.processed` | counter | successful invocations |
//! | `process.errors` | counter | failed invocations |
//! | `queue.pending` | gauge | approximate backlog of a queue, per consumer flowlet |
//!
//! `queue.pending` is raised by producers and lowered by consumers, so both sides must report it
//! under the same tags: the producing flowlet, the queue and the consuming flowlet, without any
//! instance id. See [`pending_context`].
//! | `process.instance` | gauge | running instances of the flowlet |

use std::fmt;
use std::sync::Arc;

use metrics::{counter, gauge};

use crate::shared::FlowletId;

/// Metric names.
pub mod names {
    pub const PROCESS_EVENTS_IN: &str = "process.events.in";
    pub const PROCESS_TUPLES_READ: &str = "process.tuples.read";
    pub const PROCESS_EVENTS_OUT: &str = "process.events.out";
    pub const PROCESS_EVENTS_PROCESSED: &str = "process.events.processed";
    pub const PROCESS_ERRORS: &str = "process.errors";
    pub const QUEUE_PENDING: &str = "queue.pending";
    pub const PROCESS_INSTANCE: &str = "process.instance";
}

/// Tag keys.
pub mod tags {
    pub const NAMESPACE: &str = "ns";
    pub const APP: &str = "app";
    pub const FLOW: &str = "flow";
    pub const FLOWLET: &str = "flowlet";
    pub const INSTANCE: &str = "instance";
    pub const QUEUE: &str = "queue";
    pub const CONSUMER: &str = "consumer";
    pub const PRODUCER: &str = "producer";
}

/// A tagged metrics sink.
pub trait MetricsContext: Send + Sync + fmt::Debug {
    /// Adds `delta` to the metric. Negative deltas only make sense for gauges such as
    /// `queue.pending`.
    fn increment(&self, name: &str, delta: i64);

    fn gauge(&self, name: &str, value: f64);

    /// A context carrying every tag of this one plus `tag=value`.
    fn child(&self, tag: &str, value: &str) -> Arc<dyn MetricsContext>;

    fn tags(&self) -> &[(String, String)];
}

/// Metrics context backed by the global `metrics` recorder.
#[derive(Debug, Clone, Default)]
pub struct RecorderMetrics {
    tags: Vec<(String, String)>,
}

impl RecorderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context tagged with the flowlet identity, shared by all of its instances.
    pub fn for_flowlet(id: &FlowletId) -> Self {
        Self {
            tags: vec![
                (tags::NAMESPACE.to_string(), id.namespace.clone()),
                (tags::APP.to_string(), id.application.clone()),
                (tags::FLOW.to_string(), id.flow.clone()),
                (tags::FLOWLET.to_string(), id.flowlet.clone()),
            ],
        }
    }
}

/// Tags `root` with the identity of flowlet `id`.
pub fn flowlet_context(root: &dyn MetricsContext, id: &FlowletId) -> Arc<dyn MetricsContext> {
    root.child(tags::NAMESPACE, &id.namespace)
        .child(tags::APP, &id.application)
        .child(tags::FLOW, &id.flow)
        .child(tags::FLOWLET, &id.flowlet)
}

/// The `queue.pending` context of `queue` between a producer and a consumer flowlet.
/// `producer` is the flowlet wide context of the producer, as returned by [`flowlet_context`].
pub fn pending_context(
    producer: &dyn MetricsContext,
    queue: &str,
    consumer: &str,
) -> Arc<dyn MetricsContext> {
    producer
        .child(tags::QUEUE, queue)
        .child(tags::CONSUMER, consumer)
}

/// Counters only move forward; a gauge backs metrics that can go down.
fn is_gauge(name: &str) -> bool {
    name == names::QUEUE_PENDING || name == names::PROCESS_INSTANCE
}

impl MetricsContext for RecorderMetrics {
    fn increment(&self, name: &str, delta: i64) {
        if is_gauge(name) {
            let gauge = gauge!(name.to_string(), &self.tags);
            if delta >= 0 {
                gauge.increment(delta as f64);
            } else {
                gauge.decrement(delta.unsigned_abs() as f64);
            }
        } else if delta > 0 {
            counter!(name.to_string(), &self.tags).increment(delta as u64);
        }
    }

    fn gauge(&self, name: &str, value: f64) {
        gauge!(name.to_string(), &self.tags).set(value);
    }

    fn child(&self, tag: &str, value: &str) -> Arc<dyn MetricsContext> {
        let mut tags = self.tags.clone();
        match tags.iter_mut().find(|(k, _)| k == tag) {
            Some(existing) => existing.1 = value.to_string(),
            None => tags.push((tag.to_string(), value.to_string())),
        }
        Arc::new(RecorderMetrics { tags })
    }

    fn tags(&self) -> &[(String, String)] {
        &self.tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flowlet_tags() {
        let id = FlowletId::new("ns", "app", "flow", "counter");
        let metrics = RecorderMetrics::for_flowlet(&id);
        assert!(metrics
            .tags()
            .contains(&(tags::FLOWLET.to_string(), "counter".to_string())));
        assert!(metrics.tags().iter().all(|(k, _)| k != tags::INSTANCE));
        assert_eq!(
            flowlet_context(&RecorderMetrics::new(), &id).tags(),
            metrics.tags()
        );

        let child = metrics.child(tags::QUEUE, "words");
        assert_eq!(child.tags().len(), metrics.tags().len() + 1);

        // re-tagging replaces instead of duplicating
        let producer = metrics.child(tags::FLOWLET, "splitter");
        assert_eq!(producer.tags().len(), metrics.tags().len());
        assert!(producer
            .tags()
            .contains(&(tags::FLOWLET.to_string(), "splitter".to_string())));
    }

    #[test]
    fn test_pending_context_tags() {
        let producer = FlowletId::new("ns", "app", "flow", "splitter");
        let pending = pending_context(&RecorderMetrics::for_flowlet(&producer), "words", "counter");
        assert_eq!(
            pending.tags(),
            pending_context(&*flowlet_context(&RecorderMetrics::new(), &producer), "words", "counter")
                .tags()
        );
        assert!(pending
            .tags()
            .contains(&(tags::CONSUMER.to_string(), "counter".to_string())));
        assert!(pending.tags().iter().all(|(k, _)| k != tags::INSTANCE));
    }

    #[test]
    fn test_emission_without_recorder() {
        // no recorder installed: every call is a no-op
        let metrics = RecorderMetrics::new();
        metrics.increment(names::PROCESS_EVENTS_IN, 3);
        metrics.increment(names::QUEUE_PENDING, -3);
        metrics.gauge(names::PROCESS_INSTANCE, 1.0);
        assert!(is_gauge(names::QUEUE_PENDING));
        assert!(!is_gauge(names::PROCESS_ERRORS));
    }
}
