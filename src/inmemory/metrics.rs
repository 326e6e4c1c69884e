use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::metrics::MetricsContext;

type Tags = Vec<(String, String)>;

/// Records every metric in memory. Child contexts share the store of their parent.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    tags: Tags,
    store: Arc<Mutex<BTreeMap<(Tags, String), i64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of `name` across every tag combination.
    pub fn total(&self, name: &str) -> i64 {
        self.get(name, &[])
    }

    /// Sum of `name` over the tag combinations containing all of `tags`.
    pub fn get(&self, name: &str, tags: &[(&str, &str)]) -> i64 {
        let Ok(store) = self.store.lock() else {
            return 0;
        };
        store
            .iter()
            .filter(|((entry_tags, entry_name), _)| {
                entry_name == name
                    && tags
                        .iter()
                        .all(|(k, v)| entry_tags.iter().any(|(ek, ev)| ek == k && ev == v))
            })
            .map(|(_, value)| *value)
            .sum()
    }

    /// Every tag combination recorded for `name`, with its value.
    pub fn series(&self, name: &str) -> Vec<(Tags, i64)> {
        let Ok(store) = self.store.lock() else {
            return Vec::new();
        };
        store
            .iter()
            .filter(|((_, entry_name), _)| entry_name == name)
            .map(|((tags, _), value)| (tags.clone(), *value))
            .collect()
    }
}

impl MetricsContext for InMemoryMetrics {
    fn increment(&self, name: &str, delta: i64) {
        if let Ok(mut store) = self.store.lock() {
            *store
                .entry((self.tags.clone(), name.to_string()))
                .or_default() += delta;
        }
    }

    fn gauge(&self, name: &str, value: f64) {
        if let Ok(mut store) = self.store.lock() {
            store.insert((self.tags.clone(), name.to_string()), value as i64);
        }
    }

    fn child(&self, tag: &str, value: &str) -> Arc<dyn MetricsContext> {
        let mut tags = self.tags.clone();
        match tags.iter_mut().find(|(k, _)| k == tag) {
            Some(existing) => existing.1 = value.to_string(),
            None => tags.push((tag.to_string(), value.to_string())),
        }
        Arc::new(InMemoryMetrics {
            tags,
            store: Arc::clone(&self.store),
        })
    }

    fn tags(&self) -> &[(String, String)] {
        &self.tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_share_store() {
        let metrics = InMemoryMetrics::new();
        let words = metrics.child("queue", "words");
        let lines = metrics.child("queue", "lines");

        words.increment("process.events.in", 3);
        lines.increment("process.events.in", 2);
        words.increment("queue.pending", -1);
        metrics.gauge("process.instance", 4.0);

        assert_eq!(metrics.total("process.events.in"), 5);
        assert_eq!(metrics.get("process.events.in", &[("queue", "words")]), 3);
        assert_eq!(metrics.total("queue.pending"), -1);
        assert_eq!(metrics.total("process.instance"), 4);

        let pending = metrics.series("queue.pending");
        assert_eq!(
            pending,
            vec![(vec![("queue".to_string(), "words".to_string())], -1)]
        );
    }
}
