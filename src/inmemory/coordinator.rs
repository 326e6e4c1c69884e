use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::poison_err;
use crate::error::Result;
use crate::queue::{StreamCoordinatorClient, StreamPropertyListener};
use crate::shared::StreamId;

type Subscription = (CancellationToken, Arc<dyn StreamPropertyListener>);

/// Pushes stream property changes to subscribed listeners, synchronously on the caller's thread.
#[derive(Default)]
pub struct InMemoryStreamCoordinator {
    subscriptions: Mutex<HashMap<StreamId, Vec<Subscription>>>,
}

impl fmt::Debug for InMemoryStreamCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStreamCoordinator").finish()
    }
}

impl InMemoryStreamCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on the stream.
    pub fn subscribers(&self, stream: &StreamId) -> usize {
        self.listeners(stream).len()
    }

    pub fn change_ttl(&self, stream: &StreamId, ttl: Duration) {
        for listener in self.listeners(stream) {
            listener.ttl_changed(stream, ttl);
        }
    }

    pub fn change_generation(&self, stream: &StreamId, generation: u64) {
        for listener in self.listeners(stream) {
            listener.generation_changed(stream, generation);
        }
    }

    pub fn change_threshold(&self, stream: &StreamId, threshold_mb: u64) {
        for listener in self.listeners(stream) {
            listener.threshold_changed(stream, threshold_mb);
        }
    }

    pub fn delete(&self, stream: &StreamId) {
        for listener in self.listeners(stream) {
            listener.deleted(stream);
        }
    }

    /// Live listeners of the stream; cancelled subscriptions are dropped on the way.
    fn listeners(&self, stream: &StreamId) -> Vec<Arc<dyn StreamPropertyListener>> {
        let Ok(mut subscriptions) = self.subscriptions.lock() else {
            return Vec::new();
        };
        let Some(subs) = subscriptions.get_mut(stream) else {
            return Vec::new();
        };
        subs.retain(|(token, _)| !token.is_cancelled());
        subs.iter().map(|(_, listener)| Arc::clone(listener)).collect()
    }
}

#[async_trait]
impl StreamCoordinatorClient for InMemoryStreamCoordinator {
    async fn subscribe(
        &self,
        stream: &StreamId,
        listener: Arc<dyn StreamPropertyListener>,
    ) -> Result<CancellationToken> {
        let token = CancellationToken::new();
        self.subscriptions
            .lock()
            .map_err(poison_err)?
            .entry(stream.clone())
            .or_default()
            .push((token.clone(), listener));
        Ok(token)
    }
}
