use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::poison_err;
use crate::error::Result;
use crate::transaction::{Transaction, TransactionAware};

/// A transactional table of counters.
///
/// Writes are buffered per transaction and applied on commit. Meant for one writer at a time,
/// as a flowlet instance is.
#[derive(Debug)]
pub struct InMemoryTable {
    name: String,
    committed: Mutex<BTreeMap<String, i64>>,
    pending: Mutex<BTreeMap<String, i64>>,
}

impl InMemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            committed: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn increment(&self, key: &str, delta: i64) -> Result<()> {
        *self
            .pending
            .lock()
            .map_err(poison_err)?
            .entry(key.to_string())
            .or_default() += delta;
        Ok(())
    }

    /// Committed value plus the writes of the current transaction.
    pub fn get(&self, key: &str) -> Result<i64> {
        let committed = self
            .committed
            .lock()
            .map_err(poison_err)?
            .get(key)
            .copied()
            .unwrap_or_default();
        let pending = self
            .pending
            .lock()
            .map_err(poison_err)?
            .get(key)
            .copied()
            .unwrap_or_default();
        Ok(committed + pending)
    }

    /// Committed values only.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.committed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransactionAware for InMemoryTable {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start_tx(&self, _tx: &Transaction) -> Result<()> {
        self.pending.lock().map_err(poison_err)?.clear();
        Ok(())
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        self.pending
            .lock()
            .map(|pending| {
                pending
                    .keys()
                    .map(|key| format!("{}/{key}", self.name).into_bytes())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn commit_tx(&self) -> Result<()> {
        Ok(())
    }

    async fn post_tx_commit(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock().map_err(poison_err)?);
        let mut committed = self.committed.lock().map_err(poison_err)?;
        for (key, delta) in pending {
            *committed.entry(key).or_default() += delta;
        }
        Ok(())
    }

    async fn rollback_tx(&self) -> Result<()> {
        self.pending.lock().map_err(poison_err)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_writes_apply_on_commit_only() {
        let table = InMemoryTable::new("counts");
        let tx = Transaction {
            id: 1,
            timeout: Duration::from_secs(1),
        };

        table.start_tx(&tx).await.unwrap();
        table.increment("a", 2).unwrap();
        assert_eq!(table.get("a").unwrap(), 2);
        assert_eq!(table.tx_changes(), vec![b"counts/a".to_vec()]);
        table.rollback_tx().await.unwrap();
        assert_eq!(table.get("a").unwrap(), 0);

        table.start_tx(&tx).await.unwrap();
        table.increment("a", 5).unwrap();
        table.post_tx_commit().await.unwrap();
        assert_eq!(table.snapshot().get("a"), Some(&5));
    }
}
