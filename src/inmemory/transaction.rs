use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::poison_err;
use crate::error::Result;
use crate::shared::{ComponentError, Transactions};
use crate::transaction::{Transaction, TransactionSystemClient};

#[derive(Debug, Default)]
struct TxState {
    next_id: u64,
    commit_seq: u64,
    /// In-progress transaction id to the commit sequence it started at.
    in_progress: HashMap<u64, u64>,
    /// Change sets submitted through `can_commit`, awaiting commit.
    pending: HashMap<u64, HashSet<Vec<u8>>>,
    committed: Vec<(u64, HashSet<Vec<u8>>)>,
    injected_conflicts: u32,
    commits: u64,
    aborts: u64,
}

impl TxState {
    /// Drops change sets no in-progress transaction can conflict with.
    fn prune(&mut self) {
        match self.in_progress.values().min().copied() {
            Some(oldest) => self.committed.retain(|(seq, _)| *seq > oldest),
            None => self.committed.clear(),
        }
    }
}

/// Optimistic transaction system detecting write-write conflicts on change keys.
///
/// Conflicts can also be injected: the next `n` calls to `can_commit` fail with a conflict.
#[derive(Debug, Default)]
pub struct InMemoryTransactionSystem {
    state: Mutex<TxState>,
}

impl InMemoryTransactionSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commit attempts fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.injected_conflicts += n;
        }
    }

    /// Number of committed transactions.
    pub fn commits(&self) -> u64 {
        self.state.lock().map(|s| s.commits).unwrap_or_default()
    }

    /// Number of aborted transactions.
    pub fn aborts(&self) -> u64 {
        self.state.lock().map(|s| s.aborts).unwrap_or_default()
    }
}

#[async_trait]
impl TransactionSystemClient for InMemoryTransactionSystem {
    async fn start(&self, timeout: Duration) -> Result<Transaction> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.next_id += 1;
        let id = state.next_id;
        let seq = state.commit_seq;
        state.in_progress.insert(id, seq);
        Ok(Transaction { id, timeout })
    }

    async fn can_commit(&self, tx: &Transaction, changes: &[Vec<u8>]) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            debug!(tx = tx.id, "Injected conflict");
            return Err(Transactions::conflict_error(format!(
                "transaction {} conflicts (injected)",
                tx.id
            )));
        }
        let started_at = *state.in_progress.get(&tx.id).ok_or_else(|| {
            Transactions::internal_error(format!("transaction {} is not in progress", tx.id))
        })?;

        let changes: HashSet<Vec<u8>> = changes.iter().cloned().collect();
        let conflicting = state
            .committed
            .iter()
            .any(|(seq, keys)| *seq > started_at && !keys.is_disjoint(&changes));
        if conflicting {
            return Err(Transactions::conflict_error(format!(
                "transaction {} conflicts with a committed transaction",
                tx.id
            )));
        }
        state.pending.insert(tx.id, changes);
        Ok(())
    }

    async fn commit(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if state.in_progress.remove(&tx.id).is_none() {
            return Err(Transactions::internal_error(format!(
                "transaction {} is not in progress",
                tx.id
            )));
        }
        let changes = state.pending.remove(&tx.id).unwrap_or_default();
        state.commit_seq += 1;
        let seq = state.commit_seq;
        state.committed.push((seq, changes));
        state.commits += 1;
        state.prune();
        Ok(())
    }

    async fn abort(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.in_progress.remove(&tx.id);
        state.pending.remove(&tx.id);
        state.aborts += 1;
        state.prune();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_write_conflict_detection() {
        let txs = InMemoryTransactionSystem::new();
        let a = txs.start(TIMEOUT).await.unwrap();
        let b = txs.start(TIMEOUT).await.unwrap();

        txs.can_commit(&a, &[b"k".to_vec()]).await.unwrap();
        txs.commit(&a).await.unwrap();

        let err = txs.can_commit(&b, &[b"k".to_vec()]).await.unwrap_err();
        assert!(err.is_conflict());
        txs.abort(&b).await.unwrap();

        // started after the commit, no conflict
        let c = txs.start(TIMEOUT).await.unwrap();
        txs.can_commit(&c, &[b"k".to_vec()]).await.unwrap();
        txs.commit(&c).await.unwrap();

        assert_eq!(txs.commits(), 2);
        assert_eq!(txs.aborts(), 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let txs = InMemoryTransactionSystem::new();
        txs.inject_conflicts(1);

        let tx = txs.start(TIMEOUT).await.unwrap();
        assert!(txs.can_commit(&tx, &[]).await.unwrap_err().is_conflict());
        assert!(txs.can_commit(&tx, &[]).await.is_ok());
    }
}
