//! Transactions over the instance's resource set.
//!
//! A [`TransactionContext`] drives one transaction across every [`TransactionAware`] participant
//! (datasets, queue consumers and producers) using the external [`TransactionSystemClient`]:
//! start every participant, gather their change sets for conflict detection, persist, commit and
//! finally let participants act on the commit (e.g. acknowledge dequeued entries).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::shared::{ComponentError, Transactions};

/// A transaction handed out by the transaction system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub id: u64,
    pub timeout: Duration,
}

/// A resource that takes part in transactions.
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// Name used in logs and conflict reports.
    fn name(&self) -> String;

    async fn start_tx(&self, tx: &Transaction) -> Result<()>;

    /// Keys changed in the current transaction, used for conflict detection.
    fn tx_changes(&self) -> Vec<Vec<u8>>;

    /// Persist the changes of the current transaction.
    async fn commit_tx(&self) -> Result<()>;

    /// Called once the transaction system committed the transaction.
    async fn post_tx_commit(&self) -> Result<()>;

    /// Undo the changes of the current transaction.
    async fn rollback_tx(&self) -> Result<()>;
}

/// The external transaction manager. Conflict detection happens in [`can_commit`], which returns
/// a conflict error when another committed transaction touched the same keys.
///
/// [`can_commit`]: TransactionSystemClient::can_commit
#[async_trait]
pub trait TransactionSystemClient: Send + Sync {
    async fn start(&self, timeout: Duration) -> Result<Transaction>;

    async fn can_commit(&self, tx: &Transaction, changes: &[Vec<u8>]) -> Result<()>;

    async fn commit(&self, tx: &Transaction) -> Result<()>;

    async fn abort(&self, tx: &Transaction) -> Result<()>;
}

/// Runs transactions across a fixed set of participants.
pub struct TransactionContext {
    client: Arc<dyn TransactionSystemClient>,
    participants: Vec<Arc<dyn TransactionAware>>,
    timeout: Duration,
    current: Option<Transaction>,
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field(
                "participants",
                &self.participants.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("current", &self.current)
            .finish()
    }
}

impl TransactionContext {
    pub fn new(
        client: Arc<dyn TransactionSystemClient>,
        participants: Vec<Arc<dyn TransactionAware>>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            participants,
            timeout,
            current: None,
        }
    }

    pub fn add_participant(&mut self, participant: Arc<dyn TransactionAware>) {
        self.participants.push(participant);
    }

    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// Begins a transaction and starts it on every participant.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(tx) = &self.current {
            return Err(Transactions::internal_error(format!(
                "transaction {} is already in progress",
                tx.id
            )));
        }
        let tx = self.client.start(self.timeout).await?;
        debug!(tx = tx.id, "Transaction started");
        self.current = Some(tx);

        let mut failed = None;
        for participant in &self.participants {
            if let Err(e) = participant.start_tx(&tx).await {
                warn!(tx = tx.id, participant = %participant.name(), error = %e, "Failed to start transaction on participant");
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            self.rollback(tx).await;
            return Err(e);
        }
        Ok(())
    }

    /// Checks for conflicts, persists and commits. On any failure the transaction is rolled back
    /// and aborted before the error is returned.
    pub async fn finish(&mut self) -> Result<()> {
        let tx = self
            .current
            .ok_or_else(|| Transactions::internal_error("no transaction to finish"))?;

        let changes: Vec<Vec<u8>> = self
            .participants
            .iter()
            .flat_map(|p| p.tx_changes())
            .collect();

        if let Err(e) = self.client.can_commit(&tx, &changes).await {
            debug!(tx = tx.id, error = %e, "Transaction cannot commit");
            self.rollback(tx).await;
            return Err(e);
        }

        let mut failed = None;
        for participant in &self.participants {
            if let Err(e) = participant.commit_tx().await {
                warn!(tx = tx.id, participant = %participant.name(), error = %e, "Failed to persist transaction changes");
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            self.rollback(tx).await;
            return Err(e);
        }

        if let Err(e) = self.client.commit(&tx).await {
            self.rollback(tx).await;
            return Err(e);
        }
        self.current = None;

        for participant in &self.participants {
            // the transaction is committed already, so this can only be reported
            if let Err(e) = participant.post_tx_commit().await {
                warn!(tx = tx.id, participant = %participant.name(), error = %e, "Post commit failed");
            }
        }
        debug!(tx = tx.id, "Transaction committed");
        Ok(())
    }

    /// Rolls back and aborts the current transaction, if any.
    pub async fn abort(&mut self) -> Result<()> {
        let Some(tx) = self.current else {
            return Ok(());
        };
        match self.rollback(tx).await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rolls every participant back and aborts `tx`, returning the first failure.
    async fn rollback(&mut self, tx: Transaction) -> Option<Error> {
        self.current = None;
        let mut first_err = None;
        for participant in &self.participants {
            if let Err(e) = participant.rollback_tx().await {
                warn!(tx = tx.id, participant = %participant.name(), error = %e, "Rollback failed");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.client.abort(&tx).await {
            warn!(tx = tx.id, error = %e, "Abort failed");
            first_err.get_or_insert(e);
        }
        debug!(tx = tx.id, "Transaction aborted");
        first_err
    }
}

/// Access to the transaction system and the datasets of a flowlet.
#[derive(Clone)]
pub struct DataFabricFacade {
    tx_client: Arc<dyn TransactionSystemClient>,
    datasets: Vec<Arc<dyn TransactionAware>>,
    tx_timeout: Duration,
}

impl fmt::Debug for DataFabricFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFabricFacade")
            .field(
                "datasets",
                &self.datasets.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("tx_timeout", &self.tx_timeout)
            .finish()
    }
}

impl DataFabricFacade {
    pub fn new(tx_client: Arc<dyn TransactionSystemClient>, tx_timeout: Duration) -> Self {
        Self {
            tx_client,
            datasets: Vec::new(),
            tx_timeout,
        }
    }

    pub fn with_dataset(mut self, dataset: Arc<dyn TransactionAware>) -> Self {
        self.datasets.push(dataset);
        self
    }

    pub fn datasets(&self) -> &[Arc<dyn TransactionAware>] {
        &self.datasets
    }

    /// A context covering every dataset plus the given extra participants.
    pub fn create_transaction_context(
        &self,
        extra: impl IntoIterator<Item = Arc<dyn TransactionAware>>,
    ) -> TransactionContext {
        let participants = self.datasets.iter().cloned().chain(extra).collect();
        TransactionContext::new(Arc::clone(&self.tx_client), participants, self.tx_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransactionAware for Recorder {
        fn name(&self) -> String {
            "recorder".to_string()
        }

        async fn start_tx(&self, tx: &Transaction) -> Result<()> {
            self.calls.lock().unwrap().push(format!("start:{}", tx.id));
            Ok(())
        }

        fn tx_changes(&self) -> Vec<Vec<u8>> {
            vec![b"key".to_vec()]
        }

        async fn commit_tx(&self) -> Result<()> {
            self.calls.lock().unwrap().push("commit".into());
            Ok(())
        }

        async fn post_tx_commit(&self) -> Result<()> {
            self.calls.lock().unwrap().push("post".into());
            Ok(())
        }

        async fn rollback_tx(&self) -> Result<()> {
            self.calls.lock().unwrap().push("rollback".into());
            Ok(())
        }
    }

    struct Client {
        next: AtomicU64,
        conflict: bool,
        aborted: Mutex<Vec<u64>>,
    }

    impl Client {
        fn new(conflict: bool) -> Self {
            Self {
                next: AtomicU64::new(1),
                conflict,
                aborted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TransactionSystemClient for Client {
        async fn start(&self, timeout: Duration) -> Result<Transaction> {
            Ok(Transaction {
                id: self.next.fetch_add(1, Ordering::SeqCst),
                timeout,
            })
        }

        async fn can_commit(&self, _tx: &Transaction, changes: &[Vec<u8>]) -> Result<()> {
            if self.conflict {
                return Err(Transactions::conflict_error(format!("{} keys", changes.len())));
            }
            Ok(())
        }

        async fn commit(&self, _tx: &Transaction) -> Result<()> {
            Ok(())
        }

        async fn abort(&self, tx: &Transaction) -> Result<()> {
            self.aborted.lock().unwrap().push(tx.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_sequence() {
        let recorder = Arc::new(Recorder::default());
        let facade = DataFabricFacade::new(Arc::new(Client::new(false)), Duration::from_secs(1))
            .with_dataset(recorder.clone());
        let mut ctx = facade.create_transaction_context([]);

        ctx.start().await.unwrap();
        assert!(ctx.current_transaction().is_some());
        ctx.finish().await.unwrap();
        assert!(ctx.current_transaction().is_none());

        assert_eq!(recorder.calls(), vec!["start:1", "commit", "post"]);
    }

    #[tokio::test]
    async fn test_conflict_rolls_back() {
        let recorder = Arc::new(Recorder::default());
        let client = Arc::new(Client::new(true));
        let mut ctx = TransactionContext::new(
            client.clone(),
            vec![recorder.clone() as Arc<dyn TransactionAware>],
            Duration::from_secs(1),
        );

        ctx.start().await.unwrap();
        let err = ctx.finish().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(recorder.calls(), vec!["start:1", "rollback"]);
        assert_eq!(*client.aborted.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_abort_and_double_start() {
        let recorder = Arc::new(Recorder::default());
        let mut ctx = TransactionContext::new(
            Arc::new(Client::new(false)),
            vec![recorder.clone() as Arc<dyn TransactionAware>],
            Duration::from_secs(1),
        );

        // nothing to abort
        ctx.abort().await.unwrap();

        ctx.start().await.unwrap();
        assert!(ctx.start().await.is_err());
        ctx.abort().await.unwrap();
        assert_eq!(recorder.calls(), vec!["start:1", "rollback"]);
    }
}
