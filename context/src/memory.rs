//! Per-session calculator memory with before/after inference hooks.
//!
//! ```text
//! before_inference ──► wait for pending merge ──► project(store)
//! after_inference  ──► extract (no lock held) ──► lock ──► reconcile (sync)
//! ```
//!
//! Background reconciliations are chained so they commit in turn order.
//! The store is only touched under its mutex and only between awaits.
//! Abandoning aborts the whole chain, and a merge started before the abandon
//! never commits after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tally_types::{FactStore, Message};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

use crate::extraction::ExtractionClient;
use crate::observer::{MemoryObserver, TracingObserver};
use crate::persistence;
use crate::projector::project;
use crate::reconciler::{MergeReport, reconcile};

/// The newest background reconciliation plus the earlier ones it waits on.
struct Pending {
    handle: JoinHandle<MergeReport>,
    chained: Vec<AbortHandle>,
}

impl Pending {
    fn abort(&self) {
        self.handle.abort();
        for earlier in &self.chained {
            earlier.abort();
        }
    }
}

pub struct CalculatorMemory {
    store: Arc<Mutex<FactStore>>,
    extractor: Arc<dyn ExtractionClient>,
    observer: Arc<dyn MemoryObserver>,
    pending: StdMutex<Option<Pending>>,
    /// Bumped by [`CalculatorMemory::abandon_pending`]; merges started under
    /// an older generation never commit.
    generation: Arc<AtomicU64>,
}

impl CalculatorMemory {
    pub fn new(extractor: Arc<dyn ExtractionClient>, store: FactStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            extractor,
            observer: Arc::new(TracingObserver),
            pending: StdMutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Restore from a persisted blob; unreadable blobs start empty.
    pub fn from_blob(extractor: Arc<dyn ExtractionClient>, blob: Option<&str>) -> Self {
        Self::new(extractor, persistence::deserialize(blob))
    }

    pub fn with_observer(mut self, observer: Arc<dyn MemoryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Instruction block for the next primary call.
    pub async fn before_inference(&self) -> String {
        self.wait_pending().await;
        let store = self.store.lock().await;
        self.observer.on_invoking(store.saved_values().len());
        project(&store)
    }

    /// Extract from the finished turn and merge the result.
    ///
    /// Background reconciliations still pending commit first.
    pub async fn after_inference(&self, turn_messages: Vec<Message>) -> MergeReport {
        self.wait_pending().await;
        self.reconciliation(turn_messages).await
    }

    /// Run [`Self::after_inference`] on a background task.
    ///
    /// A reconciliation already pending runs to completion first, so merges
    /// commit in turn order.
    pub fn spawn_after_inference(&self, turn_messages: Vec<Message>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let work = self.reconciliation(turn_messages);

        let (previous, mut chained) = match pending.take() {
            Some(Pending { handle, mut chained }) => {
                chained.push(handle.abort_handle());
                (Some(handle), chained)
            }
            None => (None, Vec::new()),
        };
        chained.retain(|h| !h.is_finished());

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await
        });
        *pending = Some(Pending { handle, chained });
    }

    /// Wait for the pending reconciliation, if any.
    ///
    /// Returns `None` when nothing was pending or the task was aborted.
    pub async fn wait_pending(&self) -> Option<MergeReport> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match pending.handle.await {
            Ok(report) => Some(report),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                tracing::error!(error = %e, "Memory reconciliation task failed");
                None
            }
        }
    }

    /// Abort every pending reconciliation. Returns whether one was pending.
    ///
    /// No reconciliation started before this call commits afterwards.
    pub fn abandon_pending(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(pending) => {
                pending.abort();
                tracing::debug!(
                    chained = pending.chained.len(),
                    "Abandoned pending memory reconciliation"
                );
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Current store contents without waiting for a pending merge.
    pub async fn snapshot(&self) -> FactStore {
        self.store.lock().await.clone()
    }

    /// Persistable blob, taken after any pending merge has committed.
    pub async fn serialize(&self) -> String {
        self.wait_pending().await;
        persistence::serialize(&*self.store.lock().await)
    }

    /// Extraction and merge for one turn, bound to the current generation.
    fn reconciliation(
        &self,
        turn_messages: Vec<Message>,
    ) -> impl Future<Output = MergeReport> + Send + 'static {
        let store = Arc::clone(&self.store);
        let extractor = Arc::clone(&self.extractor);
        let observer = Arc::clone(&self.observer);
        let generation = Arc::clone(&self.generation);
        let started = generation.load(Ordering::SeqCst);

        async move {
            let outcome = extractor.extract(turn_messages).await;
            let mut store = store.lock().await;
            if generation.load(Ordering::SeqCst) != started {
                tracing::debug!("Discarding reconciliation from an abandoned turn");
                return MergeReport::default();
            }
            reconcile(&mut store, outcome, observer.as_ref())
        }
    }
}

impl Drop for CalculatorMemory {
    fn drop(&mut self) {
        self.abandon_pending();
    }
}
