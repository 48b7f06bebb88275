//! Per-host state shared between the registry and the tasks working on a host.

use alloc::sync::Arc;
use std::sync::{Mutex as StdMutex, PoisonError};

use hostwatch_common::HostRecord;
use tokio::{
    sync::{Mutex, MutexGuard, Notify, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Book-keeping owned by whoever holds the host's network lock.
#[derive(Debug, Default)]
pub(crate) struct PollState {
    pub consecutive_failures: u32,
    /// Set once the host was removed; holders of a stale entry must not touch it.
    pub retired: bool,
}

/// A spawned background task together with the means to stop it.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until the task has actually finished.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!("Background task panicked: {e}");
        }
    }
}

/// A running catalog poller and the doorbell that wakes it early.
#[derive(Debug)]
pub(crate) struct CatalogHandle {
    pub task: TaskHandle,
    pub wake: Arc<Notify>,
}

/// Everything the engine keeps per registered host.
///
/// The record is published through a [`watch`] channel so readers get consistent
/// snapshots without locking. Writers that talk to the network (polls,
/// blocking adds, invalidation, catalog fetches) serialize on [`Self::lock_network`].
#[derive(Debug)]
pub(crate) struct HostEntry {
    pub uuid: String,
    record: watch::Sender<Arc<HostRecord>>,
    network: Mutex<PollState>,
    pub session: StdMutex<Option<TaskHandle>>,
    pub catalog: StdMutex<Option<CatalogHandle>>,
}

impl HostEntry {
    pub fn new(uuid: String, record: HostRecord) -> Self {
        let (record, _) = watch::channel(Arc::new(record));
        Self {
            uuid,
            record,
            network: Mutex::new(PollState::default()),
            session: StdMutex::new(None),
            catalog: StdMutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<HostRecord> {
        Arc::clone(&self.record.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HostRecord>> {
        self.record.subscribe()
    }

    pub async fn lock_network(&self) -> MutexGuard<'_, PollState> {
        self.network.lock().await
    }

    /// Apply `f` to the record and publish the result as one atomic change.
    ///
    /// Returns the published snapshot along with `f`'s result.
    pub fn update<R>(&self, f: impl FnOnce(&mut HostRecord) -> R) -> (Arc<HostRecord>, R) {
        let mut out = None;
        self.record.send_modify(|current| {
            let result = f(Arc::make_mut(current));
            out = Some((Arc::clone(current), result));
        });
        let Some(out) = out else {
            unreachable!("send_modify always runs the closure");
        };
        out
    }

    /// Like [`Self::update`], but publishes nothing if `f` fails.
    pub fn try_update<E>(
        &self,
        f: impl FnOnce(&mut HostRecord) -> Result<(), E>,
    ) -> Result<Arc<HostRecord>, E> {
        let mut out = None;
        self.record.send_if_modified(|current| {
            let mut next = (**current).clone();
            let result = f(&mut next);
            let changed = result.is_ok();
            if changed {
                *current = Arc::new(next);
            }
            out = Some(result.map(|()| Arc::clone(current)));
            changed
        });
        let Some(out) = out else {
            unreachable!("send_if_modified always runs the closure");
        };
        out
    }

    pub fn ensure_session<F, Fut>(&self, spawn: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *slot = Some(TaskHandle::spawn(spawn));
    }

    pub fn take_session(&self) -> Option<TaskHandle> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn take_catalog(&self) -> Option<CatalogHandle> {
        self.catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Cancel both background tasks and wait for them to finish.
    pub async fn stop_tasks(&self) {
        let session = self.take_session();
        let catalog = self.take_catalog();
        if let Some(ref session) = session {
            session.cancel();
        }
        if let Some(ref catalog) = catalog {
            catalog.task.cancel();
        }
        if let Some(session) = session {
            session.stop().await;
        }
        if let Some(catalog) = catalog {
            catalog.task.stop().await;
        }
    }
}
