//! The set of known hosts and the engine operations on it.
//!
//! Locking rules:
//! - the registry lock guards the map and the polling flag, and is never held
//!   across network I/O;
//! - a host's network lock is never acquired while the registry lock is held.

use alloc::{collections::BTreeMap, sync::Arc};
use core::time::Duration;
use std::sync::PoisonError;

use futures::future::join_all;
use hostwatch_common::{HostRecord, HostState, MergeError};
use thiserror::Error as ThisError;
use tokio::{
    sync::{Notify, RwLock, watch},
    time::{Instant, timeout_at},
};
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use crate::{
    app::{
        catalog,
        context::{Collaborators, EngineContext},
        entry::{CatalogHandle, HostEntry, TaskHandle},
        race::{deadline_after, race_addresses},
        session::{self, apply_race, resolve_remote_address},
    },
    config::EngineConfig,
    db::StoreError,
    notifier::Notifier,
};

#[derive(Debug, ThisError)]
pub enum RegistryError {
    #[error("No host with uuid '{0}'")]
    NotFound(String),
    #[error("Only hosts with a uuid can be registered")]
    MissingUuid,
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("Host store failed")]
    Store(#[from] StoreError),
}

/// Connectivity of the machine the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    /// A network came up; previous poll results may no longer apply.
    Available,
    /// All networks are gone; nothing is reachable.
    Lost,
}

#[derive(Default)]
struct Hosts {
    entries: BTreeMap<String, Arc<HostEntry>>,
    polling_active: bool,
}

struct RegistryInner {
    ctx: Arc<EngineContext>,
    hosts: RwLock<Hosts>,
}

/// Thread-safe collection of every known host, plus the tasks polling them.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct HostRegistry {
    inner: Arc<RegistryInner>,
}

fn spawn_session(entry: &Arc<HostEntry>, ctx: &Arc<EngineContext>) {
    let span = info_span!("host_session", host = %entry.uuid);
    let task_entry = Arc::clone(entry);
    let ctx = Arc::clone(ctx);
    entry.ensure_session(move |cancel| session::run(task_entry, ctx, cancel).instrument(span));
}

impl HostRegistry {
    pub fn new(collaborators: Collaborators, config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx: Arc::new(EngineContext::new(collaborators, config)),
                hosts: RwLock::new(Hosts::default()),
            }),
        }
    }

    fn ctx(&self) -> &Arc<EngineContext> {
        &self.inner.ctx
    }

    async fn entry(&self, uuid: &str) -> Result<Arc<HostEntry>, RegistryError> {
        self.inner
            .hosts
            .read()
            .await
            .entries
            .get(uuid)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(uuid.to_owned()))
    }

    /// Start the entry's session if polling is active. Must not be called with
    /// the entry's network lock held.
    async fn ensure_session_if_polling(&self, entry: &Arc<HostEntry>) {
        let hosts = self.inner.hosts.read().await;
        // Only sessions of hosts still in the map; a concurrent remove wins.
        if hosts.polling_active && hosts.entries.contains_key(&entry.uuid) {
            spawn_session(entry, self.ctx());
        }
    }

    /// Seed the registry with the persisted hosts and their cached catalogs.
    ///
    /// Returns the number of hosts loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    #[tracing::instrument(skip_all, err(Debug))]
    pub async fn load_from_store(&self) -> Result<usize, RegistryError> {
        let ctx = self.ctx();
        let records = ctx.store.load_all().await?;
        let mut loaded = 0_usize;
        for mut record in records {
            let Some(uuid) = record.uuid.clone() else {
                warn!("Skipping stored host without uuid");
                continue;
            };
            if record.raw_app_catalog.is_none() {
                match ctx.cache.read_app_catalog(&uuid).await {
                    Ok(raw) => record.raw_app_catalog = raw,
                    Err(e) => warn!("Could not read cached app catalog of {uuid}: {e}"),
                }
            }
            match self.add(record).await {
                Ok(_) => loaded = loaded.saturating_add(1),
                Err(e) => error!("Could not restore host {uuid}: {e}"),
            }
        }
        info!("Loaded {loaded} hosts from the store");
        Ok(loaded)
    }

    /// Register a host, or merge into the known host with the same uuid.
    ///
    /// # Errors
    ///
    /// Returns an error if the record has no uuid.
    #[tracing::instrument(skip_all, fields(host = ?record.uuid), err(Debug))]
    pub async fn add(&self, record: HostRecord) -> Result<Arc<HostRecord>, RegistryError> {
        let uuid = record.uuid.clone().ok_or(RegistryError::MissingUuid)?;
        let mut hosts = self.inner.hosts.write().await;
        if let Some(existing) = hosts.entries.get(&uuid).cloned() {
            drop(hosts);
            let snapshot = self.merge_into(&existing, &record).await?;
            self.ensure_session_if_polling(&existing).await;
            return Ok(snapshot);
        }

        let entry = Arc::new(HostEntry::new(uuid.clone(), record));
        hosts.entries.insert(uuid, Arc::clone(&entry));
        if hosts.polling_active {
            spawn_session(&entry, self.ctx());
        }
        drop(hosts);

        // Hold the lock so a concurrent remove cannot slip in before the first write.
        let network = entry.lock_network().await;
        let snapshot = entry.snapshot();
        if network.retired {
            return Ok(snapshot);
        }
        debug!("Registered new host {}", snapshot.label());
        self.ctx().persist(&snapshot).await;
        self.ctx().notify(&snapshot);
        drop(network);
        Ok(snapshot)
    }

    /// Merge under the host's network lock, persisting and notifying before releasing it.
    async fn merge_into(
        &self,
        entry: &HostEntry,
        partial: &HostRecord,
    ) -> Result<Arc<HostRecord>, RegistryError> {
        let network = entry.lock_network().await;
        if network.retired {
            return Err(RegistryError::NotFound(entry.uuid.clone()));
        }
        let snapshot = entry.try_update(|record| record.merge(partial))?;
        self.ctx().persist(&snapshot).await;
        self.ctx().notify(&snapshot);
        drop(network);
        Ok(snapshot)
    }

    /// Fold a partial observation into a known host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is unknown or `partial` names a different uuid.
    #[tracing::instrument(skip(self, partial), err(Debug))]
    pub async fn merge(
        &self,
        uuid: &str,
        partial: &HostRecord,
    ) -> Result<Arc<HostRecord>, RegistryError> {
        let entry = self.entry(uuid).await?;
        self.merge_into(&entry, partial).await
    }

    pub async fn get(&self, uuid: &str) -> Option<Arc<HostRecord>> {
        self.inner
            .hosts
            .read()
            .await
            .entries
            .get(uuid)
            .map(|entry| entry.snapshot())
    }

    /// Visit a snapshot of every host, ordered by uuid.
    pub async fn for_each(&self, mut f: impl FnMut(&Arc<HostRecord>)) {
        let hosts = self.inner.hosts.read().await;
        for entry in hosts.entries.values() {
            f(&entry.snapshot());
        }
    }

    pub async fn snapshots(&self) -> Vec<Arc<HostRecord>> {
        let mut out = Vec::new();
        self.for_each(|record| out.push(Arc::clone(record))).await;
        out
    }

    /// Watch every change to one host's record.
    pub async fn subscribe(&self, uuid: &str) -> Option<watch::Receiver<Arc<HostRecord>>> {
        self.inner
            .hosts
            .read()
            .await
            .entries
            .get(uuid)
            .map(|entry| entry.subscribe())
    }

    /// Forget a host: stop its tasks, then drop it from memory, store and cache.
    ///
    /// No notification for this host is emitted once this returns.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown hosts.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn remove_host(&self, uuid: &str) -> Result<(), RegistryError> {
        let entry = self
            .inner
            .hosts
            .write()
            .await
            .entries
            .remove(uuid)
            .ok_or_else(|| RegistryError::NotFound(uuid.to_owned()))?;
        entry.stop_tasks().await;
        // Waits for anyone still working on the host, and turns away late comers.
        entry.lock_network().await.retired = true;

        let ctx = self.ctx();
        if let Err(e) = ctx.store.delete(uuid).await {
            error!("Failed to delete host {uuid} from the store: {e}");
        }
        if let Err(e) = ctx.cache.remove(uuid).await {
            warn!("Failed to drop cached data of {uuid}: {e}");
        }
        info!("Removed host {uuid}");
        Ok(())
    }

    /// Start a polling session for every host, delivering changes to `notifier`.
    ///
    /// Hosts whose last successful poll is older than the poll data TTL are reset
    /// to [`HostState::Unknown`] first. Calling this while polling is a no-op
    /// apart from replacing the notifier.
    #[tracing::instrument(skip_all)]
    pub async fn start_polling(&self, notifier: Arc<dyn Notifier>) {
        let ctx = self.ctx();
        ctx.set_notifier(Some(notifier));
        let mut hosts = self.inner.hosts.write().await;
        if hosts.polling_active {
            return;
        }
        hosts.polling_active = true;
        let ttl = ctx.polling.poll_data_ttl();
        let now = Instant::now();
        for entry in hosts.entries.values() {
            let snapshot = entry.snapshot();
            let snapshot = if snapshot.is_stale(ttl, now) && snapshot.state != HostState::Unknown {
                debug!("Poll data of {} is stale", snapshot.label());
                entry.update(|r| r.state = HostState::Unknown).0
            } else {
                snapshot
            };
            ctx.notify(&snapshot);
            spawn_session(entry, ctx);
        }
        info!("Polling {} hosts", hosts.entries.len());
    }

    /// Stop every polling session and catalog poller and wait for them.
    ///
    /// Idempotent. No notifications are delivered after this returns.
    #[tracing::instrument(skip_all)]
    pub async fn stop_polling(&self) {
        let entries: Vec<_> = {
            let mut hosts = self.inner.hosts.write().await;
            hosts.polling_active = false;
            hosts.entries.values().cloned().collect()
        };
        join_all(entries.iter().map(|entry| entry.stop_tasks())).await;
        self.ctx().set_notifier(None);
        debug!("Polling stopped");
    }

    /// Race the addresses of a host that may not be known yet and register it
    /// if it answers.
    ///
    /// `limit` bounds the wait for the host to answer (and for its public
    /// address). Registering a host that answered in time always completes.
    ///
    /// Returns whether the host was reachable. A known host keeps the new
    /// observation even when it is not reachable right now.
    #[tracing::instrument(skip_all, fields(host = %partial.label()))]
    pub async fn add_host_blocking(&self, partial: HostRecord, limit: Duration) -> bool {
        match self.add_host_inner(partial, deadline_after(limit)).await {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!("Could not add host: {e}");
                false
            }
        }
    }

    async fn add_host_inner(
        &self,
        partial: HostRecord,
        deadline: Instant,
    ) -> Result<bool, RegistryError> {
        let ctx = self.ctx();

        if let Some(ref uuid) = partial.uuid
            && let Ok(entry) = self.entry(uuid).await
        {
            return self.refresh_known(&entry, &partial, deadline).await;
        }

        let race = race_addresses(&partial, &ctx.probe, &ctx.probe_limiter, &ctx.race);
        let outcome = match timeout_at(deadline, race).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                debug!("No address of {} answered", partial.label());
                return Ok(false);
            }
            Err(_) => {
                warn!("{} did not answer in time", partial.label());
                return Ok(false);
            }
        };

        // The user may have typed an address of a host we already know.
        let uuid = outcome.snapshot.uuid.clone();
        if let Ok(entry) = self.entry(&uuid).await {
            let mut observed = partial;
            observed.uuid = Some(uuid);
            apply_race(&mut observed, &outcome);
            self.merge_into(&entry, &observed).await?;
            self.ensure_session_if_polling(&entry).await;
            return Ok(true);
        }

        let mut record = partial;
        apply_race(&mut record, &outcome);
        match timeout_at(deadline, resolve_remote_address(ctx, &record)).await {
            Ok(Some(remote)) => record.addresses.remote = Some(remote),
            Ok(None) => {}
            Err(_) => debug!("No public address for {} in time", record.label()),
        }
        info!("Discovered host {} at {}", record.label(), outcome.active_address);
        self.add(record).await?;
        Ok(true)
    }

    /// Blocking add of a host we already know: race its merged addresses under
    /// its network lock so it does not interleave with its own session.
    async fn refresh_known(
        &self,
        entry: &Arc<HostEntry>,
        partial: &HostRecord,
        deadline: Instant,
    ) -> Result<bool, RegistryError> {
        let ctx = self.ctx();
        let mut poll_state = entry.lock_network().await;
        if poll_state.retired {
            return Err(RegistryError::NotFound(entry.uuid.clone()));
        }
        let mut candidate = HostRecord::clone(&entry.snapshot());
        candidate.merge(partial)?;
        let race = race_addresses(&candidate, &ctx.probe, &ctx.probe_limiter, &ctx.race);
        let outcome = timeout_at(deadline, race).await.ok().flatten();
        let reachable = outcome.is_some();
        let snapshot = entry.try_update(|record| {
            record.merge(partial)?;
            if let Some(ref outcome) = outcome {
                apply_race(record, outcome);
            }
            Ok::<_, MergeError>(())
        })?;
        if reachable {
            poll_state.consecutive_failures = 0;
        }
        ctx.persist(&snapshot).await;
        ctx.notify(&snapshot);
        drop(poll_state);
        self.ensure_session_if_polling(entry).await;
        Ok(reachable)
    }

    /// Poll a host right now, outside its schedule.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown hosts.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn force_poll_now(&self, uuid: &str) -> Result<HostState, RegistryError> {
        let entry = self.entry(uuid).await?;
        Ok(session::poll_cycle(&entry, self.ctx()).await)
    }

    /// Distrust everything known about a host's reachability until its next poll.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown hosts.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn invalidate(&self, uuid: &str) -> Result<(), RegistryError> {
        let entry = self.entry(uuid).await?;
        let mut poll_state = entry.lock_network().await;
        if poll_state.retired {
            return Err(RegistryError::NotFound(uuid.to_owned()));
        }
        poll_state.consecutive_failures = 0;
        let (snapshot, ()) = entry.update(|record| record.state = HostState::Unknown);
        self.ctx().notify(&snapshot);
        drop(poll_state);
        Ok(())
    }

    /// React to the local machine gaining or losing connectivity.
    ///
    /// Every host starts counting poll failures afresh.
    #[tracing::instrument(skip(self))]
    pub async fn on_network_change(&self, change: NetworkChange) {
        let state = match change {
            NetworkChange::Available => HostState::Unknown,
            NetworkChange::Lost => HostState::Offline,
        };
        let entries: Vec<_> = self.inner.hosts.read().await.entries.values().cloned().collect();
        for entry in &entries {
            let mut poll_state = entry.lock_network().await;
            if poll_state.retired {
                continue;
            }
            poll_state.consecutive_failures = 0;
            let (snapshot, ()) = entry.update(|record| record.state = state);
            self.ctx().notify(&snapshot);
            drop(poll_state);
        }
        info!("Network {change:?}, {} hosts now {state:?}", entries.len());
    }

    /// Start polling the app catalog of a host. No-op if it is already running.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown hosts.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn start_catalog_poller(&self, uuid: &str) -> Result<(), RegistryError> {
        let hosts = self.inner.hosts.read().await;
        let entry = hosts
            .entries
            .get(uuid)
            .ok_or_else(|| RegistryError::NotFound(uuid.to_owned()))?;
        let mut slot = entry.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.task.is_finished()) {
            return Ok(());
        }
        let wake = Arc::new(Notify::new());
        let span = info_span!("catalog_poller", host = %uuid);
        let task_entry = Arc::clone(entry);
        let ctx = Arc::clone(self.ctx());
        let task_wake = Arc::clone(&wake);
        *slot = Some(CatalogHandle {
            task: TaskHandle::spawn(move |cancel| {
                catalog::run(task_entry, ctx, task_wake, cancel).instrument(span)
            }),
            wake,
        });
        Ok(())
    }

    /// Stop the app catalog poller of a host and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown hosts.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn stop_catalog_poller(&self, uuid: &str) -> Result<(), RegistryError> {
        let entry = self.entry(uuid).await?;
        if let Some(handle) = entry.take_catalog() {
            handle.task.stop().await;
        }
        Ok(())
    }

    /// Wake the app catalog poller of a host early.
    ///
    /// Returns whether a poller was running.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown hosts.
    pub async fn poll_catalog_now(&self, uuid: &str) -> Result<bool, RegistryError> {
        let entry = self.entry(uuid).await?;
        let slot = entry.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Some(ref handle) => {
                handle.wake.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether polling sessions are currently running.
    pub async fn is_polling(&self) -> bool {
        self.inner.hosts.read().await.polling_active
    }
}
