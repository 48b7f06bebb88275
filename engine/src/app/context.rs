//! Collaborators and settings shared by every task of the engine.

use alloc::sync::Arc;
use std::sync::{PoisonError, RwLock};

use hostwatch_common::HostRecord;
use tokio::sync::Semaphore;
use tracing::error;

use crate::{
    app::race::RaceSettings,
    cache::CacheStore,
    config::{CatalogConfig, EngineConfig, PollingConfig, StunConfig},
    db::HostStore,
    notifier::Notifier,
    probe::{AddressProbe, AppCatalogSource},
    stun::StunResolver,
};

/// The engine's view of the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn AddressProbe>,
    pub catalog_source: Arc<dyn AppCatalogSource>,
    pub store: Arc<dyn HostStore>,
    pub cache: Arc<dyn CacheStore>,
    /// `None` disables external address resolution regardless of config.
    pub stun: Option<Arc<dyn StunResolver>>,
}

pub(crate) struct EngineContext {
    pub polling: PollingConfig,
    pub catalog: CatalogConfig,
    pub stun: StunConfig,
    pub race: RaceSettings,
    pub probe: Arc<dyn AddressProbe>,
    pub catalog_source: Arc<dyn AppCatalogSource>,
    pub store: Arc<dyn HostStore>,
    pub cache: Arc<dyn CacheStore>,
    pub stun_resolver: Option<Arc<dyn StunResolver>>,
    /// Shared by the races of all hosts.
    pub probe_limiter: Arc<Semaphore>,
    notifier: RwLock<Option<Arc<dyn Notifier>>>,
}

impl EngineContext {
    pub fn new(collaborators: Collaborators, config: &EngineConfig) -> Self {
        let Collaborators {
            probe,
            catalog_source,
            store,
            cache,
            stun,
        } = collaborators;
        Self {
            race: RaceSettings::from(&config.polling),
            polling: config.polling.clone(),
            catalog: config.catalog.clone(),
            stun: config.stun.clone(),
            probe,
            catalog_source,
            store,
            cache,
            stun_resolver: stun,
            probe_limiter: Arc::new(Semaphore::new(config.polling.max_concurrent_probes.max(1))),
            notifier: RwLock::new(None),
        }
    }

    pub fn set_notifier(&self, notifier: Option<Arc<dyn Notifier>>) {
        *self.notifier.write().unwrap_or_else(PoisonError::into_inner) = notifier;
    }

    /// Tell the current notifier, if polling is active.
    pub fn notify(&self, record: &Arc<HostRecord>) {
        let notifier = self
            .notifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notifier) = notifier {
            notifier.on_host_updated(record);
        }
    }

    /// Store failures are logged; the in-memory state stays authoritative.
    pub async fn persist(&self, record: &HostRecord) {
        if let Err(e) = self.store.upsert(record).await {
            error!("Failed to persist host {}: {e}", record.label());
        }
    }
}
