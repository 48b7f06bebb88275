//! Common utilities for integration tests.
//!
//! Scripted stand-ins for the network-facing collaborators, plus helpers to
//! build a registry around them.

use std::{
    collections::{HashMap, VecDeque},
    env, fs,
    net::IpAddr,
    path::PathBuf,
    process,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use hostwatch_common::{HostAddress, HostRecord, HostSnapshot, PairState};
use hostwatch_engine::{
    Collaborators, HostRegistry,
    cache::{CacheStore, FileCacheStore},
    config::EngineConfig,
    db::{HostStore, MemoryStore},
    probe::{AddressProbe, AppCatalogSource, ProbeError},
    stun::StunResolver,
};
use tokio::sync::mpsc;

pub const UUID: &str = "5D1B8E2A-0000-4000-8000-00000000000A";

pub fn addr(host: &str) -> HostAddress {
    HostAddress::new(host, 47989)
}

pub fn paired_snapshot(uuid: &str) -> HostSnapshot {
    HostSnapshot {
        pair_state: Some(PairState::Paired),
        ..HostSnapshot::new(uuid, "Den PC")
    }
}

/// A known host reachable only through `host`.
pub fn known_host(host: &str) -> HostRecord {
    HostRecord {
        uuid: Some(UUID.to_owned()),
        name: "Den PC".to_owned(),
        ..HostRecord::with_manual_address(addr(host))
    }
}

/// Answers per address; the script can be changed while the engine runs.
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<HashMap<HostAddress, (Duration, Result<HostSnapshot, ProbeError>)>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn answer(&self, host: &str, after: Duration, snapshot: HostSnapshot) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr(host), (after, Ok(snapshot)));
    }

    pub fn refuse(&self, host: &str) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).insert(
            addr(host),
            (Duration::ZERO, Err(ProbeError::Refused("scripted".to_owned()))),
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AddressProbe for ScriptedProbe {
    fn probe<'future_life>(
        &'future_life self,
        address: &'future_life HostAddress,
        _expected_uuid: Option<&'future_life str>,
        _timeout: Duration,
    ) -> BoxFuture<'future_life, Result<HostSnapshot, ProbeError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned();
        Box::pin(async move {
            let (after, result) =
                scripted.unwrap_or((Duration::ZERO, Err(ProbeError::Timeout)));
            tokio::time::sleep(after).await;
            result
        })
    }
}

/// Hands out the queued catalogs one per fetch, then fails.
#[derive(Default)]
pub struct ScriptedCatalog {
    queue: Mutex<VecDeque<String>>,
    fetches: AtomicUsize,
}

impl ScriptedCatalog {
    pub fn push(&self, raw: &str) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(raw.to_owned());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl AppCatalogSource for ScriptedCatalog {
    fn fetch_app_catalog<'future_life>(
        &'future_life self,
        _address: &'future_life HostAddress,
        _record: &'future_life HostRecord,
    ) -> BoxFuture<'future_life, Result<String, ProbeError>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Box::pin(async move { next.ok_or(ProbeError::Timeout) })
    }
}

/// Reports the same public address after a fixed delay, counting lookups.
/// Knows no address until told one.
#[derive(Default)]
pub struct ScriptedStun {
    script: Mutex<Option<(Duration, IpAddr)>>,
    calls: AtomicUsize,
}

impl ScriptedStun {
    pub fn answer(&self, ip: &str, after: Duration) {
        let ip = ip.parse().unwrap();
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = Some((after, ip));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StunResolver for ScriptedStun {
    fn resolve_external_address<'future_life>(
        &'future_life self,
        _server: &'future_life str,
        _port: u16,
    ) -> BoxFuture<'future_life, Option<IpAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = *self.script.lock().unwrap_or_else(PoisonError::into_inner);
        Box::pin(async move {
            let (after, ip) = scripted?;
            tokio::time::sleep(after).await;
            Some(ip)
        })
    }
}

/// A fresh, unique cache directory below the system temp dir.
pub fn temp_cache_dir(test: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("hostwatch_it_{test}_{}", process::id()));
    drop(fs::remove_dir_all(&dir));
    dir
}

pub struct Harness {
    pub registry: HostRegistry,
    pub probe: Arc<ScriptedProbe>,
    pub catalog: Arc<ScriptedCatalog>,
    pub stun: Arc<ScriptedStun>,
    pub store: Arc<dyn HostStore>,
    pub cache: Arc<dyn CacheStore>,
}

impl Harness {
    pub fn new(test: &str, config: &EngineConfig) -> Self {
        Self::with_store(test, config, Arc::new(MemoryStore::default()))
    }

    pub fn with_store(test: &str, config: &EngineConfig, store: Arc<dyn HostStore>) -> Self {
        let cache = Arc::new(FileCacheStore::new(temp_cache_dir(test)));
        Self::assemble(config, store, cache)
    }

    pub fn with_cache(config: &EngineConfig, cache: Arc<dyn CacheStore>) -> Self {
        Self::assemble(config, Arc::new(MemoryStore::default()), cache)
    }

    fn assemble(
        config: &EngineConfig,
        store: Arc<dyn HostStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let probe = Arc::new(ScriptedProbe::default());
        let catalog = Arc::new(ScriptedCatalog::default());
        let stun = Arc::new(ScriptedStun::default());
        let registry = HostRegistry::new(
            Collaborators {
                probe: Arc::<ScriptedProbe>::clone(&probe),
                catalog_source: Arc::<ScriptedCatalog>::clone(&catalog),
                store: Arc::clone(&store),
                cache: Arc::clone(&cache),
                stun: Some(Arc::<ScriptedStun>::clone(&stun)),
            },
            config,
        );
        Self {
            registry,
            probe,
            catalog,
            stun,
            store,
            cache,
        }
    }

    /// Start polling and hand back everything the engine notifies about.
    pub async fn start_polling(&self) -> mpsc::UnboundedReceiver<Arc<HostRecord>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.start_polling(Arc::new(tx)).await;
        rx
    }
}

/// Everything received so far, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<HostRecord>>) -> Vec<Arc<HostRecord>> {
    let mut out = Vec::new();
    while let Ok(record) = rx.try_recv() {
        out.push(record);
    }
    out
}
