//! Wiring the engine up for the `watch` and `probe` commands.

use alloc::sync::Arc;
use core::time::Duration;
use std::path::Path;

use eyre::{WrapErr as _, eyre};
use hostwatch_common::{AddressRole, HostRecord, HostState, PairState};
use tokio::{
    signal,
    sync::{Semaphore, broadcast},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, error, info, info_span, warn};

use crate::{
    app::{Collaborators, HostRegistry, RaceSettings, race_addresses},
    cache::{CacheStore, FileCacheStore},
    cli::ProbeArgs,
    config::{self, EngineConfig, MAX_CONCURRENT_PROBES, resolve_config_relative_paths},
    db::{HostStore, MemoryStore, SqliteStore},
    discovery::{RegistryListener, run_mdns_discovery},
    notifier::Notifier,
    probe::{AddressProbe, AppCatalogSource, HttpProbe},
    stun::{StunResolver, UdpStunResolver},
};

/// Buffered notifications before a slow printer starts losing some.
const UPDATE_BUFFER: usize = 256;

/// Creates a future that resolves when a shutdown signal is received.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler, only Ctrl-C will stop us: {e}");
                drop(signal::ctrl_c().await);
            }
        }
    }
    #[cfg(not(unix))]
    {
        drop(signal::ctrl_c().await);
    }
}

async fn open_store(config: &EngineConfig, config_path: &Path) -> eyre::Result<Arc<dyn HostStore>> {
    match config.db {
        Some(ref db) if db.enable => {
            let path = resolve_config_relative_paths(config_path, &db.path);
            let store = SqliteStore::open(&path)
                .await
                .wrap_err(format!("Failed to open host database at {}", path.display()))?;
            info!("Persisting hosts in {}", path.display());
            Ok(Arc::new(store))
        }
        _ => {
            info!("No database configured, hosts are only kept in memory");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

/// Print every host update as a JSON line and keep catalog pollers running for
/// hosts that are online and paired.
async fn print_updates(registry: HostRegistry, mut updates: broadcast::Receiver<Arc<HostRecord>>) {
    loop {
        let record = match updates.recv().await {
            Ok(record) => record,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Skipped {skipped} host updates");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match serde_json::to_string(&*record) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Failed to serialize host {}: {e}", record.label()),
        }
        if record.state == HostState::Online
            && record.pair_state == Some(PairState::Paired)
            && let Some(ref uuid) = record.uuid
            && registry.is_polling().await
            && let Err(e) = registry.start_catalog_poller(uuid).await
        {
            // The host may have been removed in the meantime.
            warn!("Could not start catalog poller: {e}");
        }
    }
}

/// Run the engine until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded or the store cannot be opened.
pub async fn watch(config_path: &Path) -> eyre::Result<()> {
    let config = config::load(config_path).await?;

    let store = open_store(&config, config_path).await?;
    let cache: Arc<dyn CacheStore> = Arc::new(FileCacheStore::new(resolve_config_relative_paths(
        config_path,
        &config.cache.dir,
    )));
    let http = Arc::new(HttpProbe::new(config.client.unique_id.clone()));
    let probe: Arc<dyn AddressProbe> = Arc::<HttpProbe>::clone(&http);
    let catalog_source: Arc<dyn AppCatalogSource> = http;
    let stun: Option<Arc<dyn StunResolver>> = if config.stun.enable {
        Some(Arc::new(UdpStunResolver::default()))
    } else {
        None
    };

    let registry = HostRegistry::new(
        Collaborators {
            probe,
            catalog_source,
            store,
            cache,
            stun,
        },
        &config,
    );
    registry
        .load_from_store()
        .await
        .wrap_err("Failed to load known hosts")?;

    let (updates_tx, updates_rx) = broadcast::channel(UPDATE_BUFFER);
    let printer = tokio::spawn(print_updates(registry.clone(), updates_rx).in_current_span());
    let notifier: Arc<dyn Notifier> = Arc::new(updates_tx);
    registry.start_polling(notifier).await;

    let cancel = CancellationToken::new();
    let mut background = JoinSet::new();
    let add_timeout = config.polling.add_host_timeout();
    for manual in &config.hosts {
        let address = match manual.to_address() {
            Ok(address) => address,
            Err(e) => {
                error!("Ignoring configured host '{}': {e}", manual.address);
                continue;
            }
        };
        let registry = registry.clone();
        let span = info_span!("manual_host", %address);
        background.spawn(
            async move {
                if !registry
                    .add_host_blocking(HostRecord::with_manual_address(address), add_timeout)
                    .await
                {
                    warn!("Configured host is not reachable right now");
                }
            }
            .instrument(span),
        );
    }

    if config.discovery.enable {
        let listener = RegistryListener::new(registry.clone(), add_timeout);
        let service_type = config.discovery.service_type.clone();
        let cancel = cancel.clone();
        background.spawn(
            async move {
                // Failures were already reported to the listener.
                drop(run_mdns_discovery(&service_type, &listener, &cancel).await);
            }
            .instrument(info_span!("discovery")),
        );
    }

    shutdown_signal().await;
    info!("Received shutdown, shutting down");
    cancel.cancel();
    background.shutdown().await;
    registry.stop_polling().await;
    // The registry dropped its notifier, closing the channel once the printer drains it.
    if let Err(e) = printer.await {
        warn!("Update printer failed: {e}");
    }
    Ok(())
}

/// Race the given addresses once and print the outcome as JSON.
///
/// # Errors
///
/// Returns an error if no address answered.
pub async fn probe_once(args: ProbeArgs) -> eyre::Result<()> {
    let mut record = HostRecord {
        uuid: args.uuid,
        ..HostRecord::default()
    };
    for (role, address) in AddressRole::RACE_ORDER.into_iter().zip(args.addresses) {
        *record.addresses.slot_mut(role) = Some(address);
    }

    let probe: Arc<dyn AddressProbe> = Arc::new(HttpProbe::new(args.unique_id));
    let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let timeout = Duration::from_millis(args.timeout_ms);
    let settings = RaceSettings {
        probe_timeout: timeout,
        online_probe_timeout: timeout,
        collection_window: Duration::from_millis(args.window_ms),
    };

    let outcome = race_addresses(&record, &probe, &limiter, &settings)
        .await
        .ok_or_else(|| eyre!("No address answered as {}", record.label()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).wrap_err("Failed to serialize race outcome")?
    );
    Ok(())
}
