//! App catalog polling: caching, empty-catalog suppression and manual wake-ups.

use std::{io, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use hostwatch_common::HostRecord;
use hostwatch_engine::{
    NetworkChange,
    cache::{CacheError, CacheStore},
    config::EngineConfig,
};
use tokio::time::sleep;

use crate::common::{Harness, UUID, addr, drain, paired_snapshot};

const FULL: &str = r#"[{"id":1,"title":"Desktop"},{"id":7,"title":"Steam"}]"#;
const EMPTY: &str = "[]";

fn quick_catalog_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.catalog.period_ms = 1000;
    config.catalog.retry_ms = 100;
    config.catalog.empty_threshold = 3;
    config
}

/// A cache whose disk is always full.
struct FullDiskCache;

impl CacheStore for FullDiskCache {
    fn write_app_catalog<'future_life>(
        &'future_life self,
        _uuid: &'future_life str,
        _raw: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), CacheError>> {
        Box::pin(async { Err(CacheError::Io(io::Error::other("no space left on device"))) })
    }

    fn read_app_catalog<'future_life>(
        &'future_life self,
        _uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<Option<String>, CacheError>> {
        Box::pin(async { Ok(None) })
    }

    fn remove<'future_life>(
        &'future_life self,
        _uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), CacheError>> {
        Box::pin(async { Ok(()) })
    }
}

/// A registry with one online, paired host.
async fn online_host(test: &str) -> Harness {
    register_online_host(Harness::new(test, &quick_catalog_config())).await
}

async fn register_online_host(harness: Harness) -> Harness {
    harness
        .probe
        .answer("10.0.0.1", Duration::from_millis(10), paired_snapshot(UUID));
    assert!(
        harness
            .registry
            .add_host_blocking(
                HostRecord::with_manual_address(addr("10.0.0.1")),
                Duration::from_secs(5)
            )
            .await,
        "host answers"
    );
    harness
}

async fn cached(harness: &Harness) -> Option<String> {
    harness.cache.read_app_catalog(UUID).await.unwrap()
}

async fn known(harness: &Harness) -> Option<String> {
    harness.registry.get(UUID).await.unwrap().raw_app_catalog.clone()
}

#[tokio::test(start_paused = true)]
async fn fetched_catalog_is_cached_and_kept() {
    let harness = online_host("catalog_cached").await;
    harness.catalog.push(FULL);
    harness.registry.start_catalog_poller(UUID).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(known(&harness).await.as_deref(), Some(FULL));
    assert_eq!(cached(&harness).await.as_deref(), Some(FULL));
    harness.registry.stop_catalog_poller(UUID).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn catalog_is_kept_and_announced_when_caching_fails() {
    let harness = register_online_host(Harness::with_cache(
        &quick_catalog_config(),
        Arc::new(FullDiskCache),
    ))
    .await;
    let mut updates = harness.start_polling().await;
    harness.catalog.push(FULL);
    harness.registry.start_catalog_poller(UUID).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(known(&harness).await.as_deref(), Some(FULL));
    assert_eq!(cached(&harness).await, None, "nothing could be cached");
    assert!(
        drain(&mut updates)
            .iter()
            .any(|record| record.raw_app_catalog.as_deref() == Some(FULL)),
        "observers hear about the new catalog"
    );
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn two_empty_catalogs_are_ignored() {
    let harness = online_host("catalog_two_empty").await;
    for raw in [FULL, EMPTY, EMPTY] {
        harness.catalog.push(raw);
    }
    harness.registry.start_catalog_poller(UUID).await.unwrap();

    sleep(Duration::from_secs(3)).await;
    assert!(harness.catalog.fetches() >= 3, "all scripted catalogs fetched");
    assert_eq!(known(&harness).await.as_deref(), Some(FULL));
    assert_eq!(cached(&harness).await.as_deref(), Some(FULL));
    harness.registry.stop_catalog_poller(UUID).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn third_empty_catalog_is_believed() {
    let harness = online_host("catalog_three_empty").await;
    for raw in [FULL, EMPTY, EMPTY, EMPTY] {
        harness.catalog.push(raw);
    }
    harness.registry.start_catalog_poller(UUID).await.unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(known(&harness).await.as_deref(), Some(EMPTY));
    assert_eq!(cached(&harness).await.as_deref(), Some(EMPTY));
    harness.registry.stop_catalog_poller(UUID).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn poll_now_cuts_the_wait_short() {
    let harness = online_host("catalog_wake").await;
    harness.catalog.push(FULL);
    assert!(
        !harness.registry.poll_catalog_now(UUID).await.unwrap(),
        "no poller yet"
    );
    harness.registry.start_catalog_poller(UUID).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.catalog.fetches(), 1);

    // After a good catalog the next fetch is a full period away.
    assert!(harness.registry.poll_catalog_now(UUID).await.unwrap());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.catalog.fetches(), 2, "woken early");

    harness.registry.stop_catalog_poller(UUID).await.unwrap();
    assert!(!harness.registry.poll_catalog_now(UUID).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn offline_host_is_not_asked_for_its_catalog() {
    let harness = online_host("catalog_offline").await;
    harness.catalog.push(FULL);
    harness
        .registry
        .on_network_change(NetworkChange::Lost)
        .await;
    harness.registry.start_catalog_poller(UUID).await.unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.catalog.fetches(), 0);
    assert_eq!(known(&harness).await, None);
    harness.registry.stop_catalog_poller(UUID).await.unwrap();
}
