//! Host state transitions and registry bookkeeping, driven through the public engine API.

use std::{path::Path, sync::Arc, time::Duration};

use hostwatch_common::{HostRecord, HostState};
use hostwatch_engine::{
    NetworkChange, RegistryError,
    config::EngineConfig,
    db::{HostStore, SqliteStore},
};
use tokio::time::sleep;

use crate::common::{Harness, UUID, addr, drain, known_host, paired_snapshot};

const QUICK: Duration = Duration::from_millis(10);

#[tokio::test(start_paused = true)]
async fn never_online_host_goes_offline_after_two_failed_polls() {
    let harness = Harness::new("never_online", &EngineConfig::default());
    harness.probe.refuse("10.0.0.1");
    harness.registry.add(known_host("10.0.0.1")).await.unwrap();
    let mut updates = harness.start_polling().await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Unknown,
        "one failure is not enough"
    );

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Offline
    );
    let states: Vec<_> = drain(&mut updates).iter().map(|r| r.state).collect();
    assert_eq!(states, vec![HostState::Unknown, HostState::Offline]);

    // Staying offline is not news.
    sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut updates).is_empty(), "offline host re-notified");
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn online_host_survives_two_failed_polls() {
    let harness = Harness::new("online_three", &EngineConfig::default());
    harness
        .probe
        .answer("10.0.0.1", QUICK, paired_snapshot(UUID));
    harness.registry.add(known_host("10.0.0.1")).await.unwrap();
    let _updates = harness.start_polling().await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Online
    );

    // Polls at ~1.5 s, ~3 s and ~4.5 s fail.
    harness.probe.refuse("10.0.0.1");
    sleep(Duration::from_millis(3900)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Online,
        "two failures keep an online host online"
    );
    sleep(Duration::from_millis(600)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Offline
    );
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn stale_record_is_unknown_before_first_poll() {
    let harness = Harness::new("stale", &EngineConfig::default());
    // Persisted while online; the poll timestamp does not survive a restart.
    let persisted = HostRecord {
        state: HostState::Online,
        ..known_host("10.0.0.1")
    };
    harness.store.upsert(&persisted).await.unwrap();
    harness
        .probe
        .answer("10.0.0.1", Duration::from_millis(500), paired_snapshot(UUID));

    assert_eq!(harness.registry.load_from_store().await.unwrap(), 1);
    let mut updates = harness.start_polling().await;

    let first = updates.recv().await.unwrap();
    assert_eq!(first.state, HostState::Unknown, "stale data must not be shown as online");
    let second = updates.recv().await.unwrap();
    assert_eq!(second.state, HostState::Online);
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn freshly_polled_record_keeps_its_state() {
    let harness = Harness::new("fresh", &EngineConfig::default());
    harness.probe.answer("10.0.0.1", QUICK, paired_snapshot(UUID));
    assert!(
        harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.1")), Duration::from_secs(5))
            .await,
        "host answers"
    );
    let mut updates = harness.start_polling().await;
    assert_eq!(updates.recv().await.unwrap().state, HostState::Online);
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn removed_host_is_never_notified_again() {
    let harness = Harness::new("removed", &EngineConfig::default());
    harness.probe.answer("10.0.0.1", QUICK, paired_snapshot(UUID));
    harness.registry.add(known_host("10.0.0.1")).await.unwrap();
    let mut updates = harness.start_polling().await;

    sleep(Duration::from_secs(4)).await;
    assert!(!drain(&mut updates).is_empty(), "polls notify");

    harness.registry.remove_host(UUID).await.unwrap();
    drain(&mut updates);
    let calls = harness.probe.calls();

    sleep(Duration::from_secs(10)).await;
    assert!(drain(&mut updates).is_empty(), "notified after removal");
    assert_eq!(harness.probe.calls(), calls, "removed host still polled");
    assert!(harness.registry.get(UUID).await.is_none());
    assert!(harness.store.load_all().await.unwrap().is_empty());
    assert!(matches!(
        harness.registry.remove_host(UUID).await,
        Err(RegistryError::NotFound(_))
    ));
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_new_host_is_not_registered() {
    let harness = Harness::new("unreachable", &EngineConfig::default());
    harness.probe.refuse("10.0.0.9");
    assert!(
        !harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.9")), Duration::from_secs(5))
            .await
    );
    assert!(harness.registry.snapshots().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn blocking_add_gives_up_after_its_limit() {
    let harness = Harness::new("add_limit", &EngineConfig::default());
    harness
        .probe
        .answer("10.0.0.1", Duration::from_secs(60), paired_snapshot(UUID));
    let started = tokio::time::Instant::now();
    assert!(
        !harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.1")), Duration::from_secs(1))
            .await
    );
    assert!(
        started.elapsed() <= Duration::from_millis(1005),
        "waited {:?}",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn blocking_add_finishes_registering_a_host_that_answered_in_time() {
    let harness = Harness::new("add_in_time", &EngineConfig::default());
    harness
        .probe
        .answer("10.0.0.1", Duration::from_millis(900), paired_snapshot(UUID));
    // The public address lookup outlasts the limit.
    harness.stun.answer("203.0.113.7", Duration::from_secs(5));
    let started = tokio::time::Instant::now();
    assert!(
        harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.1")), Duration::from_secs(1))
            .await,
        "answered within the limit"
    );
    assert!(
        started.elapsed() <= Duration::from_millis(1005),
        "waited {:?}",
        started.elapsed()
    );
    assert_eq!(harness.stun.calls(), 1);
    let record = harness.registry.get(UUID).await.unwrap();
    assert_eq!(record.state, HostState::Online);
    assert_eq!(record.addresses.remote, None, "lookup ran out of time");
    assert_eq!(harness.store.load_all().await.unwrap().len(), 1, "persisted");
}

#[tokio::test(start_paused = true)]
async fn reconnect_restarts_the_failure_count() {
    let harness = Harness::new("reconnect", &EngineConfig::default());
    harness.probe.answer("10.0.0.1", QUICK, paired_snapshot(UUID));
    harness.registry.add(known_host("10.0.0.1")).await.unwrap();
    let _updates = harness.start_polling().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Online
    );

    // Polls keep failing while the network is gone.
    harness.probe.refuse("10.0.0.1");
    harness.registry.on_network_change(NetworkChange::Lost).await;
    sleep(Duration::from_secs(6)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Offline
    );

    harness.registry.on_network_change(NetworkChange::Available).await;
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Unknown,
        "one failure after reconnecting is not enough"
    );
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Offline
    );
    harness.registry.stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn invalidate_and_network_changes_reset_state() {
    let harness = Harness::new("invalidate", &EngineConfig::default());
    harness.probe.answer("10.0.0.1", QUICK, paired_snapshot(UUID));
    assert!(
        harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.1")), Duration::from_secs(5))
            .await
    );
    harness.registry.invalidate(UUID).await.unwrap();
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Unknown
    );

    assert_eq!(
        harness.registry.force_poll_now(UUID).await.unwrap(),
        HostState::Online
    );

    harness.registry.on_network_change(NetworkChange::Lost).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Offline
    );
    harness.registry.on_network_change(NetworkChange::Available).await;
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().state,
        HostState::Unknown
    );
}

#[tokio::test]
async fn blocking_adds_are_persisted_and_merged_by_uuid() {
    let store = Arc::new(SqliteStore::open(Path::new(":memory:")).await.unwrap());
    let harness = Harness::with_store(
        "persisted",
        &EngineConfig::default(),
        Arc::<SqliteStore>::clone(&store),
    );
    harness.probe.answer("10.0.0.7", QUICK, paired_snapshot(UUID));
    harness.probe.answer("10.0.0.8", QUICK, paired_snapshot(UUID));

    assert!(
        harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.7")), Duration::from_secs(5))
            .await
    );
    let stored = store.load_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    let record = stored.first().unwrap();
    assert_eq!(record.uuid.as_deref(), Some(UUID));
    assert_eq!(record.active_address, Some(addr("10.0.0.7")));

    // Another address of the same machine ends up in the same record.
    assert!(
        harness
            .registry
            .add_host_blocking(HostRecord::with_manual_address(addr("10.0.0.8")), Duration::from_secs(5))
            .await
    );
    let hosts = harness.registry.snapshots().await;
    assert_eq!(hosts.len(), 1, "same uuid, same host");
    assert_eq!(
        hosts.first().unwrap().addresses.manual,
        Some(addr("10.0.0.8"))
    );

    harness.registry.remove_host(UUID).await.unwrap();
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn merge_rejects_a_different_uuid() {
    let harness = Harness::new("merge_uuid", &EngineConfig::default());
    harness.registry.add(known_host("10.0.0.1")).await.unwrap();
    let other = HostRecord {
        uuid: Some("someone-else".to_owned()),
        ..HostRecord::with_manual_address(addr("10.0.0.2"))
    };
    assert!(matches!(
        harness.registry.merge(UUID, &other).await,
        Err(RegistryError::Merge(_))
    ));
    assert_eq!(
        harness.registry.get(UUID).await.unwrap().addresses.manual,
        Some(addr("10.0.0.1")),
        "rejected merge left the record alone"
    );
}
