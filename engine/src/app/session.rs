//! The periodic poll loop of one host and the state machine it drives.
//!
//! ```text
//! Unknown --success--> Online
//! Unknown --initial_poll_tries failures--> Offline
//! Online  --offline_poll_tries failures--> Offline
//! Offline --success--> Online
//! ```

use alloc::sync::Arc;

use hostwatch_common::{HostAddress, HostRecord, HostState};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::{
    context::EngineContext,
    entry::HostEntry,
    race::{RaceOutcome, race_addresses},
};

/// Fold a successful race into the record.
pub(crate) fn apply_race(record: &mut HostRecord, outcome: &RaceOutcome) {
    record.apply_snapshot(&outcome.snapshot);
    record.set_reachable(
        outcome.active_address.clone(),
        outcome.available_addresses.clone(),
    );
    record.state = HostState::Online;
    record.last_successful_poll_at = Some(Instant::now());
}

/// The host's public address as seen from outside, if it is only known locally.
pub(crate) async fn resolve_remote_address(
    ctx: &EngineContext,
    record: &HostRecord,
) -> Option<HostAddress> {
    if !ctx.stun.enable || record.addresses.remote.is_some() {
        return None;
    }
    let active = record.active_address.as_ref()?;
    if !active.is_site_local() {
        return None;
    }
    let resolver = ctx.stun_resolver.as_ref()?;
    let ip = resolver
        .resolve_external_address(&ctx.stun.server, ctx.stun.port)
        .await?;
    // The host corrects the port once it is contacted through this address.
    let port = record.guess_external_port()?;
    Some(HostAddress::new(ip.to_string(), port))
}

/// Run one poll of `entry` under its network lock and return the resulting state.
pub(crate) async fn poll_cycle(entry: &HostEntry, ctx: &EngineContext) -> HostState {
    let mut poll_state = entry.lock_network().await;
    let record = entry.snapshot();
    if poll_state.retired {
        return record.state;
    }

    let Some(outcome) = race_addresses(&record, &ctx.probe, &ctx.probe_limiter, &ctx.race).await
    else {
        poll_state.consecutive_failures = poll_state.consecutive_failures.saturating_add(1);
        let tries = if record.state == HostState::Unknown {
            ctx.polling.initial_poll_tries
        } else {
            ctx.polling.offline_poll_tries
        };
        if poll_state.consecutive_failures < tries {
            debug!(
                "Poll failed ({}/{tries}), keeping state {:?}",
                poll_state.consecutive_failures, record.state
            );
            return record.state;
        }
        if record.state == HostState::Offline {
            return HostState::Offline;
        }
        info!("Host {} is offline", record.label());
        let (snapshot, ()) = entry.update(|r| r.state = HostState::Offline);
        ctx.persist(&snapshot).await;
        ctx.notify(&snapshot);
        return HostState::Offline;
    };

    poll_state.consecutive_failures = 0;
    let (mut snapshot, ()) = entry.update(|r| apply_race(r, &outcome));
    if record.state != HostState::Online {
        info!(
            "Host {} is online at {}",
            snapshot.label(),
            outcome.active_address
        );
        if let Some(remote) = resolve_remote_address(ctx, &snapshot).await {
            info!("Resolved remote address {remote} for {}", snapshot.label());
            snapshot = entry.update(|r| r.addresses.remote = Some(remote)).0;
        }
    }
    ctx.persist(&snapshot).await;
    ctx.notify(&snapshot);
    HostState::Online
}

/// Poll `entry` every polling period until cancelled.
pub(crate) async fn run(
    entry: Arc<HostEntry>,
    ctx: Arc<EngineContext>,
    cancel: CancellationToken,
) {
    debug!("Polling session started");
    // Failures counted by an earlier session say nothing about this one.
    tokio::select! {
        () = cancel.cancelled() => return,
        mut poll_state = entry.lock_network() => poll_state.consecutive_failures = 0,
    }
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            state = poll_cycle(&entry, &ctx) => debug!("Poll finished, host is {state:?}"),
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(ctx.polling.period()) => {}
        }
    }
    debug!("Polling session stopped");
}
