//! Racing a host's candidate addresses against each other.
//!
//! Every distinct address gets one probe task. The first probe that reports the
//! expected host wins and becomes the active address; probes finishing within
//! the collection window after that are recorded as secondary addresses.

use alloc::sync::Arc;
use core::time::Duration;

use hostwatch_common::{
    AddressRole, CandidateAddresses, HostAddress, HostRecord, HostSnapshot, HostState,
};
use serde::Serialize;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, warn};

use crate::{
    config::PollingConfig,
    probe::{AddressProbe, ProbeError},
};

/// Timing knobs of a single race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceSettings {
    pub probe_timeout: Duration,
    /// Used instead of `probe_timeout` for the address an online host is active on.
    pub online_probe_timeout: Duration,
    pub collection_window: Duration,
}

impl From<&PollingConfig> for RaceSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout(),
            online_probe_timeout: config.online_probe_timeout(),
            collection_window: config.collection_window(),
        }
    }
}

/// Result of a race with at least one successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceOutcome {
    /// What the primary address answered.
    pub snapshot: HostSnapshot,
    pub active_address: HostAddress,
    /// Primary first, then secondaries in completion order.
    pub available_addresses: Vec<HostAddress>,
    /// Roles whose address answered as the same host.
    pub confirmed_roles: Vec<AddressRole>,
}

/// Stand-in for "never" when a configured wait does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The instant `wait` from now, capped to the far future.
pub(crate) fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// One probe target. Several roles may share an address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    address: HostAddress,
    roles: Vec<AddressRole>,
}

fn distinct_candidates(addresses: &CandidateAddresses) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();
    for (role, address) in addresses.iter() {
        match candidates.iter_mut().find(|c| c.address == *address) {
            Some(existing) => existing.roles.push(role),
            None => candidates.push(Candidate {
                address: address.clone(),
                roles: vec![role],
            }),
        }
    }
    candidates
}

/// Probe one address under the global limiter and verify the identity it reports.
async fn probe_one(
    probe: &dyn AddressProbe,
    limiter: &Semaphore,
    address: &HostAddress,
    expected_uuid: Option<&str>,
    probe_timeout: Duration,
) -> Result<HostSnapshot, ProbeError> {
    let _permit = limiter.acquire().await.map_err(|_| ProbeError::Cancelled)?;
    let snapshot = timeout(
        probe_timeout,
        probe.probe(address, expected_uuid, probe_timeout),
    )
    .await
    .map_err(|_| ProbeError::Timeout)??;

    if snapshot.uuid.is_empty() {
        return Err(ProbeError::Malformed("response carries no uuid".to_owned()));
    }
    if let Some(expected) = expected_uuid
        && expected != snapshot.uuid
    {
        return Err(ProbeError::WrongUuid {
            expected: expected.to_owned(),
            actual: snapshot.uuid,
        });
    }
    Ok(snapshot)
}

fn log_failure(address: &HostAddress, err: &ProbeError) {
    match *err {
        ProbeError::Malformed(_) => warn!("Probe of {address} failed: {err}"),
        _ => debug!("Probe of {address} failed: {err}"),
    }
}

type ProbeResult = (usize, Result<HostSnapshot, ProbeError>);

/// Race all candidate addresses of `record`.
///
/// Returns `None` when no address answered as the expected host. Never mutates
/// the record; applying the outcome is up to the caller. Probes still running
/// when this returns are cancelled in the background.
pub async fn race_addresses(
    record: &HostRecord,
    probe: &Arc<dyn AddressProbe>,
    limiter: &Arc<Semaphore>,
    settings: &RaceSettings,
) -> Option<RaceOutcome> {
    let candidates = distinct_candidates(&record.addresses);
    if candidates.is_empty() {
        debug!("No candidate addresses for {}", record.label());
        return None;
    }

    let cancel = CancellationToken::new();
    // Cancels the probes that are still in flight once we return, however we return.
    let _cancel_on_return = cancel.clone().drop_guard();
    let mut tasks: JoinSet<ProbeResult> = JoinSet::new();

    for (index, candidate) in candidates.iter().enumerate() {
        let probe_timeout = if record.state == HostState::Online
            && record.active_address.as_ref() == Some(&candidate.address)
        {
            settings.online_probe_timeout
        } else {
            settings.probe_timeout
        };
        let probe = Arc::clone(probe);
        let limiter = Arc::clone(limiter);
        let address = candidate.address.clone();
        let expected_uuid = record.uuid.clone();
        let cancel = cancel.clone();
        tasks.spawn(
            async move {
                let result = tokio::select! {
                    () = cancel.cancelled() => Err(ProbeError::Cancelled),
                    result = probe_one(
                        probe.as_ref(),
                        &limiter,
                        &address,
                        expected_uuid.as_deref(),
                        probe_timeout,
                    ) => result,
                };
                (index, result)
            }
            .in_current_span(),
        );
    }

    let (primary_index, snapshot) = loop {
        match tasks.join_next().await? {
            Ok((index, Ok(snapshot))) => break (index, snapshot),
            Ok((index, Err(e))) => {
                if let Some(candidate) = candidates.get(index) {
                    log_failure(&candidate.address, &e);
                }
            }
            Err(e) => warn!("Probe task failed: {e}"),
        }
    };

    let mut confirmed = vec![primary_index];
    let deadline = deadline_after(settings.collection_window);
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((index, Ok(other))))) if other.uuid == snapshot.uuid => {
                confirmed.push(index);
            }
            Ok(Some(Ok((index, Ok(other))))) => {
                if let Some(candidate) = candidates.get(index) {
                    debug!(
                        "{} answered as '{}' instead of '{}', ignoring",
                        candidate.address, other.uuid, snapshot.uuid
                    );
                }
            }
            Ok(Some(Ok((index, Err(e))))) => {
                if let Some(candidate) = candidates.get(index) {
                    log_failure(&candidate.address, &e);
                }
            }
            Ok(Some(Err(e))) => warn!("Probe task failed: {e}"),
            // Every probe has reported back.
            Ok(None) => break,
            Err(_) => {
                debug!(
                    "Collection window closed with {} probes outstanding",
                    tasks.len()
                );
                break;
            }
        }
    }
    // Dropping the set aborts whatever is left without waiting for it.
    drop(tasks);

    let mut available_addresses = Vec::with_capacity(confirmed.len());
    let mut confirmed_roles = Vec::new();
    for candidate in confirmed.iter().filter_map(|&index| candidates.get(index)) {
        available_addresses.push(candidate.address.clone());
        confirmed_roles.extend(candidate.roles.iter().copied());
    }
    let Some(active_address) = available_addresses.first().cloned() else {
        unreachable!("The primary address is always confirmed");
    };
    Some(RaceOutcome {
        snapshot,
        active_address,
        available_addresses,
        confirmed_roles,
    })
}
