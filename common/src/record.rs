//! The per-host record and the rules for folding new observations into it.
//!
//! Observations come from several places (a manual add, local network discovery,
//! the persisted record, each poll), and each of them usually only knows part of
//! the picture. [`HostRecord::merge`] is therefore a merge, never an overwrite:
//!
//! | field | rule |
//! |---|---|
//! | `uuid` | write-once, a different incoming uuid is rejected |
//! | `name` | incoming if non-empty |
//! | candidate addresses | per role, incoming if present |
//! | `active_address` + `available_addresses` | replaced together, only if incoming has an active address |
//! | `state` | never merged, only poll outcomes change it |
//! | pairing, certificate, catalog, ports, mac | incoming if present |
//! | `last_successful_poll_at` | the newer one |

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::time::{Duration, Instant};

use crate::{address::HostAddress, protocol::HostSnapshot};

/// Reachability of a host as derived from poll outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// No trustworthy poll data (new host, or data older than the TTL).
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Pairing status of this client with a host. Opaque to the polling engine
/// except as a gate for app catalog polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    NotPaired,
    Paired,
    Failed,
    AlreadyInProgress,
}

/// The ways we may know how to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressRole {
    /// Address on the local network, usually learned via discovery.
    Local,
    /// Address entered by the user.
    Manual,
    /// WAN address, reported by the host or resolved via STUN.
    Remote,
    Ipv6,
}

impl AddressRole {
    /// Order in which candidate roles are probed. When two roles share an address,
    /// the earlier role owns the probe.
    pub const RACE_ORDER: [Self; 4] = [Self::Local, Self::Manual, Self::Remote, Self::Ipv6];
}

/// One optional address per [`AddressRole`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAddresses {
    #[serde(default)]
    pub local: Option<HostAddress>,
    #[serde(default)]
    pub manual: Option<HostAddress>,
    #[serde(default)]
    pub remote: Option<HostAddress>,
    #[serde(default)]
    pub ipv6: Option<HostAddress>,
}

impl CandidateAddresses {
    pub const fn get(&self, role: AddressRole) -> Option<&HostAddress> {
        match role {
            AddressRole::Local => self.local.as_ref(),
            AddressRole::Manual => self.manual.as_ref(),
            AddressRole::Remote => self.remote.as_ref(),
            AddressRole::Ipv6 => self.ipv6.as_ref(),
        }
    }

    pub const fn slot_mut(&mut self, role: AddressRole) -> &mut Option<HostAddress> {
        match role {
            AddressRole::Local => &mut self.local,
            AddressRole::Manual => &mut self.manual,
            AddressRole::Remote => &mut self.remote,
            AddressRole::Ipv6 => &mut self.ipv6,
        }
    }

    /// Present addresses in [`AddressRole::RACE_ORDER`].
    pub fn iter(&self) -> impl Iterator<Item = (AddressRole, &HostAddress)> {
        AddressRole::RACE_ORDER
            .into_iter()
            .filter_map(|role| self.get(role).map(|address| (role, address)))
    }

    pub const fn is_empty(&self) -> bool {
        self.local.is_none() && self.manual.is_none() && self.remote.is_none() && self.ipv6.is_none()
    }

    fn merge(&mut self, incoming: &Self) {
        for (role, address) in incoming.iter() {
            *self.slot_mut(role) = Some(address.clone());
        }
    }
}

/// Pinned server certificate. Never generated here, only carried along.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCertificate(pub Vec<u8>);

impl core::fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ServerCertificate({} bytes)", self.0.len())
    }
}

/// Errors raised when folding an observation into a record.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum MergeError {
    #[error("Refusing to change host uuid from '{existing}' to '{incoming}'")]
    UuidMismatch { existing: String, incoming: String },
}

/// Everything known about one streaming host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Assigned by the host on the first successful probe; write-once afterwards.
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default)]
    pub addresses: CandidateAddresses,
    /// Candidates confirmed reachable by the most recent race, primary first.
    #[serde(default)]
    pub available_addresses: Vec<HostAddress>,
    /// Always a member of `available_addresses` when set.
    #[serde(default)]
    pub active_address: Option<HostAddress>,
    #[serde(default)]
    pub state: HostState,
    #[serde(default)]
    pub pair_state: Option<PairState>,
    #[serde(default)]
    pub server_certificate: Option<ServerCertificate>,
    #[serde(default)]
    pub https_port: Option<u16>,
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Last known raw app catalog, owned by the catalog poller.
    #[serde(default, skip_serializing)]
    pub raw_app_catalog: Option<String>,
    /// Monotonic, so it is meaningless across restarts and never persisted.
    #[serde(skip)]
    pub last_successful_poll_at: Option<Instant>,
}

impl HostRecord {
    /// A record for a host the user typed in by address.
    pub fn with_manual_address(address: HostAddress) -> Self {
        Self {
            addresses: CandidateAddresses {
                manual: Some(address),
                ..CandidateAddresses::default()
            },
            ..Self::default()
        }
    }

    /// Name for log lines: the display name, falling back to uuid or first address.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        if let Some(ref uuid) = self.uuid {
            return uuid.clone();
        }
        self.addresses
            .iter()
            .next()
            .map_or_else(|| "<unaddressed host>".to_owned(), |(_, address)| address.to_string())
    }

    /// Fold another observation of the same host into this record.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::UuidMismatch`] if both records carry different uuids.
    /// The record is left untouched in that case.
    pub fn merge(&mut self, incoming: &Self) -> Result<(), MergeError> {
        if let Some(ref new) = incoming.uuid {
            match self.uuid {
                Some(ref existing) if existing != new => {
                    return Err(MergeError::UuidMismatch {
                        existing: existing.clone(),
                        incoming: new.clone(),
                    });
                }
                Some(_) => {}
                None => self.uuid = Some(new.clone()),
            }
        }

        if !incoming.name.is_empty() {
            self.name.clone_from(&incoming.name);
        }
        self.addresses.merge(&incoming.addresses);
        if let Some(ref active) = incoming.active_address {
            self.set_reachable(active.clone(), incoming.available_addresses.clone());
        }

        merge_option(&mut self.pair_state, incoming.pair_state);
        merge_option(&mut self.https_port, incoming.https_port);
        merge_option(&mut self.external_port, incoming.external_port);
        if incoming.server_certificate.is_some() {
            self.server_certificate.clone_from(&incoming.server_certificate);
        }
        if incoming.mac_address.is_some() {
            self.mac_address.clone_from(&incoming.mac_address);
        }
        if incoming.raw_app_catalog.is_some() {
            self.raw_app_catalog.clone_from(&incoming.raw_app_catalog);
        }
        self.last_successful_poll_at =
            match (self.last_successful_poll_at, incoming.last_successful_poll_at) {
                (Some(ours), Some(theirs)) => Some(ours.max(theirs)),
                (ours, theirs) => ours.or(theirs),
            };
        Ok(())
    }

    /// Take identity and metadata from a probe response.
    ///
    /// The caller is responsible for having checked the uuid against the record.
    pub fn apply_snapshot(&mut self, snapshot: &HostSnapshot) {
        if self.uuid.is_none() {
            self.uuid = Some(snapshot.uuid.clone());
        }
        if !snapshot.name.is_empty() {
            self.name.clone_from(&snapshot.name);
        }
        merge_option(&mut self.pair_state, snapshot.pair_state);
        merge_option(&mut self.https_port, snapshot.https_port);
        merge_option(&mut self.external_port, snapshot.external_port);
        if snapshot.mac_address.is_some() {
            self.mac_address.clone_from(&snapshot.mac_address);
        }
    }

    /// Replace the reachability result, keeping `active` a member of `available`
    /// and `available` free of duplicates.
    pub fn set_reachable(&mut self, active: HostAddress, available: Vec<HostAddress>) {
        let mut deduped: Vec<HostAddress> = Vec::with_capacity(available.len().saturating_add(1));
        deduped.push(active.clone());
        for address in available {
            if !deduped.contains(&address) {
                deduped.push(address);
            }
        }
        self.available_addresses = deduped;
        self.active_address = Some(active);
    }

    /// Whether the last successful poll is older than `ttl` (or never happened).
    pub fn is_stale(&self, ttl: Duration, now: Instant) -> bool {
        self.last_successful_poll_at
            .is_none_or(|at| now.saturating_duration_since(at) > ttl)
    }

    /// Guess of the port the host listens on from the WAN.
    pub fn guess_external_port(&self) -> Option<u16> {
        self.external_port
            .or_else(|| self.active_address.as_ref().map(|address| address.port))
    }
}

fn merge_option<T: Copy>(target: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *target = incoming;
    }
}
