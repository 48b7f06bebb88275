//! Wire types exchanged with a streaming host.
//!
//! - A status probe returns a [`HostSnapshot`] describing the host's identity and metadata.
//! - The app catalog is kept as raw text and decoded on demand with [`parse_app_catalog`].

use serde::{Deserialize, Serialize};

use crate::record::PairState;

/// What a single successful status probe tells us about a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Stable identifier the host assigns itself.
    pub uuid: String,
    /// Display name as configured on the host.
    #[serde(default)]
    pub name: String,
    /// Pairing status of this client as seen by the host.
    #[serde(default)]
    pub pair_state: Option<PairState>,
    #[serde(default)]
    pub https_port: Option<u16>,
    /// Port the host believes it is reachable on from the WAN.
    #[serde(default)]
    pub external_port: Option<u16>,
    #[serde(default)]
    pub mac_address: Option<String>,
}

impl HostSnapshot {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            pair_state: None,
            https_port: None,
            external_port: None,
            mac_address: None,
        }
    }
}

/// One launchable application in a host's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub hdr_supported: bool,
}

/// Decode a raw app catalog as returned by the host.
///
/// # Errors
///
/// Returns an error if the text is not a JSON array of app entries.
pub fn parse_app_catalog(raw: &str) -> Result<Vec<AppEntry>, serde_json::Error> {
    serde_json::from_str(raw)
}
