//! Configuration data types for the engine.
//!
//! Every section and field is optional; the defaults below are the tuned values
//! the engine ships with. They are policy, not structure, hence configurable.

use core::time::Duration;
use std::path::{Component, Path, PathBuf};

use hostwatch_common::{AddressParseError, HostAddress};
use serde::Deserialize;

/// Period between two polls of the same host.
pub const SERVERINFO_POLLING_PERIOD: Duration = Duration::from_millis(1500);
/// Consecutive failures before a host with no trusted history is declared offline.
pub const INITIAL_POLL_TRIES: u32 = 2;
/// Consecutive failures before a known host is declared offline.
pub const OFFLINE_POLL_TRIES: u32 = 3;
/// Age after which polled state is no longer trusted at start-up.
pub const POLL_DATA_TTL: Duration = Duration::from_secs(30);
/// How long to keep collecting secondary addresses after the first success.
pub const COLLECTION_WINDOW: Duration = Duration::from_secs(2);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for the address a host is currently online at.
pub const ONLINE_PROBE_TIMEOUT: Duration = Duration::from_secs(7);
pub const MAX_CONCURRENT_PROBES: usize = 32;
pub const ADD_HOST_TIMEOUT: Duration = Duration::from_secs(15);

pub const APPLIST_POLLING_PERIOD: Duration = Duration::from_secs(30);
pub const APPLIST_FAILED_POLLING_RETRY: Duration = Duration::from_secs(2);
/// Consecutive empty catalogs before an empty catalog is believed.
pub const EMPTY_LIST_THRESHOLD: u32 = 3;

#[expect(
    clippy::as_conversions,
    reason = "Duration::as_millis is u128; all constants fit u64"
)]
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Host polling and address race tuning.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    pub period_ms: u64,
    pub initial_poll_tries: u32,
    pub offline_poll_tries: u32,
    pub poll_data_ttl_ms: u64,
    pub collection_window_ms: u64,
    pub probe_timeout_ms: u64,
    pub online_probe_timeout_ms: u64,
    /// Cap on in-flight probes across all hosts.
    pub max_concurrent_probes: usize,
    /// Upper bound for a blocking host add (discovery or user action).
    pub add_host_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            period_ms: millis(SERVERINFO_POLLING_PERIOD),
            initial_poll_tries: INITIAL_POLL_TRIES,
            offline_poll_tries: OFFLINE_POLL_TRIES,
            poll_data_ttl_ms: millis(POLL_DATA_TTL),
            collection_window_ms: millis(COLLECTION_WINDOW),
            probe_timeout_ms: millis(PROBE_TIMEOUT),
            online_probe_timeout_ms: millis(ONLINE_PROBE_TIMEOUT),
            max_concurrent_probes: MAX_CONCURRENT_PROBES,
            add_host_timeout_ms: millis(ADD_HOST_TIMEOUT),
        }
    }
}

impl PollingConfig {
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub const fn poll_data_ttl(&self) -> Duration {
        Duration::from_millis(self.poll_data_ttl_ms)
    }

    pub const fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub const fn online_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.online_probe_timeout_ms)
    }

    pub const fn add_host_timeout(&self) -> Duration {
        Duration::from_millis(self.add_host_timeout_ms)
    }
}

/// App catalog polling tuning.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    /// Interval after a successful, non-empty fetch.
    pub period_ms: u64,
    /// Interval after a failed, empty or skipped fetch.
    pub retry_ms: u64,
    pub empty_threshold: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            period_ms: millis(APPLIST_POLLING_PERIOD),
            retry_ms: millis(APPLIST_FAILED_POLLING_RETRY),
            empty_threshold: EMPTY_LIST_THRESHOLD,
        }
    }
}

impl CatalogConfig {
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub const fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

/// External address resolution for hosts only known by a private address.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StunConfig {
    pub enable: bool,
    pub server: String,
    pub port: u16,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            enable: true,
            server: "stun.moonlight-stream.org".to_owned(),
            port: 3478,
        }
    }
}

/// Configuration for the optional local `SQLite` database.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Path to the `SQLite` database file. Relative paths are resolved relative to the config file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// When false hosts are only kept in memory, even if this table exists.
    #[serde(default = "do_db_enable")]
    pub enable: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            enable: do_db_enable(),
        }
    }
}

fn default_db_path() -> String {
    "./hostwatch.db".to_owned()
}

const fn do_db_enable() -> bool {
    true
}

/// Where fetched app catalogs are cached.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: "./cache".to_owned(),
        }
    }
}

/// Local network auto-discovery.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enable: bool,
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            service_type: "_nvstream._tcp.local.".to_owned(),
        }
    }
}

/// Identity this client presents to hosts.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub unique_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            unique_id: "0123456789ABCDEF".to_owned(),
        }
    }
}

/// A host the user entered by address.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ManualHost {
    /// `host`, `host:port` or an IPv6 literal.
    pub address: String,
    /// Overrides a port given in `address`.
    #[serde(default)]
    pub port: Option<u16>,
}

impl ManualHost {
    /// # Errors
    ///
    /// Returns an error if `address` cannot be parsed.
    pub fn to_address(&self) -> Result<HostAddress, AddressParseError> {
        let mut address: HostAddress = self.address.parse()?;
        if let Some(port) = self.port {
            address.port = port;
        }
        Ok(address)
    }
}

/// Root config structure.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub stun: StunConfig,
    /// Optional database configuration. When omitted hosts are only kept in memory.
    #[serde(default)]
    pub db: Option<DbConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub hosts: Vec<ManualHost>,
}

/// Resolves a path to an absolute one.
///
/// If the path is absolute, returns it as-is. If relative, joins it with the
/// config file's parent directory and normalizes the result to remove redundant
/// components like `./`.
pub fn resolve_config_relative_paths(config_path: &Path, relative_path: &str) -> PathBuf {
    let path = Path::new(relative_path);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else if relative_path == ":memory:" {
        // Special case: SQLite in-memory database path
        path.to_path_buf()
    } else {
        config_path
            .parent()
            .map_or_else(|| path.to_path_buf(), |d| d.join(path))
    };

    // We can't use canonicalize() because the file might not exist yet
    normalize_path(&resolved)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        use Component as C;
        match component {
            C::Normal(c) => {
                result.push(c);
            }
            C::ParentDir => {
                result.pop();
            }
            C::CurDir => {}
            C::RootDir | C::Prefix(_) => {
                result.push(component);
            }
        }
    }
    result
}
