//! Talking to a single host address: status probes and app catalog fetches.
//!
//! The engine only sees the [`AddressProbe`] and [`AppCatalogSource`] traits, so tests
//! and alternative transports can stand in for [`HttpProbe`].

use core::time::Duration;

use futures::future::BoxFuture;
use hostwatch_common::{HostAddress, HostRecord, HostSnapshot};
use thiserror::Error as ThisError;

/// Why probing one address did not yield a usable snapshot.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,
    #[error("Connection refused: {0}")]
    Refused(String),
    /// The host answered, but not with something we understand.
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// A different machine answers at this address.
    #[error("Expected host '{expected}', found '{actual}'")]
    WrongUuid { expected: String, actual: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Probe cancelled")]
    Cancelled,
}

/// Queries one address for the identity and metadata of the host behind it.
pub trait AddressProbe: Send + Sync {
    /// Probe `address` once, giving up after `timeout`.
    ///
    /// When `expected_uuid` is given the implementation may reject a host with a
    /// different uuid early; callers still verify the result.
    fn probe<'future_life>(
        &'future_life self,
        address: &'future_life HostAddress,
        expected_uuid: Option<&'future_life str>,
        timeout: Duration,
    ) -> BoxFuture<'future_life, Result<HostSnapshot, ProbeError>>;
}

/// Fetches the raw app catalog from a host.
pub trait AppCatalogSource: Send + Sync {
    fn fetch_app_catalog<'future_life>(
        &'future_life self,
        address: &'future_life HostAddress,
        record: &'future_life HostRecord,
    ) -> BoxFuture<'future_life, Result<String, ProbeError>>;
}

/// Plain HTTP implementation of both probe traits.
///
/// - `GET /serverinfo?uniqueid=<id>` answers with a JSON [`HostSnapshot`].
/// - `GET /applist?uniqueid=<id>` answers with the raw catalog text.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    unique_id: String,
}

/// Upper bound for a catalog fetch; catalogs can be slow to assemble on the host.
const APPLIST_TIMEOUT: Duration = Duration::from_secs(10);

impl HttpProbe {
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            unique_id: unique_id.into(),
        }
    }

    fn url(&self, address: &HostAddress, endpoint: &str) -> String {
        format!("http://{address}/{endpoint}?uniqueid={}", self.unique_id)
    }
}

fn classify(err: &reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout
    } else if err.is_connect() {
        ProbeError::Refused(err.to_string())
    } else if err.is_decode() {
        ProbeError::Malformed(err.to_string())
    } else {
        ProbeError::Transport(err.to_string())
    }
}

impl AddressProbe for HttpProbe {
    fn probe<'future_life>(
        &'future_life self,
        address: &'future_life HostAddress,
        expected_uuid: Option<&'future_life str>,
        timeout: Duration,
    ) -> BoxFuture<'future_life, Result<HostSnapshot, ProbeError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url(address, "serverinfo"))
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify(&e))?;
            if !response.status().is_success() {
                return Err(ProbeError::Malformed(format!(
                    "status {}",
                    response.status()
                )));
            }
            let snapshot: HostSnapshot = response.json().await.map_err(|e| classify(&e))?;
            if let Some(expected) = expected_uuid
                && expected != snapshot.uuid
            {
                return Err(ProbeError::WrongUuid {
                    expected: expected.to_owned(),
                    actual: snapshot.uuid,
                });
            }
            Ok(snapshot)
        })
    }
}

impl AppCatalogSource for HttpProbe {
    fn fetch_app_catalog<'future_life>(
        &'future_life self,
        address: &'future_life HostAddress,
        _record: &'future_life HostRecord,
    ) -> BoxFuture<'future_life, Result<String, ProbeError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url(address, "applist"))
                .timeout(APPLIST_TIMEOUT)
                .send()
                .await
                .map_err(|e| classify(&e))?;
            if !response.status().is_success() {
                return Err(ProbeError::Malformed(format!(
                    "status {}",
                    response.status()
                )));
            }
            response.text().await.map_err(|e| classify(&e))
        })
    }
}
