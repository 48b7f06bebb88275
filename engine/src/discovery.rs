//! Turning local-network announcements into host registrations.
//!
//! Hosts advertise themselves over mDNS. Each resolved announcement becomes a
//! partial [`HostRecord`] carrying only addresses and a name; the registry
//! learns the uuid by racing those addresses.

use core::{net::IpAddr, time::Duration};

use hostwatch_common::{HostAddress, HostRecord};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use crate::app::HostRegistry;

#[derive(Debug, ThisError)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed")]
    Daemon(#[from] mdns_sd::Error),
    #[error("mDNS event channel closed")]
    ChannelClosed,
}

/// Receives whatever the discovery mechanism finds.
pub trait DiscoveryListener: Send + Sync {
    fn on_host_announced(&self, partial: HostRecord);
    fn on_discovery_failure(&self, error: &DiscoveryError);
}

/// Registers announced hosts with a registry in the background.
#[derive(Clone)]
pub struct RegistryListener {
    registry: HostRegistry,
    add_timeout: Duration,
}

impl RegistryListener {
    pub const fn new(registry: HostRegistry, add_timeout: Duration) -> Self {
        Self {
            registry,
            add_timeout,
        }
    }
}

impl DiscoveryListener for RegistryListener {
    fn on_host_announced(&self, partial: HostRecord) {
        let registry = self.registry.clone();
        let limit = self.add_timeout;
        let span = info_span!("discovered_host", host = %partial.label());
        tokio::spawn(
            async move {
                if !registry.add_host_blocking(partial, limit).await {
                    debug!("Announced host did not answer");
                }
            }
            .instrument(span),
        );
    }

    fn on_discovery_failure(&self, error: &DiscoveryError) {
        error!("Host discovery failed: {error}");
    }
}

/// Build the partial record announced by one resolved service.
///
/// The first IPv4 address becomes the local address, a routable IPv6 address
/// the IPv6 one. Returns `None` if the announcement carries neither.
pub fn partial_from_service(
    hostname: &str,
    port: u16,
    addresses: impl IntoIterator<Item = IpAddr>,
) -> Option<HostRecord> {
    let mut record = HostRecord {
        name: hostname.trim_end_matches('.').trim_end_matches(".local").to_owned(),
        ..HostRecord::default()
    };
    let mut global_v6 = None;
    let mut unique_local_v6 = None;
    for ip in addresses {
        match ip {
            IpAddr::V4(_) => {
                if record.addresses.local.is_none() {
                    record.addresses.local = Some(HostAddress::new(ip.to_string(), port));
                }
            }
            IpAddr::V6(v6) => {
                if v6.is_loopback() || v6.is_unicast_link_local() {
                    continue;
                }
                let slot = if v6.is_unique_local() {
                    &mut unique_local_v6
                } else {
                    &mut global_v6
                };
                slot.get_or_insert(v6);
            }
        }
    }
    record.addresses.ipv6 = global_v6
        .or(unique_local_v6)
        .map(|v6| HostAddress::new(v6.to_string(), port));
    (!record.addresses.is_empty()).then_some(record)
}

fn partial_from_info(info: &ServiceInfo) -> Option<HostRecord> {
    partial_from_service(
        info.get_hostname(),
        info.get_port(),
        info.get_addresses().iter().copied(),
    )
}

/// Browse for `service_type` until `cancel` fires, reporting to `listener`.
///
/// # Errors
///
/// Returns an error if the mDNS daemon cannot be started or stops delivering events.
pub async fn run_mdns_discovery(
    service_type: &str,
    listener: &dyn DiscoveryListener,
    cancel: &CancellationToken,
) -> Result<(), DiscoveryError> {
    let result = browse(service_type, listener, cancel).await;
    if let Err(ref e) = result {
        listener.on_discovery_failure(e);
    }
    result
}

async fn browse(
    service_type: &str,
    listener: &dyn DiscoveryListener,
    cancel: &CancellationToken,
) -> Result<(), DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(service_type)?;
    info!("Browsing for {service_type}");

    let result = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            event = receiver.recv_async() => match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    match partial_from_info(&info) {
                        Some(partial) => {
                            debug!("Resolved {}", info.get_fullname());
                            listener.on_host_announced(partial);
                        }
                        None => debug!("Ignoring {} without usable addresses", info.get_fullname()),
                    }
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    // Departures are left to the polling sessions.
                    debug!("Service removed: {fullname}");
                }
                Ok(_) => {}
                Err(_) => break Err(DiscoveryError::ChannelClosed),
            },
        }
    };

    if let Err(e) = daemon.shutdown() {
        warn!("Failed to shut down mDNS daemon: {e}");
    }
    debug!("Stopped browsing");
    result
}
