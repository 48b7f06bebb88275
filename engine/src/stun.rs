//! Minimal STUN (RFC 5389) binding client, used to learn our public IP.
//!
//! When a host is only known by a site-local address, the public address of
//! our own network is a good guess for reaching it from outside.

use core::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use std::io;

use futures::future::BoxFuture;
use thiserror::Error as ThisError;
use tokio::{
    net::{UdpSocket, lookup_host},
    time::timeout,
};
use tracing::{debug, warn};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
/// The port is XORed with the most significant half of the cookie.
const XOR_PORT_MASK: u16 = 0x2112;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;
const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

#[derive(Debug, ThisError)]
pub enum StunError {
    #[error("Could not resolve STUN server {0}")]
    Resolve(String),
    #[error("STUN socket error")]
    Io(#[from] io::Error),
    #[error("No STUN response after {0} attempts")]
    NoResponse(u32),
    #[error("Invalid STUN response: {0}")]
    Malformed(&'static str),
}

/// Learns the public address of the network we are on.
pub trait StunResolver: Send + Sync {
    /// `None` when the address could not be determined; failures are logged, not raised.
    fn resolve_external_address<'future_life>(
        &'future_life self,
        server: &'future_life str,
        port: u16,
    ) -> BoxFuture<'future_life, Option<IpAddr>>;
}

/// Sends binding requests over UDP, retransmitting a few times.
#[derive(Debug, Clone)]
pub struct UdpStunResolver {
    attempt_timeout: Duration,
    attempts: u32,
}

impl Default for UdpStunResolver {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1),
            attempts: 3,
        }
    }
}

impl UdpStunResolver {
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or answers garbage.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn query(&self, server: &str, port: u16) -> Result<IpAddr, StunError> {
        let target = lookup_host((server, port))
            .await?
            .next()
            .ok_or_else(|| StunError::Resolve(format!("{server}:{port}")))?;
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;

        let transaction_id: TransactionId = rand::random();
        let request = encode_binding_request(&transaction_id);
        let mut buf = [0_u8; 512];
        for attempt in 1..=self.attempts {
            socket.send(&request).await?;
            match timeout(self.attempt_timeout, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    let response = buf.get(..len).unwrap_or_default();
                    match parse_binding_response(response, &transaction_id) {
                        Ok(addr) => return Ok(addr.ip()),
                        // A stray datagram; keep waiting on the next attempt.
                        Err(e) => debug!("Ignoring STUN datagram: {e}"),
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => debug!("STUN attempt {attempt} timed out"),
            }
        }
        Err(StunError::NoResponse(self.attempts))
    }
}

impl StunResolver for UdpStunResolver {
    fn resolve_external_address<'future_life>(
        &'future_life self,
        server: &'future_life str,
        port: u16,
    ) -> BoxFuture<'future_life, Option<IpAddr>> {
        Box::pin(async move {
            match self.query(server, port).await {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!("STUN lookup via {server}:{port} failed: {e}");
                    None
                }
            }
        })
    }
}

/// A binding request without attributes.
pub fn encode_binding_request(transaction_id: &TransactionId) -> [u8; HEADER_LEN] {
    let mut packet = [0_u8; HEADER_LEN];
    let bytes = BINDING_REQUEST
        .to_be_bytes()
        .into_iter()
        .chain(0_u16.to_be_bytes())
        .chain(MAGIC_COOKIE.to_be_bytes())
        .chain(*transaction_id);
    for (slot, byte) in packet.iter_mut().zip(bytes) {
        *slot = byte;
    }
    packet
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let slice = bytes.get(at..at.checked_add(2)?)?;
    Some(u16::from_be_bytes(slice.try_into().ok()?))
}

/// Extract the mapped address from a binding success response.
///
/// Prefers `XOR-MAPPED-ADDRESS` and falls back to the legacy `MAPPED-ADDRESS`.
///
/// # Errors
///
/// Returns an error if the packet is not a success response to `transaction_id`
/// or carries no usable address.
pub fn parse_binding_response(
    packet: &[u8],
    transaction_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let header = packet
        .get(..HEADER_LEN)
        .ok_or(StunError::Malformed("short header"))?;
    if read_u16(header, 0) != Some(BINDING_SUCCESS) {
        return Err(StunError::Malformed("not a binding success"));
    }
    if header.get(4..8) != Some(&MAGIC_COOKIE.to_be_bytes()[..]) {
        return Err(StunError::Malformed("bad magic cookie"));
    }
    if header.get(8..HEADER_LEN) != Some(&transaction_id[..]) {
        return Err(StunError::Malformed("transaction id mismatch"));
    }
    let body_len = usize::from(read_u16(header, 2).ok_or(StunError::Malformed("short header"))?);
    let body = packet
        .get(HEADER_LEN..HEADER_LEN.saturating_add(body_len))
        .ok_or(StunError::Malformed("truncated body"))?;

    let mut mapped = None;
    let mut offset = 0_usize;
    while let (Some(kind), Some(len)) =
        (read_u16(body, offset), read_u16(body, offset.saturating_add(2)))
    {
        let start = offset.saturating_add(4);
        let value = body
            .get(start..start.saturating_add(usize::from(len)))
            .ok_or(StunError::Malformed("truncated attribute"))?;
        match kind {
            ATTR_XOR_MAPPED_ADDRESS => {
                return decode_address(value, Some(transaction_id));
            }
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            _ => {}
        }
        // Attributes are padded to 4 bytes.
        offset = start.saturating_add(usize::from(len).next_multiple_of(4));
    }
    mapped.ok_or(StunError::Malformed("no mapped address"))
}

fn xor_in_place(bytes: &mut [u8], mask: impl IntoIterator<Item = u8>) {
    for (byte, mask) in bytes.iter_mut().zip(mask) {
        *byte ^= mask;
    }
}

fn decode_address(
    value: &[u8],
    xor_with: Option<&TransactionId>,
) -> Result<SocketAddr, StunError> {
    let family = *value.get(1).ok_or(StunError::Malformed("short address"))?;
    let mut port = read_u16(value, 2).ok_or(StunError::Malformed("short address"))?;
    if xor_with.is_some() {
        port ^= XOR_PORT_MASK;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let ip = match family {
        FAMILY_V4 => {
            let mut octets: [u8; 4] = value
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::Malformed("short ipv4"))?;
            if xor_with.is_some() {
                xor_in_place(&mut octets, cookie);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            let mut octets: [u8; 16] = value
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::Malformed("short ipv6"))?;
            if let Some(transaction_id) = xor_with {
                xor_in_place(&mut octets, cookie.into_iter().chain(*transaction_id));
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::Malformed("unknown address family")),
    };
    Ok(SocketAddr::new(ip, port))
}
