//! Client identity and lease types.
//!
//! A [`ClientId`] is the canonical key for all per-client state: the raw
//! bytes of option 61 when the client sends one, otherwise the hardware
//! type followed by the meaningful bytes of `chaddr`. Offers and leases
//! are both [`Lease`] values; an offer is simply a lease held in the
//! offer map with a short expiry.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};

/// How long an offer reserves an address while the server waits for the
/// client's REQUEST.
pub const OFFER_TIMEOUT_SECONDS: u32 = 60;

fn hex_join(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Canonical client identity: option 61 bytes, or `htype ++ chaddr[..hlen]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn from_option(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn from_hardware(htype: u8, chaddr: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(1 + chaddr.len());
        bytes.push(htype);
        bytes.extend_from_slice(chaddr);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_join(&self.0))
    }
}

/// Hardware type plus the meaningful bytes of `chaddr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareAddress {
    pub htype: u8,
    pub bytes: Vec<u8>,
}

impl HardwareAddress {
    pub fn new(htype: u8, bytes: Vec<u8>) -> Self {
        Self { htype, bytes }
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_join(&self.bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaseKind {
    Dynamic = 0,
    Reserved = 1,
}

impl TryFrom<u8> for LeaseKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Dynamic),
            1 => Ok(Self::Reserved),
            other => Err(other),
        }
    }
}

/// An address binding, either tentative (offer) or committed (lease).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_id: ClientId,
    pub hardware: HardwareAddress,
    pub address: Ipv4Addr,
    pub hostname: Option<String>,
    pub obtained_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub kind: LeaseKind,
}

impl Lease {
    /// Creates a tentative offer expiring [`OFFER_TIMEOUT_SECONDS`] from now.
    pub fn offered(
        client_id: ClientId,
        hardware: HardwareAddress,
        address: Ipv4Addr,
        hostname: Option<String>,
        kind: LeaseKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            hardware,
            address,
            hostname,
            obtained_at: now,
            expires_at: now + TimeDelta::seconds(OFFER_TIMEOUT_SECONDS as i64),
            kind,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Extends the binding for `duration_seconds` from now.
    pub fn renew(&mut self, duration_seconds: u32) {
        self.expires_at = Utc::now() + TimeDelta::seconds(duration_seconds as i64);
    }

    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}
