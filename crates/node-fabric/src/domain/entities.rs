//! Core Domain Entities for the Node Fabric
//!
//! Identifiers, addresses and per-address contact metadata stored in the
//! routing table.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed-width node identifier.
///
/// The width is a property of the routing table (`node_id_bits`), not of the
/// type, so ids are stored as owned bytes. The XOR distance between two ids of
/// the same width, read as a big-endian unsigned integer, is the Kademlia metric.
///
/// # Security
///
/// Equality is constant-time over the id bytes so that comparing a claimed id
/// against a known one does not leak the position of the first differing byte.
// SAFETY: derived_hash_with_manual_eq is intentionally allowed here.
// Equal ids have equal bytes, so hashing the bytes is consistent with eq.
#[allow(clippy::derived_hash_with_manual_eq)]
#[derive(Clone, Hash)]
pub struct NodeId(Vec<u8>);

impl PartialEq for NodeId {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut result = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            result |= a ^ b;
        }
        result == 0
    }
}

impl Eq for NodeId {}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl NodeId {
    /// Create a NodeId from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// All-zero id of the given byte width.
    pub fn zero(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    /// Underlying bytes, most significant first.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width of this id in bits.
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    /// Lowercase hex rendering, used for logs and storage keys.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// Network address of a node: a host name or IP literal plus a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Resolvable host name or IP literal.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl NodeAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address from an IP literal.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::new(ip.to_string(), port)
    }

    /// The host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Whether the host needs name resolution before dialing.
    pub fn is_hostname(&self) -> bool {
        self.ip().is_none()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// Failed to parse a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node address: {0}")]
pub struct AddressParseError(pub String);

/// Canonical string form of a [`NodeAddress`], used as the per-address key of a
/// node contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeContactAddress(String);

impl NodeContactAddress {
    /// Borrow the canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into a structured address.
    pub fn to_address(&self) -> Result<NodeAddress, AddressParseError> {
        self.0.parse()
    }
}

impl From<&NodeAddress> for NodeContactAddress {
    fn from(address: &NodeAddress) -> Self {
        Self(address.to_string())
    }
}

impl From<NodeAddress> for NodeContactAddress {
    fn from(address: NodeAddress) -> Self {
        Self::from(&address)
    }
}

impl fmt::Display for NodeContactAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an address was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// Direct dial.
    Direct,
    /// Reached after relayed hole-punch signalling.
    Signal,
}

/// Network scope an address is valid in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressScope {
    /// Reachable on the local network only.
    Local,
    /// Publicly reachable.
    Global,
}

/// Metadata stored per known address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContactAddressData {
    /// How the address was reached.
    pub mode: AddressMode,
    /// Unix seconds of the last successful connection through this address.
    pub connected_time: u64,
    /// Scopes the address is valid in.
    pub scopes: Vec<AddressScope>,
}

impl NodeContactAddressData {
    /// Data for an address connected directly at `connected_time`.
    pub fn direct(connected_time: u64) -> Self {
        Self {
            mode: AddressMode::Direct,
            connected_time,
            scopes: vec![AddressScope::Global],
        }
    }
}

/// All known addresses of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeContact {
    addresses: BTreeMap<NodeContactAddress, NodeContactAddressData>,
}

impl NodeContact {
    /// Empty contact.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contact with a single address.
    pub fn single(address: &NodeAddress, data: NodeContactAddressData) -> Self {
        let mut contact = Self::new();
        contact.insert(address.into(), data);
        contact
    }

    /// Insert or replace the data of one address.
    pub fn insert(
        &mut self,
        address: NodeContactAddress,
        data: NodeContactAddressData,
    ) -> Option<NodeContactAddressData> {
        self.addresses.insert(address, data)
    }

    /// Data of one address.
    pub fn get(&self, address: &NodeContactAddress) -> Option<&NodeContactAddressData> {
        self.addresses.get(address)
    }

    /// Remove one address.
    pub fn remove(&mut self, address: &NodeContactAddress) -> Option<NodeContactAddressData> {
        self.addresses.remove(address)
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether no address is known.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Iterate addresses in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeContactAddress, &NodeContactAddressData)> {
        self.addresses.iter()
    }

    /// Most recent connected time across all addresses.
    pub fn connected_time(&self) -> u64 {
        self.addresses
            .values()
            .map(|d| d.connected_time)
            .max()
            .unwrap_or(0)
    }

    /// Parsed addresses, most recently connected first.
    ///
    /// Addresses that fail to parse are skipped.
    pub fn addresses_by_recency(&self) -> Vec<NodeAddress> {
        let mut entries: Vec<(&NodeContactAddress, &NodeContactAddressData)> =
            self.addresses.iter().collect();
        entries.sort_by(|a, b| b.1.connected_time.cmp(&a.1.connected_time));
        entries
            .into_iter()
            .filter_map(|(addr, _)| addr.to_address().ok())
            .collect()
    }
}

impl FromIterator<(NodeContactAddress, NodeContactAddressData)> for NodeContact {
    fn from_iter<T: IntoIterator<Item = (NodeContactAddress, NodeContactAddressData)>>(
        iter: T,
    ) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}

/// Unix timestamp in seconds
///
/// # Security
///
/// Timestamps are clamped to a reasonable maximum so a peer-supplied value
/// cannot corrupt recency ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Maximum reasonable timestamp (year 9999).
    pub const MAX_REASONABLE: u64 = 253_402_300_799;

    /// Create a new timestamp, clamping to MAX_REASONABLE.
    pub fn new(secs: u64) -> Self {
        Self(secs.min(Self::MAX_REASONABLE))
    }

    /// Get the underlying seconds value.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Add seconds to timestamp (saturating at MAX_REASONABLE).
    pub fn add_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs).min(Self::MAX_REASONABLE))
    }
}
