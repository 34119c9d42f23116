//! Storage key layout of the routing table.
//!
//! ```text
//! nodes/space                                          -> active space, "0" or "1"
//! nodes/{space}/meta/{bucket}/count                    -> u64 occupancy
//! nodes/{space}/buckets/{bucket}/{node}/{address}      -> NodeContactAddressData (JSON)
//! nodes/{space}/connected/{bucket}/time/{time}/{node}  -> empty
//! nodes/{space}/connected/{bucket}/node/{node}         -> u64 connected time
//! ```
//!
//! `{bucket}` is the fixed-width hex bucket key, `{node}` the lowercase hex
//! node id and `{time}` a zero-padded decimal so keys sort by time.

use crate::domain::{bucket_key, parse_bucket_key, NodeId};

/// Key selecting the active space.
pub(crate) const SPACE_KEY: &str = "nodes/space";

/// Both storage spaces.
pub(crate) const SPACES: [Space; 2] = [Space(0), Space(1)];

/// One of the two parallel key namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Space(u8);

impl Space {
    /// Decode the stored space marker; absent means space 0.
    pub(crate) fn decode(value: Option<&[u8]>) -> Option<Self> {
        match value {
            None | Some(b"0") => Some(Space(0)),
            Some(b"1") => Some(Space(1)),
            Some(_) => None,
        }
    }

    pub(crate) fn encode(self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    pub(crate) fn other(self) -> Self {
        Space(1 - self.0)
    }

    pub(crate) fn prefix(self) -> String {
        format!("nodes/{}/", self.0)
    }

    pub(crate) fn meta_prefix(self) -> String {
        format!("nodes/{}/meta/", self.0)
    }

    pub(crate) fn buckets_prefix(self) -> String {
        format!("nodes/{}/buckets/", self.0)
    }

    pub(crate) fn bucket_count(self, index: usize) -> String {
        format!("nodes/{}/meta/{}/count", self.0, bucket_key(index))
    }

    pub(crate) fn bucket_prefix(self, index: usize) -> String {
        format!("nodes/{}/buckets/{}/", self.0, bucket_key(index))
    }

    pub(crate) fn node_prefix(self, index: usize, node_id: &NodeId) -> String {
        format!("{}{}/", self.bucket_prefix(index), node_id.to_hex())
    }

    pub(crate) fn address(self, index: usize, node_id: &NodeId, address: &str) -> String {
        format!("{}{}", self.node_prefix(index, node_id), address)
    }

    pub(crate) fn connected_time_prefix(self, index: usize) -> String {
        format!("nodes/{}/connected/{}/time/", self.0, bucket_key(index))
    }

    pub(crate) fn connected_time(self, index: usize, time: u64, node_id: &NodeId) -> String {
        format!(
            "{}{:020}/{}",
            self.connected_time_prefix(index),
            time,
            node_id.to_hex()
        )
    }

    pub(crate) fn connected_node(self, index: usize, node_id: &NodeId) -> String {
        format!(
            "nodes/{}/connected/{}/node/{}",
            self.0,
            bucket_key(index),
            node_id.to_hex()
        )
    }
}

/// Parts of an address key below `nodes/{space}/buckets/`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct AddressKey {
    pub(crate) bucket: usize,
    pub(crate) node_id: NodeId,
    pub(crate) address: String,
}

/// Split `{bucket}/{node}/{address}` (the key with the buckets prefix removed).
pub(crate) fn parse_address_key(rest: &str) -> Option<AddressKey> {
    let mut parts = rest.splitn(3, '/');
    let bucket = parse_bucket_key(parts.next()?)?;
    let node_id = NodeId::from_hex(parts.next()?).ok()?;
    let address = parts.next()?.to_owned();
    if address.is_empty() {
        return None;
    }
    Some(AddressKey {
        bucket,
        node_id,
        address,
    })
}

/// Node id at the end of a connected-time index key.
pub(crate) fn parse_connected_time_key(key: &str) -> Option<NodeId> {
    NodeId::from_hex(key.rsplit('/').next()?).ok()
}
