//! Core types used throughout the migration engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

use crate::error::{Error, Result};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Version of the placement table a migration converges to.
pub type PlacementVersion = u64;

/// Smallest addressable unit of the placement table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub u32);

impl Token {
    /// The token group this token belongs to.
    pub fn group(self, group_bits: u32) -> TokenGroup {
        TokenGroup(self.0.checked_shr(group_bits).unwrap_or(0))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coarser grouping of tokens that share one metadata snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenGroup(pub u32);

impl TokenGroup {
    /// All tokens of this group, given the group width.
    pub fn tokens(self, group_bits: u32) -> impl Iterator<Item = Token> {
        let start = self.0 << group_bits;
        (start..start + (1u32 << group_bits)).map(Token)
    }
}

impl fmt::Display for TokenGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Content address of a stored object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 20]);

impl ObjectId {
    /// Build an id whose first eight bytes are `n` (test and tooling helper).
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    /// Map this object onto the placement table.
    pub fn token(&self, token_bits: u32) -> Token {
        if token_bits == 0 {
            return Token(0);
        }
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&self.0);
        Token((hasher.finish() >> (64 - token_bits.min(32))) as u32)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Identifies one migration stream: the destination node plus a sequence
/// number unique on that node.
///
/// Packed into a `u64` only on the wire (`node_id << 32 | local_seq`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct StreamId {
    node_id: NodeId,
    local_seq: u32,
}

impl StreamId {
    /// Create a stream id. Node ids must fit the 32-bit wire field.
    pub fn new(node_id: NodeId, local_seq: u32) -> Result<Self> {
        if node_id > u64::from(u32::MAX) {
            return Err(Error::InvalidArgument(format!(
                "node id {} does not fit a stream id",
                node_id
            )));
        }
        Ok(Self { node_id, local_seq })
    }

    /// The destination node that owns this stream.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Sequence number local to the destination node.
    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    /// Encode for the wire.
    pub fn to_wire(self) -> u64 {
        (self.node_id << 32) | u64::from(self.local_seq)
    }

    /// Decode from the wire.
    pub fn from_wire(raw: u64) -> Self {
        Self {
            node_id: raw >> 32,
            local_seq: raw as u32,
        }
    }
}

impl From<StreamId> for u64 {
    fn from(id: StreamId) -> Self {
        id.to_wire()
    }
}

impl TryFrom<u64> for StreamId {
    type Error = std::convert::Infallible;

    fn try_from(raw: u64) -> std::result::Result<Self, Self::Error> {
        Ok(StreamId::from_wire(raw))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.local_seq)
    }
}

/// A stored object together with the metadata the migration protocol needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object identity.
    pub id: ObjectId,
    /// Number of references held on this object.
    pub refcount: u32,
    /// Last modification timestamp (unix nanos).
    pub mod_ts: u64,
    /// Object payload.
    pub payload: Bytes,
}

impl ObjectRecord {
    /// Create a new record.
    pub fn new(id: ObjectId, refcount: u32, mod_ts: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            refcount,
            mod_ts,
            payload: payload.into(),
        }
    }

    /// Resolve an incoming copy against the local one.
    ///
    /// Last writer wins on `mod_ts`, the local copy wins ties, and the
    /// reference count never drops below either side. Returns `None` when
    /// the local copy already dominates, so applying the same record twice
    /// changes nothing.
    pub fn merge(local: Option<&ObjectRecord>, incoming: &ObjectRecord) -> Option<ObjectRecord> {
        let Some(local) = local else {
            return Some(incoming.clone());
        };

        let refcount = local.refcount.max(incoming.refcount);
        let merged = if incoming.mod_ts > local.mod_ts {
            ObjectRecord {
                refcount,
                ..incoming.clone()
            }
        } else {
            ObjectRecord {
                refcount,
                ..local.clone()
            }
        };

        (merged != *local).then_some(merged)
    }
}

/// Metadata-only view of an object inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: ObjectId,
    pub refcount: u32,
    pub mod_ts: u64,
    /// Store change sequence at which this object was last modified.
    pub seq: u64,
}

/// A live write passing through the I/O path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// The object as written.
    pub object: ObjectRecord,
    /// Set when this write itself arrived through migration forwarding.
    pub forwarded_from: Option<NodeId>,
}

impl WriteRequest {
    /// A write originating from a client of this node.
    pub fn local(object: ObjectRecord) -> Self {
        Self {
            object,
            forwarded_from: None,
        }
    }
}
