//! Wire messages exchanged by migration executors and clients.
//!
//! Messages are transport-agnostic. The engine hands them to a
//! [`MigrationTransport`] and receives them through
//! `MigrationCoordinator::handle_message`; the helpers at the bottom of this
//! module encode them with bincode for byte-stream transports.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::placement::PlacementTable;
use crate::types::{NodeId, ObjectId, ObjectRecord, PlacementVersion, StreamId, Token};

/// One `(object, refcount)` entry of a filter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub id: ObjectId,
    pub refcount: u32,
}

/// Objects the destination already holds for one token (destination → source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRebalanceFilterSet {
    pub stream_id: StreamId,
    pub token: Token,
    pub target_version: PlacementVersion,
    /// Sequence number across every filter set of the stream.
    pub seq: u64,
    /// Set on the final filter set of the stream.
    pub is_last: bool,
    pub entries: Vec<FilterEntry>,
}

/// Acknowledges one filter set (source → destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRebalanceFilterSetAck {
    pub stream_id: StreamId,
    pub seq: u64,
    /// Tokens of the acknowledged filter set the source cannot serve.
    pub rejected: Vec<Token>,
}

/// Requests the changes accrued since the first snapshot (destination → source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSecondRebalanceDeltaSet {
    pub stream_id: StreamId,
    pub target_version: PlacementVersion,
}

/// Objects the destination is missing (source → destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRebalanceDeltaSet {
    pub stream_id: StreamId,
    pub token: Token,
    pub target_version: PlacementVersion,
    /// Protocol round (1 or 2) this delta belongs to.
    pub round: u8,
    /// Sequence number within the round, starting at zero.
    pub seq: u64,
    pub is_last: bool,
    pub objects: Vec<ObjectRecord>,
}

/// Acknowledges one applied delta set (destination → source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRebalanceDeltaSetAck {
    pub stream_id: StreamId,
    pub round: u8,
    pub seq: u64,
}

/// Releases the source side of a stream (destination → source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishResync {
    pub stream_id: StreamId,
}

/// The source refuses the whole stream for a round (source → destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceNack {
    pub stream_id: StreamId,
    pub round: u8,
    pub kind: ErrorKind,
}

/// A live write relayed to the new owner during cutover (source → destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedWrite {
    pub stream_id: StreamId,
    pub object: ObjectRecord,
}

/// Node-to-node migration protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMessage {
    FilterSet(ObjectRebalanceFilterSet),
    FilterSetAck(ObjectRebalanceFilterSetAck),
    GetSecondDeltaSet(GetSecondRebalanceDeltaSet),
    DeltaSet(ObjectRebalanceDeltaSet),
    DeltaSetAck(ObjectRebalanceDeltaSetAck),
    FinishResync(FinishResync),
    Nack(RebalanceNack),
    ForwardedWrite(ForwardedWrite),
}

impl MigrationMessage {
    /// The stream this message belongs to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            MigrationMessage::FilterSet(m) => m.stream_id,
            MigrationMessage::FilterSetAck(m) => m.stream_id,
            MigrationMessage::GetSecondDeltaSet(m) => m.stream_id,
            MigrationMessage::DeltaSet(m) => m.stream_id,
            MigrationMessage::DeltaSetAck(m) => m.stream_id,
            MigrationMessage::FinishResync(m) => m.stream_id,
            MigrationMessage::Nack(m) => m.stream_id,
            MigrationMessage::ForwardedWrite(m) => m.stream_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            MigrationMessage::FilterSet(_) => "filter_set",
            MigrationMessage::FilterSetAck(_) => "filter_set_ack",
            MigrationMessage::GetSecondDeltaSet(_) => "get_second_delta_set",
            MigrationMessage::DeltaSet(_) => "delta_set",
            MigrationMessage::DeltaSetAck(_) => "delta_set_ack",
            MigrationMessage::FinishResync(_) => "finish_resync",
            MigrationMessage::Nack(_) => "nack",
            MigrationMessage::ForwardedWrite(_) => "forwarded_write",
        }
    }
}

/// Control message from the cluster orchestrator to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    StartMigration {
        target_version: PlacementVersion,
        sources: Vec<(NodeId, Vec<Token>)>,
    },
    AbortMigration {
        target_version: PlacementVersion,
    },
    PlacementClosed {
        placement: PlacementTable,
    },
}

/// Outbound half of the node-to-node transport.
///
/// Delivery is asynchronous: `send` returns once the message is handed to
/// the network. Failures surface as [`Error::SourceUnreachable`].
#[async_trait::async_trait]
pub trait MigrationTransport: Send + Sync + std::fmt::Debug {
    async fn send(&self, to: NodeId, msg: MigrationMessage) -> Result<()>;
}

/// Transport that accepts and drops every message.
#[derive(Debug, Default)]
pub struct NoOpTransport;

#[async_trait::async_trait]
impl MigrationTransport for NoOpTransport {
    async fn send(&self, _to: NodeId, _msg: MigrationMessage) -> Result<()> {
        Ok(())
    }
}

/// Encode a protocol message to bytes.
pub fn encode_message(msg: &MigrationMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a protocol message from bytes.
pub fn decode_message(data: &[u8]) -> Result<MigrationMessage> {
    Ok(bincode::deserialize(data)?)
}

/// Encode a control message to bytes.
pub fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a control message from bytes.
pub fn decode_control(data: &[u8]) -> Result<ControlMessage> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a protocol message with a big-endian length prefix.
pub fn frame_message(msg: &MigrationMessage) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    let len = u32::try_from(data.len())
        .map_err(|_| Error::Serialization(format!("frame too large: {} bytes", data.len())))?;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Split one framed message off the front of `buf`.
///
/// Returns `None` until a complete frame is buffered; otherwise the message
/// and the number of bytes consumed.
pub fn unframe_message(buf: &[u8]) -> Result<Option<(MigrationMessage, usize)>> {
    let Some(header) = buf.get(..4) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    match buf.get(4..4 + len) {
        Some(body) => Ok(Some((decode_message(body)?, 4 + len))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamId {
        StreamId::new(4, 17).unwrap()
    }

    #[test]
    fn test_delta_set_serialization() {
        let msg = MigrationMessage::DeltaSet(ObjectRebalanceDeltaSet {
            stream_id: stream(),
            token: Token(3),
            target_version: 9,
            round: 2,
            seq: 5,
            is_last: true,
            objects: vec![ObjectRecord::new(ObjectId::from_u64(1), 2, 30, &b"payload"[..])],
        });

        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            MigrationMessage::DeltaSet(d) => {
                assert_eq!(d.stream_id, stream());
                assert_eq!(d.objects[0].payload.as_ref(), b"payload");
                assert!(d.is_last);
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_stream_id_is_packed_on_wire() {
        let msg = MigrationMessage::FinishResync(FinishResync {
            stream_id: stream(),
        });
        let bytes = encode_message(&msg).unwrap();
        // variant tag (u32) followed by the packed stream id
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[4..], &stream().to_wire().to_le_bytes());
        assert_eq!(msg.stream_id(), stream());
        assert_eq!(msg.name(), "finish_resync");
    }

    #[test]
    fn test_frame_and_unframe() {
        let msg = MigrationMessage::Nack(RebalanceNack {
            stream_id: stream(),
            round: 1,
            kind: ErrorKind::SourceNotReady,
        });
        let mut framed = frame_message(&msg).unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        assert!(unframe_message(&framed[..3]).unwrap().is_none());
        assert!(unframe_message(&framed[..framed.len() - 1]).unwrap().is_none());

        framed.extend_from_slice(&[0xde, 0xad]);
        let (decoded, used) = unframe_message(&framed).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(used, framed.len() - 2);
    }

    #[test]
    fn test_control_message_carries_placement() {
        let placement = PlacementTable::new(7).with_replicas(Token(1), vec![1, 2]);
        let msg = ControlMessage::PlacementClosed { placement };
        let decoded = decode_control(&encode_control(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = decode_message(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(matches!(err, Error::Serialization(_)));
    }
}
