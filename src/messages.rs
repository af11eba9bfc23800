//! Protocol message types shared by the proposer and learner roles.
//!
//! The layouts mirror what the data-plane acceptors parse and must stay
//! bit-exact; see [`crate::codec`] for the wire encoding itself.

use std::fmt;

use bytes::Bytes;

/// Size of the value field in a client response.
pub const VALUE_SIZE: usize = 64;

/// Size of the value field in a paxos message. One byte shorter than the
/// response field: the correlation id rides in the header instead.
pub const PAXOS_VALUE_SIZE: usize = VALUE_SIZE - 1;

/// Encoded size of a paxos message: tag, instance, two rounds, node id,
/// correlation id, value.
pub const PAXOS_WIRE_SIZE: usize = 1 + 2 + 1 + 1 + 8 + 1 + PAXOS_VALUE_SIZE;

/// Encoded size of a client response: correlation id, value.
pub const RESPONSE_WIRE_SIZE: usize = 1 + VALUE_SIZE;

/// Node id stamped on messages the learner originates itself (recovery
/// prepares and promoted accepts), distinguishing them from acceptor ids.
pub const SELF_NODE_ID: u64 = 10;

/// Correlation id stamped on self-originated messages. These only ever
/// travel towards the data plane, never to a proposer's reply port, so the
/// overlap with client correlation ids is harmless.
pub const SELF_REQUEST_ID: u8 = 10;

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Phase 1a: prepare, opening a round for an instance.
    Prepare = 1,
    /// Phase 1b: an acceptor's promise, carrying its highest accepted value.
    Promise = 2,
    /// Phase 2a: accept request driving a value towards decision.
    Accept = 3,
    /// Phase 2b: an acceptor's accepted-value report.
    Accepted = 4,
}

/// A wire tag that names no protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageKind(pub u8);

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown paxos message type {}", self.0)
    }
}

impl std::error::Error for UnknownMessageKind {}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(tag: u8) -> Result<Self, UnknownMessageKind> {
        match tag {
            1 => Ok(Self::Prepare),
            2 => Ok(Self::Promise),
            3 => Ok(Self::Accept),
            4 => Ok(Self::Accepted),
            other => Err(UnknownMessageKind(other)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

/// A paxos protocol message.
///
/// `crnd` is the proposer round the message belongs to; `vrnd` is the round
/// in which `value` was accepted (phase-1b only, zero elsewhere).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaxosMessage {
    pub kind: MessageKind,
    /// Consensus instance (slot in the command sequence).
    pub inst: u16,
    /// Proposer round.
    pub crnd: u8,
    /// Accepted round for the carried value.
    pub vrnd: u8,
    /// Originating acceptor/node id.
    pub nid: u64,
    /// Correlation id of the client request that produced this message.
    pub req_id: u8,
    /// Command payload. Encoding truncates anything beyond
    /// [`PAXOS_VALUE_SIZE`] silently; callers keep values within the field.
    pub value: Bytes,
}

impl PaxosMessage {
    /// Recovery prepare for an undecided instance: round 1, no accepted
    /// round, empty value.
    #[must_use]
    pub fn prepare(inst: u16) -> Self {
        Self {
            kind: MessageKind::Prepare,
            inst,
            crnd: 1,
            vrnd: 0,
            nid: SELF_NODE_ID,
            req_id: SELF_REQUEST_ID,
            value: Bytes::new(),
        }
    }
}

/// Reply sent back to the client that submitted a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    /// Correlation id of the original submission.
    pub req_id: u8,
    pub value: Bytes,
}

/// Frames the learner writes to the wire: paxos traffic towards the data
/// plane, responses towards clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Paxos(PaxosMessage),
    Response(ClientResponse),
}
