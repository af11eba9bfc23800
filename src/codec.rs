//! Fixed-layout binary codecs for the paxos and response datagrams.
//!
//! Both layouts are network byte order with fixed-width, right-padded value
//! fields. The codecs implement [`Decoder`]/[`Encoder`] so that
//! [`UdpFramed`] can drive them; each UDP datagram carries exactly one
//! frame, so a non-empty buffer shorter than a frame is a malformed packet
//! rather than a partial read.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::messages::{
    ClientResponse, MessageKind, Outbound, PAXOS_VALUE_SIZE, PAXOS_WIRE_SIZE, PaxosMessage,
    RESPONSE_WIRE_SIZE, VALUE_SIZE,
};

/// Strip the trailing padding/control bytes a value field carries on the
/// wire: tab, CR, LF and NUL.
fn trimmed(raw: &[u8]) -> Bytes {
    let end = raw
        .iter()
        .rposition(|&b| !matches!(b, b'\t' | b'\r' | b'\n' | 0))
        .map_or(0, |i| i + 1);
    Bytes::copy_from_slice(&raw[..end])
}

/// Write `value` into a `width`-byte field, truncating silently and
/// right-padding with NUL.
fn put_padded(dst: &mut BytesMut, value: &[u8], width: usize) {
    let n = value.len().min(width);
    dst.put_slice(&value[..n]);
    dst.put_bytes(0, width - n);
}

fn write_paxos(msg: &PaxosMessage, dst: &mut BytesMut) {
    dst.reserve(PAXOS_WIRE_SIZE);
    dst.put_u8(msg.kind.into());
    dst.put_u16(msg.inst);
    dst.put_u8(msg.crnd);
    dst.put_u8(msg.vrnd);
    dst.put_u64(msg.nid);
    dst.put_u8(msg.req_id);
    put_padded(dst, &msg.value, PAXOS_VALUE_SIZE);
}

fn write_response(resp: &ClientResponse, dst: &mut BytesMut) {
    dst.reserve(RESPONSE_WIRE_SIZE);
    dst.put_u8(resp.req_id);
    put_padded(dst, &resp.value, VALUE_SIZE);
}

fn short_datagram(what: &str, got: usize, want: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("short {what} datagram: {got} of {want} bytes"),
    )
}

/// Learner-side codec: decodes paxos messages, encodes [`Outbound`] frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct LearnerCodec;

impl Decoder for LearnerCodec {
    type Item = PaxosMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PaxosMessage>, io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < PAXOS_WIRE_SIZE {
            let got = src.len();
            src.clear();
            return Err(short_datagram("paxos", got, PAXOS_WIRE_SIZE));
        }

        let mut frame = src.split_to(PAXOS_WIRE_SIZE);
        let kind = MessageKind::try_from(frame.get_u8())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let inst = frame.get_u16();
        let crnd = frame.get_u8();
        let vrnd = frame.get_u8();
        let nid = frame.get_u64();
        let req_id = frame.get_u8();
        let value = trimmed(&frame);

        Ok(Some(PaxosMessage {
            kind,
            inst,
            crnd,
            vrnd,
            nid,
            req_id,
            value,
        }))
    }
}

impl Encoder<Outbound> for LearnerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), io::Error> {
        match item {
            Outbound::Paxos(msg) => write_paxos(&msg, dst),
            Outbound::Response(resp) => write_response(&resp, dst),
        }
        Ok(())
    }
}

/// Proposer-side codec: encodes paxos requests, decodes client responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposerCodec;

impl Decoder for ProposerCodec {
    type Item = ClientResponse;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientResponse>, io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < RESPONSE_WIRE_SIZE {
            let got = src.len();
            src.clear();
            return Err(short_datagram("response", got, RESPONSE_WIRE_SIZE));
        }

        let mut frame = src.split_to(RESPONSE_WIRE_SIZE);
        let req_id = frame.get_u8();
        let value = trimmed(&frame);

        Ok(Some(ClientResponse { req_id, value }))
    }
}

impl Encoder<PaxosMessage> for ProposerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: PaxosMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        write_paxos(&item, dst);
        Ok(())
    }
}

/// Production transport for the learner run loop.
pub type LearnerTransport = UdpFramed<LearnerCodec>;

/// Production transport for the proposer run loop.
pub type ProposerTransport = UdpFramed<ProposerCodec>;

/// Frame a bound UDP socket for [`crate::run_learner`].
#[must_use]
pub fn learner_transport(socket: UdpSocket) -> LearnerTransport {
    UdpFramed::new(socket, LearnerCodec)
}

/// Frame a bound UDP socket for [`crate::run_proposer`].
#[must_use]
pub fn proposer_transport(socket: UdpSocket) -> ProposerTransport {
    UdpFramed::new(socket, ProposerCodec)
}
