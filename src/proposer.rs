//! Client-request correlation and the proposer dispatch loop.
//!
//! The proposer is a pass-through: it stamps each submitted command with a
//! correlation id and the configured round, ships it towards the data plane
//! as an accelerated phase-2a request, and resolves the caller's future
//! when the matching response returns. It never runs phase 1 itself.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::config::ProposerConfig;
use crate::messages::{ClientResponse, MessageKind, PaxosMessage};

/// Marker error for proposer operations.
#[derive(Debug)]
pub struct ProposerError;

impl fmt::Display for ProposerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("proposer failed")
    }
}

impl std::error::Error for ProposerError {}

/// A command awaiting submission, paired with the channel its reply
/// resolves.
pub type Submission = (Bytes, oneshot::Sender<Bytes>);

/// Correlation state: the id counter and the table of pending submissions.
///
/// Ids run 1..=254 and wrap; 0 is never issued so it stays usable as an
/// unset sentinel on the wire.
pub struct Proposer {
    round: u8,
    last_req: u8,
    pending: HashMap<u8, oneshot::Sender<Bytes>>,
}

impl Proposer {
    #[must_use]
    pub fn new(round: u8) -> Self {
        Self {
            round,
            last_req: 0,
            pending: HashMap::new(),
        }
    }

    /// Number of submissions still awaiting a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn next_request_id(&mut self) -> u8 {
        self.last_req = if self.last_req + 1 < 255 {
            self.last_req + 1
        } else {
            1
        };
        self.last_req
    }

    /// Register a submission and build its wire request.
    ///
    /// Abandoned entries (caller dropped its future) are swept first so a
    /// wrapped-around id cannot collide with a live submission before the
    /// whole id space is actually in flight.
    pub fn register(&mut self, command: Bytes, reply: oneshot::Sender<Bytes>) -> PaxosMessage {
        self.pending.retain(|_, tx| !tx.is_closed());

        let req_id = self.next_request_id();
        if self.pending.insert(req_id, reply).is_some() {
            warn!(req_id, "correlation id wrapped onto a live submission, evicting it");
        }
        trace!(req_id, "registered submission");

        PaxosMessage {
            kind: MessageKind::Accept,
            inst: 0,
            crnd: self.round,
            vrnd: self.round,
            nid: 0,
            req_id,
            value: command,
        }
    }

    /// Resolve the pending submission a response belongs to.
    ///
    /// Returns whether anything was waiting; unknown or duplicate ids are
    /// dropped (duplicated UDP delivery is normal, not an error).
    pub fn resolve(&mut self, resp: ClientResponse) -> bool {
        match self.pending.remove(&resp.req_id) {
            Some(reply) => {
                if reply.send(resp.value).is_err() {
                    debug!(req_id = resp.req_id, "caller gone before its reply arrived");
                }
                true
            }
            None => {
                debug!(req_id = resp.req_id, "no pending submission for reply");
                false
            }
        }
    }
}

/// Cloneable front-end handle feeding the proposer run loop.
#[derive(Clone)]
pub struct ProposerHandle {
    tx: mpsc::Sender<Submission>,
}

impl ProposerHandle {
    /// Create a handle and the submission queue a [`run_proposer`] call
    /// consumes.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Submit a command and wait for the decided response.
    ///
    /// Dropping the returned future abandons the submission; its pending
    /// entry is swept on a later registration.
    ///
    /// # Errors
    ///
    /// Fails when the proposer loop is gone, or when the submission was
    /// evicted before a reply arrived.
    pub async fn submit(&self, command: Bytes) -> Result<Bytes, Report<ProposerError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| Report::new(ProposerError).attach_printable("proposer loop is gone"))?;
        reply_rx
            .await
            .change_context(ProposerError)
            .attach_printable("submission dropped before a reply arrived")
    }
}

/// Drive the proposer over a transport until it closes.
///
/// `conn` is the response source / request sink -
/// [`crate::codec::proposer_transport`] in production. The loop is the
/// single dispatcher for the correlation table.
///
/// # Errors
///
/// Returns a report when sending on the transport fails.
#[instrument(skip_all, name = "proposer")]
pub async fn run_proposer<C>(
    config: ProposerConfig,
    mut conn: C,
    mut submissions: mpsc::Receiver<Submission>,
) -> Result<(), Report<ProposerError>>
where
    C: Stream<Item = Result<(ClientResponse, SocketAddr), io::Error>>
        + Sink<(PaxosMessage, SocketAddr), Error = io::Error>
        + Unpin,
{
    let mut proposer = Proposer::new(config.round);
    debug!(dest = %config.dest, round = config.round, "proposer started");

    loop {
        tokio::select! {
            biased;
            incoming = conn.next() => {
                let Some(result) = incoming else {
                    debug!("transport closed, proposer exiting");
                    return Ok(());
                };
                match result {
                    Ok((resp, from)) => {
                        trace!(req_id = resp.req_id, %from, "response received");
                        proposer.resolve(resp);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed datagram"),
                }
            }
            submission = submissions.recv() => {
                let Some((command, reply)) = submission else {
                    debug!("front end closed, proposer exiting");
                    return Ok(());
                };
                let msg = proposer.register(command, reply);
                conn.send((msg, config.dest))
                    .await
                    .change_context(ProposerError)?;
            }
        }
    }
}
