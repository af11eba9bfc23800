//! Decision sequencing and the learner dispatch loop.
//!
//! [`Learner`] owns the delivery cursor on top of the quorum aggregator:
//! the application observes decided commands in strictly increasing
//! instance order no matter how decisions arrive over UDP. A decision-log
//! miss at the cursor triggers a phase-1a recovery prepare, re-sent with
//! bounded, jittered backoff.
//!
//! [`run_learner`] is the single dispatcher: every piece of aggregation,
//! cursor and retry state is mutated only on its task, so none of it needs
//! locking.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use tracing::{debug, instrument, trace, warn};

use crate::config::{LearnerConfig, Sleep};
use crate::core::PaxosLearner;
use crate::messages::{ClientResponse, MessageKind, Outbound, PaxosMessage};

/// Marker error for learner operations.
#[derive(Debug)]
pub struct LearnerError;

impl fmt::Display for LearnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("learner failed")
    }
}

impl std::error::Error for LearnerError {}

/// Application hook invoked for every decided command, in instance order.
///
/// The returned bytes become the response sent back to the client that
/// submitted the command.
#[expect(async_fn_in_trait)]
pub trait Deliver {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn deliver(&mut self, inst: u16, command: Bytes) -> Result<Bytes, Self::Error>;
}

/// What the delivery cursor can do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The instance at the cursor is decided and ready to hand over.
    Ready { inst: u16, command: Bytes },
    /// The instance at the cursor has no logged decision; it needs a
    /// recovery prepare before anything later can be delivered.
    Gap { inst: u16 },
    /// Nothing decided beyond the cursor.
    Idle,
}

/// Ordering state layered over the quorum aggregator.
pub struct Learner {
    paxos: PaxosLearner,
    /// Next instance the application expects.
    next_delivery: u16,
    /// Highest instance observed as decided.
    max_instance: u16,
    /// Correlation id and origin of the packet that decided each pending
    /// instance, for routing the response.
    reply_to: HashMap<u16, (u8, SocketAddr)>,
}

impl Learner {
    #[must_use]
    pub fn new(num_acceptors: usize) -> Self {
        Self {
            paxos: PaxosLearner::new(num_acceptors),
            next_delivery: 1,
            max_instance: 1,
            reply_to: HashMap::new(),
        }
    }

    /// Next instance the application expects.
    #[must_use]
    pub fn next_delivery(&self) -> u16 {
        self.next_delivery
    }

    /// Highest instance observed as decided.
    #[must_use]
    pub fn max_instance(&self) -> u16 {
        self.max_instance
    }

    /// Feed a phase-1b promise through to the aggregator.
    pub fn handle_promise(&mut self, msg: &PaxosMessage) -> Option<PaxosMessage> {
        self.paxos.handle_promise(msg)
    }

    /// Feed a phase-2b report; returns the decided instance if this message
    /// produced (or replayed) a decision that is still undelivered.
    pub fn on_accepted(&mut self, msg: &PaxosMessage, from: SocketAddr) -> Option<u16> {
        let (inst, _) = self.paxos.handle_accepted(msg)?;
        if inst < self.next_delivery {
            trace!(inst, "decision already delivered");
            return None;
        }
        self.reply_to.insert(inst, (msg.req_id, from));
        if self.max_instance < inst {
            self.max_instance = inst;
        }
        Some(inst)
    }

    /// Inspect the cursor: deliverable command, gap, or nothing pending.
    #[must_use]
    pub fn next_ready(&self) -> Delivery {
        if self.next_delivery > self.max_instance {
            return Delivery::Idle;
        }
        match self.paxos.decision(self.next_delivery) {
            Some(value) => Delivery::Ready {
                inst: self.next_delivery,
                command: value.clone(),
            },
            None => Delivery::Gap {
                inst: self.next_delivery,
            },
        }
    }

    /// Route back to the client awaiting `inst`, captured from the decision
    /// packet.
    pub fn take_reply(&mut self, inst: u16) -> Option<(u8, SocketAddr)> {
        self.reply_to.remove(&inst)
    }

    /// Advance the cursor past a delivered instance.
    pub fn complete(&mut self, inst: u16) {
        debug_assert_eq!(inst, self.next_delivery);
        self.next_delivery += 1;
        debug_assert!(u32::from(self.next_delivery) <= u32::from(self.max_instance) + 1);
    }
}

/// An armed gap-recovery retry.
struct Recovery {
    inst: u16,
    attempts: u32,
    delay: Duration,
}

/// Drive the learner over a transport until it closes.
///
/// `conn` is the packet source/sink - [`crate::codec::learner_transport`]
/// in production, an in-memory channel pair in tests. Decided commands are
/// handed to `deliver` strictly in instance order; its response is sent
/// back to the source address of the packet that completed the decision.
///
/// # Errors
///
/// Returns a report when sending on the transport fails, when the
/// application fails to process a delivery, or when the gap-recovery retry
/// budget for an instance is exhausted.
#[instrument(skip_all, name = "learner")]
pub async fn run_learner<C, D, S, R>(
    mut config: LearnerConfig<S, R>,
    mut conn: C,
    mut deliver: D,
) -> Result<(), Report<LearnerError>>
where
    C: Stream<Item = Result<(PaxosMessage, SocketAddr), io::Error>>
        + Sink<(Outbound, SocketAddr), Error = io::Error>
        + Unpin,
    D: Deliver,
    S: Sleep,
    R: Rng,
{
    let mut learner = Learner::new(config.num_acceptors);
    let mut recovery: Option<Recovery> = None;
    debug!(
        num_acceptors = config.num_acceptors,
        dest = %config.dest,
        "learner started"
    );

    loop {
        let incoming = if let Some(delay) = recovery.as_ref().map(|r| r.delay) {
            tokio::select! {
                biased;
                incoming = conn.next() => incoming,
                () = config.sleep.sleep(delay) => {
                    if let Some(rec) = recovery.as_mut() {
                        if rec.attempts >= config.retry.max_attempts {
                            return Err(Report::new(LearnerError).attach_printable(format!(
                                "instance {} still undecided after {} recovery prepares",
                                rec.inst,
                                rec.attempts + 1
                            )));
                        }
                        rec.attempts += 1;
                        debug!(inst = rec.inst, attempt = rec.attempts, "re-sending recovery prepare");
                        conn.send((Outbound::Paxos(PaxosMessage::prepare(rec.inst)), config.dest))
                            .await
                            .change_context(LearnerError)?;
                        rec.delay = config.retry.backoff.duration(rec.attempts, &mut config.rng);
                    }
                    continue;
                }
            }
        } else {
            conn.next().await
        };

        let Some(result) = incoming else {
            debug!("transport closed, learner exiting");
            return Ok(());
        };
        let (msg, from) = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed datagram");
                continue;
            }
        };

        match msg.kind {
            MessageKind::Promise => {
                if let Some(accept) = learner.handle_promise(&msg) {
                    trace!(inst = accept.inst, "broadcasting promoted accept");
                    conn.send((Outbound::Paxos(accept), config.dest))
                        .await
                        .change_context(LearnerError)?;
                }
            }
            MessageKind::Accepted => {
                if learner.on_accepted(&msg, from).is_none() {
                    continue;
                }
                loop {
                    match learner.next_ready() {
                        Delivery::Ready { inst, command } => {
                            trace!(inst, "delivering decided command");
                            let value = deliver
                                .deliver(inst, command)
                                .await
                                .change_context(LearnerError)?;
                            if let Some((req_id, addr)) = learner.take_reply(inst) {
                                conn.send((
                                    Outbound::Response(ClientResponse { req_id, value }),
                                    addr,
                                ))
                                .await
                                .change_context(LearnerError)?;
                            }
                            learner.complete(inst);
                            if recovery.as_ref().is_some_and(|r| r.inst == inst) {
                                recovery = None;
                            }
                        }
                        Delivery::Gap { inst } => {
                            if recovery.as_ref().is_none_or(|r| r.inst != inst) {
                                warn!(inst, "decision gap, sending recovery prepare");
                                conn.send((
                                    Outbound::Paxos(PaxosMessage::prepare(inst)),
                                    config.dest,
                                ))
                                .await
                                .change_context(LearnerError)?;
                                let delay = config.retry.backoff.duration(0, &mut config.rng);
                                recovery = Some(Recovery {
                                    inst,
                                    attempts: 0,
                                    delay,
                                });
                            }
                            break;
                        }
                        Delivery::Idle => break,
                    }
                }
            }
            MessageKind::Prepare | MessageKind::Accept => {
                warn!(kind = ?msg.kind, inst = msg.inst, "unexpected message type at learner");
            }
        }
    }
}
