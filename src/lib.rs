//! Control-plane Paxos for deployments whose acceptors run in the network
//! data plane.
//!
//! The data plane decides; this crate proposes, learns and orders. Two roles
//! are provided:
//!
//! - **Proposer**: accepts client commands, stamps them with wire-level
//!   correlation ids and matches asynchronous replies
//!   ([`ProposerHandle::submit`]).
//! - **Learner**: aggregates phase-1b promises and phase-2b accepted-values
//!   from a fixed set of acceptors, detects quorum with
//!   [`PaxosLearner`], and delivers decided commands to the application in
//!   strict instance order, recovering gaps by re-issuing phase-1a prepares.
//!
//! Both run loops are generic over a `Stream + Sink` transport so that
//! [`tokio_util::udp::UdpFramed`] carries production traffic (see
//! [`codec::learner_transport`]) while tests drive the same loops over
//! in-memory channels.
//!
//! # Quick start
//!
//! ```ignore
//! use dataplane_paxos::config::DEFAULT_LEARNER_PORT;
//! use dataplane_paxos::{codec, run_learner, LearnerConfig};
//!
//! let socket = tokio::net::UdpSocket::bind(("0.0.0.0", DEFAULT_LEARNER_PORT)).await?;
//! let transport = codec::learner_transport(socket);
//! run_learner(LearnerConfig::new(coordinator_addr, 3), transport, app).await?;
//! ```

#![warn(clippy::pedantic)]

pub mod codec;
pub mod config;
pub mod core;
pub mod learner;
pub mod messages;
pub mod proposer;

pub use codec::{LearnerCodec, LearnerTransport, ProposerCodec, ProposerTransport};
pub use config::{
    BackoffConfig, LearnerConfig, ProposerConfig, RetryConfig, Sleep, TokioSleep,
};
pub use core::{PaxosLearner, majority};
pub use learner::{Deliver, Delivery, Learner, LearnerError, run_learner};
pub use messages::{ClientResponse, MessageKind, Outbound, PaxosMessage};
pub use proposer::{Proposer, ProposerError, ProposerHandle, Submission, run_proposer};
