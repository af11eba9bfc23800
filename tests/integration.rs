//! Integration tests for the learner and proposer run loops.
//!
//! The loops are driven over in-memory channel transports so every test
//! controls exactly which datagrams arrive and observes exactly what goes
//! back out; one test runs the real UDP transport end to end.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::codec::Encoder;

use dataplane_paxos::codec::{ProposerCodec, learner_transport};
use dataplane_paxos::{
    BackoffConfig, ClientResponse, Deliver, LearnerConfig, MessageKind, Outbound, PaxosMessage,
    ProposerConfig, ProposerHandle, RetryConfig, Sleep, TokioSleep, run_learner, run_proposer,
};

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dataplane_paxos=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

// --- In-memory transport ---

/// Pairs a receive channel and a send channel into one bidirectional
/// transport with the `io::Error` surface the run loops expect.
struct Duplex<In, Out> {
    rx: mpsc::Receiver<In>,
    tx: mpsc::Sender<Out>,
}

fn duplex<In, Out>() -> (Duplex<In, Out>, mpsc::Sender<In>, mpsc::Receiver<Out>) {
    let (in_tx, in_rx) = mpsc::channel(32);
    let (out_tx, out_rx) = mpsc::channel(32);
    (
        Duplex {
            rx: in_rx,
            tx: out_tx,
        },
        in_tx,
        out_rx,
    )
}

impl<In, Out> Stream for Duplex<In, Out> {
    type Item = Result<In, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl<In, Out> Sink<Out> for Duplex<In, Out> {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.tx).poll_ready(cx).map_err(io::Error::other)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Out) -> Result<(), io::Error> {
        Pin::new(&mut self.tx).start_send(item).map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.tx).poll_flush(cx).map_err(io::Error::other)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.tx).poll_close(cx).map_err(io::Error::other)
    }
}

// --- Test fixtures ---

fn coordinator() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 34952))
}

fn client(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], port))
}

fn accepted(inst: u16, nid: u64, req_id: u8, value: &'static [u8]) -> PaxosMessage {
    PaxosMessage {
        kind: MessageKind::Accepted,
        inst,
        crnd: 1,
        vrnd: 1,
        nid,
        req_id,
        value: Bytes::from_static(value),
    }
}

fn promise(inst: u16, crnd: u8, vrnd: u8, nid: u64, value: &'static [u8]) -> PaxosMessage {
    PaxosMessage {
        kind: MessageKind::Promise,
        inst,
        crnd,
        vrnd,
        nid,
        req_id: 1,
        value: Bytes::from_static(value),
    }
}

/// Retry policy whose timer stays out of the way of a fast test.
fn patient_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 8,
        backoff: BackoffConfig {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        },
    }
}

/// Application that records deliveries and answers `done-<inst>`.
struct RecordingApp {
    tx: tokio::sync::mpsc::UnboundedSender<(u16, Bytes)>,
}

impl Deliver for RecordingApp {
    type Error = Infallible;

    async fn deliver(&mut self, inst: u16, command: Bytes) -> Result<Bytes, Infallible> {
        self.tx.send((inst, command)).expect("test is listening");
        Ok(Bytes::from(format!("done-{inst}")))
    }
}

/// Sleep that fires immediately, for retry-exhaustion tests.
#[derive(Clone, Copy)]
struct InstantSleep;

impl Sleep for InstantSleep {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

// --- Learner loop ---

#[tokio::test]
async fn learner_delivers_in_order_and_routes_responses() {
    let _guard = init_tracing();

    let (conn, mut net_tx, mut net_rx) = duplex::<(PaxosMessage, SocketAddr), _>();
    let (app_tx, mut app_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = LearnerConfig::with_seed(
        coordinator(),
        3,
        patient_retry(),
        TokioSleep,
        0,
    );
    let task = tokio::spawn(run_learner(config, conn, RecordingApp { tx: app_tx }));

    // decisions complete for instances 3, 1, 2 - two votes each
    for (inst, req_id) in [(3u16, 13u8), (1, 11), (2, 12)] {
        for nid in [1u64, 2] {
            net_tx
                .send((accepted(inst, nid, req_id, b"cmd"), client(req_id.into())))
                .await
                .unwrap();
        }
    }

    // the application observes 1, 2, 3 regardless of arrival order
    for expected in [1u16, 2, 3] {
        let (inst, command) = app_rx.recv().await.unwrap();
        assert_eq!(inst, expected);
        assert_eq!(command, Bytes::from_static(b"cmd"));
    }

    // outbound traffic interleaves gap recovery with responses:
    // prepare(1), response 1, prepare(2), response 2, response 3
    let (frame, to) = net_rx.next().await.unwrap();
    match frame {
        Outbound::Paxos(msg) => {
            assert_eq!(msg.kind, MessageKind::Prepare);
            assert_eq!(msg.inst, 1);
            assert_eq!(to, coordinator());
        }
        other => panic!("expected recovery prepare, got {other:?}"),
    }

    let mut responses = Vec::new();
    while responses.len() < 3 {
        let (frame, to) = net_rx.next().await.unwrap();
        match frame {
            Outbound::Response(resp) => responses.push((resp, to)),
            Outbound::Paxos(msg) => {
                assert_eq!(msg.kind, MessageKind::Prepare);
                assert_eq!(msg.inst, 2);
            }
        }
    }
    assert_eq!(
        responses
            .iter()
            .map(|(resp, _)| resp.req_id)
            .collect::<Vec<_>>(),
        vec![11, 12, 13]
    );
    assert_eq!(responses[0].0.value, Bytes::from_static(b"done-1"));
    assert_eq!(responses[2].0.value, Bytes::from_static(b"done-3"));
    // each response went back to the source of its deciding packet
    assert_eq!(responses[0].1, client(11));
    assert_eq!(responses[1].1, client(12));
    assert_eq!(responses[2].1, client(13));

    drop(net_tx);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn promise_quorum_is_promoted_to_accept() {
    let _guard = init_tracing();

    let (conn, mut net_tx, mut net_rx) = duplex::<(PaxosMessage, SocketAddr), _>();
    let (app_tx, _app_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = LearnerConfig::with_seed(
        coordinator(),
        3,
        patient_retry(),
        TokioSleep,
        0,
    );
    let task = tokio::spawn(run_learner(config, conn, RecordingApp { tx: app_tx }));

    net_tx
        .send((promise(6, 1, 0, 1, b""), client(1)))
        .await
        .unwrap();
    net_tx
        .send((promise(6, 1, 1, 2, b"recovered"), client(1)))
        .await
        .unwrap();

    let (frame, to) = net_rx.next().await.unwrap();
    match frame {
        Outbound::Paxos(msg) => {
            assert_eq!(msg.kind, MessageKind::Accept);
            assert_eq!(msg.inst, 6);
            assert_eq!(msg.crnd, 1);
            assert_eq!(msg.vrnd, 1);
            assert_eq!(msg.value, Bytes::from_static(b"recovered"));
            assert_eq!(to, coordinator());
        }
        other => panic!("expected promoted accept, got {other:?}"),
    }

    drop(net_tx);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn gap_recovery_gives_up_after_bounded_retries() {
    let _guard = init_tracing();

    let (conn, mut net_tx, mut net_rx) = duplex::<(PaxosMessage, SocketAddr), _>();
    let (app_tx, _app_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = LearnerConfig::with_seed(
        coordinator(),
        3,
        RetryConfig {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        },
        InstantSleep,
        0,
    );
    let task = tokio::spawn(run_learner(config, conn, RecordingApp { tx: app_tx }));

    // instance 2 decides, instance 1 never does
    net_tx
        .send((accepted(2, 1, 1, b"cmd"), client(1)))
        .await
        .unwrap();
    net_tx
        .send((accepted(2, 2, 1, b"cmd"), client(1)))
        .await
        .unwrap();

    let report = task
        .await
        .unwrap()
        .expect_err("retry budget exhaustion is an operational failure");
    assert!(format!("{report:?}").contains("recovery"));

    // the initial prepare plus three bounded retries, all for instance 1
    let mut prepares = 0;
    while let Some((frame, to)) = net_rx.next().await {
        match frame {
            Outbound::Paxos(msg) => {
                assert_eq!(msg.kind, MessageKind::Prepare);
                assert_eq!(msg.inst, 1);
                assert_eq!(to, coordinator());
                prepares += 1;
            }
            other => panic!("unexpected outbound frame {other:?}"),
        }
    }
    assert_eq!(prepares, 4);
    drop(net_tx);
}

// --- Proposer loop ---

#[tokio::test]
async fn proposer_correlates_submission_with_reply() {
    let _guard = init_tracing();

    let (conn, mut net_tx, mut net_rx) = duplex::<(ClientResponse, SocketAddr), _>();
    let (handle, submissions) = ProposerHandle::channel(8);
    let task = tokio::spawn(run_proposer(
        ProposerConfig::new(coordinator(), 0),
        conn,
        submissions,
    ));

    let submit = tokio::spawn({
        let handle = handle.clone();
        async move { handle.submit(Bytes::from_static(b"GET k")).await }
    });

    let (msg, to) = net_rx.next().await.unwrap();
    assert_eq!(to, coordinator());
    assert_eq!(msg.kind, MessageKind::Accept);
    assert_eq!(msg.req_id, 1);
    assert_eq!(msg.value, Bytes::from_static(b"GET k"));

    // a reply with a different id resolves nothing
    net_tx
        .send((
            ClientResponse {
                req_id: 9,
                value: Bytes::from_static(b"wrong"),
            },
            coordinator(),
        ))
        .await
        .unwrap();
    net_tx
        .send((
            ClientResponse {
                req_id: 1,
                value: Bytes::from_static(b"v=1"),
            },
            coordinator(),
        ))
        .await
        .unwrap();

    let value = submit.await.unwrap().unwrap();
    assert_eq!(value, Bytes::from_static(b"v=1"));

    drop(handle);
    drop(net_tx);
    task.await.unwrap().unwrap();
}

// --- Real UDP transport ---

#[tokio::test]
async fn udp_transport_decides_and_responds() {
    let _guard = init_tracing();

    let learner_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let learner_addr = learner_socket.local_addr().unwrap();
    let acceptor = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (app_tx, mut app_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = LearnerConfig::new(coordinator(), 3);
    let task = tokio::spawn(run_learner(
        config,
        learner_transport(learner_socket),
        RecordingApp { tx: app_tx },
    ));

    // two accepted-value datagrams decide instance 1
    let mut codec = ProposerCodec;
    for nid in [1u64, 2] {
        let mut buf = BytesMut::new();
        codec.encode(accepted(1, nid, 42, b"SET x=1"), &mut buf).unwrap();
        acceptor.send_to(&buf, learner_addr).await.unwrap();
    }

    let (inst, command) = app_rx.recv().await.unwrap();
    assert_eq!(inst, 1);
    assert_eq!(command, Bytes::from_static(b"SET x=1"));

    // the response datagram comes back to the deciding packet's source
    let mut buf = [0u8; 128];
    let (n, _from) = acceptor.recv_from(&mut buf).await.unwrap();
    let mut frame = BytesMut::from(&buf[..n]);
    let resp = tokio_util::codec::Decoder::decode(&mut ProposerCodec, &mut frame)
        .unwrap()
        .unwrap();
    assert_eq!(resp.req_id, 42);
    assert_eq!(resp.value, Bytes::from_static(b"done-1"));

    task.abort();
}
