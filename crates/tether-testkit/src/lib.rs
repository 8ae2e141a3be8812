//! Conformance scenarios for tether sessions.
//!
//! A transport crate implements [`TransportFactory`] and runs the shared
//! scenarios; a transport on which every scenario passes carries sessions
//! correctly. The scenarios exercise the externally visible session
//! contract: handshake, ordered delivery, RPC round trips and timeouts,
//! close-time cancellation, and replay after a reconnect.
//!
//! ```ignore
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     type Transport = MyTransport;
//!     fn connect_pair() -> impl Future<Output = Result<(Self::Transport, Self::Transport), TestError>> + Send {
//!         async { /* create a connected pair */ }
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_transport_rpc_round_trip() {
//!     tether_testkit::run_rpc_round_trip::<MyFactory>().await.unwrap();
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tether::{
    ResultCode, SenderMode, Session, SessionBuilder, SessionConfig, SessionEvent, SessionEvents,
    StaticToken,
};
use tether_core::{boxed, FrameTransport};
use tokio::time::timeout;

/// Failure of a test scenario.
#[derive(Debug)]
pub enum TestError {
    /// Transport creation failed.
    Setup(String),
    /// A step did not complete within its deadline.
    Timeout(&'static str),
    /// An observed value differed from the contract.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Timeout(step) => write!(f, "timed out waiting for {step}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

/// Creates connected transport pairs for the scenarios.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: FrameTransport;

    /// Create a connected pair: frames sent on one side arrive on the
    /// other, in order.
    fn connect_pair()
        -> impl Future<Output = Result<(Self::Transport, Self::Transport), TestError>> + Send;
}

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const TOKEN: &[u8] = b"testkit-token";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn test_config() -> SessionConfig {
    SessionConfig::default().with_tick_interval(Duration::from_millis(10))
}

/// A connected client/server session pair, handshake already complete.
pub struct SessionPair {
    pub client: Session,
    pub client_events: SessionEvents,
    pub server: Session,
    pub server_events: SessionEvents,
}

/// Build sessions over a fresh transport pair and wait for activation.
pub async fn session_pair<F: TransportFactory>(
    client_config: SessionConfig,
) -> Result<SessionPair, TestError> {
    init_tracing();
    let (client_side, server_side) = F::connect_pair().await?;

    let client_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let server_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

    let (client, client_events) = SessionBuilder::new(client_id, 100, 200)
        .config(client_config)
        .connect(Bytes::from_static(TOKEN))
        .spawn(boxed(client_side));
    let (server, server_events) = SessionBuilder::new(server_id, 200, 100)
        .config(test_config())
        .accept(StaticToken(Bytes::from_static(TOKEN)))
        .spawn(boxed(server_side));

    wait_active(&client, "client activation").await?;
    wait_active(&server, "server activation").await?;
    Ok(SessionPair {
        client,
        client_events,
        server,
        server_events,
    })
}

async fn wait_active(session: &Session, step: &'static str) -> Result<(), TestError> {
    for _ in 0..500 {
        if session.is_active() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err(TestError::Timeout(step))
}

/// Drain a session's events on a background task, answering every RPC with
/// an echo of its request body.
fn spawn_echo(mut events: SessionEvents) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SessionEvent::Rpc { body, responder } = event {
                responder.respond_success(body);
            }
        }
    });
}

/// Drain a session's events on a background task, discarding them. Keeps
/// RPC callbacks running without surfacing anything.
fn spawn_drain(mut events: SessionEvents) {
    tokio::spawn(async move { while events.recv().await.is_some() {} });
}

// ============================================================================
// Scenarios
// ============================================================================

/// Both sides reach CONNECTED through the token handshake.
pub async fn run_connect_handshake<F: TransportFactory>() -> Result<(), TestError> {
    let pair = session_pair::<F>(test_config()).await?;
    if !pair.client.is_active() || !pair.server.is_active() {
        return Err(TestError::Assertion("sessions not active".into()));
    }
    Ok(())
}

/// One-way messages arrive exactly once, in send order.
pub async fn run_one_way_ordering<F: TransportFactory>() -> Result<(), TestError> {
    let mut pair = session_pair::<F>(test_config()).await?;

    let count = 20usize;
    for i in 0..count {
        pair.client
            .send(Bytes::from(format!("msg-{i}")))
            .map_err(|e| TestError::Assertion(format!("send failed: {e}")))?;
    }

    let mut received = Vec::new();
    while received.len() < count {
        let event = timeout(Duration::from_secs(5), pair.server_events.recv())
            .await
            .map_err(|_| TestError::Timeout("one-way delivery"))?
            .ok_or(TestError::Timeout("server events closed early"))?;
        if let SessionEvent::Message(body) = event {
            received.push(body);
        }
    }
    for (i, body) in received.iter().enumerate() {
        let expected = format!("msg-{i}");
        if body.as_ref() != expected.as_bytes() {
            return Err(TestError::Assertion(format!(
                "position {i}: got {body:?}, expected {expected:?}"
            )));
        }
    }
    Ok(())
}

/// An asynchronous call completes exactly once with the peer's response.
pub async fn run_rpc_round_trip<F: TransportFactory>() -> Result<(), TestError> {
    let pair = session_pair::<F>(test_config()).await?;
    spawn_echo(pair.server_events);
    spawn_drain(pair.client_events);

    let (tx, rx) = tokio::sync::oneshot::channel();
    pair.client
        .call(Bytes::from_static(b"marco"), None, move |response| {
            let _ = tx.send(response);
        })
        .map_err(|e| TestError::Assertion(format!("call failed: {e}")))?;

    let response = timeout(Duration::from_secs(5), rx)
        .await
        .map_err(|_| TestError::Timeout("rpc response"))?
        .map_err(|_| TestError::Assertion("callback dropped without running".into()))?;
    if response.code != ResultCode::Success {
        return Err(TestError::Assertion(format!(
            "unexpected result code {:?}",
            response.code
        )));
    }
    if response.body.as_deref() != Some(b"marco".as_slice()) {
        return Err(TestError::Assertion("echo body mismatch".into()));
    }
    Ok(())
}

/// A call with no response resolves to TIMEOUT at its deadline, exactly
/// once.
pub async fn run_rpc_timeout<F: TransportFactory>() -> Result<(), TestError> {
    let pair = session_pair::<F>(test_config()).await?;
    // The server's events are never drained, so the request is never
    // answered.
    spawn_drain(pair.client_events);

    let completions = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let counter = completions.clone();
    pair.client
        .call(
            Bytes::from_static(b"void"),
            Some(Duration::from_millis(300)),
            move |response| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(response.code);
            },
        )
        .map_err(|e| TestError::Assertion(format!("call failed: {e}")))?;

    let code = timeout(Duration::from_secs(5), rx)
        .await
        .map_err(|_| TestError::Timeout("timeout completion"))?
        .map_err(|_| TestError::Assertion("callback dropped without running".into()))?;
    if code != ResultCode::Timeout {
        return Err(TestError::Assertion(format!(
            "unexpected result code {code:?}"
        )));
    }
    // Give a late duplicate every chance to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    match completions.load(Ordering::SeqCst) {
        1 => Ok(()),
        n => Err(TestError::Assertion(format!("callback ran {n} times"))),
    }
}

/// Synchronous calls block their own thread, resolve in issue order, and
/// flush buffered sends before parking.
pub async fn run_sync_calls_in_order<F: TransportFactory>() -> Result<(), TestError> {
    let pair = session_pair::<F>(
        test_config().with_sender_mode(SenderMode::Buffered),
    )
    .await?;
    spawn_echo(pair.server_events);
    spawn_drain(pair.client_events);

    // `sync` refuses to park a thread that carries the runtime context, so
    // the calls come from a plain OS thread.
    let client = pair.client.clone();
    let (result_tx, result_rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        // Buffered one-way traffic queued ahead of the calls; the first sync
        // call must flush it rather than deadlock behind it.
        client.send(Bytes::from_static(b"buffered")).unwrap();
        let first = client.sync(Bytes::from_static(b"first"), Some(Duration::from_secs(5)));
        let second = client.sync(Bytes::from_static(b"second"), Some(Duration::from_secs(5)));
        let _ = result_tx.send((first, second));
    });
    let (first, second) = timeout(Duration::from_secs(15), result_rx)
        .await
        .map_err(|_| TestError::Timeout("sync call results"))?
        .map_err(|_| TestError::Assertion("sync thread panicked".into()))?;
    for (name, response, expected) in [
        ("first", &first, b"first".as_slice()),
        ("second", &second, b"second".as_slice()),
    ] {
        if response.code != ResultCode::Success {
            return Err(TestError::Assertion(format!(
                "{name} sync call returned {:?}",
                response.code
            )));
        }
        if response.body.as_deref() != Some(expected) {
            return Err(TestError::Assertion(format!("{name} echo body mismatch")));
        }
    }
    Ok(())
}

/// Closing a session with buffered calls resolves each of them to
/// SESSION_CLOSED and submits none of them to the network.
pub async fn run_close_cancels_buffered_calls<F: TransportFactory>() -> Result<(), TestError> {
    let mut pair = session_pair::<F>(
        test_config()
            .with_sender_mode(SenderMode::Buffered)
            .with_flush_threshold(100),
    )
    .await?;
    spawn_drain(pair.client_events);

    let pending = 5usize;
    let closed = Arc::new(AtomicUsize::new(0));
    for _ in 0..pending {
        let closed = closed.clone();
        pair.client
            .call(Bytes::from_static(b"doomed"), None, move |response| {
                if response.code == ResultCode::SessionClosed {
                    closed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .map_err(|e| TestError::Assertion(format!("call failed: {e}")))?;
    }

    pair.client.close();
    if closed.load(Ordering::SeqCst) != pending {
        return Err(TestError::Assertion(format!(
            "expected {pending} SESSION_CLOSED completions, got {}",
            closed.load(Ordering::SeqCst)
        )));
    }

    // None of the cancelled calls may surface on the peer.
    loop {
        match timeout(Duration::from_millis(300), pair.server_events.recv()).await {
            Err(_) | Ok(None) => return Ok(()),
            Ok(Some(SessionEvent::Rpc { .. })) => {
                return Err(TestError::Assertion(
                    "cancelled call reached the peer".into(),
                ));
            }
            Ok(Some(SessionEvent::Message(_))) => {}
        }
    }
}

/// A peer that never writes never acks; once the oldest unacked message
/// outlives its deadline the sender fails fast by closing the session.
pub async fn run_unacked_fail_fast<F: TransportFactory>() -> Result<(), TestError> {
    let pair = session_pair::<F>(
        test_config().with_ack_timeout(Duration::from_millis(200)),
    )
    .await?;
    spawn_drain(pair.client_events);
    spawn_drain(pair.server_events);

    pair.client
        .send(Bytes::from_static(b"unacked"))
        .map_err(|e| TestError::Assertion(format!("send failed: {e}")))?;

    for _ in 0..500 {
        if pair.client.is_closed() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(TestError::Assertion(
        "session stayed open past the unacked deadline".into(),
    ))
}

/// Idle sessions exchange ACK_PING/ACK_PONG and never hit the session
/// timeout while the link is healthy.
pub async fn run_heartbeat_keeps_idle_sessions_alive<F: TransportFactory>(
) -> Result<(), TestError> {
    let pair = session_pair::<F>(
        test_config()
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_session_timeout(Duration::from_millis(600)),
    )
    .await?;
    spawn_drain(pair.client_events);
    spawn_drain(pair.server_events);

    // Several session timeouts worth of silence from the application.
    tokio::time::sleep(Duration::from_secs(2)).await;
    if pair.client.is_active() && pair.server.is_active() {
        Ok(())
    } else {
        Err(TestError::Assertion(
            "an idle session closed despite heartbeats".into(),
        ))
    }
}

/// Messages unacknowledged when the link dies are replayed after a rebind
/// and arrive exactly once, in order.
pub async fn run_reconnect_replay<F: TransportFactory>() -> Result<(), TestError> {
    let mut pair = session_pair::<F>(test_config()).await?;

    // Kill the link, then send into the void. The writes fail, but the
    // messages stay in the unacked window.
    let (dead_client_side, dead_server_side) = F::connect_pair().await?;
    dead_client_side.close();
    drop(dead_server_side);
    pair.client
        .bind_transport(boxed(dead_client_side))
        .map_err(|e| TestError::Assertion(format!("bind failed: {e}")))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    pair.client
        .send(Bytes::from_static(b"lost-1"))
        .map_err(|e| TestError::Assertion(format!("send failed: {e}")))?;
    pair.client
        .send(Bytes::from_static(b"lost-2"))
        .map_err(|e| TestError::Assertion(format!("send failed: {e}")))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect: bind a fresh pair to both sessions.
    let (client_side, server_side) = F::connect_pair().await?;
    pair.server
        .bind_transport(boxed(server_side))
        .map_err(|e| TestError::Assertion(format!("bind failed: {e}")))?;
    pair.client
        .bind_transport(boxed(client_side))
        .map_err(|e| TestError::Assertion(format!("bind failed: {e}")))?;

    let mut received = Vec::new();
    while received.len() < 2 {
        let event = timeout(Duration::from_secs(5), pair.server_events.recv())
            .await
            .map_err(|_| TestError::Timeout("replayed delivery"))?
            .ok_or(TestError::Timeout("server events closed early"))?;
        if let SessionEvent::Message(body) = event {
            received.push(body);
        }
    }
    if received[0].as_ref() != b"lost-1" || received[1].as_ref() != b"lost-2" {
        return Err(TestError::Assertion(format!(
            "replayed out of order: {received:?}"
        )));
    }
    Ok(())
}
