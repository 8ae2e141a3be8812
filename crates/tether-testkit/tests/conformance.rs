//! The conformance suite run over the in-process reference transport.

use std::future::Future;

use tether_testkit::{TestError, TransportFactory};
use tether_transport_mem::MemTransport;

struct MemFactory;

impl TransportFactory for MemFactory {
    type Transport = MemTransport;

    fn connect_pair(
    ) -> impl Future<Output = Result<(Self::Transport, Self::Transport), TestError>> + Send {
        async { Ok(MemTransport::pair()) }
    }
}

#[tokio::test]
async fn mem_connect_handshake() {
    tether_testkit::run_connect_handshake::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_one_way_ordering() {
    tether_testkit::run_one_way_ordering::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_rpc_round_trip() {
    tether_testkit::run_rpc_round_trip::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_rpc_timeout() {
    tether_testkit::run_rpc_timeout::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mem_sync_calls_in_order() {
    tether_testkit::run_sync_calls_in_order::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_close_cancels_buffered_calls() {
    tether_testkit::run_close_cancels_buffered_calls::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_unacked_fail_fast() {
    tether_testkit::run_unacked_fail_fast::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_heartbeat_keeps_idle_sessions_alive() {
    tether_testkit::run_heartbeat_keeps_idle_sessions_alive::<MemFactory>()
        .await
        .unwrap();
}

#[tokio::test]
async fn mem_reconnect_replay() {
    tether_testkit::run_reconnect_replay::<MemFactory>()
        .await
        .unwrap();
}
