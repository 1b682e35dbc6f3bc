#![allow(clippy::unwrap_used)]

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tunnel_proxy::{IncomingSession, OpenError, TunnelConfig, TunnelProxy};

/// Wires an initiator and an acceptor engine together over an in-memory pipe.
fn tunnel_pair(
    initiator_cfg: TunnelConfig,
) -> (
    tunnel_proxy::TunnelHandle,
    tokio::sync::mpsc::Receiver<IncomingSession>,
    tunnel_proxy::TunnelHandle,
) {
    let (gateway_end, agent_end) = tokio::io::duplex(256 * 1024);

    let (gw_reader, gw_writer) = tokio::io::split(gateway_end);
    let initiator = TunnelProxy::new(Box::new(gw_reader), Box::new(gw_writer)).with_config(initiator_cfg);
    let initiator_handle = initiator.handle();
    initiator.spawn().detach();

    let (ag_reader, ag_writer) = tokio::io::split(agent_end);
    let mut acceptor = TunnelProxy::new(Box::new(ag_reader), Box::new(ag_writer)).with_config(TunnelConfig::acceptor());
    let sessions = acceptor.session_acceptor();
    let acceptor_handle = acceptor.handle();
    acceptor.spawn().detach();

    (initiator_handle, sessions, acceptor_handle)
}

#[tokio::test]
async fn session_bytes_cross_both_directions() {
    let (handle, mut sessions, _acceptor) = tunnel_pair(TunnelConfig::initiator());

    let echo_server = tokio::spawn(async move {
        let incoming = sessions.recv().await.unwrap();
        assert_eq!(incoming.session_id, "sess-1");

        let mut stream = incoming.stream;
        let mut buf = vec![0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.write_all(b" back").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let mut stream = handle.open_session("sess-1").await.unwrap();
    stream.write_all(b"hello").await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello back");

    echo_server.await.unwrap();
}

#[tokio::test]
async fn operator_eof_half_closes_the_channel() {
    let (handle, mut sessions, _acceptor) = tunnel_pair(TunnelConfig::initiator());

    let agent = tokio::spawn(async move {
        let mut stream = sessions.recv().await.unwrap().stream;

        // The whole request is readable even though the peer already stopped
        // writing.
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // The answer still flows in the other direction.
        stream.write_all(b"late answer").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let mut stream = handle.open_session("sess-1").await.unwrap();
    stream.write_all(b"request").await.unwrap();

    let (mut read_half, write_half) = tokio::io::split(stream);
    drop_write_half(write_half).await;

    let mut answer = Vec::new();
    read_half.read_to_end(&mut answer).await.unwrap();
    assert_eq!(answer, b"late answer");

    agent.await.unwrap();
}

async fn drop_write_half(mut write_half: tokio::io::WriteHalf<tunnel_proxy::ChannelStream>) {
    write_half.shutdown().await.unwrap();
    drop(write_half);
}

#[tokio::test]
async fn channel_budget_is_enforced() {
    let cfg = TunnelConfig {
        max_channels: 1,
        ..TunnelConfig::initiator()
    };
    let (handle, mut sessions, _acceptor) = tunnel_pair(cfg);

    let _keep_sessions_alive = tokio::spawn(async move {
        let _held = sessions.recv().await;
        std::future::pending::<()>().await;
    });

    let _first = handle.open_session("sess-1").await.unwrap();

    let second = handle.open_session("sess-2").await;
    assert!(matches!(second, Err(OpenError::ResourceShortage)));
}

#[tokio::test]
async fn keepalive_is_acknowledged() {
    let (handle, _sessions, _acceptor) = tunnel_pair(TunnelConfig::initiator());

    handle.keepalive(1).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while handle.last_ack() < 1 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("keepalive should be acknowledged");
}

#[tokio::test]
async fn closing_the_tunnel_surfaces_eof_to_open_channels() {
    let (handle, mut sessions, acceptor_handle) = tunnel_pair(TunnelConfig::initiator());

    let agent = tokio::spawn(async move {
        let mut stream = sessions.recv().await.unwrap().stream;
        let mut out = Vec::new();
        // The agent-side consumer observes EOF when the tunnel dies.
        stream.read_to_end(&mut out).await.unwrap();
    });

    let mut stream = handle.open_session("sess-1").await.unwrap();

    acceptor_handle.close().await;
    acceptor_handle.closed().await;

    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;

    agent.await.unwrap();

    // A fresh open on the initiator fails: the peer is gone.
    let reopened = handle.open_session("sess-2").await;
    assert!(reopened.is_err());
}
