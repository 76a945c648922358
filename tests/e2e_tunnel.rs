//! Relay, agent and destination wired together over loopback

use burrow_agent::{Agent, AgentConfig, AgentError};
use burrow_relay::{Relay, RelayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

async fn start_relay() -> (Relay, SocketAddr) {
    let relay = Relay::new(RelayConfig::new());
    let listener = Relay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = relay.clone();
    tokio::spawn(async move { server.serve(listener).await });

    (relay, addr)
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn start_agent(relay_addr: SocketAddr) -> Arc<Agent> {
    let agent = Arc::new(Agent::new(AgentConfig::new(format!("http://{}", relay_addr))).unwrap());

    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    agent
}

async fn wait_for_session(relay: &Relay, active: bool) {
    for _ in 0..300 {
        if relay.has_active_session() == active {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay session state never became {}", active);
}

async fn connect_through(relay_addr: SocketAddr, target: SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut status = vec![0u8; OK_RESPONSE.len()];
    client.read_exact(&mut status).await.unwrap();
    (client, status)
}

#[tokio::test]
async fn test_tunnel_round_trip() {
    let echo = start_echo_server().await;
    let (relay, relay_addr) = start_relay().await;

    let agent = start_agent(relay_addr).await;
    wait_for_session(&relay, true).await;

    let (mut client, status) = connect_through(relay_addr, echo).await;
    assert_eq!(status, OK_RESPONSE);

    client.write_all(b"hello through the burrow").await.unwrap();
    let mut echoed = [0u8; 24];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the burrow");

    // A second tunnel shares the same session
    let (mut second, status) = connect_through(relay_addr, echo).await;
    assert_eq!(status, OK_RESPONSE);
    second.write_all(b"again").await.unwrap();
    let mut echoed = [0u8; 5];
    second.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"again");

    agent.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_connect_is_refused_until_agent_registers() {
    let echo = start_echo_server().await;
    let (relay, relay_addr) = start_relay().await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", echo).as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let agent = start_agent(relay_addr).await;
    wait_for_session(&relay, true).await;

    let (_client, status) = connect_through(relay_addr, echo).await;
    assert_eq!(status, OK_RESPONSE);

    agent.shutdown();
}

#[tokio::test]
async fn test_unreachable_destination_closes_client_after_ack() {
    let (relay, relay_addr) = start_relay().await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let agent = start_agent(relay_addr).await;
    wait_for_session(&relay, true).await;

    let (mut client, status) = connect_through(relay_addr, target).await;
    assert_eq!(status, OK_RESPONSE);

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("client was not closed");
    assert!(read.is_ok());
    assert!(rest.is_empty());

    // The session itself survives the failed dial
    assert!(relay.has_active_session());
    agent.shutdown();
}

#[tokio::test]
async fn test_second_agent_is_rejected() {
    let (relay, relay_addr) = start_relay().await;

    let first = start_agent(relay_addr).await;
    wait_for_session(&relay, true).await;

    let second = Agent::new(AgentConfig::new(format!("ws://{}", relay_addr))).unwrap();
    let err = second.run().await.unwrap_err();
    assert!(matches!(err, AgentError::Handshake(_)));
    assert!(!err.is_fatal());

    assert!(relay.has_active_session());
    first.shutdown();
}

#[tokio::test]
async fn test_agent_can_reregister_after_disconnect() {
    let echo = start_echo_server().await;
    let (relay, relay_addr) = start_relay().await;

    let first = start_agent(relay_addr).await;
    wait_for_session(&relay, true).await;

    first.shutdown();
    wait_for_session(&relay, false).await;

    let second = start_agent(relay_addr).await;
    wait_for_session(&relay, true).await;

    let (mut client, status) = connect_through(relay_addr, echo).await;
    assert_eq!(status, OK_RESPONSE);
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    second.shutdown();
}
