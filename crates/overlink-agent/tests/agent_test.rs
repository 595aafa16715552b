//! End-to-end agent run on the direct overlay backend

mod common;

use common::ScriptedKeys;
use overlink_agent::{Agent, AgentConfig, ConnectionState};
use overlink_overlay::{DirectConfig, DirectNetwork, OverlaySession, PortForward};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_agent_relays_and_answers_liveness() {
    // Local service the overlay port maps to
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_port = service.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = service.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    let forward_port = free_port().await;
    let liveness_port = free_port().await;
    let state_dir = tempfile::tempdir().unwrap();

    let network = DirectNetwork::new(DirectConfig {
        forward_ports: vec![PortForward {
            listen_port: forward_port,
            overlay_port: service_port,
        }],
        ..Default::default()
    });
    let config = AgentConfig {
        hostname: "e2e-node".to_string(),
        control_url: "https://control.example.com".to_string(),
        state_dir: state_dir.path().join("overlay"),
        liveness_port,
        relay_target_host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    let keys = ScriptedKeys::default();
    let agent = Agent::new(config, network, keys.clone()).unwrap();
    let relays = agent.relays();
    let handle = agent.start().await.unwrap();

    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(keys.calls(), 1);
    assert!(state_dir.path().join("overlay").is_dir());

    // Relay
    let mut client = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    client.write_all(b"0123456789").await.unwrap();
    let mut echoed = [0u8; 10];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"0123456789");
    let active = relays.list().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].destination.port(), service_port);
    assert_eq!(active[0].local_target, format!("127.0.0.1:{}", service_port));

    drop(client);
    tokio::time::timeout(TIMEOUT, async {
        while relays.count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay should be unregistered after the client leaves");

    // Liveness
    let mut probe = TcpStream::connect(("127.0.0.1", liveness_port)).await.unwrap();
    probe
        .write_all(b"GET / HTTP/1.1\r\nHost: e2e-node\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(TIMEOUT, probe.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("\r\n\r\nOk\n"));

    let session = handle.current_session().unwrap();
    handle.shutdown().await;
    assert!(session.local_client().is_err());
}
