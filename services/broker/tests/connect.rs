//! CONNECT handshake: version and heart-beat negotiation, virtual hosts,
//! authentication, and the one-ERROR-then-close failure shape.

use broker::config::BrokerConfig;
use broker::{Broker, BrokerHandle};
use broker_test_utils::MockStompClient;
use stomp_wire::{Command, Frame};

fn test_config() -> BrokerConfig {
    BrokerConfig {
        die_delay_ms: 150,
        ..BrokerConfig::default()
    }
}

async fn start(mut config: BrokerConfig) -> BrokerHandle {
    config.bind = "127.0.0.1:0".to_owned();
    Broker::start(config).await.expect("broker start")
}

#[tokio::test]
async fn unsupported_version_gets_error_with_supported_list_then_close() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_raw(b"CONNECT\naccept-version:2.5\nhost:x\n\n\x00")
        .await
        .unwrap();

    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.command, Command::Error);
    assert_eq!(error.header("message"), Some("version not supported"));
    assert_eq!(error.header("version"), Some("1.0,1.1"));
    assert_eq!(&error.body[..], b"Supported protocol versions are 1.0,1.1");
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn connected_echoes_negotiated_version_and_server_heart_beat() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(
            &Frame::new(Command::Connect)
                .with_header("accept-version", "1.1")
                .with_header("heart-beat", "500,2000"),
        )
        .await
        .unwrap();

    let connected = client.recv_frame().await.unwrap();
    assert_eq!(connected.command, Command::Connected);
    assert_eq!(connected.header("version"), Some("1.1"));
    // Server advertises its own configured minimums, not the client's.
    assert_eq!(connected.header("heart-beat"), Some("100,10000"));
    assert!(connected.header("session").is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn missing_accept_version_defaults_to_1_0() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client.send_frame(&Frame::new(Command::Connect)).await.unwrap();

    let connected = client.recv_frame().await.unwrap();
    assert_eq!(connected.header("version"), Some("1.0"));
}

#[tokio::test]
async fn first_frame_must_be_a_connect_frame() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(
            &Frame::new(Command::Subscribe)
                .with_header("destination", "/topic/x")
                .with_header("id", "s1"),
        )
        .await
        .unwrap();

    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.command, Command::Error);
    assert_eq!(
        error.header("message"),
        Some("Client must first send a connect frame")
    );
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn non_numeric_heart_beat_is_fatal() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(
            &Frame::new(Command::Connect)
                .with_header("accept-version", "1.1")
                .with_header("heart-beat", "abc,0"),
        )
        .await
        .unwrap();

    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.command, Command::Error);
    assert!(
        error
            .header("message")
            .is_some_and(|m| m.starts_with("Invalid heart-beat header"))
    );
}

#[tokio::test]
async fn unknown_virtual_host_is_fatal() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(
            &Frame::new(Command::Connect)
                .with_header("accept-version", "1.1")
                .with_header("host", "nope"),
        )
        .await
        .unwrap();

    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.header("message"), Some("Invalid virtual host: nope"));
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn authentication_rejects_bad_credentials() {
    let mut config = test_config();
    config.virtual_hosts[0]
        .users
        .insert("alice".to_owned(), "secret".to_owned());
    let handle = start(config).await;

    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(
            &Frame::new(Command::Connect)
                .with_header("accept-version", "1.1")
                .with_header("login", "alice")
                .with_header("passcode", "wrong"),
        )
        .await
        .unwrap();

    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.header("message"), Some("Authentication failed."));
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn authentication_accepts_configured_credentials() {
    let mut config = test_config();
    config.virtual_hosts[0]
        .users
        .insert("alice".to_owned(), "secret".to_owned());
    let handle = start(config).await;

    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(
            &Frame::new(Command::Connect)
                .with_header("accept-version", "1.1")
                .with_header("login", "alice")
                .with_header("passcode", "secret"),
        )
        .await
        .unwrap();

    let connected = client.recv_frame().await.unwrap();
    assert_eq!(connected.command, Command::Connected);
}

#[tokio::test]
async fn each_session_gets_a_distinct_id() {
    let handle = start(test_config()).await;
    let (_c1, connected1) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    let (_c2, connected2) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    assert_ne!(connected1.header("session"), connected2.header("session"));
}

#[tokio::test]
async fn stomp_command_also_opens_a_session() {
    let handle = start(test_config()).await;
    let mut client = MockStompClient::connect(handle.local_addr()).await.unwrap();
    client
        .send_frame(&Frame::new(Command::Stomp).with_header("accept-version", "1.1"))
        .await
        .unwrap();
    let connected = client.recv_frame().await.unwrap();
    assert_eq!(connected.command, Command::Connected);
}
