//! Subscription lifecycle, topic/queue delivery, selectors, ack modes, and
//! the 1.0 fallbacks.

use broker::config::BrokerConfig;
use broker::{Broker, BrokerHandle};
use broker_test_utils::MockStompClient;
use stomp_wire::{Command, Frame};
use tokio::time::Duration;

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

fn subscribe(destination: &str, id: &str, receipt: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header("destination", destination)
        .with_header("id", id)
        .with_header("receipt", receipt)
}

fn send(destination: &str, message_id: &str, body: &str) -> Frame {
    Frame::new(Command::Send)
        .with_header("destination", destination)
        .with_header("message-id", message_id)
        .with_body(body.as_bytes().to_vec())
}

async fn expect_receipt(client: &mut MockStompClient, receipt_id: &str) {
    let frame = client.recv_frame().await.expect("receipt frame");
    assert_eq!(frame.command, Command::Receipt);
    assert_eq!(frame.header("receipt-id"), Some(receipt_id));
}

#[tokio::test]
async fn topic_delivery_carries_subscription_and_message_id() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/news", "s1", "r1"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(
            &Frame::new(Command::Send)
                .with_header("destination", "/topic/news")
                .with_body(&b"hello"[..]),
        )
        .await
        .unwrap();

    let message = sub.recv_frame().await.unwrap();
    assert_eq!(message.command, Command::Message);
    assert_eq!(message.header("destination"), Some("/topic/news"));
    assert_eq!(message.header("subscription"), Some("s1"));
    assert!(
        message
            .header("message-id")
            .is_some_and(|id| id.starts_with("msg:"))
    );
    assert_eq!(&message.body[..], b"hello");
}

#[tokio::test]
async fn cumulative_ack_settles_the_prefix_only() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/acks", "s1", "r1").with_header("ack", "client"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    for id in ["m1", "m2", "m3"] {
        publisher
            .send_frame(&send("/topic/acks", id, id))
            .await
            .unwrap();
    }
    for id in ["m1", "m2", "m3"] {
        let message = sub.recv_frame().await.unwrap();
        assert_eq!(message.header("message-id"), Some(id));
    }

    // ACK m2 settles m1 and m2; m3 remains pending and can still be acked.
    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("subscription", "s1")
            .with_header("message-id", "m2")
            .with_header("receipt", "ra2"),
    )
    .await
    .unwrap();
    expect_receipt(&mut sub, "ra2").await;

    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("subscription", "s1")
            .with_header("message-id", "m3")
            .with_header("receipt", "ra3"),
    )
    .await
    .unwrap();
    expect_receipt(&mut sub, "ra3").await;

    // m1 went with the cumulative ack of m2: acking it again is an error.
    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("subscription", "s1")
            .with_header("message-id", "m1"),
    )
    .await
    .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(error.command, Command::Error);
    assert_eq!(
        error.header("message"),
        Some("ACK failed, invalid message id: m1")
    );
}

#[tokio::test]
async fn client_individual_ack_settles_exactly_one() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/ind", "s1", "r1").with_header("ack", "client-individual"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/ind", "m1", "one"))
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/ind", "m2", "two"))
        .await
        .unwrap();
    sub.recv_frame().await.unwrap();
    sub.recv_frame().await.unwrap();

    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("subscription", "s1")
            .with_header("message-id", "m2")
            .with_header("receipt", "ra"),
    )
    .await
    .unwrap();
    expect_receipt(&mut sub, "ra").await;

    // m2 is settled; m1 is untouched, so a repeat of m2 fails.
    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("subscription", "s1")
            .with_header("message-id", "m2"),
    )
    .await
    .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(
        error.header("message"),
        Some("ACK failed, invalid message id: m2")
    );
}

#[tokio::test]
async fn ack_on_auto_subscription_is_a_protocol_error() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/auto", "s1", "r1"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;

    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("subscription", "s1")
            .with_header("message-id", "whatever"),
    )
    .await
    .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(
        error.header("message"),
        Some("subscription ack mode does not expect ACK frames")
    );
}

#[tokio::test]
async fn queue_buffers_messages_sent_before_subscribe() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(&send("/queue/jobs", "j1", "job one"))
        .await
        .unwrap();

    let (mut worker, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    worker
        .send_frame(&subscribe("/queue/jobs", "w1", "r1"))
        .await
        .unwrap();
    expect_receipt(&mut worker, "r1").await;

    let message = worker.recv_frame().await.unwrap();
    assert_eq!(message.header("message-id"), Some("j1"));
    assert_eq!(&message.body[..], b"job one");
}

#[tokio::test]
async fn duplicate_subscription_id_is_fatal() {
    let handle = start(test_config()).await;
    let (mut sub, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/a", "s1", "r1"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;

    sub.send_frame(&subscribe("/topic/b", "s1", "r2"))
        .await
        .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(
        error.header("message"),
        Some("A subscription with id 's1' already exists")
    );
}

#[tokio::test]
async fn subscribe_without_id_requires_1_0() {
    let handle = start(test_config()).await;
    let (mut sub, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    sub.send_frame(
        &Frame::new(Command::Subscribe).with_header("destination", "/topic/x"),
    )
    .await
    .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(error.header("message"), Some("id header is required"));
}

#[tokio::test]
async fn selector_filters_deliveries() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/colored", "s1", "r1").with_header("selector", "color = 'red'"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/colored", "m-blue", "blue one").with_header("color", "blue"))
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/colored", "m-red", "red one").with_header("color", "red"))
        .await
        .unwrap();

    let message = sub.recv_frame().await.unwrap();
    assert_eq!(message.header("message-id"), Some("m-red"));
}

#[tokio::test]
async fn invalid_selector_is_fatal() {
    let handle = start(test_config()).await;
    let (mut sub, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/x", "s1", "r1").with_header("selector", "color ="))
        .await
        .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(error.command, Command::Error);
    assert!(
        error
            .header("message")
            .is_some_and(|m| m.starts_with("Invalid selector"))
    );
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&subscribe("/topic/old", "s1", "r1"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r1").await;
    sub.send_frame(&subscribe("/topic/marker", "s2", "r2"))
        .await
        .unwrap();
    expect_receipt(&mut sub, "r2").await;

    sub.send_frame(
        &Frame::new(Command::Unsubscribe)
            .with_header("id", "s1")
            .with_header("receipt", "r3"),
    )
    .await
    .unwrap();
    expect_receipt(&mut sub, "r3").await;

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/old", "dead", "not delivered"))
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/marker", "live", "delivered"))
        .await
        .unwrap();

    // Only the marker subscription delivers; the unsubscribed topic is gone.
    let message = sub.recv_frame().await.unwrap();
    assert_eq!(message.header("message-id"), Some("live"));
    assert_eq!(message.header("subscription"), Some("s2"));
}

#[tokio::test]
async fn unsubscribe_unknown_id_is_fatal() {
    let handle = start(test_config()).await;
    let (mut sub, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&Frame::new(Command::Unsubscribe).with_header("id", "nope"))
        .await
        .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(error.header("message"), Some("Subscription 'nope' not found"));
}

#[tokio::test]
async fn unknown_action_is_fatal() {
    let handle = start(test_config()).await;
    let (mut client, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    client.send_raw(b"NACK\nid:1\n\n\x00").await.unwrap();
    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.header("message"), Some("Unknown STOMP action: NACK"));
}

#[tokio::test]
async fn invalid_destination_is_fatal() {
    let handle = start(test_config()).await;
    let (mut client, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    client
        .send_frame(&send("/bogus/x", "m1", "nope"))
        .await
        .unwrap();
    let error = client.recv_frame().await.unwrap();
    assert_eq!(error.header("message"), Some("invalid destination: /bogus/x"));
}

#[tokio::test]
async fn v10_subscribes_by_destination_and_acks_without_subscription() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut sub, connected) = MockStompClient::connect_session(addr, "1.0", None)
        .await
        .unwrap();
    assert_eq!(connected.header("version"), Some("1.0"));

    // 1.0 fallback: no id header; the destination identifies the subscription.
    sub.send_frame(
        &Frame::new(Command::Subscribe)
            .with_header("destination", "/topic/legacy")
            .with_header("ack", "client")
            .with_header("receipt", "r1"),
    )
    .await
    .unwrap();
    expect_receipt(&mut sub, "r1").await;

    let (mut publisher, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/legacy", "m1", "legacy"))
        .await
        .unwrap();

    let message = sub.recv_frame().await.unwrap();
    // Identified by destination, so no subscription header on the way out.
    assert_eq!(message.header("subscription"), None);
    assert_eq!(message.header("message-id"), Some("m1"));

    // ...and ACK may omit the subscription header too.
    sub.send_frame(
        &Frame::new(Command::Ack)
            .with_header("message-id", "m1")
            .with_header("receipt", "ra"),
    )
    .await
    .unwrap();
    expect_receipt(&mut sub, "ra").await;
}

#[tokio::test]
async fn v11_ack_requires_the_subscription_header() {
    let handle = start(test_config()).await;
    let (mut sub, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    sub.send_frame(&Frame::new(Command::Ack).with_header("message-id", "m1"))
        .await
        .unwrap();
    let error = sub.recv_frame().await.unwrap();
    assert_eq!(
        error.header("message"),
        Some("subscription header is required")
    );
}

#[tokio::test]
async fn topic_message_with_no_subscribers_is_dropped_but_receipted() {
    let handle = start(test_config()).await;
    let (mut publisher, _) = MockStompClient::connect_session(handle.local_addr(), "1.1", None)
        .await
        .unwrap();
    publisher
        .send_frame(&send("/topic/void", "m1", "nobody home").with_header("receipt", "r1"))
        .await
        .unwrap();
    expect_receipt(&mut publisher, "r1").await;
    assert!(
        publisher
            .try_recv_frame(Duration::from_millis(100))
            .await
            .is_none()
    );
}
