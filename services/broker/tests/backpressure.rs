//! Flow control: a full destination suspends the producer's reads; the
//! refill (a consumer draining the queue) resumes them, and per-destination
//! send order survives the stall.

use broker::config::BrokerConfig;
use broker::{Broker, BrokerHandle};
use broker_test_utils::MockStompClient;
use stomp_wire::{Command, Frame};
use tokio::time::Duration;

async fn start(mut config: BrokerConfig) -> BrokerHandle {
    config.bind = "127.0.0.1:0".to_owned();
    Broker::start(config).await.expect("broker start")
}

async fn expect_receipt(client: &mut MockStompClient, receipt_id: &str) {
    let frame = client.recv_frame().await.expect("receipt frame");
    assert_eq!(frame.command, Command::Receipt);
    assert_eq!(frame.header("receipt-id"), Some(receipt_id));
}

#[tokio::test]
async fn full_destination_suspends_producer_until_drained() {
    let mut config = BrokerConfig {
        die_delay_ms: 150,
        ..BrokerConfig::default()
    };
    // Tiny buffers so a handful of sends jam the destination.
    config.virtual_hosts[0].destination_buffer = 2;
    let handle = start(config).await;
    let addr = handle.local_addr();

    let (mut producer, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();

    // No consumer yet: the queue absorbs a few deliveries, then the
    // destination fills and the producer's reads stop. The final send
    // carries a receipt; it cannot be processed while reads are suspended.
    let total = 10;
    for n in 1..=total {
        let mut frame = Frame::new(Command::Send)
            .with_header("destination", "/queue/pile")
            .with_header("message-id", &format!("m{n}"))
            .with_body(format!("payload {n}"));
        if n == total {
            frame = frame.with_header("receipt", "last");
        }
        producer.send_frame(&frame).await.unwrap();
    }
    assert!(
        producer
            .try_recv_frame(Duration::from_millis(300))
            .await
            .is_none(),
        "receipt must not arrive while the destination is blocked"
    );

    // A consumer binds and drains: reads resume and the backlog flows in
    // send order.
    let (mut consumer, _) = MockStompClient::connect_session(addr, "1.1", None)
        .await
        .unwrap();
    consumer
        .send_frame(
            &Frame::new(Command::Subscribe)
                .with_header("destination", "/queue/pile")
                .with_header("id", "c1")
                .with_header("receipt", "sub"),
        )
        .await
        .unwrap();
    expect_receipt(&mut consumer, "sub").await;

    for n in 1..=total {
        let message = consumer.recv_frame().await.unwrap();
        assert_eq!(
            message.header("message-id"),
            Some(format!("m{n}").as_str()),
            "messages must arrive in send order"
        );
    }
    expect_receipt(&mut producer, "last").await;
}
