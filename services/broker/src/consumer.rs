//! Per-subscription consumer session.
//!
//! Converts router deliveries into outbound MESSAGE frames: records the
//! delivery with the subscription's ack tracker, stamps the `subscription`
//! header when the subscription was identified by id, and offers the frame
//! to the connection's outbound sink. The sink send awaits capacity, so a
//! slow transport pauses delivery consumption rather than dropping frames.

use stomp_wire::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ack::AckTracker;
use crate::connection::OutboundItem;
use crate::router::{Binding, Delivery, DestinationId, ORIGIN_STOMP};
use crate::selector::Selector;

pub struct ConsumerSession {
    /// Router-facing identity.
    pub id: Uuid,
    /// The client's `id` header. None when a 1.0 client subscribed by
    /// destination only, in which case MESSAGE frames carry no
    /// `subscription` header either.
    pub subscription_id: Option<String>,
    pub destination: DestinationId,
    pub ack: AckTracker,
    /// Raw selector source and its compiled form.
    pub selector: Option<(String, Selector)>,
    /// Present for bound (point-to-point or durable) subscriptions.
    pub binding: Option<Binding>,
    sink: mpsc::Sender<OutboundItem>,
}

impl ConsumerSession {
    pub fn new(
        subscription_id: Option<String>,
        destination: DestinationId,
        ack: AckTracker,
        selector: Option<(String, Selector)>,
        binding: Option<Binding>,
        sink: mpsc::Sender<OutboundItem>,
    ) -> ConsumerSession {
        ConsumerSession {
            id: Uuid::new_v4(),
            subscription_id,
            destination,
            ack,
            selector,
            binding,
            sink,
        }
    }

    /// Whether this session wants the delivery: the origin protocol must
    /// match, and the selector (when present) must accept the headers.
    pub fn matches(&self, delivery: &Delivery) -> bool {
        delivery.origin == ORIGIN_STOMP
            && self
                .selector
                .as_ref()
                .is_none_or(|(_, s)| s.evaluate(&delivery.message.headers))
    }

    /// Deliver one message to the client. Returns the tracked message id,
    /// or None when the outbound sink is gone (connection closing).
    pub async fn offer(&mut self, delivery: Delivery) -> Option<String> {
        let Delivery {
            mut message, ack, ..
        } = delivery;

        message.command = Command::Message;
        if let Some(id) = &self.subscription_id {
            message.set_header("subscription", id);
        }
        let message_id = message.header("message-id").unwrap_or_default().to_owned();

        self.ack.track(message_id.clone(), ack);
        if self.sink.send(OutboundItem::Frame(message)).await.is_err() {
            return None;
        }
        Some(message_id)
    }
}
