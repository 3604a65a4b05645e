//! Per-connection STOMP protocol handler.
//!
//! One task owns all connection state and drives a select loop over three
//! inputs: decoded frames from the socket, deliveries from this
//! connection's subscriptions, and heart-beat monitor events. A companion
//! writer task drains the outbound frame channel, so everything the peer
//! sees left through one ordered sink.
//!
//! The handshake runs before the loop: version and heart-beat negotiation,
//! virtual-host lookup, authentication, CONNECTED. Anything fatal afterward
//! produces exactly one ERROR frame, reads stop, and the socket closes
//! after the configured die delay.
//!
//! Suspension is structural: every await inside frame dispatch (route
//! connect, full destination, authentication) pauses frame intake, which is
//! what applies backpressure to the transport. `waiting_on` names the
//! reason for diagnostics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use stomp_wire::{
    BufferPool, Command, Frame, FrameDecoder, IoCounters, WireError, WireEvent, encode,
    encode_keep_alive,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

use crate::ack::AckTracker;
use crate::config::BrokerConfig;
use crate::consumer::ConsumerSession;
use crate::heartbeat::{HeartbeatEvent, HeartbeatIntervals, HeartbeatMonitor};
use crate::host::{HostRegistry, SecurityContext, VirtualHost};
use crate::producer::ProducerRoutes;
use crate::router::{Binding, ConsumerHandle, Delivery, DestinationId, DestinationKind};
use crate::selector::Selector;
use crate::store::{StoreUow, UowGate};
use crate::transaction::{TransactionRegistry, TxAction};

/// Versions this handler speaks, in preference order of the CONNECT scan.
pub const SUPPORTED_VERSIONS: &str = "1.0,1.1";

const OUTBOUND_BUFFER: usize = 64;
const DELIVERY_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1_0,
    V1_1,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_1 => "1.1",
        }
    }
}

/// One item on the outbound sink. Keep-alives are bare newlines, not
/// frames, so they get their own variant.
pub enum OutboundItem {
    Frame(Frame),
    KeepAlive,
}

/// A fatal protocol condition: becomes the single ERROR frame.
#[derive(Debug)]
struct Die {
    message: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Die {
    fn new(message: impl Into<String>) -> Die {
        Die {
            message: message.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

/// Why the handshake never reached OPEN.
enum HandshakeEnd {
    Closed,
    Die(Die),
}

// ---------------------------------------------------------------------------
// Socket plumbing
// ---------------------------------------------------------------------------

/// Read half plus decode buffer. The buffer may be swapped for a pooled one
/// once the virtual host is known.
struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    decoder: FrameDecoder,
    counters: IoCounters,
    pool: Option<Arc<BufferPool>>,
}

impl FrameReader {
    fn new(half: OwnedReadHalf, counters: IoCounters) -> FrameReader {
        FrameReader {
            half,
            buf: BytesMut::with_capacity(8 * 1024),
            decoder: FrameDecoder::new(),
            counters,
            pool: None,
        }
    }

    /// Switch to reading through the host's buffer pool.
    fn attach_pool(&mut self, pool: Arc<BufferPool>) {
        let mut pooled = pool.take();
        pooled.extend_from_slice(&self.buf);
        self.buf = pooled;
        self.pool = Some(pool);
    }

    /// Next wire event. `Ok(None)` when the transport is gone.
    async fn next(&mut self) -> Result<Option<WireEvent>, WireError> {
        loop {
            if let Some(event) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(event));
            }
            match self.half.read_buf(&mut self.buf).await {
                Ok(0) => return Ok(None),
                Ok(n) => self.counters.record_read(n),
                Err(e) => {
                    debug!(error = %e, "transport read failed");
                    return Ok(None);
                }
            }
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give(std::mem::take(&mut self.buf));
        }
    }
}

/// Drain the outbound channel onto the socket, bumping the write counter
/// the heart-beat monitor samples.
async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<OutboundItem>,
    counters: IoCounters,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(item) = rx.recv().await {
        buf.clear();
        match item {
            OutboundItem::Frame(frame) => encode(&frame, &mut buf),
            OutboundItem::KeepAlive => encode_keep_alive(&mut buf),
        }
        if half.write_all(&buf).await.is_err() {
            break;
        }
        counters.record_written(buf.len());
    }
    let _ = half.shutdown().await;
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Drive one TCP session to completion.
pub async fn handle_connection(
    stream: TcpStream,
    config: Arc<BrokerConfig>,
    hosts: Arc<HostRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |a| a.to_string());
    let counters = IoCounters::new();
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_loop(write_half, out_rx, counters.clone()));
    let (hb_tx, hb_rx) = mpsc::channel(4);

    let mut handler = ConnectionHandler::new(config, hosts, out_tx, counters.clone(), hb_tx, hb_rx);
    let mut reader = FrameReader::new(read_half, counters);
    debug!(peer = %peer, "connection accepted");

    match handler.handshake(&mut reader, &mut shutdown).await {
        Ok(()) => {
            if let Some(pool) = handler.host.as_ref().and_then(|h| h.buffer_pool.clone()) {
                reader.attach_pool(pool);
            }
            if let Err(die) = handler.serve(reader, &mut shutdown).await {
                handler.drain_error(die).await;
            }
        }
        Err(HandshakeEnd::Die(die)) => handler.drain_error(die).await,
        Err(HandshakeEnd::Closed) => {}
    }

    handler.teardown().await;
    drop(handler);
    let _ = writer.await;
    debug!(peer = %peer, "connection finished");
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

struct ConnectionHandler {
    config: Arc<BrokerConfig>,
    hosts: Arc<HostRegistry>,
    version: ProtocolVersion,
    host: Option<Arc<VirtualHost>>,
    session_id: Option<String>,
    consumers: HashMap<String, ConsumerSession>,
    deliveries: StreamMap<String, ReceiverStream<Delivery>>,
    routes: Option<ProducerRoutes>,
    transactions: TransactionRegistry,
    /// 1.0 fallback: message id to subscription key, for ACK frames that
    /// omit the subscription header. Kept in lockstep with the trackers.
    ack_index: HashMap<String, String>,
    outbound: mpsc::Sender<OutboundItem>,
    counters: IoCounters,
    heartbeat: Option<HeartbeatMonitor>,
    hb_tx: mpsc::Sender<HeartbeatEvent>,
    hb_rx: mpsc::Receiver<HeartbeatEvent>,
    next_message_id: u64,
    /// Why frame intake is currently paused, for diagnostics.
    waiting_on: Option<String>,
    closed: bool,
}

impl ConnectionHandler {
    fn new(
        config: Arc<BrokerConfig>,
        hosts: Arc<HostRegistry>,
        outbound: mpsc::Sender<OutboundItem>,
        counters: IoCounters,
        hb_tx: mpsc::Sender<HeartbeatEvent>,
        hb_rx: mpsc::Receiver<HeartbeatEvent>,
    ) -> ConnectionHandler {
        ConnectionHandler {
            config,
            hosts,
            version: ProtocolVersion::V1_0,
            host: None,
            session_id: None,
            consumers: HashMap::new(),
            deliveries: StreamMap::new(),
            routes: None,
            transactions: TransactionRegistry::new(),
            ack_index: HashMap::new(),
            outbound,
            counters,
            heartbeat: None,
            hb_tx,
            hb_rx,
            next_message_id: 0,
            waiting_on: None,
            closed: false,
        }
    }

    fn is_v10(&self) -> bool {
        self.version == ProtocolVersion::V1_0
    }

    async fn send(&self, frame: Frame) {
        let _ = self.outbound.send(OutboundItem::Frame(frame)).await;
    }

    async fn send_receipt_for(&self, frame: &Frame) {
        if let Some(receipt_id) = frame.header("receipt") {
            self.send(Frame::receipt(receipt_id)).await;
        }
    }

    fn ensure_message_id(&mut self, frame: &mut Frame) {
        if frame.header("message-id").is_none() {
            self.next_message_id += 1;
            let id = format!("msg:{}", self.next_message_id);
            frame.set_header("message-id", &id);
        }
    }

    // -----------------------------------------------------------------------
    // Handshake: INIT -> NEGOTIATING -> AUTHENTICATING -> OPEN
    // -----------------------------------------------------------------------

    async fn handshake(
        &mut self,
        reader: &mut FrameReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), HandshakeEnd> {
        let frame = loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(HandshakeEnd::Closed);
                    }
                }
                event = reader.next() => match event {
                    Err(e) => return Err(HandshakeEnd::Die(Die::new(e.to_string()))),
                    Ok(None) => return Err(HandshakeEnd::Closed),
                    Ok(Some(WireEvent::KeepAlive)) => {}
                    Ok(Some(WireEvent::Frame(frame))) => break frame,
                }
            }
        };
        if !matches!(frame.command, Command::Connect | Command::Stomp) {
            return Err(HandshakeEnd::Die(Die::new(
                "Client must first send a connect frame",
            )));
        }
        self.on_connect(frame).await.map_err(HandshakeEnd::Die)
    }

    async fn on_connect(&mut self, frame: Frame) -> Result<(), Die> {
        let accept = frame.header("accept-version").unwrap_or("1.0");
        let Some(version) = negotiate_version(accept) else {
            return Err(Die {
                message: "version not supported".to_owned(),
                headers: vec![("version".to_owned(), SUPPORTED_VERSIONS.to_owned())],
                body: format!("Supported protocol versions are {SUPPORTED_VERSIONS}"),
            });
        };
        self.version = version;

        let raw_heart_beat = frame.header("heart-beat").unwrap_or("0,0");
        let Some((cx, cy)) = parse_heart_beat(raw_heart_beat) else {
            return Err(Die::new(format!(
                "Invalid heart-beat header: {raw_heart_beat}"
            )));
        };

        let host_header = frame.header("host");
        let Some(host) = self.hosts.lookup(host_header) else {
            return Err(Die::new(format!(
                "Invalid virtual host: {}",
                host_header.unwrap_or("<default>")
            )));
        };

        if let Some(authenticator) = host.authenticator.clone() {
            let ctx = SecurityContext {
                login: frame.header("login").map(str::to_owned),
                passcode: frame.header("passcode").map(str::to_owned),
            };
            self.waiting_on = Some("authenticating".to_owned());
            let ok = authenticator.authenticate(&ctx).await;
            self.waiting_on = None;
            if !ok {
                return Err(Die::new("Authentication failed."));
            }
        }

        let session_id = format!("{}:{}", host.id, host.next_session());
        let heart_beat = format!(
            "{},{}",
            self.config.outbound_heartbeat_ms, self.config.inbound_heartbeat_ms
        );
        self.send(Frame::connected(version.as_str(), &session_id, &heart_beat))
            .await;
        info!(session = %session_id, version = version.as_str(), "session open");

        self.routes = Some(ProducerRoutes::new(
            Arc::clone(&host.router),
            self.config.producer_route_cache_size,
        ));
        self.session_id = Some(session_id);
        self.host = Some(host);

        let intervals = HeartbeatIntervals::negotiate(
            self.config.inbound_heartbeat_ms,
            self.config.outbound_heartbeat_ms,
            cx,
            cy,
        );
        let monitor = HeartbeatMonitor::new(self.counters.clone(), intervals, self.hb_tx.clone());
        monitor.start();
        self.heartbeat = Some(monitor);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // OPEN: the select loop
    // -----------------------------------------------------------------------

    async fn serve(
        &mut self,
        mut reader: FrameReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Die> {
        loop {
            if self.closed {
                return Ok(());
            }
            let has_subscriptions = !self.deliveries.is_empty();
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                Some(event) = self.hb_rx.recv() => match event {
                    HeartbeatEvent::KeepAlive => {
                        let _ = self.outbound.send(OutboundItem::KeepAlive).await;
                    }
                    HeartbeatEvent::Dead => {
                        warn!(
                            session = self.session_id.as_deref().unwrap_or("-"),
                            waiting_on = self.waiting_on.as_deref(),
                            "peer made no read progress, closing"
                        );
                        return Ok(());
                    }
                },
                event = reader.next() => match event {
                    Err(e) => return Err(Die::new(e.to_string())),
                    Ok(None) => return Ok(()),
                    Ok(Some(WireEvent::KeepAlive)) => {}
                    Ok(Some(WireEvent::Frame(frame))) => self.dispatch(frame).await?,
                },
                Some((key, delivery)) = self.deliveries.next(), if has_subscriptions => {
                    self.on_delivery(key, delivery).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), Die> {
        let command = frame.command.clone();
        match command {
            Command::Send => self.on_send(frame).await,
            Command::Ack => self.on_ack(frame).await,
            Command::Subscribe => self.on_subscribe(frame).await,
            Command::Unsubscribe => self.on_unsubscribe(frame).await,
            Command::Begin => self.on_begin(frame).await,
            Command::Commit => self.on_commit(frame).await,
            Command::Abort => self.on_abort(frame).await,
            Command::Disconnect => self.on_disconnect(frame).await,
            other => Err(Die::new(format!(
                "Unknown STOMP action: {}",
                other.as_str()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // SEND
    // -----------------------------------------------------------------------

    async fn on_send(&mut self, mut frame: Frame) -> Result<(), Die> {
        if frame.header("destination").is_none() {
            return Err(Die::new("destination header is required"));
        }
        // Message ids number by arrival, whether or not the send is deferred.
        self.ensure_message_id(&mut frame);

        if let Some(tx_id) = frame.header("transaction").map(str::to_owned) {
            self.send_receipt_for(&frame).await;
            frame
                .headers
                .retain(|(k, _)| k != "receipt" && k != "transaction");
            self.transactions.enqueue(&tx_id, TxAction::Send { frame });
            return Ok(());
        }
        self.perform_send(frame, None).await
    }

    async fn perform_send(&mut self, mut frame: Frame, gate: Option<UowGate>) -> Result<(), Die> {
        let raw_dest = frame.header("destination").unwrap_or_default().to_owned();
        let destination =
            DestinationId::parse(&raw_dest).map_err(|e| Die::new(e.to_string()))?;
        let receipt = frame.header("receipt").map(str::to_owned);
        frame.headers.retain(|(k, _)| k != "receipt");

        let Some(routes) = self.routes.as_mut() else {
            return Err(Die::new("session not initialized"));
        };
        self.waiting_on = Some(format!("connecting to destination: {destination}"));
        let route = routes.resolve(&destination).await;
        self.waiting_on = None;

        if route.has_targets() {
            let mut delivery = Delivery::new(frame);
            delivery.gate = gate;
            if let Err(delivery) = route.try_offer(delivery) {
                // Destination is full: stop reading frames until it drains.
                self.waiting_on = Some(format!("blocked destination: {destination}"));
                debug!(destination = %destination, "destination full, suspending reads");
                if !route.offer(delivery).await {
                    warn!(destination = %destination, "destination vanished, message dropped");
                }
                self.waiting_on = None;
            }
        } else {
            debug!(destination = %destination, "no targets, message dropped");
        }

        if let Some(receipt_id) = receipt {
            self.send(Frame::receipt(&receipt_id)).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // SUBSCRIBE / UNSUBSCRIBE
    // -----------------------------------------------------------------------

    async fn on_subscribe(&mut self, frame: Frame) -> Result<(), Die> {
        let Some(raw_dest) = frame.header("destination") else {
            return Err(Die::new("destination header is required"));
        };
        let destination = DestinationId::parse(raw_dest).map_err(|e| Die::new(e.to_string()))?;

        let explicit_id = frame.header("id").map(str::to_owned);
        let key = match (&explicit_id, self.is_v10()) {
            (Some(id), _) => id.clone(),
            // 1.0 clients may subscribe by destination alone.
            (None, true) => raw_dest.to_owned(),
            (None, false) => return Err(Die::new("id header is required")),
        };
        if self.consumers.contains_key(&key) {
            return Err(Die::new(format!(
                "A subscription with id '{key}' already exists"
            )));
        }

        let Some(ack) = AckTracker::from_header(frame.header("ack")) else {
            return Err(Die::new(format!(
                "Unsupported ack mode: {}",
                frame.header("ack").unwrap_or_default()
            )));
        };

        let selector = match frame.header("selector") {
            None => None,
            Some(raw) => match Selector::compile(raw) {
                Ok(compiled) => Some((raw.to_owned(), compiled)),
                Err(e) => {
                    return Err(Die::new(format!("Invalid selector \"{raw}\": {e}")));
                }
            },
        };
        let persistent = frame.header("persistent") == Some("true");

        let binding = match destination.kind {
            DestinationKind::Topic if !persistent => None,
            DestinationKind::Topic => Some(Binding::DurableTopic {
                destination: destination.clone(),
                subscription_id: key.clone(),
                selector: selector.as_ref().map(|(raw, _)| raw.clone()),
            }),
            DestinationKind::Queue => Some(Binding::PointToPoint {
                destination: destination.clone(),
            }),
        };

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let session = ConsumerSession::new(
            explicit_id,
            destination.clone(),
            ack,
            selector,
            binding.clone(),
            self.outbound.clone(),
        );
        let handle = ConsumerHandle {
            id: session.id,
            selector: session.selector.as_ref().map(|(_, s)| s.clone()),
            deliveries: tx,
        };

        let Some(host) = self.host.as_ref() else {
            return Err(Die::new("session not initialized"));
        };
        let router = Arc::clone(&host.router);
        match &binding {
            None => {
                self.waiting_on = Some(format!("binding to destination: {destination}"));
                router.bind(destination.clone(), handle).await;
                self.waiting_on = None;
            }
            Some(b) => {
                self.waiting_on = Some(format!("creating queue for: {destination}"));
                let queue = router.create_queue(b.clone()).await;
                self.waiting_on = None;
                let Some(queue) = queue else {
                    return Err(Die::new(format!(
                        "Unable to create queue for destination: {destination}"
                    )));
                };
                queue.bind(handle);
            }
        }

        debug!(
            session = self.session_id.as_deref().unwrap_or("-"),
            subscription = %key,
            destination = %destination,
            "subscribed"
        );
        self.deliveries.insert(key.clone(), ReceiverStream::new(rx));
        self.consumers.insert(key, session);
        self.send_receipt_for(&frame).await;
        Ok(())
    }

    async fn on_unsubscribe(&mut self, frame: Frame) -> Result<(), Die> {
        let key = frame.header("id").map(str::to_owned).or_else(|| {
            if self.is_v10() {
                frame.header("destination").map(str::to_owned)
            } else {
                None
            }
        });
        let Some(key) = key else {
            return Err(Die::new("id header is required"));
        };
        let Some(session) = self.consumers.remove(&key) else {
            return Err(Die::new(format!("Subscription '{key}' not found")));
        };
        self.deliveries.remove(&key);
        self.ack_index.retain(|_, v| v != &key);

        let Some(host) = self.host.as_ref() else {
            return Err(Die::new("session not initialized"));
        };
        let router = Arc::clone(&host.router);
        match &session.binding {
            None => router.unbind(session.destination.clone(), session.id).await,
            Some(binding) => {
                if let Some(queue) = router.get_queue(binding.clone()).await {
                    queue.unbind(session.id);
                }
                let persistent = frame.header("persistent") == Some("true");
                if persistent && matches!(binding, Binding::DurableTopic { .. }) {
                    self.waiting_on = Some(format!("destroying queue for: {}", session.destination));
                    router.destroy_queue(binding.clone()).await;
                    self.waiting_on = None;
                }
            }
        }

        self.send_receipt_for(&frame).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ACK
    // -----------------------------------------------------------------------

    async fn on_ack(&mut self, frame: Frame) -> Result<(), Die> {
        let Some(message_id) = frame.header("message-id").map(str::to_owned) else {
            return Err(Die::new("message-id header is required"));
        };
        let subscription = frame.header("subscription").map(str::to_owned);

        if let Some(tx_id) = frame.header("transaction").map(str::to_owned) {
            self.transactions.enqueue(
                &tx_id,
                TxAction::Ack {
                    subscription,
                    message_id,
                },
            );
            self.send_receipt_for(&frame).await;
            return Ok(());
        }

        self.perform_ack(subscription.as_deref(), &message_id, None)?;
        self.send_receipt_for(&frame).await;
        Ok(())
    }

    fn perform_ack(
        &mut self,
        subscription: Option<&str>,
        message_id: &str,
        uow: Option<&mut dyn StoreUow>,
    ) -> Result<(), Die> {
        let key = match subscription {
            Some(s) => s.to_owned(),
            None => {
                if !self.is_v10() {
                    return Err(Die::new("subscription header is required"));
                }
                match self.ack_index.get(message_id) {
                    Some(k) => k.clone(),
                    None => {
                        return Err(Die::new(format!(
                            "ACK failed, invalid message id: {message_id}"
                        )));
                    }
                }
            }
        };
        let Some(session) = self.consumers.get_mut(&key) else {
            return Err(Die::new(format!("Subscription '{key}' not found")));
        };
        session
            .ack
            .perform_ack(message_id, uow)
            .map_err(|e| Die::new(e.to_string()))?;
        if self.is_v10() {
            self.ack_index.remove(message_id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // BEGIN / COMMIT / ABORT
    // -----------------------------------------------------------------------

    fn transaction_header(frame: &Frame) -> Result<&str, Die> {
        frame
            .header("transaction")
            .ok_or_else(|| Die::new("transaction header is required"))
    }

    async fn on_begin(&mut self, frame: Frame) -> Result<(), Die> {
        let tx_id = Self::transaction_header(&frame)?;
        self.transactions
            .begin(tx_id)
            .map_err(|e| Die::new(e.to_string()))?;
        self.send_receipt_for(&frame).await;
        Ok(())
    }

    async fn on_abort(&mut self, frame: Frame) -> Result<(), Die> {
        let tx_id = Self::transaction_header(&frame)?;
        self.transactions
            .abort(tx_id)
            .map_err(|e| Die::new(e.to_string()))?;
        self.send_receipt_for(&frame).await;
        Ok(())
    }

    async fn on_commit(&mut self, frame: Frame) -> Result<(), Die> {
        let tx_id = Self::transaction_header(&frame)?.to_owned();
        let actions = self
            .transactions
            .commit(&tx_id)
            .map_err(|e| Die::new(e.to_string()))?;
        let receipt = frame.header("receipt").map(str::to_owned);
        let store = self.host.as_ref().and_then(|h| h.store.clone());

        match store {
            Some(store) => {
                // Every deferred action replays against one unit of work;
                // its deliveries stay gated until the release below.
                let mut uow = store.create_uow();
                let gate = uow.gate();
                for action in actions {
                    match action {
                        TxAction::Send { frame } => {
                            self.perform_send(frame, Some(gate.clone())).await?;
                        }
                        TxAction::Ack {
                            subscription,
                            message_id,
                        } => {
                            self.perform_ack(
                                subscription.as_deref(),
                                &message_id,
                                Some(uow.as_mut()),
                            )?;
                        }
                    }
                }
                if let Some(receipt_id) = receipt {
                    let outbound = self.outbound.clone();
                    uow.on_complete(Box::new(move || {
                        let receipt = Frame::receipt(&receipt_id);
                        if outbound.try_send(OutboundItem::Frame(receipt)).is_err() {
                            warn!("outbound queue full, COMMIT receipt dropped");
                        }
                    }));
                }
                uow.release();
            }
            None => {
                for action in actions {
                    match action {
                        TxAction::Send { frame } => self.perform_send(frame, None).await?,
                        TxAction::Ack {
                            subscription,
                            message_id,
                        } => self.perform_ack(subscription.as_deref(), &message_id, None)?,
                    }
                }
                if let Some(receipt_id) = receipt {
                    self.send(Frame::receipt(&receipt_id)).await;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DISCONNECT, deliveries, teardown
    // -----------------------------------------------------------------------

    async fn on_disconnect(&mut self, frame: Frame) -> Result<(), Die> {
        self.send_receipt_for(&frame).await;
        info!(
            session = self.session_id.as_deref().unwrap_or("-"),
            "client disconnect"
        );
        self.closed = true;
        Ok(())
    }

    async fn on_delivery(&mut self, key: String, delivery: Delivery) {
        let v10 = self.is_v10();
        let Some(session) = self.consumers.get_mut(&key) else {
            return;
        };
        if !session.matches(&delivery) {
            return;
        }
        let was_auto = session.ack.is_auto();
        match session.offer(delivery).await {
            None => self.closed = true,
            Some(message_id) => {
                if v10 && !was_auto {
                    self.ack_index.insert(message_id, key);
                }
            }
        }
    }

    /// DRAINING_ERROR: one ERROR frame, then a grace period for the peer to
    /// read it. Frame intake already stopped when the dispatch unwound.
    async fn drain_error(&mut self, die: Die) {
        warn!(
            session = self.session_id.as_deref().unwrap_or("-"),
            message = %die.message,
            "closing connection with error"
        );
        let mut frame = Frame::error(&die.message);
        for (name, value) in &die.headers {
            frame.set_header(name, value);
        }
        if !die.body.is_empty() {
            frame = frame.with_body(die.body.clone());
        }
        let _ = self.outbound.send(OutboundItem::Frame(frame)).await;
        self.waiting_on = Some("draining error".to_owned());
        tokio::time::sleep(Duration::from_millis(self.config.die_delay_ms)).await;
    }

    /// CLOSED: idempotent cleanup. Unbind every subscription, disconnect
    /// every cached producer route, drop the 1.0 ack index.
    async fn teardown(&mut self) {
        self.closed = true;
        if let Some(monitor) = &self.heartbeat {
            monitor.stop();
        }
        if let Some(host) = self.host.clone() {
            for (_, session) in self.consumers.drain() {
                match &session.binding {
                    None => {
                        host.router
                            .unbind(session.destination.clone(), session.id)
                            .await;
                    }
                    Some(binding) => {
                        if let Some(queue) = host.router.get_queue(binding.clone()).await {
                            queue.unbind(session.id);
                        }
                    }
                }
            }
            if let Some(routes) = self.routes.as_mut() {
                routes.clear();
            }
        }
        self.ack_index.clear();
        if let Some(session) = &self.session_id {
            info!(session = %session, waiting_on = self.waiting_on.as_deref(), "session closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Negotiation helpers
// ---------------------------------------------------------------------------

/// First supported entry of a comma-separated `accept-version` list.
fn negotiate_version(accept: &str) -> Option<ProtocolVersion> {
    accept.split(',').find_map(|v| match v.trim() {
        "1.0" => Some(ProtocolVersion::V1_0),
        "1.1" => Some(ProtocolVersion::V1_1),
        _ => None,
    })
}

/// `heart-beat: cx,cy` with both values numeric.
fn parse_heart_beat(raw: &str) -> Option<(u64, u64)> {
    let (cx, cy) = raw.split_once(',')?;
    Some((cx.trim().parse().ok()?, cy.trim().parse().ok()?))
}
