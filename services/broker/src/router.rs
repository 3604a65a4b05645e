//! Broker routing layer.
//!
//! The connection core talks to the router through the [`Router`] and
//! [`Queue`] traits; [`MemoryRouter`] is the in-process implementation. Each
//! destination owns a bounded intake channel drained by a pump task that fans
//! deliveries out to the destination's current targets: directly-bound topic
//! consumers and queue intakes. Queues buffer and round-robin to their bound
//! consumers.
//!
//! Flow control is the intake bound: `Route::try_offer` fails when the
//! destination is full and `Route::offer` awaits capacity, which is what
//! suspends a producer connection's reads until the destination drains.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use stomp_wire::Frame;
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::ack::AckCallback;
use crate::selector::Selector;
use crate::store::UowGate;

/// Default bound of destination intakes and queue buffers.
pub const DEFAULT_BUFFER: usize = 1024;

/// Origin tag for deliveries produced by this protocol handler.
pub const ORIGIN_STOMP: &str = "stomp";

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A parsed destination: `/queue/<name>` or `/topic/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationId {
    pub kind: DestinationKind,
    pub name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("invalid destination: {0}")]
    Invalid(String),
}

impl DestinationId {
    pub fn parse(raw: &str) -> Result<DestinationId, DestinationError> {
        let (kind, name) = if let Some(name) = raw.strip_prefix("/queue/") {
            (DestinationKind::Queue, name)
        } else if let Some(name) = raw.strip_prefix("/topic/") {
            (DestinationKind::Topic, name)
        } else {
            return Err(DestinationError::Invalid(raw.to_owned()));
        };
        if name.is_empty() {
            return Err(DestinationError::Invalid(raw.to_owned()));
        }
        Ok(DestinationId {
            kind,
            name: name.to_owned(),
        })
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "/queue/{}", self.name),
            DestinationKind::Topic => write!(f, "/topic/{}", self.name),
        }
    }
}

/// Description of how a queue is attached to a destination. Durable enough
/// to recreate the attachment: the same binding resolves to the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    /// The shared queue behind a point-to-point destination.
    PointToPoint { destination: DestinationId },
    /// A durable topic subscription's private queue.
    DurableTopic {
        destination: DestinationId,
        subscription_id: String,
        selector: Option<String>,
    },
}

impl Binding {
    pub fn destination(&self) -> &DestinationId {
        match self {
            Binding::PointToPoint { destination } => destination,
            Binding::DurableTopic { destination, .. } => destination,
        }
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

/// One message in flight from a producer toward consumers.
pub struct Delivery {
    pub message: Frame,
    pub size: usize,
    pub origin: &'static str,
    /// Present while the owning transaction's unit of work is incomplete;
    /// dispatch holds the delivery until the gate opens.
    pub gate: Option<UowGate>,
    /// Settled once consumption (or durable storage) is established.
    pub ack: Option<AckCallback>,
}

impl Delivery {
    pub fn new(message: Frame) -> Delivery {
        let size = message.body.len();
        Delivery {
            message,
            size,
            origin: ORIGIN_STOMP,
            gate: None,
            ack: None,
        }
    }
}

/// Router-facing side of a subscription: deliveries sent here re-enter the
/// owning connection's event loop.
#[derive(Clone)]
pub struct ConsumerHandle {
    pub id: Uuid,
    pub selector: Option<Selector>,
    pub deliveries: mpsc::Sender<Delivery>,
}

impl ConsumerHandle {
    fn accepts(&self, delivery: &Delivery) -> bool {
        self.selector
            .as_ref()
            .is_none_or(|s| s.evaluate(&delivery.message.headers))
    }
}

// ---------------------------------------------------------------------------
// Producer routes
// ---------------------------------------------------------------------------

/// Producer handle onto a destination.
#[derive(Clone)]
pub struct Route {
    destination: DestinationId,
    intake: mpsc::Sender<Delivery>,
    target_count: Arc<AtomicUsize>,
    producers: Arc<AtomicUsize>,
}

impl Route {
    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    /// Whether anything is currently attached to receive deliveries.
    pub fn has_targets(&self) -> bool {
        self.target_count.load(Ordering::SeqCst) > 0
    }

    /// Producers currently attached to this destination.
    pub fn producers(&self) -> usize {
        self.producers.load(Ordering::SeqCst)
    }

    /// Non-blocking offer; hands the delivery back when the destination is
    /// full (or gone) so the caller can suspend and retry with [`offer`].
    ///
    /// [`offer`]: Route::offer
    pub fn try_offer(&self, delivery: Delivery) -> Result<(), Delivery> {
        self.intake.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(d) | mpsc::error::TrySendError::Closed(d) => d,
        })
    }

    /// Offer awaiting intake capacity. Returns false when the destination
    /// pump is gone.
    pub async fn offer(&self, delivery: Delivery) -> bool {
        self.intake.send(delivery).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

pub trait Router: Send + Sync {
    /// Attach a producer to `destination`, creating it on first use.
    fn connect(&self, destination: DestinationId) -> BoxFuture<'_, Route>;
    /// Release a producer attachment (the LRU eviction hook).
    fn disconnect(&self, route: &Route);
    /// Bind a consumer directly to a (topic) destination.
    fn bind(&self, destination: DestinationId, consumer: ConsumerHandle) -> BoxFuture<'_, ()>;
    /// Remove a directly-bound consumer.
    fn unbind(&self, destination: DestinationId, consumer: Uuid) -> BoxFuture<'_, ()>;
    /// Resolve or create the queue a binding describes.
    fn create_queue(&self, binding: Binding) -> BoxFuture<'_, Option<Arc<dyn Queue>>>;
    /// Tear down a binding's queue. False when no such queue exists.
    fn destroy_queue(&self, binding: Binding) -> BoxFuture<'_, bool>;
    /// Resolve a binding's queue without creating it.
    fn get_queue(&self, binding: Binding) -> BoxFuture<'_, Option<Arc<dyn Queue>>>;
}

pub trait Queue: Send + Sync {
    fn bind(&self, consumer: ConsumerHandle);
    fn unbind(&self, consumer: Uuid);
}

// ---------------------------------------------------------------------------
// In-memory router
// ---------------------------------------------------------------------------

pub struct MemoryRouter {
    destinations: RwLock<HashMap<DestinationId, DestinationEntry>>,
    queues: RwLock<HashMap<Binding, Arc<MemoryQueue>>>,
    buffer: usize,
}

#[derive(Clone)]
struct DestinationEntry {
    intake: mpsc::Sender<Delivery>,
    targets: Arc<std::sync::RwLock<Vec<Target>>>,
    target_count: Arc<AtomicUsize>,
    producers: Arc<AtomicUsize>,
}

#[derive(Clone)]
enum Target {
    Consumer(ConsumerHandle),
    QueueIntake {
        binding: Binding,
        selector: Option<Selector>,
        intake: mpsc::Sender<Delivery>,
    },
}

impl MemoryRouter {
    pub fn new() -> MemoryRouter {
        MemoryRouter::with_buffer(DEFAULT_BUFFER)
    }

    /// `buffer` bounds every destination intake and queue buffer; small
    /// values make producers feel backpressure quickly.
    pub fn with_buffer(buffer: usize) -> MemoryRouter {
        MemoryRouter {
            destinations: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            buffer,
        }
    }

    async fn entry(&self, destination: &DestinationId) -> DestinationEntry {
        {
            let map = self.destinations.read().await;
            if let Some(entry) = map.get(destination) {
                return entry.clone();
            }
        }
        let mut map = self.destinations.write().await;
        if let Some(entry) = map.get(destination) {
            return entry.clone();
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let entry = DestinationEntry {
            intake: tx,
            targets: Arc::new(std::sync::RwLock::new(Vec::new())),
            target_count: Arc::new(AtomicUsize::new(0)),
            producers: Arc::new(AtomicUsize::new(0)),
        };
        tokio::spawn(destination_pump(
            destination.clone(),
            rx,
            Arc::clone(&entry.targets),
            Arc::clone(&entry.target_count),
        ));
        map.insert(destination.clone(), entry.clone());
        entry
    }

    async fn queue_for(&self, binding: &Binding, create: bool) -> Option<Arc<MemoryQueue>> {
        {
            let map = self.queues.read().await;
            if let Some(queue) = map.get(binding) {
                return Some(Arc::clone(queue));
            }
        }
        if !create {
            return None;
        }
        let mut map = self.queues.write().await;
        if let Some(queue) = map.get(binding) {
            return Some(Arc::clone(queue));
        }

        let selector = match binding {
            Binding::DurableTopic {
                selector: Some(raw),
                ..
            } => Selector::compile(raw).ok(),
            _ => None,
        };
        let queue = MemoryQueue::start(binding.clone(), self.buffer);

        // Attach the queue's intake as a target of its destination.
        let entry = self.entry(binding.destination()).await;
        entry.targets.write().expect("targets lock").push(Target::QueueIntake {
            binding: binding.clone(),
            selector,
            intake: queue.intake.clone(),
        });
        entry.target_count.fetch_add(1, Ordering::SeqCst);

        map.insert(binding.clone(), Arc::clone(&queue));
        Some(queue)
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        MemoryRouter::new()
    }
}

impl Router for MemoryRouter {
    fn connect(&self, destination: DestinationId) -> BoxFuture<'_, Route> {
        Box::pin(async move {
            // A queue destination materializes its shared queue on first
            // producer attach, so sends buffer even with no consumer yet.
            if destination.kind == DestinationKind::Queue {
                let _ = self
                    .queue_for(
                        &Binding::PointToPoint {
                            destination: destination.clone(),
                        },
                        true,
                    )
                    .await;
            }
            let entry = self.entry(&destination).await;
            entry.producers.fetch_add(1, Ordering::SeqCst);
            Route {
                destination,
                intake: entry.intake.clone(),
                target_count: Arc::clone(&entry.target_count),
                producers: Arc::clone(&entry.producers),
            }
        })
    }

    fn disconnect(&self, route: &Route) {
        route.producers.fetch_sub(1, Ordering::SeqCst);
        debug!(destination = %route.destination, "producer route disconnected");
    }

    fn bind(&self, destination: DestinationId, consumer: ConsumerHandle) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let entry = self.entry(&destination).await;
            entry
                .targets
                .write()
                .expect("targets lock")
                .push(Target::Consumer(consumer));
            entry.target_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn unbind(&self, destination: DestinationId, consumer: Uuid) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let map = self.destinations.read().await;
            let Some(entry) = map.get(&destination) else {
                return;
            };
            let mut targets = entry.targets.write().expect("targets lock");
            let before = targets.len();
            targets.retain(|t| !matches!(t, Target::Consumer(c) if c.id == consumer));
            let removed = before - targets.len();
            drop(targets);
            entry.target_count.fetch_sub(removed, Ordering::SeqCst);
        })
    }

    fn create_queue(&self, binding: Binding) -> BoxFuture<'_, Option<Arc<dyn Queue>>> {
        Box::pin(async move {
            self.queue_for(&binding, true)
                .await
                .map(|q| q as Arc<dyn Queue>)
        })
    }

    fn destroy_queue(&self, binding: Binding) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Some(_queue) = self.queues.write().await.remove(&binding) else {
                return false;
            };
            let map = self.destinations.read().await;
            if let Some(entry) = map.get(binding.destination()) {
                let mut targets = entry.targets.write().expect("targets lock");
                let before = targets.len();
                targets.retain(|t| !matches!(t, Target::QueueIntake { binding: b, .. } if *b == binding));
                let removed = before - targets.len();
                drop(targets);
                entry.target_count.fetch_sub(removed, Ordering::SeqCst);
            }
            debug!(destination = %binding.destination(), "queue destroyed");
            true
        })
    }

    fn get_queue(&self, binding: Binding) -> BoxFuture<'_, Option<Arc<dyn Queue>>> {
        Box::pin(async move {
            self.queue_for(&binding, false)
                .await
                .map(|q| q as Arc<dyn Queue>)
        })
    }
}

/// Drain one destination's intake, fanning each delivery out to the current
/// targets. Slow targets backpressure the whole destination, which is what
/// ultimately suspends producers.
async fn destination_pump(
    destination: DestinationId,
    mut intake: mpsc::Receiver<Delivery>,
    targets: Arc<std::sync::RwLock<Vec<Target>>>,
    target_count: Arc<AtomicUsize>,
) {
    while let Some(mut delivery) = intake.recv().await {
        if let Some(gate) = delivery.gate.as_mut() {
            gate.wait().await;
        }
        delivery.gate = None;

        let recipients: Vec<(Option<Uuid>, mpsc::Sender<Delivery>)> = {
            let targets = targets.read().expect("targets lock");
            targets
                .iter()
                .filter_map(|t| match t {
                    Target::Consumer(c) if c.accepts(&delivery) => {
                        Some((Some(c.id), c.deliveries.clone()))
                    }
                    Target::QueueIntake {
                        selector, intake, ..
                    } if selector
                        .as_ref()
                        .is_none_or(|s| s.evaluate(&delivery.message.headers)) =>
                    {
                        Some((None, intake.clone()))
                    }
                    _ => None,
                })
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in recipients {
            let copy = Delivery {
                message: delivery.message.clone(),
                size: delivery.size,
                origin: delivery.origin,
                gate: None,
                ack: None,
            };
            if tx.send(copy).await.is_err() {
                if let Some(id) = id {
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut targets = targets.write().expect("targets lock");
            let before = targets.len();
            targets.retain(|t| !matches!(t, Target::Consumer(c) if dead.contains(&c.id)));
            let removed = before - targets.len();
            drop(targets);
            target_count.fetch_sub(removed, Ordering::SeqCst);
        }

        // Fanned out to every live target: consumption is established.
        if let Some(ack) = delivery.ack.take() {
            ack(None);
        }
    }
    debug!(destination = %destination, "destination pump stopped");
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

pub struct MemoryQueue {
    intake: mpsc::Sender<Delivery>,
    shared: Arc<QueueShared>,
}

struct QueueShared {
    consumers: std::sync::RwLock<Vec<ConsumerHandle>>,
    bound: Notify,
    cursor: AtomicUsize,
    outstanding: Arc<AtomicUsize>,
}

impl MemoryQueue {
    fn start(binding: Binding, buffer: usize) -> Arc<MemoryQueue> {
        let (tx, rx) = mpsc::channel(buffer);
        let shared = Arc::new(QueueShared {
            consumers: std::sync::RwLock::new(Vec::new()),
            bound: Notify::new(),
            cursor: AtomicUsize::new(0),
            outstanding: Arc::new(AtomicUsize::new(0)),
        });
        tokio::spawn(queue_pump(binding, rx, Arc::clone(&shared)));
        Arc::new(MemoryQueue { intake: tx, shared })
    }

    /// Deliveries dispatched to consumers but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }
}

impl Queue for MemoryQueue {
    fn bind(&self, consumer: ConsumerHandle) {
        self.shared
            .consumers
            .write()
            .expect("consumers lock")
            .push(consumer);
        self.shared.bound.notify_one();
    }

    fn unbind(&self, consumer: Uuid) {
        self.shared
            .consumers
            .write()
            .expect("consumers lock")
            .retain(|c| c.id != consumer);
    }
}

/// Drain one queue's buffer, round-robining each delivery to the first
/// bound consumer whose selector accepts it. With nobody bound the delivery
/// is held (and the buffer behind it fills), which is the durable-ish
/// behavior a bound queue exists for.
async fn queue_pump(binding: Binding, mut intake: mpsc::Receiver<Delivery>, shared: Arc<QueueShared>) {
    while let Some(mut delivery) = intake.recv().await {
        if let Some(gate) = delivery.gate.as_mut() {
            gate.wait().await;
        }
        delivery.gate = None;

        loop {
            enum Pick {
                Consumer(Uuid, mpsc::Sender<Delivery>),
                NobodyBound,
                NobodyMatches,
            }
            let pick = {
                let consumers = shared.consumers.read().expect("consumers lock");
                if consumers.is_empty() {
                    Pick::NobodyBound
                } else {
                    let n = consumers.len();
                    let start = shared.cursor.fetch_add(1, Ordering::Relaxed);
                    (0..n)
                        .map(|i| &consumers[(start + i) % n])
                        .find(|c| c.accepts(&delivery))
                        .map_or(Pick::NobodyMatches, |c| {
                            Pick::Consumer(c.id, c.deliveries.clone())
                        })
                }
            };
            match pick {
                Pick::NobodyBound => {
                    shared.bound.notified().await;
                }
                Pick::NobodyMatches => {
                    debug!(destination = %binding.destination(), "no consumer matches, dropping");
                    break;
                }
                Pick::Consumer(id, tx) => {
                    let outstanding = Arc::clone(&shared.outstanding);
                    outstanding.fetch_add(1, Ordering::SeqCst);
                    delivery.ack = Some(Box::new(move |_uow| {
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                    }));
                    match tx.send(delivery).await {
                        Ok(()) => break,
                        Err(mpsc::error::SendError(returned)) => {
                            // Consumer is gone; forget it and redispatch.
                            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                            delivery = returned;
                            delivery.ack = None;
                            shared
                                .consumers
                                .write()
                                .expect("consumers lock")
                                .retain(|c| c.id != id);
                        }
                    }
                }
            }
        }
    }
    debug!(destination = %binding.destination(), "queue pump stopped");
}
