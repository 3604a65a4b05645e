//! Message store collaborator.
//!
//! A store batches the side effects of a committed transaction into a single
//! unit of work: transactional SENDs and ACKs replay against one UOW, their
//! completion callbacks fire when the UOW is released, and deliveries created
//! under the UOW stay invisible to consumers until then.

use tokio::sync::watch;

pub trait Store: Send + Sync {
    fn create_uow(&self) -> Box<dyn StoreUow>;
}

pub trait StoreUow: Send {
    /// Register a callback to run once the unit of work completes.
    fn on_complete(&mut self, callback: Box<dyn FnOnce() + Send>);
    /// Visibility gate for deliveries created under this unit of work.
    fn gate(&self) -> UowGate;
    /// Complete the unit of work: open the gate, then fire completions.
    fn release(self: Box<Self>);
}

/// Handle a delivery carries so downstream dispatch can hold it until the
/// owning unit of work completes.
#[derive(Debug, Clone)]
pub struct UowGate {
    open: watch::Receiver<bool>,
}

impl UowGate {
    pub async fn wait(&mut self) {
        // A dropped sender means the unit of work is gone; holding the
        // delivery forever would wedge the destination, so treat it as open.
        let _ = self.open.wait_for(|open| *open).await;
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store whose units of work complete as soon as they are released.
pub struct MemoryStore;

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl Store for MemoryStore {
    fn create_uow(&self) -> Box<dyn StoreUow> {
        let (tx, rx) = watch::channel(false);
        Box::new(MemoryUow {
            completions: Vec::new(),
            open_tx: tx,
            open_rx: rx,
        })
    }
}

struct MemoryUow {
    completions: Vec<Box<dyn FnOnce() + Send>>,
    open_tx: watch::Sender<bool>,
    open_rx: watch::Receiver<bool>,
}

impl StoreUow for MemoryUow {
    fn on_complete(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.completions.push(callback);
    }

    fn gate(&self) -> UowGate {
        UowGate {
            open: self.open_rx.clone(),
        }
    }

    fn release(mut self: Box<Self>) {
        let _ = self.open_tx.send(true);
        for callback in self.completions.drain(..) {
            callback();
        }
    }
}
