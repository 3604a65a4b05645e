//! Client transaction bookkeeping.
//!
//! A transaction is an ordered list of deferred actions, connection-local by
//! construction. SEND and ACK frames naming a transaction enqueue here; the
//! connection replays the drained list against a single store unit of work
//! on COMMIT, and ABORT discards the list without running anything.

use std::collections::HashMap;

use stomp_wire::Frame;

/// A deferred frame effect, replayed on COMMIT.
#[derive(Debug)]
pub enum TxAction {
    /// A SEND held back until commit. The frame already carries its
    /// `message-id`; the receipt, if any, was emitted at enqueue time.
    Send { frame: Frame },
    /// An ACK held back until commit.
    Ack {
        subscription: Option<String>,
        message_id: String,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction already started: {0}")]
    AlreadyStarted(String),
    #[error("transaction not active: {0}")]
    NotActive(String),
}

#[derive(Default)]
pub struct TransactionRegistry {
    transactions: HashMap<String, Vec<TxAction>>,
}

impl TransactionRegistry {
    pub fn new() -> TransactionRegistry {
        TransactionRegistry::default()
    }

    pub fn begin(&mut self, id: &str) -> Result<(), TxError> {
        if self.transactions.contains_key(id) {
            return Err(TxError::AlreadyStarted(id.to_owned()));
        }
        self.transactions.insert(id.to_owned(), Vec::new());
        Ok(())
    }

    /// Append an action, creating the transaction if BEGIN never named it.
    pub fn enqueue(&mut self, id: &str, action: TxAction) {
        self.transactions.entry(id.to_owned()).or_default().push(action);
    }

    /// Drain the transaction for replay, in insertion order.
    pub fn commit(&mut self, id: &str) -> Result<Vec<TxAction>, TxError> {
        self.transactions
            .remove(id)
            .ok_or_else(|| TxError::NotActive(id.to_owned()))
    }

    /// Discard the transaction. No action ever runs.
    pub fn abort(&mut self, id: &str) -> Result<(), TxError> {
        self.transactions
            .remove(id)
            .map(drop)
            .ok_or_else(|| TxError::NotActive(id.to_owned()))
    }

    pub fn active(&self) -> usize {
        self.transactions.len()
    }
}
