//! Heart-beat liveness monitor.
//!
//! Watches the connection's raw byte counters. The read side samples at the
//! negotiated read interval and declares the peer dead when no bytes arrived
//! across a full sample; the write side samples at half the negotiated write
//! interval and asks for a keep-alive newline when nothing was written. A
//! monotonic session nonce cancels timers left over from a previous
//! `start()` so a restart never acts on stale samples.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stomp_wire::IoCounters;
use tokio::sync::mpsc;
use tracing::debug;

/// Grace added to the read interval, capped at 5s.
const READ_GRACE_CAP_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The write side was idle for a full sample; send a keep-alive.
    KeepAlive,
    /// The read side saw no bytes for a full sample; the peer is gone.
    Dead,
}

/// Negotiated check intervals. Zero disables a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatIntervals {
    pub read_ms: u64,
    pub write_ms: u64,
}

impl HeartbeatIntervals {
    /// Combine this broker's configured minimums with the peer's
    /// `heart-beat: cx,cy` offer.
    ///
    /// `cx` is how often the peer can send (drives our read checks), `cy`
    /// how often it wants to hear from us (drives our write keep-alives).
    pub fn negotiate(inbound_ms: u64, outbound_ms: u64, cx: u64, cy: u64) -> HeartbeatIntervals {
        let read_ms = if cx == 0 {
            0
        } else {
            let base = inbound_ms.max(cx);
            base + base.min(READ_GRACE_CAP_MS)
        };
        let write_ms = if cy == 0 { 0 } else { outbound_ms.max(cy) };
        HeartbeatIntervals { read_ms, write_ms }
    }
}

pub struct HeartbeatMonitor {
    counters: IoCounters,
    intervals: HeartbeatIntervals,
    session: Arc<AtomicU64>,
    events: mpsc::Sender<HeartbeatEvent>,
}

impl HeartbeatMonitor {
    pub fn new(
        counters: IoCounters,
        intervals: HeartbeatIntervals,
        events: mpsc::Sender<HeartbeatEvent>,
    ) -> HeartbeatMonitor {
        HeartbeatMonitor {
            counters,
            intervals,
            session: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Arm both check loops. Any loops from a previous `start` expire at
    /// their next wakeup.
    pub fn start(&self) {
        let nonce = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        if self.intervals.write_ms > 0 {
            tokio::spawn(write_check_loop(
                self.counters.clone(),
                Duration::from_millis(self.intervals.write_ms / 2),
                Arc::clone(&self.session),
                nonce,
                self.events.clone(),
                self.counters.bytes_written(),
            ));
        }
        if self.intervals.read_ms > 0 {
            tokio::spawn(read_check_loop(
                self.counters.clone(),
                Duration::from_millis(self.intervals.read_ms),
                Arc::clone(&self.session),
                nonce,
                self.events.clone(),
                self.counters.bytes_read(),
            ));
        }
    }

    /// Cancel the running loops at their next wakeup.
    pub fn stop(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
    }

    pub fn intervals(&self) -> HeartbeatIntervals {
        self.intervals
    }
}

async fn write_check_loop(
    counters: IoCounters,
    period: Duration,
    session: Arc<AtomicU64>,
    nonce: u64,
    events: mpsc::Sender<HeartbeatEvent>,
    mut last: u64,
) {
    loop {
        tokio::time::sleep(period).await;
        if session.load(Ordering::SeqCst) != nonce {
            return;
        }
        let sample = counters.bytes_written();
        if sample == last && events.send(HeartbeatEvent::KeepAlive).await.is_err() {
            return;
        }
        last = sample;
    }
}

async fn read_check_loop(
    counters: IoCounters,
    period: Duration,
    session: Arc<AtomicU64>,
    nonce: u64,
    events: mpsc::Sender<HeartbeatEvent>,
    mut last: u64,
) {
    loop {
        tokio::time::sleep(period).await;
        if session.load(Ordering::SeqCst) != nonce {
            return;
        }
        let sample = counters.bytes_read();
        if sample == last {
            debug!("no read progress across a full heart-beat interval");
            let _ = events.send(HeartbeatEvent::Dead).await;
            return;
        }
        last = sample;
    }
}
