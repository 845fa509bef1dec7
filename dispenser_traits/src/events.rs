//! Bounded edge-event queue between interrupt context and the main loop.
//!
//! All hardware edges (pill drop, encoder rotation, button presses) funnel
//! through one demultiplexing handler that posts `{source, timestamp}` onto
//! this queue. The cooperative loop is the sole consumer. The queue is
//! bounded; when full, events are dropped rather than blocking the
//! interrupt path.

use std::time::Instant;

use crossbeam_channel as xch;

/// Which hardware edge fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSource {
    PillDrop,
    /// Signed quadrature delta, usually ±1.
    Encoder(i8),
    ButtonPress,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeEvent {
    pub source: EdgeSource,
    /// Millisecond timestamp taken at post time (wraps at `u32::MAX`).
    pub at_ms: u32,
}

/// Producer half, cloneable into each interrupt handler.
#[derive(Clone)]
pub struct EdgeSender {
    tx: xch::Sender<EdgeEvent>,
    origin: Instant,
}

impl EdgeSender {
    /// Post an event; drops it when the queue is full.
    pub fn post(&self, source: EdgeSource) -> bool {
        let at_ms = (self.origin.elapsed().as_millis() & u128::from(u32::MAX)) as u32;
        self.tx.try_send(EdgeEvent { source, at_ms }).is_ok()
    }
}

/// Consumer half, owned by the cooperative loop.
pub struct EdgeReceiver {
    rx: xch::Receiver<EdgeEvent>,
}

impl EdgeReceiver {
    /// Non-blocking poll for the next queued edge.
    pub fn poll(&self) -> Option<EdgeEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<EdgeEvent> {
        self.rx.try_iter().collect()
    }
}

/// Create a bounded edge queue of the given capacity.
pub fn edge_queue(capacity: usize) -> (EdgeSender, EdgeReceiver) {
    let (tx, rx) = xch::bounded(capacity);
    (
        EdgeSender {
            tx,
            origin: Instant::now(),
        },
        EdgeReceiver { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (tx, rx) = edge_queue(4);
        assert!(tx.post(EdgeSource::PillDrop));
        assert!(tx.post(EdgeSource::Encoder(-1)));
        assert_eq!(rx.poll().map(|e| e.source), Some(EdgeSource::PillDrop));
        assert_eq!(rx.poll().map(|e| e.source), Some(EdgeSource::Encoder(-1)));
        assert!(rx.poll().is_none());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, rx) = edge_queue(1);
        assert!(tx.post(EdgeSource::ButtonPress));
        assert!(!tx.post(EdgeSource::ButtonPress));
        assert_eq!(rx.drain().len(), 1);
    }
}
