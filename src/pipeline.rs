//! Ordered delivery of concurrently-processed packets
//!
//! AEAD work is CPU-bound and runs on many tasks at once, but the downstream
//! consumer (socket send, tun write) must observe packets in arrival order.
//! [`OrderedDelivery`] hands out FIFO tickets: a task registers a ticket when
//! its packet arrives, does the expensive work off to the side, then runs its
//! finalizer through the ticket. Finalizers execute in exactly registration
//! order; only the emission step is serialized, so latency is bounded by the
//! slowest individual packet rather than cumulative queue depth.
//!
//! Each direction (inbound decrypt, outbound encrypt) gets its own
//! independent chain.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// A FIFO ticket chain serializing result emission
#[derive(Default)]
pub struct OrderedDelivery {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl OrderedDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically append a ticket recording this packet's arrival position.
    ///
    /// The caller may then perform arbitrary work concurrently with other
    /// ticket holders before finishing through [`OrderTicket::run_ordered`].
    pub fn register(&self) -> OrderTicket {
        let (done, next) = oneshot::channel();
        let predecessor = self
            .tail
            .lock()
            .expect("ticket chain poisoned")
            .replace(next);
        OrderTicket { predecessor, done }
    }
}

/// A position in an [`OrderedDelivery`] chain.
///
/// Dropping a ticket without running it releases its successor, so an
/// abandoned packet (for example one that failed to decrypt) never stalls the
/// chain.
pub struct OrderTicket {
    predecessor: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

impl OrderTicket {
    /// Wait for the chronological predecessor's finalizer, run `finalizer`,
    /// then release the successor.
    pub async fn run_ordered<F, Fut, T>(self, finalizer: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(predecessor) = self.predecessor {
            // An Err means the predecessor was abandoned; proceed either way
            let _ = predecessor.await;
        }

        let out = finalizer().await;
        let _ = self.done.send(());
        out
    }
}
