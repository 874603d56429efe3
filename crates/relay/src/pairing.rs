//! Matches error streams with their data streams.
//!
//! Both streams of one forwarded connection carry the same request id, but
//! their headers are read on separate tasks so either may show up first. The
//! data side waits a bounded time for its error stream, and an error stream
//! is parked for at most the same time before it is dropped unclaimed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

enum Slot<T> {
    /// `generation` tells a parked stream apart from a later one that reused
    /// the same request id.
    Parked { stream: T, generation: u64 },
    Waiting(oneshot::Sender<T>),
}

/// Per-connection rendezvous keyed by request id.
pub struct Pairing<T> {
    slots: Mutex<HashMap<u32, Slot<T>>>,
    park_timeout: Duration,
    generations: AtomicU64,
}

impl<T: Send + 'static> Pairing<T> {
    /// Parked streams are dropped after `park_timeout` if nobody takes them.
    pub fn new(park_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            park_timeout,
            generations: AtomicU64::new(0),
        })
    }

    /// Hand over the error stream for `request_id`.
    pub fn offer(self: &Arc<Self>, request_id: u32, stream: T) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let stream = match slots.remove(&request_id) {
                Some(Slot::Waiting(waiter)) => match waiter.send(stream) {
                    Ok(()) => return,
                    // The data side gave up just now.
                    Err(stream) => stream,
                },
                Some(Slot::Parked { .. }) => {
                    debug!(request_id, "duplicate error stream, replacing");
                    stream
                }
                None => stream,
            };
            slots.insert(request_id, Slot::Parked { stream, generation });
        }

        let pairing = Arc::downgrade(self);
        let timeout = self.park_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(pairing, request_id, generation);
        });
    }

    /// Take the error stream for `request_id`, waiting up to `timeout`.
    pub async fn take(&self, request_id: u32, timeout: Duration) -> Option<T> {
        let receiver = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.remove(&request_id) {
                Some(Slot::Parked { stream, .. }) => return Some(stream),
                Some(Slot::Waiting(_)) | None => {
                    let (tx, rx) = oneshot::channel();
                    slots.insert(request_id, Slot::Waiting(tx));
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(stream)) => Some(stream),
            _ => {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(Slot::Waiting(_)) = slots.get(&request_id) {
                    slots.remove(&request_id);
                }
                None
            }
        }
    }

    /// Number of request ids with a parked stream or a waiter.
    pub fn pending(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Drop the stream parked as `generation` if it is still unclaimed. Dropping
/// a QUIC send stream finishes it.
fn expire<T>(pairing: Weak<Pairing<T>>, request_id: u32, generation: u64) {
    let Some(pairing) = pairing.upgrade() else {
        return;
    };
    let expired = {
        let mut slots = pairing.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(&request_id) {
            Some(Slot::Parked { generation: parked, .. }) if *parked == generation => {
                slots.remove(&request_id)
            }
            _ => None,
        }
    };
    if expired.is_some() {
        debug!(request_id, "error stream never claimed, dropping it");
    }
}
