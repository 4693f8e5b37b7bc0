//! Outstanding requests awaiting a response from one worker generation.
//!
//! Senders register a one-shot slot keyed by [`RequestId`] before writing the
//! request; the generation's reader task completes the slot. Once the reader
//! gives up, the table is closed and every remaining slot is failed, so no
//! sender outlives its worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::bridge::protocol::{RequestId, Response};
use crate::fault::Fault;

pub type ResponseSlot = oneshot::Receiver<Result<Response, Fault>>;

#[derive(Default)]
struct Inner {
    slots: DashMap<RequestId, oneshot::Sender<Result<Response, Fault>>>,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `request_id`. The returned guard removes the entry
    /// when dropped, whatever happens to the send.
    pub fn register(&self, request_id: RequestId) -> Result<(PendingGuard, ResponseSlot), Fault> {
        let (tx, rx) = oneshot::channel();
        match self.inner.slots.entry(request_id) {
            Entry::Occupied(_) => {
                return Err(Fault::protocol(format!("request {request_id} is already in flight")));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let guard = PendingGuard {
            pending: self.clone(),
            request_id,
        };
        // Checked after insert: fail_all closes first, then drains.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Fault::process("worker is no longer reading responses"));
        }
        Ok((guard, rx))
    }

    /// Route a response to its waiter. Returns false when nobody waits for it.
    pub fn complete(&self, response: Response) -> bool {
        match self.inner.slots.remove(&response.request_id) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Close the table and fail every outstanding slot with `fault`.
    pub fn fail_all(&self, fault: &Fault) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<RequestId> = self.inner.slots.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.slots.remove(&id) {
                let _ = tx.send(Err(fault.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }
}

/// Removes its pending entry on drop.
pub struct PendingGuard {
    pending: PendingRequests,
    request_id: RequestId,
}

impl PendingGuard {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.inner.slots.remove(&self.request_id);
    }
}
