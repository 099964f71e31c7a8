//! Table of calls waiting for their reply on one connection.
//!
//! Each in-flight call registers its transaction id (xid) and gets a
//! one-shot receiver. The connection listener completes the entry whose xid
//! matches an incoming reply; replies for ids nobody waits on any more (the
//! caller already timed out) are discarded without waking anyone.
//!
//! When the listener dies, the failure is recorded here and every waiter is
//! released at once; later registrations fail immediately with the same
//! error instead of waiting for a reply that can never come.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

#[derive(Default)]
struct Waiters {
    pending: HashMap<u32, oneshot::Sender<Vec<u8>>>,
    failure: Option<Error>,
}

#[derive(Default)]
pub struct TransactionTracker {
    waiters: Mutex<Waiters>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts waiting for the reply to `xid`.
    ///
    /// Registering an id that is already waiting replaces the old waiter,
    /// which then sees its receiver closed.
    pub fn register(&self, xid: u32) -> Result<oneshot::Receiver<Vec<u8>>> {
        let mut waiters = self.lock();
        if let Some(failure) = &waiters.failure {
            return Err(failure.clone());
        }
        let (sender, receiver) = oneshot::channel();
        waiters.pending.insert(xid, sender);
        Ok(receiver)
    }

    /// Hands `reply` to the caller waiting on `xid`.
    ///
    /// Returns false if nobody is waiting for it.
    pub fn complete(&self, xid: u32, reply: Vec<u8>) -> bool {
        let sender = self.lock().pending.remove(&xid);
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Stops waiting for `xid`.
    pub fn cancel(&self, xid: u32) {
        self.lock().pending.remove(&xid);
    }

    /// Records a fatal failure and releases every waiter.
    pub fn fail_all(&self, failure: Error) {
        let mut waiters = self.lock();
        waiters.failure.get_or_insert(failure);
        // Dropping the senders wakes the receivers with an error.
        waiters.pending.clear();
    }

    pub fn failure(&self) -> Option<Error> {
        self.lock().failure.clone()
    }

    pub fn is_waiting(&self, xid: u32) -> bool {
        self.lock().pending.contains_key(&xid)
    }

    /// Number of calls currently waiting.
    pub fn waiting(&self) -> usize {
        self.lock().pending.len()
    }
}
