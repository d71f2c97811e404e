use std::sync::Mutex;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::runtime::task::WaitContext;
use crate::runtime::value::Value;

pub const MAX_CHANNEL_CAPACITY: i64 = 1_000_000;

/// Bounded FIFO channel. Capacity 0 is a rendezvous: a send completes only
/// when a receiver is waiting. Closing drops the stored sender, which lets
/// receivers drain the buffer and then observe end-of-stream; the close is
/// idempotent and silent on an already-closed channel.
pub struct Channel {
    capacity: usize,
    sender: Mutex<Option<Sender<Value>>>,
    receiver: Receiver<Value>,
}

/// Outcome of a blocking send.
pub enum SendWait {
    Sent,
    Closed,
    Canceled,
    Fatal,
}

/// Outcome of a blocking receive.
pub enum RecvWait {
    Received(Value),
    Drained,
    Canceled,
    Fatal,
}

impl Channel {
    pub fn new(capacity: usize) -> Channel {
        let (tx, rx) = bounded(capacity);
        Channel {
            capacity,
            sender: Mutex::new(Some(tx)),
            receiver: rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Block until the value is handed off, the caller is canceled, or the
    /// runtime goes fatal. Fails fast with `Closed` when the channel was
    /// already closed at call time.
    pub fn send(&self, value: Value, wait: &WaitContext) -> SendWait {
        // Clone the sender out of the lock so a concurrent close cannot
        // block behind a rendezvous handshake.
        let sender = match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.clone(),
            None => return SendWait::Closed,
        };
        select! {
            send(sender, value) -> result => match result {
                Ok(()) => SendWait::Sent,
                Err(_) => SendWait::Closed,
            },
            recv(wait.cancel) -> _ => SendWait::Canceled,
            recv(wait.fatal) -> _ => SendWait::Fatal,
        }
    }

    /// Block until a value arrives, the channel is closed and drained, the
    /// caller is canceled, or the runtime goes fatal.
    pub fn recv(&self, wait: &WaitContext) -> RecvWait {
        select! {
            recv(self.receiver) -> result => match result {
                Ok(value) => RecvWait::Received(value),
                Err(_) => RecvWait::Drained,
            },
            recv(wait.cancel) -> _ => RecvWait::Canceled,
            recv(wait.fatal) -> _ => RecvWait::Fatal,
        }
    }
}
