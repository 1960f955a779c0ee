use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use parking_lot::Mutex;

pub struct ScopeGuard<F: FnOnce()> {
    dropfn: ManuallyDrop<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        unsafe { ManuallyDrop::drop(&mut self.dropfn) }
        std::mem::forget(self)
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        // SAFETY: This is OK because `dropfn` is `ManuallyDrop` which will not be dropped by the compiler.
        let dropfn = unsafe { ManuallyDrop::take(&mut self.dropfn) };
        dropfn();
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: ManuallyDrop::new(dropfn),
    }
}

pub struct BroadcastSender<T> {
    sender: async_broadcast::Sender<T>,
    _keep_alive: async_broadcast::InactiveReceiver<T>,
}

impl<T> Deref for BroadcastSender<T> {
    type Target = async_broadcast::Sender<T>;

    fn deref(&self) -> &Self::Target {
        &self.sender
    }
}

impl<T> DerefMut for BroadcastSender<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.sender
    }
}

pub fn broadcast<T>(cap: usize) -> BroadcastSender<T> {
    let (mut sender, receiver) = async_broadcast::broadcast(cap);
    sender.set_overflow(true);
    BroadcastSender {
        sender,
        _keep_alive: receiver.deactivate(),
    }
}

/// An observable cell holding an always-current value.
///
/// Subscribers see the value held at subscription time first, then
/// every subsequent update. Only the latest unobserved update is kept.
pub struct WatchCell<T> {
    current: Mutex<T>,
    sender: BroadcastSender<T>,
}

impl<T: Clone> WatchCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: Mutex::new(initial),
            sender: broadcast(1),
        }
    }

    pub fn get(&self) -> T {
        self.current.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.current.lock() = value.clone();
        let _ = self.sender.try_broadcast(value);
    }

    pub fn subscribe(&self) -> WatchStream<T> {
        // Snapshot and receiver creation happen under the same lock so
        // the first item cannot race a concurrent `set`.
        let current = self.current.lock();
        WatchStream {
            first: Some(current.clone()),
            receiver: self.sender.new_receiver(),
        }
    }
}

/// Stream of values from a [`WatchCell`], current value first.
pub struct WatchStream<T> {
    first: Option<T>,
    receiver: async_broadcast::Receiver<T>,
}

impl<T: Clone> WatchStream<T> {
    /// Receives the next value, or `None` once the cell is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.first.take() {
            return Some(value);
        }
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(async_broadcast::RecvError::Overflowed(_)) => continue,
                Err(async_broadcast::RecvError::Closed) => return None,
            }
        }
    }
}

impl<T: Clone + Unpin> Stream for WatchStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(value) = this.first.take() {
            return Poll::Ready(Some(value));
        }
        Pin::new(&mut this.receiver).poll_next(cx)
    }
}
