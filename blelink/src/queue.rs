//! Per-link, per-kind FIFO correlation of backend completions.
//!
//! The backend protocol carries no request identifier: the only
//! correlation key is arrival order. Each (kind, subject) pair gets its
//! own FIFO; at most one operation per FIFO is dispatched to the
//! backend at a time, and a completion event always resolves the
//! oldest pending operation of its key. Operations of the same key
//! must therefore never be reordered.

use std::collections::{HashMap, VecDeque};

use futures_channel::oneshot;
use tracing::{debug, error};

use crate::backend::Command;
use crate::characteristic::Characteristic;
use crate::descriptor::Descriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::id::AttributeId;
use crate::service::Service;

/// The kinds of request the queue serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OperationKind {
    DiscoverServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    Read,
    Write,
    SetNotify,
}

/// FIFO key. `subject` is the attribute the operation targets (the
/// parent service for characteristic discovery, the characteristic
/// itself for reads/writes/notify), or `None` for service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OperationKey {
    pub kind: OperationKind,
    pub subject: Option<AttributeId>,
}

impl OperationKey {
    pub fn new(kind: OperationKind, subject: Option<AttributeId>) -> Self {
        Self { kind, subject }
    }
}

/// Payload bound to a resolved operation.
#[derive(Debug)]
pub(crate) enum Completion {
    Services(Vec<Service>),
    Characteristics(Vec<Characteristic>),
    Descriptors(Vec<Descriptor>),
    Value(Vec<u8>),
    Written,
    NotifyState(bool),
}

impl Completion {
    fn mismatched(self) -> Error {
        error!(payload = ?self, "completion payload does not match its operation kind");
        ErrorKind::QueueCorruption.into()
    }

    pub fn into_services(self) -> Result<Vec<Service>> {
        match self {
            Completion::Services(services) => Ok(services),
            other => Err(other.mismatched()),
        }
    }

    pub fn into_characteristics(self) -> Result<Vec<Characteristic>> {
        match self {
            Completion::Characteristics(characteristics) => Ok(characteristics),
            other => Err(other.mismatched()),
        }
    }

    pub fn into_descriptors(self) -> Result<Vec<Descriptor>> {
        match self {
            Completion::Descriptors(descriptors) => Ok(descriptors),
            other => Err(other.mismatched()),
        }
    }

    pub fn into_value(self) -> Result<Vec<u8>> {
        match self {
            Completion::Value(value) => Ok(value),
            other => Err(other.mismatched()),
        }
    }

    pub fn into_written(self) -> Result<()> {
        match self {
            Completion::Written => Ok(()),
            other => Err(other.mismatched()),
        }
    }

    pub fn into_notify_state(self) -> Result<bool> {
        match self {
            Completion::NotifyState(enabled) => Ok(enabled),
            other => Err(other.mismatched()),
        }
    }
}

/// A request owned by the queue until its completion arrives.
///
/// The token records issue order; it only appears in logs. Pending
/// operations are never recycled: they resolve on the first matching
/// completion or fail when the queue is torn down.
struct PendingOperation {
    token: u64,
    command: Command,
    completion: oneshot::Sender<Result<Completion>>,
}

/// Outcome of feeding a completion event into the queue.
#[must_use]
pub(crate) enum Resolution {
    /// The oldest pending operation was resolved. If `next` is present
    /// the new FIFO head must be dispatched to the backend (after any
    /// session lock is released).
    Resolved { next: Option<Command> },
    /// No operation of this key was pending: the correlation invariant
    /// is broken and every pending operation has been failed. The
    /// owning session must tear down.
    Corrupted,
}

#[derive(Default)]
pub(crate) struct OperationQueue {
    queues: HashMap<OperationKey, VecDeque<PendingOperation>>,
    next_token: u64,
    corrupted: bool,
}

impl OperationQueue {
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Appends an operation to its FIFO.
    ///
    /// Returns the completion receiver and, when the FIFO was empty,
    /// the command the caller must dispatch once it has released its
    /// lock. A held operation is dispatched later, when it becomes the
    /// FIFO head.
    pub fn enqueue(
        &mut self,
        key: OperationKey,
        command: Command,
    ) -> Result<(oneshot::Receiver<Result<Completion>>, Option<Command>)> {
        if self.is_corrupted() {
            return Err(ErrorKind::QueueCorruption.into());
        }

        let token = self.next_token;
        self.next_token += 1;

        let (sender, receiver) = oneshot::channel();
        let queue = self.queues.entry(key).or_default();
        let dispatch = queue.is_empty().then(|| command.clone());
        debug!(token, ?key, held = dispatch.is_none(), "operation enqueued");
        queue.push_back(PendingOperation {
            token,
            command,
            completion: sender,
        });
        Ok((receiver, dispatch))
    }

    /// Resolves the oldest pending operation for `key` with `outcome`
    /// and hands back the next head for dispatch.
    ///
    /// A completion with an empty FIFO is not an ordinary error: it
    /// means the backend delivered an unexpected or duplicate
    /// callback, so the whole queue is poisoned and every pending
    /// operation fails with [`ErrorKind::QueueCorruption`].
    pub fn complete(&mut self, key: OperationKey, outcome: Result<Completion>) -> Resolution {
        match self.pop(key) {
            Some(op) => {
                debug!(token = op.token, ?key, "operation resolved");
                let _ = op.completion.send(outcome);
                let next = self
                    .queues
                    .get(&key)
                    .and_then(|queue| queue.front())
                    .map(|op| op.command.clone());
                Resolution::Resolved { next }
            }
            None => {
                error!(?key, "completion event with no pending operation");
                self.corrupt();
                Resolution::Corrupted
            }
        }
    }

    /// Like [`complete`](Self::complete), but an event with no pending
    /// operation is legitimate and resolves nothing. Used for value
    /// updates, which are also delivered for unsolicited notifications.
    pub fn complete_if_pending(
        &mut self,
        key: OperationKey,
        outcome: Result<Completion>,
    ) -> Option<Command> {
        let op = self.pop(key)?;
        debug!(token = op.token, ?key, "operation resolved");
        let _ = op.completion.send(outcome);
        self.queues
            .get(&key)
            .and_then(|queue| queue.front())
            .map(|op| op.command.clone())
    }

    /// Poisons the queue, failing every pending operation with
    /// [`ErrorKind::QueueCorruption`]. Subsequent enqueues fail
    /// immediately. Idempotent.
    pub fn corrupt(&mut self) {
        if self.corrupted {
            return;
        }
        self.corrupted = true;
        for (key, queue) in self.queues.drain() {
            for op in queue {
                debug!(token = op.token, ?key, "failing pending operation");
                let _ = op.completion.send(Err(ErrorKind::QueueCorruption.into()));
            }
        }
    }

    /// Discards every pending operation, failing each with `kind`.
    /// Used on session teardown; their commands are not retracted from
    /// the backend.
    pub fn fail_all(&mut self, kind: ErrorKind) {
        for (key, queue) in self.queues.drain() {
            for op in queue {
                debug!(token = op.token, ?key, "canceling pending operation");
                let _ = op.completion.send(Err(kind.clone().into()));
            }
        }
    }

    fn pop(&mut self, key: OperationKey) -> Option<PendingOperation> {
        let queue = self.queues.get_mut(&key)?;
        let op = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        op
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::id::LinkId;

    fn read_key(id: u64) -> OperationKey {
        OperationKey::new(OperationKind::Read, Some(AttributeId::new(id)))
    }

    fn read_command(id: u64) -> Command {
        Command::ReadCharacteristic {
            link: LinkId::new(Uuid::from_u128(1)),
            characteristic: AttributeId::new(id),
        }
    }

    fn value(queue_result: Result<Completion>) -> Vec<u8> {
        queue_result.unwrap().into_value().unwrap()
    }

    #[test]
    fn only_the_fifo_head_is_dispatched() {
        let mut queue = OperationQueue::default();
        let (_rx1, dispatch1) = queue.enqueue(read_key(1), read_command(1)).unwrap();
        let (_rx2, dispatch2) = queue.enqueue(read_key(1), read_command(1)).unwrap();
        assert_eq!(dispatch1, Some(read_command(1)));
        assert_eq!(dispatch2, None);
    }

    #[test]
    fn completions_resolve_in_issue_order() {
        let mut queue = OperationQueue::default();
        let (mut rx1, _) = queue.enqueue(read_key(1), read_command(1)).unwrap();
        let (mut rx2, _) = queue.enqueue(read_key(1), read_command(1)).unwrap();

        let Resolution::Resolved { next } =
            queue.complete(read_key(1), Ok(Completion::Value(vec![1])))
        else {
            panic!("queue reported corruption");
        };
        assert_eq!(next, Some(read_command(1)));
        assert_eq!(value(rx1.try_recv().unwrap().unwrap()), vec![1]);
        assert!(rx2.try_recv().unwrap().is_none());

        let Resolution::Resolved { next } =
            queue.complete(read_key(1), Ok(Completion::Value(vec![2])))
        else {
            panic!("queue reported corruption");
        };
        assert_eq!(next, None);
        assert_eq!(value(rx2.try_recv().unwrap().unwrap()), vec![2]);
    }

    #[test]
    fn distinct_subjects_have_independent_fifos() {
        let mut queue = OperationQueue::default();
        let (_rx1, dispatch1) = queue.enqueue(read_key(1), read_command(1)).unwrap();
        let (_rx2, dispatch2) = queue.enqueue(read_key(2), read_command(2)).unwrap();
        // Both are FIFO heads, so both dispatch immediately.
        assert_eq!(dispatch1, Some(read_command(1)));
        assert_eq!(dispatch2, Some(read_command(2)));
    }

    #[test]
    fn completion_with_empty_fifo_poisons_the_queue() {
        let mut queue = OperationQueue::default();
        let (mut rx, _) = queue.enqueue(read_key(1), read_command(1)).unwrap();

        let resolution = queue.complete(
            OperationKey::new(OperationKind::Write, Some(AttributeId::new(9))),
            Ok(Completion::Written),
        );
        assert!(matches!(resolution, Resolution::Corrupted));
        assert!(queue.is_corrupted());

        // The unrelated pending operation failed too.
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(
            outcome.unwrap_err().kind(),
            &ErrorKind::QueueCorruption,
        );

        // And nothing further can be enqueued.
        let err = queue.enqueue(read_key(1), read_command(1)).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::QueueCorruption);
    }

    #[test]
    fn unsolicited_update_resolves_nothing() {
        let mut queue = OperationQueue::default();
        let next = queue.complete_if_pending(read_key(1), Ok(Completion::Value(vec![1])));
        assert_eq!(next, None);
        assert!(!queue.is_corrupted());
    }

    #[test]
    fn fail_all_cancels_every_pending_operation() {
        let mut queue = OperationQueue::default();
        let (mut rx1, _) = queue.enqueue(read_key(1), read_command(1)).unwrap();
        let (mut rx2, _) = queue.enqueue(read_key(2), read_command(2)).unwrap();

        queue.fail_all(ErrorKind::Canceled);

        for rx in [&mut rx1, &mut rx2] {
            let outcome = rx.try_recv().unwrap().unwrap();
            assert_eq!(outcome.unwrap_err().kind(), &ErrorKind::Canceled);
        }
        assert!(!queue.is_corrupted());
    }
}
