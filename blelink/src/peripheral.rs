use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use btuuid::BluetoothUuid;
use futures_channel::{mpsc, oneshot};
use futures_core::Stream;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::backend::{AdapterBackend, Command, ConnectionState, WriteMode};
use crate::characteristic::Characteristic;
use crate::descriptor::Descriptor;
use crate::error::{ErrorKind, ProtocolError, Result};
use crate::id::{AttributeId, LinkId};
use crate::queue::{Completion, OperationKey, OperationKind, OperationQueue, Resolution};
use crate::service::Service;
use crate::util::{WatchCell, WatchStream};

/// One device link: request-scoped GATT operations and subscription
/// streams for a single peripheral.
///
/// Sessions are cheap to clone; clones share the same link state and
/// operation queues. Obtain one from
/// [`CentralSession::peripheral`](crate::CentralSession::peripheral) or
/// a successful [`connect`](crate::CentralSession::connect).
#[derive(Clone)]
pub struct PeripheralSession {
    link: LinkId,
    shared: Arc<PeripheralShared>,
    backend: Arc<dyn AdapterBackend>,
}

impl PeripheralSession {
    pub(crate) fn new(
        link: LinkId,
        shared: Arc<PeripheralShared>,
        backend: Arc<dyn AdapterBackend>,
    ) -> Self {
        Self {
            link,
            shared,
            backend,
        }
    }

    /// The identity of the peripheral this session talks to.
    pub fn id(&self) -> LinkId {
        self.link
    }

    /// The current state of the link.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Returns a stream of link state changes, current state first.
    pub fn state_changes(&self) -> WatchStream<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Initiates service discovery on the peripheral.
    ///
    /// If `services` is provided, the result is narrowed to services
    /// with those UUIDs; requested UUIDs that were not discovered are
    /// dropped silently.
    pub async fn discover_services(
        &self,
        services: Option<&[BluetoothUuid]>,
    ) -> Result<Vec<Service>> {
        let receiver = self.enqueue(
            OperationKey::new(OperationKind::DiscoverServices, None),
            Command::DiscoverServices {
                link: self.link,
                services: services.map(<[_]>::to_vec),
            },
        )?;
        let mut found = receiver.await??.into_services()?;
        if let Some(filter) = services {
            found.retain(|service| filter.contains(&service.uuid));
        }
        Ok(found)
    }

    /// Initiates discovery of the characteristics of a service.
    ///
    /// The `characteristics` parameter can limit the result to
    /// characteristics matching the provided UUIDs; requested UUIDs
    /// that were not discovered are dropped silently.
    pub async fn discover_characteristics(
        &self,
        service: &Service,
        characteristics: Option<&[BluetoothUuid]>,
    ) -> Result<Vec<Characteristic>> {
        let receiver = self.enqueue(
            OperationKey::new(OperationKind::DiscoverCharacteristics, Some(service.id)),
            Command::DiscoverCharacteristics {
                link: self.link,
                service: service.id,
                characteristics: characteristics.map(<[_]>::to_vec),
            },
        )?;
        let mut found = receiver.await??.into_characteristics()?;
        if let Some(filter) = characteristics {
            found.retain(|characteristic| filter.contains(&characteristic.uuid));
        }
        Ok(found)
    }

    /// Initiates discovery of the descriptors of a characteristic.
    pub async fn discover_descriptors(
        &self,
        characteristic: &Characteristic,
    ) -> Result<Vec<Descriptor>> {
        let receiver = self.enqueue(
            OperationKey::new(OperationKind::DiscoverDescriptors, Some(characteristic.id)),
            Command::DiscoverDescriptors {
                link: self.link,
                characteristic: characteristic.id,
            },
        )?;
        receiver.await??.into_descriptors()
    }

    /// Reads the value of a characteristic.
    ///
    /// Resolves on the first update event for this characteristic,
    /// which may also be an unsolicited notification.
    pub async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        let receiver = self.enqueue(
            OperationKey::new(OperationKind::Read, Some(characteristic.id)),
            Command::ReadCharacteristic {
                link: self.link,
                characteristic: characteristic.id,
            },
        )?;
        receiver.await??.into_value()
    }

    /// Writes the value of a characteristic and waits for the
    /// peripheral's acknowledgement.
    pub async fn write(&self, characteristic: &Characteristic, value: Vec<u8>) -> Result<()> {
        let receiver = self.enqueue(
            OperationKey::new(OperationKind::Write, Some(characteristic.id)),
            Command::WriteCharacteristic {
                link: self.link,
                characteristic: characteristic.id,
                value,
                mode: WriteMode::WithResponse,
            },
        )?;
        receiver.await??.into_written()
    }

    /// Writes the value of a characteristic without acknowledgement.
    ///
    /// The protocol offers no completion signal for this write, so
    /// there is no error channel either; the command goes straight to
    /// the backend.
    pub fn write_without_response(&self, characteristic: &Characteristic, value: Vec<u8>) {
        self.backend.issue(Command::WriteCharacteristic {
            link: self.link,
            characteristic: characteristic.id,
            value,
            mode: WriteMode::WithoutResponse,
        });
    }

    /// Enables or disables notifications for a characteristic.
    ///
    /// If the characteristic's notify state already matches `enabled`,
    /// this resolves immediately without issuing a backend command.
    pub async fn set_notify(&self, characteristic: &Characteristic, enabled: bool) -> Result<()> {
        let (receiver, dispatch) = {
            let mut inner = self.shared.inner.lock();
            let current = inner
                .notify_flags
                .get(&characteristic.id)
                .copied()
                .unwrap_or(false);
            if current == enabled {
                debug!(
                    link = %self.link,
                    characteristic = %characteristic.id,
                    enabled,
                    "notify state already matches, no command issued"
                );
                return Ok(());
            }
            inner.queue.enqueue(
                OperationKey::new(OperationKind::SetNotify, Some(characteristic.id)),
                Command::SetNotify {
                    link: self.link,
                    characteristic: characteristic.id,
                    enabled,
                },
            )?
        };
        if let Some(command) = dispatch {
            self.backend.issue(command);
        }
        receiver.await??.into_notify_state().map(|_| ())
    }

    /// Whether notifications are currently enabled for a characteristic.
    pub fn is_notifying(&self, characteristic: &Characteristic) -> bool {
        self.shared
            .inner
            .lock()
            .notify_flags
            .get(&characteristic.id)
            .copied()
            .unwrap_or(false)
    }

    /// Returns a stream of value updates for a characteristic.
    ///
    /// The value may update as the result of a [`read`](Self::read) or
    /// a notification from the peripheral once enabled with
    /// [`set_notify`](Self::set_notify). The stream never completes on
    /// its own; it ends when the link session is torn down, and
    /// dropping it permanently withdraws the subscription (call again
    /// for a new one).
    pub fn value_updates(&self, characteristic: &Characteristic) -> ValueUpdates {
        let (sender, receiver) = mpsc::unbounded();
        self.shared
            .inner
            .lock()
            .listeners
            .entry(characteristic.id)
            .or_default()
            .push(sender);
        ValueUpdates { receiver }
    }

    /// Reads the value of a descriptor.
    ///
    /// Descriptor I/O is deliberately unimplemented and always fails
    /// with [`ErrorKind::Unsupported`].
    pub async fn read_descriptor(&self, _descriptor: &Descriptor) -> Result<Vec<u8>> {
        Err(ErrorKind::Unsupported.into())
    }

    /// Writes the value of a descriptor.
    ///
    /// Descriptor I/O is deliberately unimplemented and always fails
    /// with [`ErrorKind::Unsupported`].
    pub async fn write_descriptor(&self, _descriptor: &Descriptor, _value: Vec<u8>) -> Result<()> {
        Err(ErrorKind::Unsupported.into())
    }

    fn enqueue(
        &self,
        key: OperationKey,
        command: Command,
    ) -> Result<oneshot::Receiver<Result<Completion>>> {
        let (receiver, dispatch) = self.shared.inner.lock().queue.enqueue(key, command)?;
        if let Some(command) = dispatch {
            self.backend.issue(command);
        }
        Ok(receiver)
    }
}

/// Stream of value updates for one characteristic.
pub struct ValueUpdates {
    receiver: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
}

impl Stream for ValueUpdates {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// Link state shared between session clones and the event sink.
pub(crate) struct PeripheralShared {
    link: LinkId,
    state: WatchCell<ConnectionState>,
    inner: Mutex<PeripheralInner>,
}

#[derive(Default)]
struct PeripheralInner {
    queue: OperationQueue,
    notify_flags: HashMap<AttributeId, bool>,
    listeners: HashMap<AttributeId, Vec<mpsc::UnboundedSender<Result<Vec<u8>>>>>,
}

impl PeripheralShared {
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            state: WatchCell::new(ConnectionState::default()),
            inner: Mutex::new(PeripheralInner::default()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        debug!(link = %self.link, ?state, "link state changed");
        self.state.set(state);
    }

    /// Resolves the oldest pending operation for `key`, dispatching the
    /// next held operation if one is waiting.
    pub fn handle_completion(
        &self,
        backend: &Arc<dyn AdapterBackend>,
        key: OperationKey,
        outcome: Result<Completion>,
    ) {
        let resolution = self.inner.lock().queue.complete(key, outcome);
        self.finish(backend, resolution);
    }

    /// Routes a value update: resolves a pending read if one is in
    /// flight and forwards the payload to every listener. An update
    /// with no pending read is an ordinary notification.
    pub fn handle_update(
        &self,
        backend: &Arc<dyn AdapterBackend>,
        characteristic: AttributeId,
        value: Vec<u8>,
        error: Option<ProtocolError>,
    ) {
        let outcome: Result<Vec<u8>> = match error {
            Some(error) => Err(error.into()),
            None => Ok(value),
        };
        let next = {
            let mut inner = self.inner.lock();
            let next = inner.queue.complete_if_pending(
                OperationKey::new(OperationKind::Read, Some(characteristic)),
                outcome.clone().map(Completion::Value),
            );
            if let Some(senders) = inner.listeners.get_mut(&characteristic) {
                senders.retain(|sender| sender.unbounded_send(outcome.clone()).is_ok());
                if senders.is_empty() {
                    inner.listeners.remove(&characteristic);
                }
            }
            next
        };
        if let Some(command) = next {
            backend.issue(command);
        }
    }

    /// Records the new notify flag and resolves the pending
    /// `set_notify`.
    pub fn handle_notification_state(
        &self,
        backend: &Arc<dyn AdapterBackend>,
        characteristic: AttributeId,
        enabled: bool,
        error: Option<ProtocolError>,
    ) {
        let outcome = match error {
            Some(error) => Err(error.into()),
            None => Ok(Completion::NotifyState(enabled)),
        };
        let resolution = {
            let mut inner = self.inner.lock();
            if outcome.is_ok() {
                inner.notify_flags.insert(characteristic, enabled);
            }
            inner.queue.complete(
                OperationKey::new(OperationKind::SetNotify, Some(characteristic)),
                outcome,
            )
        };
        self.finish(backend, resolution);
    }

    /// Discards every pending operation and ends every value-update
    /// stream. Commands already sent to the backend are not retracted.
    pub fn teardown(&self, kind: ErrorKind) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.queue.fail_all(kind);
            inner.notify_flags.clear();
            std::mem::take(&mut inner.listeners)
        };
        // Dropping the senders ends the streams.
        drop(listeners);
    }

    fn finish(&self, backend: &Arc<dyn AdapterBackend>, resolution: Resolution) {
        match resolution {
            Resolution::Resolved { next: Some(command) } => backend.issue(command),
            Resolution::Resolved { next: None } => {}
            Resolution::Corrupted => self.teardown_corrupted(),
        }
    }

    /// Terminates the link session after a broken correlation
    /// invariant: every pending operation has already failed, new
    /// requests are rejected, and the link is reported disconnected
    /// with [`ErrorKind::QueueCorruption`].
    fn teardown_corrupted(&self) {
        error!(link = %self.link, "correlation invariant broken, tearing down link session");
        let listeners = {
            let mut inner = self.inner.lock();
            inner.queue.corrupt();
            inner.notify_flags.clear();
            std::mem::take(&mut inner.listeners)
        };
        drop(listeners);
        self.state.set(ConnectionState::Disconnected {
            error: Some(ErrorKind::QueueCorruption.into()),
        });
    }
}

impl std::fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}
