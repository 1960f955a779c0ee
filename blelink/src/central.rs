use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use btuuid::BluetoothUuid;
use futures_channel::{mpsc, oneshot};
use futures_core::Stream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::advertisement_data::AdvertisementData;
use crate::backend::{AdapterBackend, AdapterState, BackendEvent, Command, ConnectionState};
use crate::error::{Error, ErrorKind, ProtocolError, Result};
use crate::id::LinkId;
use crate::peripheral::{PeripheralSession, PeripheralShared};
use crate::queue::{Completion, OperationKey, OperationKind};
use crate::util::{WatchCell, WatchStream, defer};

/// A peripheral discovered while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub link: LinkId,
    pub advertisement: AdvertisementData,
    pub rssi: i16,
}

/// Outcome of a connect attempt.
pub enum ConnectOutcome {
    /// The link came up; the session is live.
    Connected(PeripheralSession),
    /// The backend reported a benign disconnect before the link came
    /// up: the attempt was superseded, which is a clean no-op rather
    /// than a failure.
    Superseded,
}

impl ConnectOutcome {
    /// The live session, if the attempt connected.
    pub fn session(self) -> Option<PeripheralSession> {
        match self {
            ConnectOutcome::Connected(session) => Some(session),
            ConnectOutcome::Superseded => None,
        }
    }
}

impl fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Connected(session) => {
                f.debug_tuple("Connected").field(&session.id()).finish()
            }
            ConnectOutcome::Superseded => f.write_str("Superseded"),
        }
    }
}

/// Adapter-wide session: power-state tracking, the scan lifecycle and
/// connect/disconnect races.
///
/// Cheap to clone; clones share the same adapter state. All backend
/// events for the session arrive through the [`EventSink`] obtained
/// from [`event_sink`](Self::event_sink), serialized on the backend's
/// delivery context.
#[derive(Clone)]
pub struct CentralSession {
    shared: Arc<CentralShared>,
}

impl CentralSession {
    /// Creates a session over `backend`.
    ///
    /// The concrete backend variant is chosen here, once; wire the
    /// backend's event driver to [`event_sink`](Self::event_sink) to
    /// complete construction.
    pub fn new(backend: Arc<dyn AdapterBackend>) -> Self {
        let adapter_state = WatchCell::new(backend.adapter_state());
        Self {
            shared: Arc::new(CentralShared {
                backend,
                adapter_state,
                scanning: WatchCell::new(false),
                inner: Mutex::new(CentralInner::default()),
            }),
        }
    }

    /// Returns the sink the backend's event driver delivers into.
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The current power state of the adapter.
    pub fn adapter_state(&self) -> AdapterState {
        self.shared.adapter_state.get()
    }

    /// Returns a stream of adapter state changes, current state first.
    pub fn adapter_state_changes(&self) -> WatchStream<AdapterState> {
        self.shared.adapter_state.subscribe()
    }

    /// Whether a scan is currently active.
    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.get()
    }

    /// Returns a stream of scanning-flag changes, current value first.
    pub fn scanning_changes(&self) -> WatchStream<bool> {
        self.shared.scanning.subscribe()
    }

    /// Starts scanning for peripherals, stopping any scan already in
    /// progress first. At most one scan is active per session.
    ///
    /// If `services` is provided, only peripherals advertising those
    /// services are reported. Suspends until the adapter reaches a
    /// determined state, then fails with
    /// [`ErrorKind::AdapterNotReady`] unless it is powered on.
    ///
    /// The returned stream ends deterministically when
    /// [`stop_scan`](Self::stop_scan) is called or the adapter leaves
    /// the powered-on state; dropping it stops the scan if this scan is
    /// still the active one.
    pub async fn start_scan(&self, services: Option<&[BluetoothUuid]>) -> Result<ScanResults> {
        self.stop_scan();
        self.ready().await?;

        let (sender, receiver) = mpsc::unbounded();
        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.scan_generation += 1;
            inner.scan = Some(ActiveScan {
                generation: inner.scan_generation,
                sender,
            });
            inner.scan_generation
        };
        debug!(generation, "scan starting");
        self.shared.scanning.set(true);
        self.shared.backend.issue(Command::StartScan {
            services: services.map(<[_]>::to_vec),
        });
        Ok(ScanResults {
            receiver,
            generation,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Stops the active scan, if any.
    ///
    /// Issues exactly one backend stop command per active scan and
    /// fires that scan's kill signal exactly once; calling this again
    /// with no scan active is a no-op. A scan started afterwards
    /// belongs to a new generation and is immune to stale stops.
    pub fn stop_scan(&self) {
        self.shared.stop_scan_generation(None);
    }

    /// Connects to a peripheral.
    ///
    /// Races the backend's connected and disconnected events for
    /// `link`: whichever fires first wins. A disconnected event
    /// carrying an error fails the attempt with that error; one
    /// carrying no error resolves as [`ConnectOutcome::Superseded`].
    ///
    /// If the returned future is dropped while the link is still
    /// connecting, a disconnect command is issued; the remote attempt
    /// is otherwise not retracted.
    pub async fn connect(&self, link: LinkId) -> Result<ConnectOutcome> {
        self.ready().await?;

        let (sender, receiver) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock();
            inner
                .peripherals
                .entry(link)
                .or_insert_with(|| Arc::new(PeripheralShared::new(link)));
            inner.connecting.insert(link, sender);
        }
        debug!(%link, "connecting");
        self.shared.backend.issue(Command::Connect { link });

        let guard = defer(|| {
            if matches!(self.peripheral(link).state(), ConnectionState::Connecting) {
                self.shared.backend.issue(Command::Disconnect { link });
            }
        });
        let resolution = receiver.await?;
        guard.defuse();

        match resolution {
            ConnectResolution::Connected => Ok(ConnectOutcome::Connected(self.peripheral(link))),
            ConnectResolution::Superseded => Ok(ConnectOutcome::Superseded),
            ConnectResolution::Failed(error) => Err(error),
        }
    }

    /// Disconnects from a peripheral.
    ///
    /// Resolves on the first disconnected event for `link`,
    /// propagating the error it carries, if any.
    pub async fn disconnect(&self, link: LinkId) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.shared
            .inner
            .lock()
            .disconnecting
            .entry(link)
            .or_default()
            .push(sender);
        debug!(%link, "disconnecting");
        self.shared.backend.issue(Command::Disconnect { link });
        receiver.await?
    }

    /// Returns the session for a discovered peripheral identity.
    ///
    /// Sessions are per identity: calling this twice for the same link
    /// yields clones sharing one state.
    pub fn peripheral(&self, link: LinkId) -> PeripheralSession {
        let shared = self
            .shared
            .inner
            .lock()
            .peripherals
            .entry(link)
            .or_insert_with(|| Arc::new(PeripheralShared::new(link)))
            .clone();
        PeripheralSession::new(link, shared, self.shared.backend.clone())
    }

    /// Suspends until the adapter reaches a determined state, then
    /// proceeds only if it is powered on.
    async fn ready(&self) -> Result<()> {
        let mut states = self.shared.adapter_state.subscribe();
        while let Some(state) = states.recv().await {
            if !state.is_determined() {
                continue;
            }
            return if state == AdapterState::PoweredOn {
                Ok(())
            } else {
                Err(ErrorKind::AdapterNotReady(state).into())
            };
        }
        Err(ErrorKind::Canceled.into())
    }
}

/// Stream of scan results for one scan generation.
#[derive(Debug)]
pub struct ScanResults {
    receiver: mpsc::UnboundedReceiver<ScanResult>,
    generation: u64,
    shared: Weak<CentralShared>,
}

impl Stream for ScanResults {
    type Item = ScanResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for ScanResults {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop_scan_generation(Some(self.generation));
        }
    }
}

/// Delivery endpoint for backend events.
///
/// The backend's driver calls [`deliver`](Self::deliver) for every
/// event, serialized on one logical context. The sink holds only a
/// weak reference to the session; once the session is gone, delivery
/// becomes a no-op.
#[derive(Clone)]
pub struct EventSink {
    shared: Weak<CentralShared>,
}

impl EventSink {
    pub fn deliver(&self, event: BackendEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.handle_event(event);
    }
}

struct CentralShared {
    backend: Arc<dyn AdapterBackend>,
    adapter_state: WatchCell<AdapterState>,
    scanning: WatchCell<bool>,
    inner: Mutex<CentralInner>,
}

#[derive(Default)]
struct CentralInner {
    scan: Option<ActiveScan>,
    scan_generation: u64,
    connecting: HashMap<LinkId, oneshot::Sender<ConnectResolution>>,
    disconnecting: HashMap<LinkId, Vec<oneshot::Sender<Result<()>>>>,
    peripherals: HashMap<LinkId, Arc<PeripheralShared>>,
}

struct ActiveScan {
    generation: u64,
    sender: mpsc::UnboundedSender<ScanResult>,
}

enum ConnectResolution {
    Connected,
    Superseded,
    Failed(Error),
}

impl CentralShared {
    /// Ends the active scan. With a generation, only that generation's
    /// scan is stopped; stale callers cannot kill a newer scan.
    fn stop_scan_generation(&self, generation: Option<u64>) {
        let stopped = {
            let mut inner = self.inner.lock();
            match (&inner.scan, generation) {
                (Some(active), Some(generation)) if active.generation != generation => None,
                _ => inner.scan.take(),
            }
        };
        if let Some(active) = stopped {
            debug!(generation = active.generation, "scan stopping");
            self.backend.issue(Command::StopScan);
            self.scanning.set(false);
        }
        // Dropping the taken sender fires this generation's kill
        // signal: the stream ends once its buffer drains.
    }

    fn handle_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::AdapterStateChanged(state) => {
                debug!(?state, "adapter state changed");
                self.adapter_state.set(state);
                if state != AdapterState::PoweredOn {
                    // The adapter itself stopped scanning; end the
                    // sequence without issuing a redundant stop.
                    let ended = self.inner.lock().scan.take();
                    if ended.is_some() {
                        warn!(?state, "scan ended, adapter left the powered-on state");
                        self.scanning.set(false);
                    }
                }
            }
            BackendEvent::Discovered {
                link,
                advertisement,
                rssi,
            } => {
                let withdrawn = {
                    let inner = self.inner.lock();
                    match &inner.scan {
                        Some(active) => active
                            .sender
                            .unbounded_send(ScanResult {
                                link,
                                advertisement,
                                rssi,
                            })
                            .is_err(),
                        None => false,
                    }
                };
                if withdrawn {
                    // The subscriber dropped the stream without calling
                    // stop; the backend must not keep scanning.
                    self.stop_scan_generation(None);
                }
            }
            BackendEvent::LinkStateChanged { link, state } => self.handle_link_state(link, state),
            BackendEvent::ServicesDiscovered {
                link,
                services,
                error,
            } => self.with_peripheral(link, |peripheral| {
                peripheral.handle_completion(
                    &self.backend,
                    OperationKey::new(OperationKind::DiscoverServices, None),
                    outcome(error, Completion::Services(services)),
                );
            }),
            BackendEvent::CharacteristicsDiscovered {
                link,
                service,
                characteristics,
                error,
            } => self.with_peripheral(link, |peripheral| {
                peripheral.handle_completion(
                    &self.backend,
                    OperationKey::new(OperationKind::DiscoverCharacteristics, Some(service)),
                    outcome(error, Completion::Characteristics(characteristics)),
                );
            }),
            BackendEvent::DescriptorsDiscovered {
                link,
                characteristic,
                descriptors,
                error,
            } => self.with_peripheral(link, |peripheral| {
                peripheral.handle_completion(
                    &self.backend,
                    OperationKey::new(OperationKind::DiscoverDescriptors, Some(characteristic)),
                    outcome(error, Completion::Descriptors(descriptors)),
                );
            }),
            BackendEvent::CharacteristicUpdated {
                link,
                characteristic,
                value,
                error,
            } => self.with_peripheral(link, |peripheral| {
                peripheral.handle_update(&self.backend, characteristic, value, error);
            }),
            BackendEvent::CharacteristicWritten {
                link,
                characteristic,
                error,
            } => self.with_peripheral(link, |peripheral| {
                peripheral.handle_completion(
                    &self.backend,
                    OperationKey::new(OperationKind::Write, Some(characteristic)),
                    outcome(error, Completion::Written),
                );
            }),
            BackendEvent::NotificationStateChanged {
                link,
                characteristic,
                enabled,
                error,
            } => self.with_peripheral(link, |peripheral| {
                peripheral.handle_notification_state(&self.backend, characteristic, enabled, error);
            }),
        }
    }

    fn handle_link_state(&self, link: LinkId, state: ConnectionState) {
        let (peripheral, connecting, disconnecting) = {
            let mut inner = self.inner.lock();
            let peripheral = inner
                .peripherals
                .entry(link)
                .or_insert_with(|| Arc::new(PeripheralShared::new(link)))
                .clone();
            match &state {
                ConnectionState::Connected => (peripheral, inner.connecting.remove(&link), None),
                ConnectionState::Disconnected { .. } => (
                    peripheral,
                    inner.connecting.remove(&link),
                    inner.disconnecting.remove(&link),
                ),
                _ => (peripheral, None, None),
            }
        };

        peripheral.set_state(state.clone());

        match state {
            ConnectionState::Connected => {
                if let Some(sender) = connecting {
                    let _ = sender.send(ConnectResolution::Connected);
                }
            }
            ConnectionState::Disconnected { error } => {
                if let Some(sender) = connecting {
                    let resolution = match &error {
                        Some(error) => ConnectResolution::Failed(error.clone()),
                        None => ConnectResolution::Superseded,
                    };
                    let _ = sender.send(resolution);
                }
                if let Some(waiters) = disconnecting {
                    let result: Result<()> = match &error {
                        Some(error) => Err(error.clone()),
                        None => Ok(()),
                    };
                    for sender in waiters {
                        let _ = sender.send(result.clone());
                    }
                }
                // The link is down: pending operations can never
                // resolve and value-update streams end here.
                peripheral.teardown(ErrorKind::Canceled);
            }
            _ => {}
        }
    }

    fn with_peripheral(&self, link: LinkId, f: impl FnOnce(&PeripheralShared)) {
        let peripheral = self.inner.lock().peripherals.get(&link).cloned();
        match peripheral {
            Some(peripheral) => f(&peripheral),
            None => warn!(%link, "event for unknown link dropped"),
        }
    }
}

fn outcome(error: Option<ProtocolError>, completion: Completion) -> Result<Completion> {
    match error {
        Some(error) => Err(error.into()),
        None => Ok(completion),
    }
}
