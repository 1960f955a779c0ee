//! The adapter backend capability surface.
//!
//! A backend is the concrete adapter a session drives: real hardware
//! or a simulation. Both variants implement [`AdapterBackend`] and are
//! indistinguishable to the session layer; the concrete variant is
//! chosen once at session construction and never switched afterward.
//!
//! The command protocol carries no correlation token. Commands are
//! parameterized only by identifiers, and completions come back as
//! [`BackendEvent`]s delivered through the session's
//! [`EventSink`](crate::EventSink) in the order the backend finished
//! them.

use btuuid::BluetoothUuid;

use crate::advertisement_data::AdvertisementData;
use crate::characteristic::Characteristic;
use crate::descriptor::Descriptor;
use crate::error::{Error, ProtocolError};
use crate::id::{AttributeId, LinkId};
use crate::service::Service;

/// Power state of the local adapter.
///
/// `PoweredOn` is the only state in which commands are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Whether the adapter has settled into a definite state.
    ///
    /// `Unknown` and `Resetting` are transient; readiness checks
    /// suspend until the adapter leaves them.
    pub fn is_determined(&self) -> bool {
        !matches!(self, AdapterState::Unknown | AdapterState::Resetting)
    }
}

/// Connection state of one peripheral link.
///
/// Terminal transitions carry the error reported by the backend, if
/// any. Transitions are driven exclusively by backend-delivered
/// events, never predicted locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { error: Option<Error> },
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected { error: None }
    }
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// The peripheral acknowledges the write; an
    /// [`BackendEvent::CharacteristicWritten`] event follows.
    WithResponse,
    /// Fire and forget; the protocol offers no acknowledgement.
    WithoutResponse,
}

/// A command issued to the adapter backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        link: LinkId,
    },
    Disconnect {
        link: LinkId,
    },
    StartScan {
        services: Option<Vec<BluetoothUuid>>,
    },
    StopScan,
    DiscoverServices {
        link: LinkId,
        services: Option<Vec<BluetoothUuid>>,
    },
    DiscoverCharacteristics {
        link: LinkId,
        service: AttributeId,
        characteristics: Option<Vec<BluetoothUuid>>,
    },
    DiscoverDescriptors {
        link: LinkId,
        characteristic: AttributeId,
    },
    ReadCharacteristic {
        link: LinkId,
        characteristic: AttributeId,
    },
    WriteCharacteristic {
        link: LinkId,
        characteristic: AttributeId,
        value: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        link: LinkId,
        characteristic: AttributeId,
        enabled: bool,
    },
}

/// An event delivered by the adapter backend.
///
/// Discovery events carry the discovered collections; attribute events
/// carry the subject identity and the backend-reported error, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    AdapterStateChanged(AdapterState),
    Discovered {
        link: LinkId,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    LinkStateChanged {
        link: LinkId,
        state: ConnectionState,
    },
    ServicesDiscovered {
        link: LinkId,
        services: Vec<Service>,
        error: Option<ProtocolError>,
    },
    CharacteristicsDiscovered {
        link: LinkId,
        service: AttributeId,
        characteristics: Vec<Characteristic>,
        error: Option<ProtocolError>,
    },
    DescriptorsDiscovered {
        link: LinkId,
        characteristic: AttributeId,
        descriptors: Vec<Descriptor>,
        error: Option<ProtocolError>,
    },
    CharacteristicUpdated {
        link: LinkId,
        characteristic: AttributeId,
        value: Vec<u8>,
        error: Option<ProtocolError>,
    },
    CharacteristicWritten {
        link: LinkId,
        characteristic: AttributeId,
        error: Option<ProtocolError>,
    },
    NotificationStateChanged {
        link: LinkId,
        characteristic: AttributeId,
        enabled: bool,
        error: Option<ProtocolError>,
    },
}

/// Capability surface shared by real and simulated adapters.
///
/// Sessions are written against this interface alone. Events flow the
/// other way: the backend's driver delivers them into the session's
/// [`EventSink`](crate::EventSink), serialized on one logical context.
pub trait AdapterBackend: Send + Sync + 'static {
    /// The current power state of the adapter.
    fn adapter_state(&self) -> AdapterState;

    /// Issues a command to the adapter.
    ///
    /// Commands are not acknowledged here; completions and unsolicited
    /// events come back through the event sink.
    fn issue(&self, command: Command);
}
