//! A simulated adapter backend for the `blelink` crate.
//!
//! [`Simulator`] implements the same capability surface a real adapter
//! does, against an in-memory device table. By default every command
//! is answered immediately on the issuing context; switch to manual
//! mode with [`set_auto_respond`](Simulator::set_auto_respond) to hold
//! commands and script completions one at a time, or inject arbitrary
//! events with [`emit`](Simulator::emit).
//!
//! Every issued command is recorded and can be inspected with
//! [`issued`](Simulator::issued), which is what the `blelink`
//! integration tests assert against.

mod device;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use blelink::{
    AdapterBackend, AdapterState, AdvertisementData, AttributeId, BackendEvent, Characteristic,
    Command, ConnectionState, Descriptor, EventSink, LinkId, ProtocolError, Service, WriteMode,
};

pub use device::{CharacteristicSpec, ConnectBehavior, DeviceSpec, ServiceSpec};

/// A scriptable in-memory adapter.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Mutex<SimInner>>,
}

impl Simulator {
    /// Creates a simulator with the adapter in the `Unknown` state and
    /// automatic responses enabled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                adapter_state: AdapterState::Unknown,
                sink: None,
                auto_respond: true,
                scanning: false,
                devices: Vec::new(),
                issued: Vec::new(),
                pending: VecDeque::new(),
                next_attribute: 0,
                next_link: 0,
            })),
        }
    }

    /// The backend handle to construct a session over.
    pub fn backend(&self) -> Arc<SimBackend> {
        Arc::new(SimBackend {
            inner: self.inner.clone(),
        })
    }

    /// Wires the session's event sink to this simulator.
    pub fn attach(&self, sink: EventSink) {
        self.inner.lock().sink = Some(sink);
    }

    /// Changes the adapter state and delivers the corresponding event.
    pub fn set_adapter_state(&self, state: AdapterState) {
        let sink = {
            let mut inner = self.inner.lock();
            inner.adapter_state = state;
            inner.sink.clone()
        };
        if let Some(sink) = sink {
            sink.deliver(BackendEvent::AdapterStateChanged(state));
        }
    }

    /// Shorthand for `set_adapter_state(AdapterState::PoweredOn)`.
    pub fn power_on(&self) {
        self.set_adapter_state(AdapterState::PoweredOn);
    }

    /// Registers a simulated device and returns its link identity.
    pub fn add_device(&self, spec: DeviceSpec) -> LinkId {
        self.inner.lock().add_device(spec)
    }

    /// Enables or disables automatic command responses. While
    /// disabled, issued commands are held until
    /// [`respond_next`](Self::respond_next).
    pub fn set_auto_respond(&self, enabled: bool) {
        self.inner.lock().auto_respond = enabled;
    }

    /// Answers the oldest held command, if any.
    pub fn respond_next(&self) -> bool {
        let command = self.inner.lock().pending.pop_front();
        match command {
            Some(command) => {
                respond(&self.inner, command);
                true
            }
            None => false,
        }
    }

    /// Answers every held command in order.
    pub fn respond_all(&self) {
        while self.respond_next() {}
    }

    /// Delivers a raw event, bypassing the device table.
    pub fn emit(&self, event: BackendEvent) {
        let sink = self.inner.lock().sink.clone();
        if let Some(sink) = sink {
            sink.deliver(event);
        }
    }

    /// Pushes a notification for a characteristic, updating its stored
    /// value.
    pub fn notify(&self, link: LinkId, characteristic: AttributeId, value: Vec<u8>) {
        {
            let mut inner = self.inner.lock();
            if let Some(device) = inner.devices.iter_mut().find(|device| device.link == link) {
                device.values.insert(characteristic, value.clone());
            }
        }
        self.emit(BackendEvent::CharacteristicUpdated {
            link,
            characteristic,
            value,
            error: None,
        });
    }

    /// The stored value of a characteristic, if the device exists.
    pub fn value(&self, link: LinkId, characteristic: AttributeId) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|device| device.link == link)
            .and_then(|device| device.values.get(&characteristic).cloned())
    }

    /// Whether the adapter believes a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scanning
    }

    /// Whether the adapter believes a link is connected.
    pub fn is_connected(&self, link: LinkId) -> bool {
        self.inner
            .lock()
            .devices
            .iter()
            .any(|device| device.link == link && device.connected)
    }

    /// Every command issued so far, in order.
    pub fn issued(&self) -> Vec<Command> {
        self.inner.lock().issued.clone()
    }

    /// Drains and returns the command log.
    pub fn take_issued(&self) -> Vec<Command> {
        std::mem::take(&mut self.inner.lock().issued)
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

/// The [`AdapterBackend`] handle of a [`Simulator`].
pub struct SimBackend {
    inner: Arc<Mutex<SimInner>>,
}

impl AdapterBackend for SimBackend {
    fn adapter_state(&self) -> AdapterState {
        self.inner.lock().adapter_state
    }

    fn issue(&self, command: Command) {
        debug!(?command, "command issued");
        let run = {
            let mut inner = self.inner.lock();
            inner.issued.push(command.clone());
            if inner.auto_respond {
                true
            } else {
                inner.pending.push_back(command.clone());
                false
            }
        };
        if run {
            respond(&self.inner, command);
        }
    }
}

/// Computes the response under the lock, delivers it outside of it.
/// Delivery can re-enter `issue` (the session dispatches the next FIFO
/// head), so no lock may be held here.
fn respond(inner: &Arc<Mutex<SimInner>>, command: Command) {
    let (sink, events) = {
        let mut guard = inner.lock();
        (guard.sink.clone(), guard.events_for(command))
    };
    if let Some(sink) = sink {
        for event in events {
            debug!(?event, "event delivered");
            sink.deliver(event);
        }
    }
}

struct SimInner {
    adapter_state: AdapterState,
    sink: Option<EventSink>,
    auto_respond: bool,
    scanning: bool,
    devices: Vec<Device>,
    issued: Vec<Command>,
    pending: VecDeque<Command>,
    next_attribute: u64,
    next_link: u128,
}

struct Device {
    link: LinkId,
    rssi: i16,
    connect: ConnectBehavior,
    advertisement: AdvertisementData,
    services: Vec<Service>,
    characteristics: Vec<Characteristic>,
    descriptors: Vec<Descriptor>,
    values: HashMap<AttributeId, Vec<u8>>,
    notifying: HashSet<AttributeId>,
    connected: bool,
}

impl SimInner {
    fn add_device(&mut self, spec: DeviceSpec) -> LinkId {
        self.next_link += 1;
        let link = LinkId::new(Uuid::from_u128(self.next_link));

        let mut services = Vec::new();
        let mut characteristics = Vec::new();
        let mut descriptors = Vec::new();
        let mut values = HashMap::new();

        for service_spec in &spec.services {
            let service_id = self.next_attribute_id();
            services.push(Service {
                id: service_id,
                uuid: service_spec.uuid.clone(),
                is_primary: service_spec.is_primary,
            });
            for characteristic_spec in &service_spec.characteristics {
                let characteristic_id = self.next_attribute_id();
                characteristics.push(Characteristic {
                    id: characteristic_id,
                    service: service_id,
                    uuid: characteristic_spec.uuid.clone(),
                    properties: characteristic_spec.properties,
                });
                values.insert(characteristic_id, characteristic_spec.value.clone());
                for descriptor_uuid in &characteristic_spec.descriptors {
                    descriptors.push(Descriptor {
                        id: self.next_attribute_id(),
                        characteristic: characteristic_id,
                        uuid: descriptor_uuid.clone(),
                    });
                }
            }
        }

        let advertisement = AdvertisementData {
            local_name: spec.name,
            manufacturer_data: spec.manufacturer_data,
            service_uuids: services.iter().map(|service| service.uuid.clone()).collect(),
            is_connectable: true,
            ..Default::default()
        };

        self.devices.push(Device {
            link,
            rssi: spec.rssi,
            connect: spec.connect,
            advertisement,
            services,
            characteristics,
            descriptors,
            values,
            notifying: HashSet::new(),
            connected: false,
        });
        link
    }

    fn next_attribute_id(&mut self) -> AttributeId {
        self.next_attribute += 1;
        AttributeId::new(self.next_attribute)
    }

    fn device_mut(&mut self, link: LinkId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|device| device.link == link)
    }

    fn events_for(&mut self, command: Command) -> Vec<BackendEvent> {
        match command {
            Command::Connect { link } => match self.device_mut(link) {
                Some(device) => {
                    let connecting = BackendEvent::LinkStateChanged {
                        link,
                        state: ConnectionState::Connecting,
                    };
                    match device.connect.clone() {
                        ConnectBehavior::Accept => {
                            device.connected = true;
                            vec![
                                connecting,
                                BackendEvent::LinkStateChanged {
                                    link,
                                    state: ConnectionState::Connected,
                                },
                            ]
                        }
                        ConnectBehavior::Refuse(error) => vec![
                            connecting,
                            BackendEvent::LinkStateChanged {
                                link,
                                state: ConnectionState::Disconnected {
                                    error: Some(error.into()),
                                },
                            },
                        ],
                        ConnectBehavior::Supersede => vec![
                            connecting,
                            BackendEvent::LinkStateChanged {
                                link,
                                state: ConnectionState::Disconnected { error: None },
                            },
                        ],
                    }
                }
                None => vec![BackendEvent::LinkStateChanged {
                    link,
                    state: ConnectionState::Disconnected {
                        error: Some(ProtocolError::new("unknown device").into()),
                    },
                }],
            },
            Command::Disconnect { link } => {
                if let Some(device) = self.device_mut(link) {
                    device.connected = false;
                }
                vec![
                    BackendEvent::LinkStateChanged {
                        link,
                        state: ConnectionState::Disconnecting,
                    },
                    BackendEvent::LinkStateChanged {
                        link,
                        state: ConnectionState::Disconnected { error: None },
                    },
                ]
            }
            Command::StartScan { services } => {
                self.scanning = true;
                self.devices
                    .iter()
                    .filter(|device| match &services {
                        Some(filter) => device
                            .advertisement
                            .service_uuids
                            .iter()
                            .any(|uuid| filter.contains(uuid)),
                        None => true,
                    })
                    .map(|device| BackendEvent::Discovered {
                        link: device.link,
                        advertisement: device.advertisement.clone(),
                        rssi: device.rssi,
                    })
                    .collect()
            }
            Command::StopScan => {
                self.scanning = false;
                Vec::new()
            }
            Command::DiscoverServices { link, services } => match self.device_mut(link) {
                Some(device) => {
                    let found = device
                        .services
                        .iter()
                        .filter(|service| match &services {
                            Some(filter) => filter.contains(&service.uuid),
                            None => true,
                        })
                        .cloned()
                        .collect();
                    vec![BackendEvent::ServicesDiscovered {
                        link,
                        services: found,
                        error: None,
                    }]
                }
                None => vec![BackendEvent::ServicesDiscovered {
                    link,
                    services: Vec::new(),
                    error: Some(ProtocolError::new("unknown device")),
                }],
            },
            Command::DiscoverCharacteristics {
                link,
                service,
                characteristics,
            } => match self.device_mut(link) {
                Some(device) => {
                    let found = device
                        .characteristics
                        .iter()
                        .filter(|characteristic| characteristic.service == service)
                        .filter(|characteristic| match &characteristics {
                            Some(filter) => filter.contains(&characteristic.uuid),
                            None => true,
                        })
                        .cloned()
                        .collect();
                    vec![BackendEvent::CharacteristicsDiscovered {
                        link,
                        service,
                        characteristics: found,
                        error: None,
                    }]
                }
                None => vec![BackendEvent::CharacteristicsDiscovered {
                    link,
                    service,
                    characteristics: Vec::new(),
                    error: Some(ProtocolError::new("unknown device")),
                }],
            },
            Command::DiscoverDescriptors {
                link,
                characteristic,
            } => match self.device_mut(link) {
                Some(device) => {
                    let found = device
                        .descriptors
                        .iter()
                        .filter(|descriptor| descriptor.characteristic == characteristic)
                        .cloned()
                        .collect();
                    vec![BackendEvent::DescriptorsDiscovered {
                        link,
                        characteristic,
                        descriptors: found,
                        error: None,
                    }]
                }
                None => vec![BackendEvent::DescriptorsDiscovered {
                    link,
                    characteristic,
                    descriptors: Vec::new(),
                    error: Some(ProtocolError::new("unknown device")),
                }],
            },
            Command::ReadCharacteristic {
                link,
                characteristic,
            } => {
                let value = self
                    .device_mut(link)
                    .and_then(|device| device.values.get(&characteristic).cloned())
                    .unwrap_or_default();
                vec![BackendEvent::CharacteristicUpdated {
                    link,
                    characteristic,
                    value,
                    error: None,
                }]
            }
            Command::WriteCharacteristic {
                link,
                characteristic,
                value,
                mode,
            } => {
                if let Some(device) = self.device_mut(link) {
                    device.values.insert(characteristic, value);
                }
                match mode {
                    WriteMode::WithResponse => vec![BackendEvent::CharacteristicWritten {
                        link,
                        characteristic,
                        error: None,
                    }],
                    WriteMode::WithoutResponse => Vec::new(),
                }
            }
            Command::SetNotify {
                link,
                characteristic,
                enabled,
            } => {
                if let Some(device) = self.device_mut(link) {
                    if enabled {
                        device.notifying.insert(characteristic);
                    } else {
                        device.notifying.remove(&characteristic);
                    }
                }
                vec![BackendEvent::NotificationStateChanged {
                    link,
                    characteristic,
                    enabled,
                    error: None,
                }]
            }
        }
    }
}
