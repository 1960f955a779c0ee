use btuuid::BluetoothUuid;

use blelink::{CharacteristicProperties, ManufacturerData, ProtocolError};

/// How a simulated device answers a connect command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Report `Connecting` then `Connected`.
    Accept,
    /// Report `Connecting`, then a disconnect carrying this error.
    Refuse(ProtocolError),
    /// Report `Connecting`, then a disconnect carrying no error: the
    /// benign-disconnect race a connect attempt resolves as a clean
    /// no-op.
    Supersede,
}

/// Description of a simulated peripheral.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub(crate) name: Option<String>,
    pub(crate) rssi: i16,
    pub(crate) connect: ConnectBehavior,
    pub(crate) manufacturer_data: Option<ManufacturerData>,
    pub(crate) services: Vec<ServiceSpec>,
}

impl DeviceSpec {
    pub fn new() -> Self {
        Self {
            name: None,
            rssi: -50,
            connect: ConnectBehavior::Accept,
            manufacturer_data: None,
            services: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn connect_behavior(mut self, behavior: ConnectBehavior) -> Self {
        self.connect = behavior;
        self
    }

    pub fn manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data = Some(ManufacturerData { company_id, data });
        self
    }

    pub fn service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// Description of a simulated GATT service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub(crate) uuid: BluetoothUuid,
    pub(crate) is_primary: bool,
    pub(crate) characteristics: Vec<CharacteristicSpec>,
}

impl ServiceSpec {
    pub fn new(uuid: BluetoothUuid) -> Self {
        Self {
            uuid,
            is_primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.is_primary = false;
        self
    }

    pub fn characteristic(mut self, characteristic: CharacteristicSpec) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// Description of a simulated GATT characteristic.
#[derive(Debug, Clone)]
pub struct CharacteristicSpec {
    pub(crate) uuid: BluetoothUuid,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) value: Vec<u8>,
    pub(crate) descriptors: Vec<BluetoothUuid>,
}

impl CharacteristicSpec {
    pub fn new(uuid: BluetoothUuid) -> Self {
        Self {
            uuid,
            properties: CharacteristicProperties {
                read: true,
                ..Default::default()
            },
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn properties(mut self, properties: CharacteristicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn writable(mut self) -> Self {
        self.properties.write = true;
        self
    }

    pub fn notifying(mut self) -> Self {
        self.properties.notify = true;
        self
    }

    pub fn descriptor(mut self, uuid: BluetoothUuid) -> Self {
        self.descriptors.push(uuid);
        self
    }
}
