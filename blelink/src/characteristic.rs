use btuuid::BluetoothUuid;

use crate::id::AttributeId;

/// A GATT characteristic discovered on a peripheral.
///
/// A characteristic belongs to exactly one service; the owning service
/// is recorded by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Characteristic {
    /// Backend-assigned identity of this characteristic instance.
    pub id: AttributeId,
    /// Identity of the service this characteristic belongs to.
    pub service: AttributeId,
    /// The GATT UUID of the characteristic.
    pub uuid: BluetoothUuid,
    /// The operations the characteristic supports.
    pub properties: CharacteristicProperties,
}

/// The operations a characteristic supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}
