use btuuid::BluetoothUuid;

use crate::id::AttributeId;

/// A GATT descriptor discovered on a peripheral.
///
/// A descriptor belongs to exactly one characteristic; the owning
/// characteristic is recorded by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Backend-assigned identity of this descriptor instance.
    pub id: AttributeId,
    /// Identity of the characteristic this descriptor belongs to.
    pub characteristic: AttributeId,
    /// The GATT UUID of the descriptor.
    pub uuid: BluetoothUuid,
}
