use btuuid::BluetoothUuid;

use crate::id::AttributeId;

/// A GATT service discovered on a peripheral.
///
/// Produced by [`PeripheralSession::discover_services`] and immutable
/// thereafter.
///
/// [`PeripheralSession::discover_services`]: crate::PeripheralSession::discover_services
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    /// Backend-assigned identity of this service instance.
    pub id: AttributeId,
    /// The GATT UUID of the service.
    pub uuid: BluetoothUuid,
    /// Whether this is a primary service.
    pub is_primary: bool,
}
