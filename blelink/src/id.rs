use std::fmt;

use uuid::Uuid;

/// Opaque, stable identifier for one peripheral link.
///
/// Assigned by the backend when a peripheral is first discovered and
/// stable for the lifetime of that peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(Uuid);

impl LinkId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for LinkId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque, stable identifier for a discovered attribute.
///
/// Two characteristics may share a GATT UUID under different services;
/// the backend assigns each discovered attribute its own identity, and
/// completion events are matched against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeId(u64);

impl AttributeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
