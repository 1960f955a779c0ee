//! Request-scoped asynchronous operations over a callback-driven
//! Bluetooth adapter backend.
//!
//! The adapter protocol carries no request-correlation identifier:
//! each completion event can only be matched to the request that
//! caused it by arrival order. This crate serializes competing
//! requests per link and per operation kind, correlates each
//! completion to the oldest outstanding request, and exposes the
//! result as cancellable futures and streams, over one capability
//! surface ([`AdapterBackend`]) that real and simulated adapters
//! implement alike.
//!
//! [`CentralSession`] owns adapter-wide concerns (power state, the
//! scan lifecycle, connect/disconnect races); [`PeripheralSession`]
//! owns one device link and its GATT operations.
//!
//! See the `blelink-sim` crate for a simulated backend and a runnable
//! example.

pub mod advertisement_data;
mod backend;
mod central;
mod characteristic;
mod descriptor;
pub mod error;
mod id;
mod peripheral;
mod queue;
mod service;
mod util;

pub use advertisement_data::{AdvertisementData, ManufacturerData};
pub use backend::*;
pub use central::*;
pub use characteristic::*;
pub use descriptor::*;
pub use error::{Error, ErrorKind, ProtocolError, Result};
pub use id::*;
pub use peripheral::*;
pub use service::*;
pub use util::WatchStream;
