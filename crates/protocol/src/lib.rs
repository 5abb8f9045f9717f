//! Wire protocol for the vhotplug control-plane API.
//!
//! Defines the newline-delimited JSON request/response/event payloads
//! exchanged between `vhotplug` and API clients, and the stable error
//! kinds that cross the wire as the `error` field of a failed response.

pub mod error;
pub mod events;
pub mod requests;
pub mod types;
pub mod version;

pub use error::{ApiError, ErrorCode};
pub use events::Event;
pub use requests::{PciSelector, Request, UsbSelector};
pub use types::{DeviceKey, PciDeviceJson, UsbDeviceJson};
pub use version::API_VERSION;
