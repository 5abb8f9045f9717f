pub mod model;
pub mod source;
pub mod usbdb;

pub use model::{DeviceCache, EvdevDevice, Interface, PciDevice, PciSelector, UsbDevice, UsbSelector};
pub use source::{DeviceEvent, KernelDeviceSource, SourceError};
pub use usbdb::UsbIdDb;
