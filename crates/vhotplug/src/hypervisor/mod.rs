//! Hypervisor adapters: qemu (via QMP) and crosvm (via its control socket)
//! are two variants of the same capability set. Neither adapter keeps a
//! connection open across idle periods; each reconnects lazily on the next
//! command and backs off exponentially while the VM is unreachable.

pub mod crosvm;
pub mod ids;
pub mod qmp;
pub mod worker;

use crate::config::VmKind;
use crate::device::model::{EvdevDevice, PciDevice, UsbDevice};
use protocol::DeviceKey;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use worker::{AdapterHandle, spawn_adapter_worker};

pub const MIN_BACKOFF: Duration = Duration::from_millis(250);
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("vm unreachable: {0}")]
    VmUnreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation unsupported by this hypervisor")]
    Unsupported,
    #[error("adapter command timed out")]
    Timeout,
    #[error("device id already exists on this hypervisor")]
    DeviceBusy,
}

/// How a USB attach command names the device to QMP/crosvm: by its stable
/// hostbus/hostaddr pair, or by the host port path an operator selected with
/// a `bus_port` selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbAttachMode {
    BusAddress,
    Port,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Disconnected,
    Ready,
    Closed,
}

/// A connection to one VM's control channel. `Qmp` and `Crosvm` are
/// capability-set variants: both support USB, only QMP supports PCI and
/// evdev passthrough.
pub enum Adapter {
    Qmp(qmp::QmpAdapter),
    Crosvm(crosvm::CrosvmAdapter),
}

impl Adapter {
    pub fn new(kind: VmKind, socket: PathBuf) -> Self {
        match kind {
            VmKind::Qemu => Adapter::Qmp(qmp::QmpAdapter::new(socket)),
            VmKind::Crosvm => Adapter::Crosvm(crosvm::CrosvmAdapter::new(socket)),
        }
    }

    pub async fn connect(&mut self) -> Result<(), AdapterError> {
        match self {
            Adapter::Qmp(a) => a.connect().await,
            Adapter::Crosvm(a) => a.connect().await,
        }
    }

    pub async fn attach_usb(
        &mut self,
        device: &UsbDevice,
        mode: UsbAttachMode,
    ) -> Result<(), AdapterError> {
        match self {
            Adapter::Qmp(a) => a.attach_usb(device, mode).await,
            Adapter::Crosvm(a) => a.attach_usb(device, mode).await,
        }
    }

    pub async fn detach_usb(&mut self, key: &DeviceKey) -> Result<(), AdapterError> {
        match self {
            Adapter::Qmp(a) => a.detach_usb(key).await,
            Adapter::Crosvm(a) => a.detach_usb(key).await,
        }
    }

    pub async fn attach_pci(&mut self, device: &PciDevice) -> Result<(), AdapterError> {
        match self {
            Adapter::Qmp(a) => a.attach_pci(device).await,
            Adapter::Crosvm(a) => a.attach_pci(device).await,
        }
    }

    pub async fn detach_pci(&mut self, key: &DeviceKey) -> Result<(), AdapterError> {
        match self {
            Adapter::Qmp(a) => a.detach_pci(key).await,
            Adapter::Crosvm(a) => a.detach_pci(key).await,
        }
    }

    pub async fn attach_evdev(
        &mut self,
        device: &EvdevDevice,
        bus: &str,
    ) -> Result<(), AdapterError> {
        match self {
            Adapter::Qmp(a) => a.attach_evdev(device, bus).await,
            Adapter::Crosvm(a) => a.attach_evdev(device, bus).await,
        }
    }
}
