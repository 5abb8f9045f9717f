//! Kernel device source.
//!
//! Runs on a dedicated OS thread, draining a udev netlink monitor socket and
//! normalizing each event before it ever reaches the async side of the
//! daemon. Normalization happens here, not after crossing the mailbox
//! boundary, so nothing downstream needs to touch libudev handles.

use crate::device::model::{EvdevDevice, Interface, PciDevice, UsbDevice};
use crate::device::usbdb::UsbIdDb;
use common::MailboxTx;
use protocol::DeviceKey;
use thiserror::Error;
use tracing::warn;
use udev::{Enumerator, EventType, MonitorBuilder};

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    UsbAdded(UsbDevice),
    UsbRemoved(DeviceKey),
    PciAdded(PciDevice),
    PciRemoved(DeviceKey),
    EvdevAdded(EvdevDevice),
    EvdevRemoved(DeviceKey),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to set up udev monitor: {0}")]
    Setup(#[source] std::io::Error),
    #[error("udev monitor socket closed unexpectedly")]
    SourceLost,
}

fn hex_attr(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .and_then(|v| v.to_str())
        .map(|s| s.trim_start_matches("0x").to_lowercase())
}

fn u8_attr(device: &udev::Device, name: &str) -> Option<u8> {
    hex_attr(device, name).and_then(|s| u8::from_str_radix(&s, 16).ok())
}

fn str_attr(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .and_then(|v| v.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub struct KernelDeviceSource {
    socket: udev::MonitorSocket,
    usbdb: UsbIdDb,
}

impl KernelDeviceSource {
    pub fn new() -> Result<Self, SourceError> {
        let socket = MonitorBuilder::new()
            .map_err(SourceError::Setup)?
            .match_subsystem("usb")
            .map_err(SourceError::Setup)?
            .match_subsystem("pci")
            .map_err(SourceError::Setup)?
            .match_subsystem("input")
            .map_err(SourceError::Setup)?
            .listen()
            .map_err(SourceError::Setup)?;
        Ok(Self {
            socket,
            usbdb: UsbIdDb::new(),
        })
    }

    /// Enumerate already-connected devices, used by `--attach-connected`.
    pub fn enumerate_connected(&self) -> Result<Vec<DeviceEvent>, SourceError> {
        let mut events = Vec::new();
        for subsystem in ["usb", "pci", "input"] {
            let mut enumerator = Enumerator::new().map_err(SourceError::Setup)?;
            enumerator.match_subsystem(subsystem).map_err(SourceError::Setup)?;
            let devices = enumerator.scan_devices().map_err(SourceError::Setup)?;
            for device in devices {
                if let Some(event) = self.normalize_add(&device) {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    /// Drain the monitor socket until it closes or errors. Blocks the
    /// calling thread; intended to be run on its own `std::thread`.
    pub fn run_blocking(mut self, events: MailboxTx<DeviceEvent>) -> Result<(), SourceError> {
        loop {
            let event = self.socket.iter().next().ok_or(SourceError::SourceLost)?;
            let normalized = match event.event_type() {
                EventType::Add | EventType::Change => self.normalize_add(&event),
                EventType::Remove => self.normalize_remove(&event),
                _ => None,
            };
            let Some(normalized) = normalized else {
                continue;
            };
            if events.send_blocking(normalized).is_err() {
                warn!("orchestrator mailbox closed, stopping kernel device source");
                return Ok(());
            }
        }
    }

    fn normalize_add(&self, device: &udev::Device) -> Option<DeviceEvent> {
        match device.subsystem()?.to_str()? {
            "usb" => self.normalize_usb(device).map(DeviceEvent::UsbAdded),
            "pci" => Self::normalize_pci(device).map(DeviceEvent::PciAdded),
            "input" => Self::normalize_evdev(device).map(DeviceEvent::EvdevAdded),
            _ => None,
        }
    }

    fn normalize_remove(&self, device: &udev::Device) -> Option<DeviceEvent> {
        match device.subsystem()?.to_str()? {
            "usb" => Self::usb_key(device).map(DeviceEvent::UsbRemoved),
            "pci" => Self::pci_key(device).map(DeviceEvent::PciRemoved),
            "input" => Self::evdev_key(device).map(DeviceEvent::EvdevRemoved),
            _ => None,
        }
    }

    fn normalize_usb(&self, device: &udev::Device) -> Option<UsbDevice> {
        if device.devtype().and_then(|s| s.to_str()) != Some("usb_device") {
            return None;
        }
        let bus: u8 = device.attribute_value("busnum")?.to_str()?.parse().ok()?;
        let address: u8 = device.attribute_value("devnum")?.to_str()?.parse().ok()?;
        let vid = hex_attr(device, "idVendor")?;
        let pid = hex_attr(device, "idProduct")?;
        let device_class = u8_attr(device, "bDeviceClass").unwrap_or(0);
        let device_subclass = u8_attr(device, "bDeviceSubClass").unwrap_or(0);
        let device_protocol = u8_attr(device, "bDeviceProtocol").unwrap_or(0);
        let port = device
            .sysname()
            .to_str()
            .and_then(|s| s.split_once('-'))
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        let (vendor_name, product_name) = self.usbdb.lookup(&vid, &pid);
        let interfaces = Self::usb_interfaces(device).unwrap_or_default();

        Some(UsbDevice {
            bus,
            address,
            vid,
            pid,
            vendor_name,
            product_name,
            port,
            device_class,
            device_subclass,
            device_protocol,
            interfaces,
        })
    }

    fn usb_interfaces(device: &udev::Device) -> Option<Vec<Interface>> {
        let mut enumerator = Enumerator::new().ok()?;
        enumerator.match_parent(device).ok()?;
        enumerator.match_subsystem("usb").ok()?;
        let children = enumerator.scan_devices().ok()?;
        let mut interfaces = Vec::new();
        for child in children {
            if child.devtype().and_then(|s| s.to_str()) != Some("usb_interface") {
                continue;
            }
            if let (Some(class), Some(subclass), Some(protocol)) = (
                u8_attr(&child, "bInterfaceClass"),
                u8_attr(&child, "bInterfaceSubClass"),
                u8_attr(&child, "bInterfaceProtocol"),
            ) {
                interfaces.push(Interface {
                    class,
                    subclass,
                    protocol,
                });
            }
        }
        Some(interfaces)
    }

    fn normalize_pci(device: &udev::Device) -> Option<PciDevice> {
        let address = device.sysname().to_str()?.to_string();
        let vid = hex_attr(device, "vendor")?;
        let did = hex_attr(device, "device")?;
        let class_bytes = u32::from_str_radix(&hex_attr(device, "class")?, 16).ok()?;
        let device_class = ((class_bytes >> 16) & 0xff) as u8;
        let device_subclass = ((class_bytes >> 8) & 0xff) as u8;
        let device_prog_if = (class_bytes & 0xff) as u8;
        let description = device
            .property_value("ID_MODEL_FROM_DATABASE")
            .and_then(|v| v.to_str())
            .map(|s| s.trim_matches('"').to_string());

        Some(PciDevice {
            address,
            vid,
            did,
            device_class,
            device_subclass,
            device_prog_if,
            description,
        })
    }

    fn normalize_evdev(device: &udev::Device) -> Option<EvdevDevice> {
        let node = device.devnode()?.to_str()?.to_string();
        if !node.contains("/event") {
            return None;
        }
        let parent = device.parent();
        let name = parent
            .as_ref()
            .and_then(|parent| parent.property_value("NAME").map(|v| v.to_string_lossy().trim_matches('"').to_string()));
        let phys = str_attr(device, "phys").or_else(|| parent.as_ref().and_then(|p| str_attr(p, "phys")));
        let unique = str_attr(device, "uniq").or_else(|| parent.as_ref().and_then(|p| str_attr(p, "uniq")));
        Some(EvdevDevice { node, name, phys, unique })
    }

    fn usb_key(device: &udev::Device) -> Option<DeviceKey> {
        let bus: u8 = device
            .attribute_value("busnum")
            .or_else(|| device.property_value("BUSNUM"))
            .and_then(|v| v.to_str())?
            .parse()
            .ok()?;
        let address: u8 = device
            .attribute_value("devnum")
            .or_else(|| device.property_value("DEVNUM"))
            .and_then(|v| v.to_str())?
            .parse()
            .ok()?;
        Some(DeviceKey::Usb { bus, address })
    }

    fn pci_key(device: &udev::Device) -> Option<DeviceKey> {
        Some(DeviceKey::Pci {
            address: device.sysname().to_str()?.to_string(),
        })
    }

    fn evdev_key(device: &udev::Device) -> Option<DeviceKey> {
        let node = device
            .devnode()
            .and_then(|p| p.to_str())
            .map(|s| s.to_string())
            .or_else(|| device.property_value("DEVNAME").map(|v| v.to_string_lossy().to_string()))?;
        if !node.contains("/event") {
            return None;
        }
        Some(DeviceKey::Evdev { node })
    }
}

/// Spawn the kernel device source on its own thread.
pub fn spawn(events: MailboxTx<DeviceEvent>) -> std::thread::JoinHandle<Result<(), SourceError>> {
    std::thread::Builder::new()
        .name("kernel-device-source".to_string())
        .spawn(move || {
            let source = KernelDeviceSource::new()?;
            source.run_blocking(events)
        })
        .expect("failed to spawn kernel device source thread")
}
