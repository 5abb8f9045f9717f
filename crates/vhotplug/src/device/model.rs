//! Normalized device records.
//!
//! Kernel device source normalizes raw udev attributes into these records
//! before anything else in the daemon ever sees a device. A record is never
//! mutated in place: a udev change event produces a fresh record that
//! replaces the old one in the cache.

use protocol::{DeviceKey, PciDeviceJson, UsbDeviceJson};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsbDevice {
    pub bus: u8,
    pub address: u8,
    pub vid: String,
    pub pid: String,
    pub vendor_name: Option<String>,
    pub product_name: Option<String>,
    pub port: String,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interfaces: Vec<Interface>,
}

impl UsbDevice {
    pub fn device_node(&self) -> String {
        format!("/dev/bus/usb/{:03}/{:03}", self.bus, self.address)
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::Usb {
            bus: self.bus,
            address: self.address,
        }
    }

    pub fn to_json(&self, allowed_vms: Vec<String>, vm: Option<String>) -> UsbDeviceJson {
        UsbDeviceJson {
            device_node: self.device_node(),
            vid: self.vid.clone(),
            pid: self.pid.clone(),
            vendor_name: self.vendor_name.clone(),
            product_name: self.product_name.clone(),
            bus: self.bus,
            port: self.port.clone(),
            allowed_vms,
            vm,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PciDevice {
    pub address: String,
    pub vid: String,
    pub did: String,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_prog_if: u8,
    pub description: Option<String>,
}

impl PciDevice {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::Pci {
            address: self.address.clone(),
        }
    }

    pub fn to_json(&self, allowed_vms: Vec<String>, vm: Option<String>) -> PciDeviceJson {
        PciDeviceJson {
            address: self.address.clone(),
            vid: self.vid.clone(),
            did: self.did.clone(),
            description: self.description.clone(),
            allowed_vms,
            vm,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvdevDevice {
    pub node: String,
    pub name: Option<String>,
    pub phys: Option<String>,
    pub unique: Option<String>,
}

impl EvdevDevice {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::Evdev {
            node: self.node.clone(),
        }
    }
}

/// The set of device selectors accepted by an API attach/detach command,
/// resolved against the cache below.
#[derive(Debug, Clone)]
pub enum UsbSelector {
    DeviceNode(String),
    BusPort(u8, String),
    VidPid(String, String),
}

#[derive(Debug, Clone)]
pub enum PciSelector {
    Address(String),
    VidDid(String, String),
}

impl From<&protocol::UsbSelector> for UsbSelector {
    fn from(value: &protocol::UsbSelector) -> Self {
        match value {
            protocol::UsbSelector::DeviceNode { device_node } => {
                UsbSelector::DeviceNode(device_node.clone())
            }
            protocol::UsbSelector::BusPort { bus, port } => UsbSelector::BusPort(*bus, port.clone()),
            protocol::UsbSelector::VidPid { vid, pid } => {
                UsbSelector::VidPid(vid.clone(), pid.clone())
            }
        }
    }
}

impl From<&protocol::PciSelector> for PciSelector {
    fn from(value: &protocol::PciSelector) -> Self {
        match value {
            protocol::PciSelector::Address { address } => PciSelector::Address(address.clone()),
            protocol::PciSelector::VidDid { vid, did } => {
                PciSelector::VidDid(vid.clone(), did.clone())
            }
        }
    }
}

/// Read-only-outside-the-orchestrator snapshot of currently present devices.
#[derive(Debug, Default)]
pub struct DeviceCache {
    usb: HashMap<DeviceKey, UsbDevice>,
    pci: HashMap<DeviceKey, PciDevice>,
    evdev: HashMap<DeviceKey, EvdevDevice>,
}

impl DeviceCache {
    pub fn upsert_usb(&mut self, device: UsbDevice) {
        self.usb.insert(device.key(), device);
    }

    pub fn remove_usb(&mut self, key: &DeviceKey) -> Option<UsbDevice> {
        self.usb.remove(key)
    }

    pub fn usb(&self, key: &DeviceKey) -> Option<&UsbDevice> {
        self.usb.get(key)
    }

    pub fn upsert_pci(&mut self, device: PciDevice) {
        self.pci.insert(device.key(), device);
    }

    pub fn remove_pci(&mut self, key: &DeviceKey) -> Option<PciDevice> {
        self.pci.remove(key)
    }

    pub fn pci(&self, key: &DeviceKey) -> Option<&PciDevice> {
        self.pci.get(key)
    }

    pub fn upsert_evdev(&mut self, device: EvdevDevice) {
        self.evdev.insert(device.key(), device);
    }

    pub fn remove_evdev(&mut self, key: &DeviceKey) -> Option<EvdevDevice> {
        self.evdev.remove(key)
    }

    pub fn list_usb(&self) -> impl Iterator<Item = &UsbDevice> {
        self.usb.values()
    }

    pub fn list_pci(&self) -> impl Iterator<Item = &PciDevice> {
        self.pci.values()
    }

    pub fn find_usb(&self, selector: &UsbSelector) -> Vec<&UsbDevice> {
        self.usb
            .values()
            .filter(|d| match selector {
                UsbSelector::DeviceNode(node) => &d.device_node() == node,
                UsbSelector::BusPort(bus, port) => d.bus == *bus && &d.port == port,
                UsbSelector::VidPid(vid, pid) => {
                    d.vid.eq_ignore_ascii_case(vid) && d.pid.eq_ignore_ascii_case(pid)
                }
            })
            .collect()
    }

    pub fn find_pci(&self, selector: &PciSelector) -> Vec<&PciDevice> {
        self.pci
            .values()
            .filter(|d| match selector {
                PciSelector::Address(address) => &d.address == address,
                PciSelector::VidDid(vid, did) => {
                    d.vid.eq_ignore_ascii_case(vid) && d.did.eq_ignore_ascii_case(did)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mouse() -> UsbDevice {
        UsbDevice {
            bus: 1,
            address: 4,
            vid: "046d".into(),
            pid: "c077".into(),
            vendor_name: Some("Logitech".into()),
            product_name: None,
            port: "2.4".into(),
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            interfaces: vec![Interface {
                class: 3,
                subclass: 1,
                protocol: 2,
            }],
        }
    }

    #[test]
    fn upsert_and_find_by_vid_pid() {
        let mut cache = DeviceCache::default();
        cache.upsert_usb(mouse());
        let found = cache.find_usb(&UsbSelector::VidPid("046D".into(), "C077".into()));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn find_by_device_node() {
        let mut cache = DeviceCache::default();
        cache.upsert_usb(mouse());
        let found = cache.find_usb(&UsbSelector::DeviceNode("/dev/bus/usb/001/004".into()));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn change_replaces_record() {
        let mut cache = DeviceCache::default();
        cache.upsert_usb(mouse());
        let mut changed = mouse();
        changed.product_name = Some("Wireless Mouse".into());
        cache.upsert_usb(changed);
        assert_eq!(cache.list_usb().count(), 1);
        assert_eq!(
            cache.usb(&mouse().key()).unwrap().product_name.as_deref(),
            Some("Wireless Mouse")
        );
    }
}
