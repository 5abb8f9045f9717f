//! Device and registry key types shared by requests, events and responses.

use serde::{Deserialize, Serialize};

/// The tuple that uniquely names a device in the Attachment Registry.
///
/// `Usb` carries `(bus, address)`, `Pci` the `DDDD:BB:DD.F` address string,
/// `Evdev` the `/dev/input/eventN` node path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Usb { bus: u8, address: u8 },
    Pci { address: String },
    Evdev { node: String },
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKey::Usb { bus, address } => write!(f, "usb:{bus:03}:{address:03}"),
            DeviceKey::Pci { address } => write!(f, "pci:{address}"),
            DeviceKey::Evdev { node } => write!(f, "evdev:{node}"),
        }
    }
}

/// `UsbDeviceJson` as emitted in `usb_list` responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsbDeviceJson {
    pub device_node: String,
    pub vid: String,
    pub pid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    pub bus: u8,
    pub port: String,
    pub allowed_vms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

/// `PciDeviceJson` as emitted in `pci_list` responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PciDeviceJson {
    pub address: String,
    pub vid: String,
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub allowed_vms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_display() {
        assert_eq!(
            DeviceKey::Usb { bus: 1, address: 4 }.to_string(),
            "usb:001:004"
        );
        assert_eq!(
            DeviceKey::Pci {
                address: "0000:00:02.0".into()
            }
            .to_string(),
            "pci:0000:00:02.0"
        );
        assert_eq!(
            DeviceKey::Evdev {
                node: "/dev/input/event3".into()
            }
            .to_string(),
            "evdev:/dev/input/event3"
        );
    }

    #[test]
    fn usb_device_json_round_trips() {
        let device = UsbDeviceJson {
            device_node: "/dev/bus/usb/001/004".into(),
            vid: "046d".into(),
            pid: "c077".into(),
            vendor_name: Some("Logitech".into()),
            product_name: None,
            bus: 1,
            port: "2.4".into(),
            allowed_vms: vec!["vm1".into()],
            vm: None,
        };
        let json = serde_json::to_string(&device).unwrap();
        let parsed: UsbDeviceJson = serde_json::from_str(&json).unwrap();
        assert_eq!(device, parsed);
    }

    #[test]
    fn pci_device_json_round_trips() {
        let device = PciDeviceJson {
            address: "0000:01:00.0".into(),
            vid: "10de".into(),
            did: "1eb8".into(),
            description: None,
            allowed_vms: vec![],
            vm: Some("vm2".into()),
        };
        let json = serde_json::to_string(&device).unwrap();
        let parsed: PciDeviceJson = serde_json::from_str(&json).unwrap();
        assert_eq!(device, parsed);
    }
}
