//! API request envelopes and device selectors.

use serde::{Deserialize, Serialize};

/// A request line sent by an API client, tagged on the `action` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Subscribe this connection to `Event` notifications.
    EnableNotifications,
    /// List all known USB devices and their current attachment state.
    UsbList,
    /// Attach a USB device to a VM, overriding or disambiguating the rule set.
    UsbAttach {
        #[serde(flatten)]
        selector: UsbSelector,
        vm: String,
    },
    /// Detach a USB device from whichever VM it is currently attached to.
    UsbDetach {
        #[serde(flatten)]
        selector: UsbSelector,
    },
    /// List all known PCI devices and their current attachment state.
    PciList,
    /// Attach a PCI device to a VM.
    PciAttach {
        #[serde(flatten)]
        selector: PciSelector,
        vm: String,
    },
    /// Detach a PCI device from whichever VM it is currently attached to.
    PciDetach {
        #[serde(flatten)]
        selector: PciSelector,
    },
}

/// Exactly one way of naming a USB device in a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UsbSelector {
    DeviceNode { device_node: String },
    BusPort { bus: u8, port: String },
    VidPid { vid: String, pid: String },
}

/// Exactly one way of naming a PCI device in a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PciSelector {
    Address { address: String },
    VidDid { vid: String, did: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_attach_parses_device_node_selector() {
        let json = r#"{"action":"usb_attach","device_node":"/dev/bus/usb/001/004","vm":"vm1"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::UsbAttach { selector, vm } => {
                assert_eq!(vm, "vm1");
                assert_eq!(
                    selector,
                    UsbSelector::DeviceNode {
                        device_node: "/dev/bus/usb/001/004".into()
                    }
                );
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn usb_detach_parses_vid_pid_selector() {
        let json = r#"{"action":"usb_detach","vid":"046d","pid":"c077"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::UsbDetach {
                selector: UsbSelector::VidPid {
                    vid: "046d".into(),
                    pid: "c077".into()
                }
            }
        );
    }

    #[test]
    fn pci_attach_parses_address_selector() {
        let json = r#"{"action":"pci_attach","address":"0000:01:00.0","vm":"vm2"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::PciAttach { selector, vm } => {
                assert_eq!(vm, "vm2");
                assert_eq!(
                    selector,
                    PciSelector::Address {
                        address: "0000:01:00.0".into()
                    }
                );
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn bare_actions_parse_without_extra_fields() {
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"action":"usb_list"}"#).unwrap(),
            Request::UsbList
        );
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"action":"enable_notifications"}"#).unwrap(),
            Request::EnableNotifications
        );
    }
}
