//! Notification events pushed to subscribed API clients.

use serde::{Deserialize, Serialize};

/// Asynchronous notifications emitted in Orchestrator commit order.
///
/// Serialized as `{"event": <variant>, ...fields}` on a client's connection
/// once it has sent `enable_notifications`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A USB device was plugged in and matched against the rule set.
    UsbConnected { device_node: String },
    /// A previously seen USB device was unplugged.
    UsbDisconnected { device_node: String },
    /// A USB device was attached to a VM, by rule or by API request.
    UsbAttached { device_node: String, vm: String },
    /// A USB device was detached from a VM.
    UsbDetached { device_node: String, vm: String },
    /// A connected USB device matched more than one rule's candidate VM set
    /// and requires an explicit `usb_attach` to disambiguate.
    UsbSelectVm {
        device_node: String,
        allowed_vms: Vec<String>,
    },
    /// A PCI device was attached to a VM.
    PciAttached { address: String, vm: String },
    /// A PCI device was detached from a VM.
    PciDetached { address: String, vm: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_attached_serializes_with_event_tag() {
        let event = Event::UsbAttached {
            device_node: "/dev/bus/usb/001/004".into(),
            vm: "vm1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "usb_attached");
        assert_eq!(json["vm"], "vm1");
    }

    #[test]
    fn usb_select_vm_round_trips() {
        let event = Event::UsbSelectVm {
            device_node: "/dev/bus/usb/001/005".into(),
            allowed_vms: vec!["vm1".into(), "vm2".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
