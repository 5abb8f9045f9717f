//! Event notification framing.
//!
//! Notifications are forwarded to a subscribed client as soon as the
//! Orchestrator publishes them — no batching window, no per-device dedup.
//! A client that cannot keep up with its `broadcast` receiver is
//! disconnected by its connection handler rather than being allowed to
//! fall behind the Orchestrator's commit order.

use protocol::Event;

/// Serialize one event as a newline-delimited JSON line ready to write to a
/// client socket.
pub fn encode_event(event: &Event) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_trailing_newline() {
        let event = Event::UsbConnected {
            device_node: "/dev/bus/usb/001/004".into(),
        };
        let line = encode_event(&event).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with(r#"{"event":"usb_connected""#));
    }

    #[test]
    fn select_vm_event_carries_allowed_vms() {
        let event = Event::UsbSelectVm {
            device_node: "/dev/bus/usb/001/005".into(),
            allowed_vms: vec!["vm1".into(), "vm2".into()],
        };
        let line = encode_event(&event).unwrap();
        assert!(line.contains(r#""allowed_vms":["vm1","vm2"]"#));
    }
}
