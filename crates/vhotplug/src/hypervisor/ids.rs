//! Deterministic QMP/crosvm device ids, stable across reconnects so a retried
//! `device_add` after a dropped connection targets the same id a later
//! `device_del` will use.

pub fn usb_id(bus: u8, address: u8) -> String {
    format!("vhp-usb-{bus}-{address}")
}

pub fn pci_id(address: &str) -> String {
    format!("vhp-pci-{}", address.replace(':', "-"))
}

/// The PCI slot QEMU should place `virtio-input-host-pci` into, derived from
/// the evdev node's event number so it's stable across reconnects without any
/// per-VM counter state: `/dev/input/event3` on prefix `pcie.0` -> `pcie.0.3`.
pub fn evdev_bus(prefix: &str, node: &str) -> String {
    let n = node.rsplit("event").next().unwrap_or_default();
    format!("{prefix}.{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_id_format() {
        assert_eq!(usb_id(1, 4), "vhp-usb-1-4");
    }

    #[test]
    fn pci_id_replaces_colons() {
        assert_eq!(pci_id("0000:01:00.0"), "vhp-pci-0000-01-00.0");
    }

    #[test]
    fn evdev_bus_derives_slot_from_event_number() {
        assert_eq!(evdev_bus("pcie.0", "/dev/input/event3"), "pcie.0.3");
    }
}
