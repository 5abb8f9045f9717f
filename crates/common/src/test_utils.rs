//! Shared test fixtures usable from any crate in the workspace.

use protocol::{PciDeviceJson, UsbDeviceJson};
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a USB device fixture with sensible defaults, overriding vid/pid.
pub fn mock_usb_device(device_node: &str, vid: &str, pid: &str) -> UsbDeviceJson {
    UsbDeviceJson {
        device_node: device_node.to_string(),
        vid: vid.to_string(),
        pid: pid.to_string(),
        vendor_name: None,
        product_name: None,
        bus: 1,
        port: "1.1".to_string(),
        allowed_vms: Vec::new(),
        vm: None,
    }
}

/// Build a HID-class fixture (Logitech keyboard vid/pid), the common case
/// exercised by the "HID allow" scenario.
pub fn mock_hid_device(device_node: &str) -> UsbDeviceJson {
    mock_usb_device(device_node, "046d", "c52b")
}

/// Build a PCI device fixture with sensible defaults.
pub fn mock_pci_device(address: &str, vid: &str, did: &str) -> PciDeviceJson {
    PciDeviceJson {
        address: address.to_string(),
        vid: vid.to_string(),
        did: did.to_string(),
        description: None,
        allowed_vms: Vec::new(),
        vm: None,
    }
}

/// Wrap an async operation with a timeout so a hung test fails fast.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_hid_device_has_logitech_ids() {
        let device = mock_hid_device("/dev/bus/usb/001/004");
        assert_eq!(device.vid, "046d");
        assert_eq!(device.pid, "c52b");
    }

    #[tokio::test]
    async fn with_timeout_reports_timeout_error() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        assert!(result.is_err());
    }
}
