//! USB vendor/product name lookups.
//!
//! The `usb-ids` crate compiles the whole `usb.ids` database into the
//! binary, so there is nothing to load at startup; resolving the Open
//! Question about per-event blocking lookups, the database is simply
//! always resident and lookups are in-memory hash lookups.

use usb_ids::FromId;

pub struct UsbIdDb;

impl UsbIdDb {
    pub fn new() -> Self {
        Self
    }

    /// Resolve vendor and product names from lowercase hex vid/pid strings.
    pub fn lookup(&self, vid: &str, pid: &str) -> (Option<String>, Option<String>) {
        let (Some(vid), Some(pid)) = (
            u16::from_str_radix(vid, 16).ok(),
            u16::from_str_radix(pid, 16).ok(),
        ) else {
            return (None, None);
        };

        if let Some(device) = usb_ids::Device::from_vid_pid(vid, pid) {
            (Some(device.vendor().name().to_string()), Some(device.name().to_string()))
        } else if let Some(vendor) = usb_ids::Vendor::from_id(vid) {
            (Some(vendor.name().to_string()), None)
        } else {
            (None, None)
        }
    }
}

impl Default for UsbIdDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logitech_vendor_resolves() {
        let db = UsbIdDb::new();
        let (vendor, _product) = db.lookup("046d", "c077");
        assert_eq!(vendor.as_deref(), Some("Logitech, Inc."));
    }

    #[test]
    fn unknown_ids_resolve_to_none() {
        let db = UsbIdDb::new();
        let (vendor, product) = db.lookup("ffff", "ffff");
        assert!(vendor.is_none() || product.is_none());
    }

    #[test]
    fn malformed_hex_resolves_to_none() {
        let db = UsbIdDb::new();
        assert_eq!(db.lookup("zzzz", "c077"), (None, None));
    }
}
