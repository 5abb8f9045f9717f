//! Attachment Registry: the single source of truth for which VM owns which
//! device. Enforces the one-owner-per-device invariant; the orchestrator is
//! the only caller, so all mutation is already serialized.

use protocol::DeviceKey;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub device_key: DeviceKey,
    pub vm_name: String,
    pub attached_at: Instant,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device already attached to {vm_name}")]
    AlreadyAttached { vm_name: String },
    #[error("device not attached")]
    NotAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Usb,
    Pci,
    Evdev,
}

fn kind_of(device_key: &DeviceKey) -> DeviceKind {
    match device_key {
        DeviceKey::Usb { .. } => DeviceKind::Usb,
        DeviceKey::Pci { .. } => DeviceKind::Pci,
        DeviceKey::Evdev { .. } => DeviceKind::Evdev,
    }
}

#[derive(Debug, Default)]
pub struct AttachmentRegistry {
    by_device: HashMap<DeviceKey, Attachment>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device_key: DeviceKey, vm_name: String) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_device.get(&device_key) {
            return Err(RegistryError::AlreadyAttached {
                vm_name: existing.vm_name.clone(),
            });
        }
        self.by_device.insert(
            device_key.clone(),
            Attachment {
                device_key,
                vm_name,
                attached_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, device_key: &DeviceKey) -> Result<Attachment, RegistryError> {
        self.by_device.remove(device_key).ok_or(RegistryError::NotAttached)
    }

    pub fn vm_of(&self, device_key: &DeviceKey) -> Option<&str> {
        self.by_device.get(device_key).map(|a| a.vm_name.as_str())
    }

    pub fn is_attached(&self, device_key: &DeviceKey) -> bool {
        self.by_device.contains_key(device_key)
    }

    pub fn list_by_vm<'a>(&'a self, vm_name: &'a str) -> impl Iterator<Item = &'a Attachment> {
        self.by_device.values().filter(move |a| a.vm_name == vm_name)
    }

    pub fn list_by_kind(&self, kind: DeviceKind) -> impl Iterator<Item = &Attachment> {
        self.by_device.values().filter(move |a| kind_of(&a.device_key) == kind)
    }

    pub fn list_all(&self) -> impl Iterator<Item = &Attachment> {
        self.by_device.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bus: u8, address: u8) -> DeviceKey {
        DeviceKey::Usb { bus, address }
    }

    #[test]
    fn insert_then_duplicate_fails() {
        let mut registry = AttachmentRegistry::new();
        registry.insert(key(1, 4), "vm1".into()).unwrap();
        let err = registry.insert(key(1, 4), "vm2".into()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyAttached { vm_name } if vm_name == "vm1"));
    }

    #[test]
    fn remove_missing_fails() {
        let mut registry = AttachmentRegistry::new();
        assert!(matches!(registry.remove(&key(1, 4)), Err(RegistryError::NotAttached)));
    }

    #[test]
    fn list_by_vm_filters() {
        let mut registry = AttachmentRegistry::new();
        registry.insert(key(1, 4), "vm1".into()).unwrap();
        registry.insert(key(1, 5), "vm2".into()).unwrap();
        let vm1_devices: Vec<_> = registry.list_by_vm("vm1").collect();
        assert_eq!(vm1_devices.len(), 1);
        assert_eq!(vm1_devices[0].device_key, key(1, 4));
    }

    #[test]
    fn remove_then_reinsert_succeeds() {
        let mut registry = AttachmentRegistry::new();
        registry.insert(key(1, 4), "vm1".into()).unwrap();
        registry.remove(&key(1, 4)).unwrap();
        registry.insert(key(1, 4), "vm2".into()).unwrap();
        assert_eq!(registry.vm_of(&key(1, 4)), Some("vm2"));
    }

    #[test]
    fn list_by_kind_filters() {
        let mut registry = AttachmentRegistry::new();
        registry.insert(key(1, 4), "vm1".into()).unwrap();
        registry
            .insert(DeviceKey::Pci { address: "0000:01:00.0".into() }, "vm1".into())
            .unwrap();
        let usb: Vec<_> = registry.list_by_kind(DeviceKind::Usb).collect();
        assert_eq!(usb.len(), 1);
        assert_eq!(usb[0].device_key, key(1, 4));
        assert_eq!(registry.list_by_kind(DeviceKind::Evdev).count(), 0);
    }
}
