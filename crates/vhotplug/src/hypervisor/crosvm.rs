//! crosvm control-socket adapter. crosvm only exposes USB hot-attach over its
//! control socket; PCI and evdev passthrough are configured at VM launch time
//! and cannot be changed at runtime, so those operations are `Unsupported`.

use super::{AdapterError, COMMAND_TIMEOUT, UsbAttachMode, ids};
use crate::device::model::{EvdevDevice, PciDevice, UsbDevice};
use protocol::DeviceKey;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub struct CrosvmAdapter {
    socket_path: PathBuf,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
}

impl CrosvmAdapter {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            reader: None,
            writer: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), AdapterError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| AdapterError::VmUnreachable(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        Ok(())
    }

    async fn exec(&mut self, command: Value) -> Result<Value, AdapterError> {
        let writer = self.writer.as_mut().ok_or_else(|| AdapterError::Protocol("not connected".into()))?;
        let mut line = serde_json::to_vec(&command).map_err(|e| AdapterError::Protocol(e.to_string()))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| AdapterError::VmUnreachable(e.to_string()))?;

        let reader = self.reader.as_mut().ok_or_else(|| AdapterError::Protocol("not connected".into()))?;
        let mut line = String::new();
        let read = tokio::time::timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| AdapterError::Timeout)?
            .map_err(|e| AdapterError::VmUnreachable(e.to_string()))?;
        if read == 0 {
            return Err(AdapterError::VmUnreachable("connection closed by peer".into()));
        }
        let response: Value = serde_json::from_str(line.trim()).map_err(|e| AdapterError::Protocol(e.to_string()))?;
        if let Some(error) = response.get("error") {
            let desc = error.as_str().unwrap_or_default();
            if desc.contains("already exists") || desc.contains("already attached") {
                return Err(AdapterError::DeviceBusy);
            }
            return Err(AdapterError::Protocol(error.to_string()));
        }
        Ok(response)
    }

    pub async fn attach_usb(&mut self, device: &UsbDevice, _mode: UsbAttachMode) -> Result<(), AdapterError> {
        let id = ids::usb_id(device.bus, device.address);
        self.exec(json!({
            "command": "usb_attach",
            "id": id,
            "bus": device.bus,
            "addr": device.address,
            "vendor_id": device.vid,
            "product_id": device.pid,
            "dev_path": device.device_node(),
        }))
        .await?;
        Ok(())
    }

    pub async fn detach_usb(&mut self, key: &DeviceKey) -> Result<(), AdapterError> {
        let DeviceKey::Usb { bus, address } = key else {
            return Err(AdapterError::Protocol("detach_usb called with non-usb key".into()));
        };
        self.exec(json!({"command": "usb_detach", "id": ids::usb_id(*bus, *address)})).await?;
        Ok(())
    }

    pub async fn attach_pci(&mut self, _device: &PciDevice) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    pub async fn detach_pci(&mut self, _key: &DeviceKey) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    pub async fn attach_evdev(&mut self, _device: &EvdevDevice, _bus: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }
}
