//! QEMU Machine Protocol adapter: a line-delimited JSON control channel over
//! a UNIX socket. `device_add`/`device_del` drive USB, PCI and evdev
//! passthrough with hypervisor-specific driver strings.

use super::{AdapterError, COMMAND_TIMEOUT, UsbAttachMode, ids};
use crate::device::model::{EvdevDevice, PciDevice, UsbDevice};
use protocol::DeviceKey;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub struct QmpAdapter {
    socket_path: PathBuf,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
}

impl QmpAdapter {
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
        let mut reader = BufReader::new(read_half);

        // Greeting: {"QMP": {...}}
        read_line_with_timeout(&mut reader).await?;

        self.reader = Some(reader);
        self.writer = Some(write_half);
        self.exec(json!({"execute": "qmp_capabilities"})).await?;
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
        loop {
            let response = read_line_with_timeout(reader).await?;
            // QMP may interleave asynchronous events; skip them.
            if response.get("event").is_some() {
                continue;
            }
            if let Some(error) = response.get("error") {
                let desc = error.get("desc").and_then(Value::as_str).unwrap_or_default();
                if desc.contains("already exists") || desc.contains("Duplicate device ID") {
                    return Err(AdapterError::DeviceBusy);
                }
                return Err(AdapterError::Protocol(error.to_string()));
            }
            return Ok(response);
        }
    }

    pub async fn attach_usb(&mut self, device: &UsbDevice, mode: UsbAttachMode) -> Result<(), AdapterError> {
        let id = ids::usb_id(device.bus, device.address);
        let mut arguments = json!({
            "driver": "usb-host",
            "id": id,
        });
        match mode {
            UsbAttachMode::BusAddress => {
                arguments["hostbus"] = device.bus.to_string().into();
                arguments["hostaddr"] = device.address.to_string().into();
            }
            UsbAttachMode::Port => {
                arguments["hostport"] = format!("{}-{}", device.bus, device.port).into();
            }
        }
        self.exec(json!({
            "execute": "device_add",
            "arguments": arguments,
        }))
        .await?;
        Ok(())
    }

    pub async fn detach_usb(&mut self, key: &DeviceKey) -> Result<(), AdapterError> {
        let DeviceKey::Usb { bus, address } = key else {
            return Err(AdapterError::Protocol("detach_usb called with non-usb key".into()));
        };
        self.device_del(&ids::usb_id(*bus, *address)).await
    }

    pub async fn attach_pci(&mut self, device: &PciDevice) -> Result<(), AdapterError> {
        let id = ids::pci_id(&device.address);
        self.exec(json!({
            "execute": "device_add",
            "arguments": {
                "driver": "vfio-pci",
                "id": id,
                "host": device.address,
            }
        }))
        .await?;
        Ok(())
    }

    pub async fn detach_pci(&mut self, key: &DeviceKey) -> Result<(), AdapterError> {
        let DeviceKey::Pci { address } = key else {
            return Err(AdapterError::Protocol("detach_pci called with non-pci key".into()));
        };
        self.device_del(&ids::pci_id(address)).await
    }

    pub async fn attach_evdev(&mut self, device: &EvdevDevice, bus: &str) -> Result<(), AdapterError> {
        let id = format!("vhp-evdev-{}", device.node.replace('/', "-"));
        self.exec(json!({
            "execute": "device_add",
            "arguments": {
                "driver": "virtio-input-host-pci",
                "id": id,
                "evdev": device.node,
                "bus": bus,
            }
        }))
        .await?;
        Ok(())
    }

    async fn device_del(&mut self, id: &str) -> Result<(), AdapterError> {
        self.exec(json!({"execute": "device_del", "arguments": {"id": id}})).await?;
        Ok(())
    }
}

async fn read_line_with_timeout(reader: &mut BufReader<OwnedReadHalf>) -> Result<Value, AdapterError> {
    let mut line = String::new();
    let read = tokio::time::timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(|e| AdapterError::VmUnreachable(e.to_string()))?;
    if read == 0 {
        return Err(AdapterError::VmUnreachable("connection closed by peer".into()));
    }
    serde_json::from_str(line.trim()).map_err(|e| AdapterError::Protocol(e.to_string()))
}
