//! Per-VM adapter worker: a dedicated async task owns one `Adapter` and
//! serializes every command issued against it, so the enum's `&mut self`
//! methods never need a lock. The worker tracks connection state and backs
//! off exponentially while the VM is unreachable, reconnecting lazily on the
//! next command rather than polling in the background.

use super::{AdapterError, AdapterState, Adapter, MAX_BACKOFF, MIN_BACKOFF, UsbAttachMode};
use crate::device::model::{EvdevDevice, PciDevice, UsbDevice};
use protocol::DeviceKey;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub enum AdapterCommand {
    AttachUsb(UsbDevice, UsbAttachMode, oneshot::Sender<Result<(), AdapterError>>),
    DetachUsb(DeviceKey, oneshot::Sender<Result<(), AdapterError>>),
    AttachPci(PciDevice, oneshot::Sender<Result<(), AdapterError>>),
    DetachPci(DeviceKey, oneshot::Sender<Result<(), AdapterError>>),
    AttachEvdev(EvdevDevice, String, oneshot::Sender<Result<(), AdapterError>>),
}

/// Cheap, cloneable handle to a running adapter worker. Every orchestrator
/// call goes through here; the worker task is the only thing that ever
/// touches the underlying `Adapter`.
#[derive(Clone)]
pub struct AdapterHandle {
    tx: mpsc::Sender<AdapterCommand>,
}

impl AdapterHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, AdapterError>>) -> AdapterCommand,
    ) -> Result<T, AdapterError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| AdapterError::VmUnreachable("adapter worker stopped".into()))?;
        rx.await
            .map_err(|_| AdapterError::VmUnreachable("adapter worker stopped".into()))?
    }

    pub async fn attach_usb(&self, device: UsbDevice, mode: UsbAttachMode) -> Result<(), AdapterError> {
        self.call(|tx| AdapterCommand::AttachUsb(device, mode, tx)).await
    }

    pub async fn detach_usb(&self, key: DeviceKey) -> Result<(), AdapterError> {
        self.call(|tx| AdapterCommand::DetachUsb(key, tx)).await
    }

    pub async fn attach_pci(&self, device: PciDevice) -> Result<(), AdapterError> {
        self.call(|tx| AdapterCommand::AttachPci(device, tx)).await
    }

    pub async fn detach_pci(&self, key: DeviceKey) -> Result<(), AdapterError> {
        self.call(|tx| AdapterCommand::DetachPci(key, tx)).await
    }

    pub async fn attach_evdev(&self, device: EvdevDevice, bus: String) -> Result<(), AdapterError> {
        self.call(|tx| AdapterCommand::AttachEvdev(device, bus, tx)).await
    }
}

struct BackoffState {
    state: AdapterState,
    current_backoff: std::time::Duration,
    next_attempt_at: Option<Instant>,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            state: AdapterState::Disconnected,
            current_backoff: MIN_BACKOFF,
            next_attempt_at: None,
        }
    }

    fn record_success(&mut self) {
        self.state = AdapterState::Ready;
        self.current_backoff = MIN_BACKOFF;
        self.next_attempt_at = None;
    }

    fn record_failure(&mut self) {
        self.state = AdapterState::Disconnected;
        self.next_attempt_at = Some(Instant::now() + self.current_backoff);
        self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);
    }

    /// `true` once the backoff window has elapsed and a reconnect should be
    /// attempted; stays `false` (without resetting the timer) when called
    /// again before it expires.
    fn ready_to_retry(&self) -> bool {
        match self.next_attempt_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }
}

async fn ensure_connected(adapter: &mut Adapter, backoff: &mut BackoffState) -> Result<(), AdapterError> {
    if backoff.state == AdapterState::Ready {
        return Ok(());
    }
    if !backoff.ready_to_retry() {
        return Err(AdapterError::VmUnreachable("backing off after a previous failure".into()));
    }
    match adapter.connect().await {
        Ok(()) => {
            backoff.record_success();
            Ok(())
        }
        Err(e) => {
            backoff.record_failure();
            Err(e)
        }
    }
}

fn note_outcome<T>(backoff: &mut BackoffState, result: &Result<T, AdapterError>) {
    match result {
        Ok(_) | Err(AdapterError::Unsupported) | Err(AdapterError::DeviceBusy) => backoff.record_success(),
        Err(_) => backoff.record_failure(),
    }
}

/// `DeviceBusy` on an attach means the id already exists on the hypervisor:
/// idempotent from the caller's point of view, so it's remapped to success.
/// Detach keeps it as a genuine failure (nothing to reconcile a delete with).
fn remap_attach_busy(result: Result<(), AdapterError>) -> Result<(), AdapterError> {
    match result {
        Err(AdapterError::DeviceBusy) => Ok(()),
        other => other,
    }
}

async fn run(vm_name: String, mut adapter: Adapter, mut rx: mpsc::Receiver<AdapterCommand>) {
    let mut backoff = BackoffState::new();
    while let Some(command) = rx.recv().await {
        match command {
            AdapterCommand::AttachUsb(device, mode, reply) => {
                let result = match ensure_connected(&mut adapter, &mut backoff).await {
                    Ok(()) => adapter.attach_usb(&device, mode).await,
                    Err(e) => Err(e),
                };
                note_outcome(&mut backoff, &result);
                let _ = reply.send(remap_attach_busy(result));
            }
            AdapterCommand::DetachUsb(key, reply) => {
                let result = match ensure_connected(&mut adapter, &mut backoff).await {
                    Ok(()) => adapter.detach_usb(&key).await,
                    Err(e) => Err(e),
                };
                note_outcome(&mut backoff, &result);
                let _ = reply.send(result);
            }
            AdapterCommand::AttachPci(device, reply) => {
                let result = match ensure_connected(&mut adapter, &mut backoff).await {
                    Ok(()) => adapter.attach_pci(&device).await,
                    Err(e) => Err(e),
                };
                note_outcome(&mut backoff, &result);
                let _ = reply.send(remap_attach_busy(result));
            }
            AdapterCommand::DetachPci(key, reply) => {
                let result = match ensure_connected(&mut adapter, &mut backoff).await {
                    Ok(()) => adapter.detach_pci(&key).await,
                    Err(e) => Err(e),
                };
                note_outcome(&mut backoff, &result);
                let _ = reply.send(result);
            }
            AdapterCommand::AttachEvdev(device, bus, reply) => {
                let result = match ensure_connected(&mut adapter, &mut backoff).await {
                    Ok(()) => adapter.attach_evdev(&device, &bus).await,
                    Err(e) => Err(e),
                };
                note_outcome(&mut backoff, &result);
                let _ = reply.send(remap_attach_busy(result));
            }
        }
        if backoff.state == AdapterState::Disconnected {
            debug!(vm = %vm_name, "adapter disconnected, will retry with backoff");
        }
    }
    warn!(vm = %vm_name, "adapter worker channel closed, stopping");
}

pub fn spawn_adapter_worker(vm_name: String, adapter: Adapter) -> AdapterHandle {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run(vm_name, adapter, rx));
    AdapterHandle { tx }
}
