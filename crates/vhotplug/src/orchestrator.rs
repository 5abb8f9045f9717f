//! The Orchestrator: the sole mutator of the Attachment Registry. One
//! serialized command loop processes kernel device events and API commands
//! in arrival order; nothing outside this task ever touches the Registry or
//! issues an adapter command directly.

use crate::config::{CompiledConfig, EvdevPassthroughConfig};
use crate::device::{DeviceCache, DeviceEvent, PciSelector as DevicePciSelector, UsbSelector as DeviceUsbSelector};
use crate::hypervisor::AdapterHandle;
use crate::registry::AttachmentRegistry;
use crate::rules::{self, RuleSet};
use protocol::{ApiError, Event, PciDeviceJson, PciSelector, Request, UsbDeviceJson, UsbSelector};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

/// The `ok` payload of a successful API response; most actions carry none.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Ok,
    UsbList(Vec<UsbDeviceJson>),
    PciList(Vec<PciDeviceJson>),
}

enum OrchestratorMessage {
    Kernel(DeviceEvent),
    Api(Request, oneshot::Sender<Result<ApiResponse, ApiError>>),
}

/// Cheap, cloneable handle used by the kernel device source and every API
/// connection to reach the single Orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorMessage>,
    events: broadcast::Sender<Event>,
}

impl OrchestratorHandle {
    pub async fn submit_kernel_event(&self, event: DeviceEvent) {
        if self.tx.send(OrchestratorMessage::Kernel(event)).await.is_err() {
            warn!("orchestrator stopped, dropping kernel event");
        }
    }

    pub async fn dispatch(&self, request: Request) -> Result<ApiResponse, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(OrchestratorMessage::Api(request, tx))
            .await
            .map_err(|_| ApiError::vm_unreachable("orchestrator stopped"))?;
        rx.await.map_err(|_| ApiError::vm_unreachable("orchestrator stopped"))?
    }

    /// Subscribe to the event stream. Each connection keeps its own
    /// receiver; a connection that falls behind is responsible for
    /// disconnecting on `broadcast::error::RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

fn adapter_error_to_api(e: crate::hypervisor::AdapterError) -> ApiError {
    use crate::hypervisor::AdapterError as E;
    match e {
        E::VmUnreachable(m) => ApiError::vm_unreachable(m),
        E::Protocol(m) => ApiError::protocol_error(m),
        E::Unsupported => ApiError::unsupported("operation unsupported by this hypervisor"),
        E::Timeout => ApiError::timeout("adapter command timed out"),
        // Attach idempotence is handled below the orchestrator (the adapter
        // worker remaps this to `Ok` for attach); this arm only exists to
        // keep the match exhaustive for an error that reaches here through
        // some other command in the future.
        E::DeviceBusy => ApiError::already_attached("device already exists on the hypervisor"),
    }
}

pub struct Orchestrator {
    cache: DeviceCache,
    registry: AttachmentRegistry,
    usb_rulesets: Vec<RuleSet>,
    pci_rulesets: Vec<RuleSet>,
    evdev_passthrough: Option<EvdevPassthroughConfig>,
    adapters: HashMap<String, AdapterHandle>,
    events: broadcast::Sender<Event>,
    metrics: Arc<common::Metrics>,
    rx: mpsc::Receiver<OrchestratorMessage>,
}

impl Orchestrator {
    /// Builds the orchestrator and its public handle. Call `run` on the
    /// returned orchestrator to start its command loop.
    pub fn new(
        config: CompiledConfig,
        adapters: HashMap<String, AdapterHandle>,
        metrics: Arc<common::Metrics>,
    ) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let handle = OrchestratorHandle {
            tx,
            events: events.clone(),
        };
        let orchestrator = Self {
            cache: DeviceCache::default(),
            registry: AttachmentRegistry::new(),
            usb_rulesets: config.usb_rulesets,
            pci_rulesets: config.pci_rulesets,
            evdev_passthrough: config.evdev_passthrough,
            adapters,
            events,
            metrics,
            rx,
        };
        (orchestrator, handle)
    }

    pub async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                OrchestratorMessage::Kernel(event) => {
                    self.metrics.record_kernel_event();
                    self.handle_kernel_event(event).await;
                }
                OrchestratorMessage::Api(request, reply) => {
                    let result = self.handle_api_request(request).await;
                    let _ = reply.send(result);
                }
            }
        }
        warn!("orchestrator mailbox closed, stopping");
    }

    fn publish(&self, event: Event) {
        // No subscribers is the common case until a client opts in; a send
        // error here just means nobody is listening yet.
        let _ = self.events.send(event);
    }

    async fn handle_kernel_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::UsbAdded(device) => {
                let key = device.key();
                let device_node = device.device_node();
                self.cache.upsert_usb(device.clone());
                self.publish(Event::UsbConnected {
                    device_node: device_node.clone(),
                });

                let eligible = rules::eligible_usb_vms(&self.usb_rulesets, &device);
                match eligible.as_slice() {
                    [] => {
                        let result = match rules::evaluate_usb(&self.usb_rulesets, &device) {
                            rules::Verdict::Disable => "disabled",
                            rules::Verdict::Allow(_) | rules::Verdict::NoMatch => "no_match",
                        };
                        crate::audit::record_verdict(&key.to_string(), result);
                    }
                    [vm] => self.attach_usb(key, device, vm.clone()).await,
                    many => {
                        self.publish(Event::UsbSelectVm {
                            device_node,
                            allowed_vms: many.to_vec(),
                        });
                    }
                }
            }
            DeviceEvent::UsbRemoved(key) => {
                let device_node = self
                    .cache
                    .usb(&key)
                    .map(|d| d.device_node())
                    .unwrap_or_else(|| key.to_string());
                self.cache.remove_usb(&key);
                if let Ok(attachment) = self.registry.remove(&key) {
                    if let Some(adapter) = self.adapters.get(&attachment.vm_name) {
                        let _ = adapter.detach_usb(key.clone()).await;
                    }
                    self.metrics.record_usb_detached();
                    crate::audit::record_detach(&key.to_string(), &attachment.vm_name, "kernel", "ok");
                    self.publish(Event::UsbDetached {
                        device_node: device_node.clone(),
                        vm: attachment.vm_name,
                    });
                }
                self.publish(Event::UsbDisconnected { device_node });
            }
            DeviceEvent::PciAdded(device) => {
                let key = device.key();
                self.cache.upsert_pci(device.clone());

                let eligible = rules::eligible_pci_vms(&self.pci_rulesets, &device);
                match eligible.as_slice() {
                    [] => {
                        let result = match rules::evaluate_pci(&self.pci_rulesets, &device) {
                            rules::Verdict::Disable => "disabled",
                            rules::Verdict::Allow(_) | rules::Verdict::NoMatch => "no_match",
                        };
                        crate::audit::record_verdict(&key.to_string(), result);
                    }
                    [vm] => self.attach_pci(key, device, vm.clone()).await,
                    many => {
                        info!(vm_count = many.len(), "pci device eligible for more than one vm, no automatic attach");
                    }
                }
            }
            DeviceEvent::PciRemoved(key) => {
                self.cache.remove_pci(&key);
                if let Ok(attachment) = self.registry.remove(&key) {
                    if let Some(adapter) = self.adapters.get(&attachment.vm_name) {
                        let _ = adapter.detach_pci(key.clone()).await;
                    }
                    self.metrics.record_pci_detached();
                    crate::audit::record_detach(&key.to_string(), &attachment.vm_name, "kernel", "ok");
                    let address = match &key {
                        protocol::DeviceKey::Pci { address } => address.clone(),
                        _ => key.to_string(),
                    };
                    self.publish(Event::PciDetached {
                        address,
                        vm: attachment.vm_name,
                    });
                }
            }
            DeviceEvent::EvdevAdded(device) => {
                self.cache.upsert_evdev(device.clone());
                let Some(cfg) = self.evdev_passthrough.clone() else {
                    return;
                };
                if cfg.disable {
                    return;
                }
                let key = device.key();
                if self.registry.is_attached(&key) {
                    return;
                }
                let Some(adapter) = self.adapters.get(&cfg.target_vm).cloned() else {
                    warn!(vm = %cfg.target_vm, "evdev passthrough targets unknown vm");
                    return;
                };
                let bus = crate::hypervisor::ids::evdev_bus(&cfg.pcie_bus_prefix, &device.node);
                match adapter.attach_evdev(device, bus).await {
                    Ok(()) => {
                        let _ = self.registry.insert(key, cfg.target_vm);
                    }
                    Err(e) => warn!(error = %e, "evdev passthrough attach failed"),
                }
            }
            DeviceEvent::EvdevRemoved(key) => {
                self.cache.remove_evdev(&key);
                // No detach verb in the capability set: the hypervisor
                // observes the hot-unplug on its own. Just stop tracking it.
                let _ = self.registry.remove(&key);
            }
        }
    }

    async fn attach_usb(&mut self, key: protocol::DeviceKey, device: crate::device::UsbDevice, vm: String) {
        let Some(adapter) = self.adapters.get(&vm).cloned() else {
            warn!(vm = %vm, "rule targets unknown vm");
            return;
        };
        match adapter
            .attach_usb(device.clone(), crate::hypervisor::UsbAttachMode::BusAddress)
            .await
        {
            Ok(()) => {
                if self.registry.insert(key.clone(), vm.clone()).is_ok() {
                    self.metrics.record_usb_attached();
                    crate::audit::record_attach(&key.to_string(), &vm, "kernel", "ok");
                    self.publish(Event::UsbAttached {
                        device_node: device.device_node(),
                        vm,
                    });
                }
            }
            Err(e) => {
                crate::audit::record_attach(&key.to_string(), &vm, "kernel", "failed");
                info!(vm = %vm, error = %e, "usb attach failed, will retry on next relevant event");
            }
        }
    }

    async fn attach_pci(&mut self, key: protocol::DeviceKey, device: crate::device::PciDevice, vm: String) {
        let Some(adapter) = self.adapters.get(&vm).cloned() else {
            warn!(vm = %vm, "rule targets unknown vm");
            return;
        };
        match adapter.attach_pci(device.clone()).await {
            Ok(()) => {
                if self.registry.insert(key.clone(), vm.clone()).is_ok() {
                    self.metrics.record_pci_attached();
                    crate::audit::record_attach(&key.to_string(), &vm, "kernel", "ok");
                    self.publish(Event::PciAttached {
                        address: device.address.clone(),
                        vm,
                    });
                }
            }
            Err(e) => {
                crate::audit::record_attach(&key.to_string(), &vm, "kernel", "failed");
                info!(vm = %vm, error = %e, "pci attach failed, will retry on next relevant event");
            }
        }
    }

    async fn handle_api_request(&mut self, request: Request) -> Result<ApiResponse, ApiError> {
        match request {
            Request::EnableNotifications => Ok(ApiResponse::Ok),
            Request::UsbList => Ok(ApiResponse::UsbList(self.usb_list_json())),
            Request::PciList => Ok(ApiResponse::PciList(self.pci_list_json())),
            Request::UsbAttach { selector, vm } => self.api_usb_attach(selector, vm).await,
            Request::UsbDetach { selector } => self.api_usb_detach(selector).await,
            Request::PciAttach { selector, vm } => self.api_pci_attach(selector, vm).await,
            Request::PciDetach { selector } => self.api_pci_detach(selector).await,
        }
    }

    fn usb_list_json(&self) -> Vec<UsbDeviceJson> {
        self.cache
            .list_usb()
            .map(|device| {
                let allowed_vms = rules::eligible_usb_vms(&self.usb_rulesets, device);
                let vm = self.registry.vm_of(&device.key()).map(|s| s.to_string());
                device.to_json(allowed_vms, vm)
            })
            .collect()
    }

    fn pci_list_json(&self) -> Vec<PciDeviceJson> {
        self.cache
            .list_pci()
            .map(|device| {
                let allowed_vms = rules::eligible_pci_vms(&self.pci_rulesets, device);
                let vm = self.registry.vm_of(&device.key()).map(|s| s.to_string());
                device.to_json(allowed_vms, vm)
            })
            .collect()
    }

    async fn api_usb_attach(&mut self, selector: UsbSelector, vm: String) -> Result<ApiResponse, ApiError> {
        let mode = if matches!(selector, UsbSelector::BusPort { .. }) {
            crate::hypervisor::UsbAttachMode::Port
        } else {
            crate::hypervisor::UsbAttachMode::BusAddress
        };
        let selector: DeviceUsbSelector = (&selector).into();
        let device = resolve_one(self.cache.find_usb(&selector))?;
        let key = device.key();
        if let Some(owner) = self.registry.vm_of(&key) {
            return Err(ApiError::already_attached(owner.to_string()));
        }
        let adapter = self
            .adapters
            .get(&vm)
            .cloned()
            .ok_or_else(|| ApiError::vm_unreachable(format!("unknown vm {vm}")))?;
        adapter.attach_usb(device.clone(), mode).await.map_err(adapter_error_to_api)?;
        self.registry
            .insert(key.clone(), vm.clone())
            .map_err(|_| ApiError::already_attached(vm.clone()))?;
        self.metrics.record_usb_attached();
        crate::audit::record_attach(&key.to_string(), &vm, "api", "ok");
        self.publish(Event::UsbAttached {
            device_node: device.device_node(),
            vm,
        });
        Ok(ApiResponse::Ok)
    }

    async fn api_usb_detach(&mut self, selector: UsbSelector) -> Result<ApiResponse, ApiError> {
        let selector: DeviceUsbSelector = (&selector).into();
        let device = resolve_one(self.cache.find_usb(&selector))?;
        let key = device.key();
        let vm = self
            .registry
            .vm_of(&key)
            .map(|s| s.to_string())
            .ok_or_else(|| ApiError::not_attached("device not attached"))?;
        let adapter = self
            .adapters
            .get(&vm)
            .cloned()
            .ok_or_else(|| ApiError::vm_unreachable(format!("unknown vm {vm}")))?;
        adapter.detach_usb(key.clone()).await.map_err(adapter_error_to_api)?;
        self.registry
            .remove(&key)
            .map_err(|_| ApiError::not_attached("device not attached"))?;
        self.metrics.record_usb_detached();
        crate::audit::record_detach(&key.to_string(), &vm, "api", "ok");
        self.publish(Event::UsbDetached {
            device_node: device.device_node(),
            vm,
        });
        Ok(ApiResponse::Ok)
    }

    async fn api_pci_attach(&mut self, selector: PciSelector, vm: String) -> Result<ApiResponse, ApiError> {
        let selector: DevicePciSelector = (&selector).into();
        let device = resolve_one(self.cache.find_pci(&selector))?;
        let key = device.key();
        if let Some(owner) = self.registry.vm_of(&key) {
            return Err(ApiError::already_attached(owner.to_string()));
        }
        let adapter = self
            .adapters
            .get(&vm)
            .cloned()
            .ok_or_else(|| ApiError::vm_unreachable(format!("unknown vm {vm}")))?;
        adapter.attach_pci(device.clone()).await.map_err(adapter_error_to_api)?;
        self.registry
            .insert(key.clone(), vm.clone())
            .map_err(|_| ApiError::already_attached(vm.clone()))?;
        self.metrics.record_pci_attached();
        crate::audit::record_attach(&key.to_string(), &vm, "api", "ok");
        self.publish(Event::PciAttached {
            address: device.address.clone(),
            vm,
        });
        Ok(ApiResponse::Ok)
    }

    async fn api_pci_detach(&mut self, selector: PciSelector) -> Result<ApiResponse, ApiError> {
        let selector: DevicePciSelector = (&selector).into();
        let device = resolve_one(self.cache.find_pci(&selector))?;
        let key = device.key();
        let vm = self
            .registry
            .vm_of(&key)
            .map(|s| s.to_string())
            .ok_or_else(|| ApiError::not_attached("device not attached"))?;
        let adapter = self
            .adapters
            .get(&vm)
            .cloned()
            .ok_or_else(|| ApiError::vm_unreachable(format!("unknown vm {vm}")))?;
        adapter.detach_pci(key.clone()).await.map_err(adapter_error_to_api)?;
        self.registry
            .remove(&key)
            .map_err(|_| ApiError::not_attached("device not attached"))?;
        self.metrics.record_pci_detached();
        crate::audit::record_detach(&key.to_string(), &vm, "api", "ok");
        self.publish(Event::PciDetached {
            address: device.address.clone(),
            vm,
        });
        Ok(ApiResponse::Ok)
    }
}

fn resolve_one<T: Clone>(matches: Vec<&T>) -> Result<T, ApiError> {
    match matches.len() {
        0 => Err(ApiError::no_such_device("no device matches the selector")),
        1 => Ok(matches[0].clone()),
        _ => Err(ApiError::ambiguous("more than one device matches the selector")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, VmKind};
    use crate::device::model::{Interface, UsbDevice};
    use crate::hypervisor::Adapter;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn mouse(vid: &str, pid: &str, bus: u8, address: u8) -> UsbDevice {
        UsbDevice {
            bus,
            address,
            vid: vid.into(),
            pid: pid.into(),
            vendor_name: Some("Logitech".into()),
            product_name: None,
            port: "2.4".into(),
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            interfaces: vec![Interface {
                class: 3,
                subclass: 1,
                protocol: 2,
            }],
        }
    }

    fn usb_ruleset(target_vm: &str, json: &str) -> RuleSet {
        let spec: crate::config::RuleSetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.target_vm, target_vm);
        RuleSet::compile(&spec).unwrap()
    }

    /// Greets once like real QMP, then echoes `{"return":{}}` for every
    /// subsequent line, standing in for a real QEMU instance in tests.
    fn spawn_fake_qmp(socket_path: std::path::PathBuf) {
        let listener = UnixListener::bind(&socket_path).expect("bind fake qmp socket");
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    let _ = write_half.write_all(b"{\"QMP\":{\"version\":{}}}\n").await;
                    while let Ok(Some(_line)) = lines.next_line().await {
                        let _ = write_half.write_all(b"{\"return\":{}}\n").await;
                    }
                });
            }
        });
    }

    async fn test_orchestrator(
        usb_rulesets: Vec<RuleSet>,
        vms: &[&str],
    ) -> (OrchestratorHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut adapters = HashMap::new();
        for vm in vms {
            let socket = dir.path().join(format!("{vm}.sock"));
            spawn_fake_qmp(socket.clone());
            let adapter = Adapter::new(VmKind::Qemu, socket);
            adapters.insert(vm.to_string(), crate::hypervisor::spawn_adapter_worker(vm.to_string(), adapter));
        }
        // Let the fake servers start listening before the first command races them.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = CompiledConfig {
            usb_rulesets,
            pci_rulesets: vec![],
            evdev_passthrough: None,
            vms: vec![],
            api: ApiConfig::default(),
        };
        let (orchestrator, handle) = Orchestrator::new(config, adapters, Arc::new(common::Metrics::default()));
        tokio::spawn(orchestrator.run());
        (handle, dir)
    }

    async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open")
    }

    async fn no_further_event(rx: &mut broadcast::Receiver<Event>) {
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "expected no further event, got one");
    }

    /// Scenario 1: HID allow.
    #[tokio::test]
    async fn hid_allow_attaches_and_notifies() {
        let rs = usb_ruleset(
            "vm1",
            r#"{"targetVm":"vm1","allow":[{"interfaceClass":3,"interfaceProtocol":2}]}"#,
        );
        let (handle, _dir) = test_orchestrator(vec![rs], &["vm1"]).await;
        let mut events = handle.subscribe();

        handle.submit_kernel_event(DeviceEvent::UsbAdded(mouse("046d", "c077", 1, 4))).await;

        assert!(matches!(next_event(&mut events).await, Event::UsbConnected { .. }));
        assert!(matches!(
            next_event(&mut events).await,
            Event::UsbAttached { vm, .. } if vm == "vm1"
        ));
    }

    /// Scenario 2: deny overrides allow within the same rule set.
    #[tokio::test]
    async fn deny_overrides_allow() {
        let rs = usb_ruleset(
            "vm1",
            r#"{"targetVm":"vm1",
                "allow":[{"interfaceClass":3,"interfaceProtocol":2}],
                "deny":[{"vid":"046d","pid":"c52b"}]}"#,
        );
        let (handle, _dir) = test_orchestrator(vec![rs], &["vm1"]).await;
        let mut events = handle.subscribe();

        handle.submit_kernel_event(DeviceEvent::UsbAdded(mouse("046d", "c52b", 1, 4))).await;

        assert!(matches!(next_event(&mut events).await, Event::UsbConnected { .. }));
        no_further_event(&mut events).await;
    }

    /// Scenario 3: a matching rule with `disable:true` suppresses attach and
    /// does not raise an ambiguity notification either.
    #[tokio::test]
    async fn disable_flag_suppresses_attach() {
        let rs = usb_ruleset(
            "vm1",
            r#"{"targetVm":"vm1","allow":[{"interfaceClass":3,"interfaceProtocol":2,"disable":true}]}"#,
        );
        let (handle, _dir) = test_orchestrator(vec![rs], &["vm1"]).await;
        let mut events = handle.subscribe();

        handle.submit_kernel_event(DeviceEvent::UsbAdded(mouse("046d", "c077", 1, 4))).await;

        assert!(matches!(next_event(&mut events).await, Event::UsbConnected { .. }));
        no_further_event(&mut events).await;
    }

    /// Scenario 4: an operator-driven attach by vid/pid fails `ambiguous`
    /// when more than one connected device shares that vid/pid.
    #[tokio::test]
    async fn ambiguous_operator_attach() {
        let (handle, _dir) = test_orchestrator(vec![], &["vm1"]).await;
        handle.submit_kernel_event(DeviceEvent::UsbAdded(mouse("1111", "2222", 1, 4))).await;
        handle.submit_kernel_event(DeviceEvent::UsbAdded(mouse("1111", "2222", 1, 5))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let request = Request::UsbAttach {
            selector: UsbSelector::VidPid {
                vid: "1111".into(),
                pid: "2222".into(),
            },
            vm: "vm1".into(),
        };
        let result = handle.dispatch(request).await;
        assert!(matches!(result, Err(e) if e.code == protocol::ErrorCode::Ambiguous));
    }

    /// Scenario 5: unplugging an attached device detaches it and clears the
    /// registry even though the fake adapter here always succeeds.
    #[tokio::test]
    async fn attach_then_unplug_detaches_and_notifies() {
        let rs = usb_ruleset(
            "vm1",
            r#"{"targetVm":"vm1","allow":[{"interfaceClass":3,"interfaceProtocol":2}]}"#,
        );
        let (handle, _dir) = test_orchestrator(vec![rs], &["vm1"]).await;
        let mut events = handle.subscribe();
        let device = mouse("046d", "c077", 1, 4);
        let key = device.key();

        handle.submit_kernel_event(DeviceEvent::UsbAdded(device)).await;
        assert!(matches!(next_event(&mut events).await, Event::UsbConnected { .. }));
        assert!(matches!(next_event(&mut events).await, Event::UsbAttached { .. }));

        handle.submit_kernel_event(DeviceEvent::UsbRemoved(key)).await;
        assert!(matches!(
            next_event(&mut events).await,
            Event::UsbDetached { vm, .. } if vm == "vm1"
        ));
        assert!(matches!(next_event(&mut events).await, Event::UsbDisconnected { .. }));

        let usb_list = match handle.dispatch(Request::UsbList).await.unwrap() {
            ApiResponse::UsbList(devices) => devices,
            other => panic!("unexpected response: {other:?}"),
        };
        assert!(usb_list.is_empty());
    }

    /// Scenario 6: two rule sets independently allow the same device to
    /// different VMs; the orchestrator asks the operator to choose instead
    /// of picking one, and an explicit follow-up attach then succeeds.
    #[tokio::test]
    async fn multiple_eligible_vms_requires_operator_choice() {
        let rs1 = usb_ruleset("vm1", r#"{"targetVm":"vm1","allow":[{"vid":"1111","pid":"2222"}]}"#);
        let rs2 = usb_ruleset("vm2", r#"{"targetVm":"vm2","allow":[{"vid":"1111","pid":"2222"}]}"#);
        let (handle, _dir) = test_orchestrator(vec![rs1, rs2], &["vm1", "vm2"]).await;
        let mut events = handle.subscribe();

        handle.submit_kernel_event(DeviceEvent::UsbAdded(mouse("1111", "2222", 1, 4))).await;

        assert!(matches!(next_event(&mut events).await, Event::UsbConnected { .. }));
        match next_event(&mut events).await {
            Event::UsbSelectVm { allowed_vms, .. } => {
                assert_eq!(allowed_vms, vec!["vm1".to_string(), "vm2".to_string()]);
            }
            other => panic!("expected usb_select_vm, got {other:?}"),
        }

        let request = Request::UsbAttach {
            selector: UsbSelector::VidPid {
                vid: "1111".into(),
                pid: "2222".into(),
            },
            vm: "vm2".into(),
        };
        handle.dispatch(request).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            Event::UsbAttached { vm, .. } if vm == "vm2"
        ));
    }
}
