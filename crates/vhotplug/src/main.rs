//! vhotplug
//!
//! Host-side daemon that watches the kernel's hotplug stream for USB, PCI
//! and evdev devices and attaches them to the VM selected by the
//! configured passthrough rules, over each VM's QMP or crosvm control
//! socket. A JSON control-plane API over TCP/VSOCK/UNIX lets clients list
//! devices and drive attach/detach manually.

mod api;
mod audit;
mod config;
mod device;
mod hypervisor;
mod orchestrator;
mod registry;
mod rules;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::{Metrics, setup_logging};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use api::ApiServer;
use config::Config;
use device::{DeviceEvent, KernelDeviceSource};
use hypervisor::{Adapter, spawn_adapter_worker};
use orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "vhotplug")]
#[command(author, version, about = "Attach hotplugged USB/PCI/evdev devices to VMs")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Attach devices already connected at startup, not just future hotplug events.
    #[arg(short = 'a', long = "attach-connected")]
    attach_connected: bool,

    /// Enable debug-level logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(if args.debug { "debug" } else { "info" }).context("setting up logging")?;

    if let Err(e) = run(args).await {
        error!(error = %e, "vhotplug exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?.compile()?;
    let metrics = Arc::new(Metrics::default());

    let mut adapters = HashMap::new();
    for vm in &config.vms {
        let adapter = Adapter::new(vm.kind, vm.socket.clone());
        let handle = spawn_adapter_worker(vm.name.clone(), adapter);
        adapters.insert(vm.name.clone(), handle);
    }

    let api_config = config.api.clone();
    let (orchestrator, orchestrator_handle) = Orchestrator::new(config, adapters, metrics.clone());
    tokio::spawn(orchestrator.run());

    let (device_tx, device_rx) = common::mailbox::<DeviceEvent>(256);
    let source_handle = device::source::spawn(device_tx.clone());

    if args.attach_connected {
        match KernelDeviceSource::new() {
            Ok(source) => match source.enumerate_connected() {
                Ok(events) => {
                    info!(count = events.len(), "replaying already-connected devices");
                    for event in events {
                        orchestrator_handle.submit_kernel_event(event).await;
                    }
                }
                Err(e) => warn!(error = %e, "failed to enumerate already-connected devices"),
            },
            Err(e) => warn!(error = %e, "failed to open udev enumerator for --attach-connected"),
        }
    }

    let forward_handle = orchestrator_handle.clone();
    tokio::spawn(async move {
        loop {
            match device_rx.recv().await {
                Ok(event) => forward_handle.submit_kernel_event(event).await,
                Err(_) => {
                    error!("kernel device source mailbox closed, no further hotplug events will be delivered");
                    break;
                }
            }
        }
    });

    if api_config.enable {
        let server = ApiServer::new(api_config, orchestrator_handle.clone(), metrics.clone());
        server.spawn().await;
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, exiting");

    // The kernel device source thread blocks on a netlink socket with no
    // clean way to interrupt it from here; let the process exit drop it.
    let _ = source_handle;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
