//! Monotonic daemon counters.
//!
//! No HTTP exporter: these are read by tests and by an optional periodic
//! `info!` summary line, not scraped externally.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    usb_attached_total: AtomicU64,
    usb_detached_total: AtomicU64,
    pci_attached_total: AtomicU64,
    pci_detached_total: AtomicU64,
    adapter_reconnects_total: AtomicU64,
    api_connections_total: AtomicU64,
    kernel_events_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_usb_attached(&self) {
        self.usb_attached_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usb_detached(&self) {
        self.usb_detached_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pci_attached(&self) {
        self.pci_attached_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pci_detached(&self) {
        self.pci_detached_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_adapter_reconnect(&self) {
        self.adapter_reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_connection(&self) {
        self.api_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kernel_event(&self) {
        self.kernel_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            usb_attached_total: self.usb_attached_total.load(Ordering::Relaxed),
            usb_detached_total: self.usb_detached_total.load(Ordering::Relaxed),
            pci_attached_total: self.pci_attached_total.load(Ordering::Relaxed),
            pci_detached_total: self.pci_detached_total.load(Ordering::Relaxed),
            adapter_reconnects_total: self.adapter_reconnects_total.load(Ordering::Relaxed),
            api_connections_total: self.api_connections_total.load(Ordering::Relaxed),
            kernel_events_total: self.kernel_events_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub usb_attached_total: u64,
    pub usb_detached_total: u64,
    pub pci_attached_total: u64,
    pub pci_detached_total: u64,
    pub adapter_reconnects_total: u64,
    pub api_connections_total: u64,
    pub kernel_events_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());

        metrics.record_usb_attached();
        metrics.record_usb_attached();
        metrics.record_pci_detached();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.usb_attached_total, 2);
        assert_eq!(snapshot.pci_detached_total, 1);
        assert_eq!(snapshot.usb_detached_total, 0);
    }
}
