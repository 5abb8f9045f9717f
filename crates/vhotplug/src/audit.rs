//! Structured audit trail.
//!
//! Every attach/detach decision and API mutation is logged as a single
//! `tracing` event on the `vhotplug::audit` target, with structured fields
//! rather than a free-text message. Downstream log collectors filter on the
//! target name to pull just the audit trail out of the daemon's regular
//! logs; there is no separate audit log file or rotation to manage here.

use tracing::info;

/// Record an attach decision (kernel-triggered or API-triggered).
pub fn record_attach(device_key: &str, vm: &str, source: &str, outcome: &str) {
    info!(
        target: "vhotplug::audit",
        device_key,
        vm,
        source,
        outcome,
        "device attach"
    );
}

/// Record a detach decision.
pub fn record_detach(device_key: &str, vm: &str, source: &str, outcome: &str) {
    info!(
        target: "vhotplug::audit",
        device_key,
        vm,
        source,
        outcome,
        "device detach"
    );
}

/// Record a rule-engine verdict that produced no action (denied or
/// ambiguous), so the audit trail explains why a connected device never
/// got attached anywhere.
pub fn record_verdict(device_key: &str, verdict: &str) {
    info!(target: "vhotplug::audit", device_key, verdict, "rule verdict");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::subscriber::with_default;

    #[test]
    fn emits_without_panicking() {
        let subscriber = tracing_subscriber::registry();
        with_default(subscriber, || {
            record_attach("usb:1:2", "vm1", "kernel", "ok");
            record_detach("usb:1:2", "vm1", "kernel", "ok");
            record_verdict("usb:1:3", "no_match");
        });
    }
}
