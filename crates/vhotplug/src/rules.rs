//! Passthrough rule engine.
//!
//! Evaluates a device against the ordered `RuleSet`s from the config: inside
//! a rule set, `deny` blocks that rule set's `allow` entirely; across rule
//! sets, the first rule set with a match wins. Separately,
//! [`eligible_usb_vms`]/[`eligible_pci_vms`] evaluate *every* rule set to
//! find devices more than one VM would claim, which the orchestrator treats
//! as an ambiguity requiring operator choice.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{RuleSetSpec, RuleSpec};
use crate::device::model::{PciDevice, UsbDevice};

#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub vid: Option<String>,
    pub pid: Option<String>,
    pub did: Option<String>,
    pub address: Option<String>,
    pub vendor_name: Option<Regex>,
    pub product_name: Option<Regex>,
    pub device_class: Option<u8>,
    pub device_subclass: Option<u8>,
    pub device_protocol: Option<u8>,
    pub interface_class: Option<u8>,
    pub interface_subclass: Option<u8>,
    pub interface_protocol: Option<u8>,
    pub disable: bool,
    pub description: String,
}

fn anchored_case_insensitive(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i)^(?:{pattern})$"))
        .with_context(|| format!("invalid regex pattern: {pattern}"))
}

impl Rule {
    pub fn compile(spec: &RuleSpec) -> Result<Rule> {
        Ok(Rule {
            vid: spec.vid.clone(),
            pid: spec.pid.clone(),
            did: spec.did.clone(),
            address: spec.address.clone(),
            vendor_name: spec.vendor_name.as_deref().map(anchored_case_insensitive).transpose()?,
            product_name: spec.product_name.as_deref().map(anchored_case_insensitive).transpose()?,
            device_class: spec.device_class,
            device_subclass: spec.device_subclass,
            device_protocol: spec.device_protocol,
            interface_class: spec.interface_class,
            interface_subclass: spec.interface_subclass,
            interface_protocol: spec.interface_protocol,
            disable: spec.disable,
            description: spec.description.clone(),
        })
    }

    pub fn matches_usb(&self, device: &UsbDevice) -> bool {
        if let Some(ref vid) = self.vid
            && !vid.eq_ignore_ascii_case(&device.vid)
        {
            return false;
        }
        if let Some(ref pid) = self.pid
            && !pid.eq_ignore_ascii_case(&device.pid)
        {
            return false;
        }
        if let Some(ref re) = self.vendor_name {
            match &device.vendor_name {
                Some(name) if re.is_match(name) => {}
                _ => return false,
            }
        }
        if let Some(ref re) = self.product_name {
            match &device.product_name {
                Some(name) if re.is_match(name) => {}
                _ => return false,
            }
        }
        if let Some(c) = self.device_class
            && c != device.device_class
        {
            return false;
        }
        if let Some(c) = self.device_subclass
            && c != device.device_subclass
        {
            return false;
        }
        if let Some(c) = self.device_protocol
            && c != device.device_protocol
        {
            return false;
        }
        if self.interface_class.is_some()
            || self.interface_subclass.is_some()
            || self.interface_protocol.is_some()
        {
            let any_interface_matches = device.interfaces.iter().any(|iface| {
                self.interface_class.is_none_or(|c| c == iface.class)
                    && self.interface_subclass.is_none_or(|c| c == iface.subclass)
                    && self.interface_protocol.is_none_or(|c| c == iface.protocol)
            });
            if !any_interface_matches {
                return false;
            }
        }
        true
    }

    pub fn matches_pci(&self, device: &PciDevice) -> bool {
        if let Some(ref vid) = self.vid
            && !vid.eq_ignore_ascii_case(&device.vid)
        {
            return false;
        }
        if let Some(ref did) = self.did
            && !did.eq_ignore_ascii_case(&device.did)
        {
            return false;
        }
        if let Some(ref address) = self.address
            && address != &device.address
        {
            return false;
        }
        if let Some(c) = self.device_class
            && c != device.device_class
        {
            return false;
        }
        if let Some(c) = self.device_subclass
            && c != device.device_subclass
        {
            return false;
        }
        if let Some(c) = self.device_protocol
            && c != device.device_prog_if
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub target_vm: String,
    pub allow: Vec<Rule>,
    pub deny: Vec<Rule>,
    pub description: String,
}

impl RuleSet {
    pub fn compile(spec: &RuleSetSpec) -> Result<RuleSet> {
        Ok(RuleSet {
            target_vm: spec.target_vm.clone(),
            allow: spec.allow.iter().map(Rule::compile).collect::<Result<_>>()?,
            deny: spec.deny.iter().map(Rule::compile).collect::<Result<_>>()?,
            description: spec.description.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow(String),
    Disable,
    NoMatch,
}

enum RuleSetVerdict {
    Allow(String),
    Disable,
    NoMatch,
}

fn evaluate_ruleset_usb(ruleset: &RuleSet, device: &UsbDevice) -> RuleSetVerdict {
    if ruleset.deny.iter().any(|rule| rule.matches_usb(device)) {
        return RuleSetVerdict::NoMatch;
    }
    match ruleset.allow.iter().find(|rule| rule.matches_usb(device)) {
        Some(rule) if rule.disable => RuleSetVerdict::Disable,
        Some(_) => RuleSetVerdict::Allow(ruleset.target_vm.clone()),
        None => RuleSetVerdict::NoMatch,
    }
}

fn evaluate_ruleset_pci(ruleset: &RuleSet, device: &PciDevice) -> RuleSetVerdict {
    if ruleset.deny.iter().any(|rule| rule.matches_pci(device)) {
        return RuleSetVerdict::NoMatch;
    }
    match ruleset.allow.iter().find(|rule| rule.matches_pci(device)) {
        Some(rule) if rule.disable => RuleSetVerdict::Disable,
        Some(_) => RuleSetVerdict::Allow(ruleset.target_vm.clone()),
        None => RuleSetVerdict::NoMatch,
    }
}

/// First-rule-set-wins verdict, used for the common single-match path.
pub fn evaluate_usb(rulesets: &[RuleSet], device: &UsbDevice) -> Verdict {
    let mut saw_disable = false;
    for ruleset in rulesets {
        match evaluate_ruleset_usb(ruleset, device) {
            RuleSetVerdict::Allow(vm) => return Verdict::Allow(vm),
            RuleSetVerdict::Disable => saw_disable = true,
            RuleSetVerdict::NoMatch => {}
        }
    }
    if saw_disable { Verdict::Disable } else { Verdict::NoMatch }
}

pub fn evaluate_pci(rulesets: &[RuleSet], device: &PciDevice) -> Verdict {
    let mut saw_disable = false;
    for ruleset in rulesets {
        match evaluate_ruleset_pci(ruleset, device) {
            RuleSetVerdict::Allow(vm) => return Verdict::Allow(vm),
            RuleSetVerdict::Disable => saw_disable = true,
            RuleSetVerdict::NoMatch => {}
        }
    }
    if saw_disable { Verdict::Disable } else { Verdict::NoMatch }
}

/// All VMs whose rule set would allow this device, in config order. More
/// than one entry means the device is ambiguous and should be published as
/// `usb_select_vm` rather than auto-attached.
pub fn eligible_usb_vms(rulesets: &[RuleSet], device: &UsbDevice) -> Vec<String> {
    rulesets
        .iter()
        .filter_map(|ruleset| match evaluate_ruleset_usb(ruleset, device) {
            RuleSetVerdict::Allow(vm) => Some(vm),
            _ => None,
        })
        .collect()
}

pub fn eligible_pci_vms(rulesets: &[RuleSet], device: &PciDevice) -> Vec<String> {
    rulesets
        .iter()
        .filter_map(|ruleset| match evaluate_ruleset_pci(ruleset, device) {
            RuleSetVerdict::Allow(vm) => Some(vm),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::model::Interface;

    fn mouse(vid: &str, pid: &str) -> UsbDevice {
        UsbDevice {
            bus: 1,
            address: 4,
            vid: vid.into(),
            pid: pid.into(),
            vendor_name: Some("Logitech".into()),
            product_name: Some("M185".into()),
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

    fn ruleset(target_vm: &str, spec_json: &str) -> RuleSet {
        let spec: RuleSetSpec = serde_json::from_str(spec_json).unwrap();
        assert_eq!(spec.target_vm, target_vm);
        RuleSet::compile(&spec).unwrap()
    }

    #[test]
    fn allows_by_interface_class_and_protocol() {
        let rs = ruleset(
            "vm1",
            r#"{"targetVm":"vm1","allow":[{"interfaceClass":3,"interfaceProtocol":2}]}"#,
        );
        let verdict = evaluate_usb(&[rs], &mouse("046d", "c077"));
        assert_eq!(verdict, Verdict::Allow("vm1".into()));
    }

    #[test]
    fn deny_within_ruleset_blocks_its_own_allow() {
        let rs = ruleset(
            "vm1",
            r#"{"targetVm":"vm1",
                "allow":[{"interfaceClass":3}],
                "deny":[{"pid":"c077"}]}"#,
        );
        let verdict = evaluate_usb(&[rs], &mouse("046d", "c077"));
        assert_eq!(verdict, Verdict::NoMatch);
    }

    #[test]
    fn disable_rule_suppresses_attach() {
        let rs = ruleset(
            "vm1",
            r#"{"targetVm":"vm1","allow":[{"pid":"c077","disable":true}]}"#,
        );
        assert_eq!(evaluate_usb(&[rs], &mouse("046d", "c077")), Verdict::Disable);
    }

    #[test]
    fn multiple_rulesets_allow_are_reported_as_eligible() {
        let rs1 = ruleset("vm1", r#"{"targetVm":"vm1","allow":[{"vid":"1111","pid":"2222"}]}"#);
        let rs2 = ruleset("vm2", r#"{"targetVm":"vm2","allow":[{"vid":"1111","pid":"2222"}]}"#);
        let device = mouse("1111", "2222");
        let eligible = eligible_usb_vms(&[rs1.clone(), rs2.clone()], &device);
        assert_eq!(eligible, vec!["vm1".to_string(), "vm2".to_string()]);
        assert_eq!(evaluate_usb(&[rs1, rs2], &device), Verdict::Allow("vm1".into()));
    }

    #[test]
    fn vendor_name_regex_is_anchored_and_case_insensitive() {
        let rs = ruleset("vm1", r#"{"targetVm":"vm1","allow":[{"vendorName":"logitech"}]}"#);
        assert_eq!(evaluate_usb(&[rs.clone()], &mouse("046d", "c077")), Verdict::Allow("vm1".into()));

        let mut other = mouse("046d", "c077");
        other.vendor_name = Some("NotLogitechAtAll".into());
        assert_eq!(evaluate_usb(&[rs], &other), Verdict::NoMatch);
    }
}
