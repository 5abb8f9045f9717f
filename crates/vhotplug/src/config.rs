//! Daemon configuration: rule sets, VM specs and the API transport settings.
//!
//! Configuration is a single JSON document. Unknown top-level fields are
//! ignored; unknown fields inside a rule are rejected so a typo in a
//! passthrough rule fails loudly at load time instead of silently matching
//! nothing.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::rules::{Rule, RuleSet};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, rename = "usbPassthrough")]
    pub usb_passthrough: Vec<RuleSetSpec>,
    #[serde(default, rename = "pciPassthrough")]
    pub pci_passthrough: Vec<RuleSetSpec>,
    #[serde(default, rename = "evdevPassthrough")]
    pub evdev_passthrough: Option<EvdevPassthroughConfig>,
    pub vms: Vec<VmSpec>,
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvdevPassthroughConfig {
    #[serde(rename = "targetVm")]
    pub target_vm: String,
    #[serde(default)]
    pub disable: bool,
    #[serde(rename = "pcieBusPrefix", default = "default_pcie_bus_prefix")]
    pub pcie_bus_prefix: String,
}

fn default_pcie_bus_prefix() -> String {
    "pcie.0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VmKind,
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    Qemu,
    Crosvm,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enable: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "unixSocket")]
    pub unix_socket: Option<PathBuf>,
    #[serde(default)]
    pub transports: Vec<ApiTransport>,
    #[serde(rename = "allowedCids", default)]
    pub allowed_cids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiTransport {
    Tcp,
    Vsock,
    Unix,
}

/// A `RuleSet` as deserialized from JSON, before its regex fields are
/// compiled into [`crate::rules::RuleSet`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleSetSpec {
    #[serde(rename = "targetVm")]
    pub target_vm: String,
    #[serde(default)]
    pub allow: Vec<RuleSpec>,
    #[serde(default)]
    pub deny: Vec<RuleSpec>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub vid: Option<String>,
    pub pid: Option<String>,
    pub did: Option<String>,
    pub address: Option<String>,
    #[serde(rename = "vendorName")]
    pub vendor_name: Option<String>,
    #[serde(rename = "productName")]
    pub product_name: Option<String>,
    #[serde(rename = "deviceClass")]
    pub device_class: Option<u8>,
    #[serde(rename = "deviceSubclass")]
    pub device_subclass: Option<u8>,
    #[serde(rename = "deviceProtocol")]
    pub device_protocol: Option<u8>,
    #[serde(rename = "interfaceClass")]
    pub interface_class: Option<u8>,
    #[serde(rename = "interfaceSubclass")]
    pub interface_subclass: Option<u8>,
    #[serde(rename = "interfaceProtocol")]
    pub interface_protocol: Option<u8>,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub description: String,
}

/// Config with all rule regexes compiled, ready for the orchestrator.
pub struct CompiledConfig {
    pub usb_rulesets: Vec<RuleSet>,
    pub pci_rulesets: Vec<RuleSet>,
    pub evdev_passthrough: Option<EvdevPassthroughConfig>,
    pub vms: Vec<VmSpec>,
    pub api: ApiConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.vms.is_empty() {
            bail!("config must declare at least one VM");
        }
        let mut names = std::collections::HashSet::new();
        for vm in &self.vms {
            if !names.insert(vm.name.as_str()) {
                bail!("duplicate VM name in config: {}", vm.name);
            }
        }
        for rs in self.usb_passthrough.iter().chain(self.pci_passthrough.iter()) {
            if !names.contains(rs.target_vm.as_str()) {
                bail!("rule set targets unknown VM: {}", rs.target_vm);
            }
        }
        if let Some(ref evdev) = self.evdev_passthrough
            && !names.contains(evdev.target_vm.as_str())
        {
            bail!("evdevPassthrough targets unknown VM: {}", evdev.target_vm);
        }
        Ok(())
    }

    /// Compile every rule's regex fields, failing the whole load on the
    /// first malformed pattern.
    pub fn compile(self) -> Result<CompiledConfig> {
        let usb_rulesets = self
            .usb_passthrough
            .iter()
            .map(RuleSet::compile)
            .collect::<Result<Vec<_>>>()
            .context("compiling usbPassthrough rule sets")?;
        let pci_rulesets = self
            .pci_passthrough
            .iter()
            .map(RuleSet::compile)
            .collect::<Result<Vec<_>>>()
            .context("compiling pciPassthrough rule sets")?;
        Ok(CompiledConfig {
            usb_rulesets,
            pci_rulesets,
            evdev_passthrough: self.evdev_passthrough,
            vms: self.vms,
            api: self.general.api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "usbPassthrough": [
                {
                    "targetVm": "vm1",
                    "allow": [{"interfaceClass": 3, "interfaceProtocol": 2, "description": "mouse"}]
                }
            ],
            "vms": [
                {"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}
            ],
            "general": {"api": {"enable": true, "transports": ["unix"], "unixSocket": "/run/vhotplug.sock"}}
        }"#
    }

    #[test]
    fn parses_minimal_config() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.vms.len(), 1);
        assert_eq!(config.usb_passthrough.len(), 1);
        assert!(config.general.api.enable);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_top_level_field_is_ignored() {
        let with_extra = sample_json().replacen('{', r#"{"somethingElse": 1, "#, 1);
        let config: Config = serde_json::from_str(&with_extra).unwrap();
        assert_eq!(config.vms.len(), 1);
    }

    #[test]
    fn unknown_rule_field_is_rejected() {
        let bad = r#"{"vid": "1234", "bogus": true}"#;
        let result: Result<RuleSpec, _> = serde_json::from_str(bad);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_ruleset_targeting_unknown_vm() {
        let bad = sample_json().replace(r#""targetVm": "vm1""#, r#""targetVm": "doesnotexist""#);
        let bad_config: Config = serde_json::from_str(&bad).unwrap();
        assert!(bad_config.validate().is_err());

        let good_config: Config = serde_json::from_str(sample_json()).unwrap();
        assert!(good_config.validate().is_ok());
    }

    #[test]
    fn malformed_regex_fails_compile() {
        let json = r#"{
            "usbPassthrough": [
                {"targetVm": "vm1", "allow": [{"vendorName": "("}]}
            ],
            "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.compile().is_err());
    }
}
