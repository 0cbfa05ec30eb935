use anyhow::{Context, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use thiserror::Error;

use crate::datapath::{SetupConfig, TeardownConfig, MAX_ENI_INDEX, PRIMARY_ENI_INDEX};
use crate::types::{CmdArgs, IpNetSet, IpSet};

/// Default MTU of both veth ends
pub const DEFAULT_MTU: u32 = 1500;
/// Default prefix of host-side veth names
pub const DEFAULT_HOST_VETH_PREFIX: &str = "cali";
/// Hex digits of the pod hash kept in the host veth name
const VETH_HASH_LEN: usize = 11;
/// Longest interface name the kernel accepts
const IFNAMSIZ: usize = 15;

/// A network configuration the plugin refuses to act on.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(ConfigError(format!($($arg)*)).into())
    };
}

/// Network configuration for the veth CNI, read from stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI specification version
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// MTU of both veth ends
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Prefix of host-side veth names
    #[serde(default = "default_host_veth_prefix")]
    pub host_veth_prefix: String,
    /// Cluster service ranges, routed via the host
    #[serde(default)]
    pub service_cidrs: Vec<IpNetwork>,
    /// Node-local ranges reached through the host stack
    #[serde(default)]
    pub host_stack_cidrs: Vec<IpNetwork>,
    #[serde(default = "enabled")]
    pub enable_ipv4: bool,
    #[serde(default = "enabled")]
    pub enable_ipv6: bool,
    /// Address allocation for this pod
    pub allocation: Option<Allocation>,
}

/// What the controller allocated to one pod
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Interface index of the ENI; absent or 0 for the primary ENI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eni_index: Option<u32>,
    /// MAC of the ENI, resolved to an index on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eni_mac: Option<String>,
    #[serde(default)]
    pub trunk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ipv4: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ipv6: Option<Ipv6Addr>,
    /// Address of the ENI itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ipv4: Option<Ipv4Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ipv6: Option<Ipv6Network>,
    #[serde(default)]
    pub extra_routes: Vec<ExtraRoute>,
    /// Ingress limit in bits per second
    #[serde(default)]
    pub ingress: u64,
    /// Egress limit in bits per second
    #[serde(default)]
    pub egress: u64,
}

/// Additional container route. The container always reaches it through
/// the synthetic gateway, whatever `gw` says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraRoute {
    pub dst: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// How the allocation names its ENI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EniRef {
    Primary,
    Index(u32),
    Mac(String),
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_host_veth_prefix() -> String {
    DEFAULT_HOST_VETH_PREFIX.to_string()
}

fn enabled() -> bool {
    true
}

impl Allocation {
    pub fn container_addresses(&self) -> IpNetSet {
        IpNetSet::new(self.ipv4, self.ipv6)
    }

    pub fn gateway_addresses(&self) -> IpSet {
        IpSet::new(self.gateway_ipv4, self.gateway_ipv6)
    }

    pub fn host_addresses(&self) -> Option<IpNetSet> {
        let set = IpNetSet::new(self.host_ipv4, self.host_ipv6);
        (!set.is_empty()).then_some(set)
    }

    pub fn eni(&self) -> EniRef {
        match (self.eni_index, &self.eni_mac) {
            (Some(index), _) if index != PRIMARY_ENI_INDEX => EniRef::Index(index),
            (None, Some(mac)) => EniRef::Mac(mac.clone()),
            _ => EniRef::Primary,
        }
    }
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf =
            serde_json::from_slice(bytes).context("Failed to parse network configuration")?;
        conf.validate()?;
        Ok(conf)
    }

    /// Read and parse a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::parse(&bytes)
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write configuration {}", path.as_ref().display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(68..=65535).contains(&self.mtu) {
            invalid!("Invalid MTU {} (must be between 68 and 65535)", self.mtu);
        }
        if self.host_veth_prefix.is_empty() {
            invalid!("hostVethPrefix must not be empty");
        }
        if self.host_veth_prefix.len() + VETH_HASH_LEN > IFNAMSIZ {
            invalid!(
                "hostVethPrefix {:?} too long (at most {} bytes)",
                self.host_veth_prefix,
                IFNAMSIZ - VETH_HASH_LEN
            );
        }
        // DEL may arrive without an allocation; ADD and CHECK ask for it
        // through `allocation()`.
        let Some(alloc) = &self.allocation else {
            return Ok(());
        };
        if alloc.ipv4.is_none() && alloc.ipv6.is_none() {
            invalid!("allocation has neither ipv4 nor ipv6");
        }
        if alloc.eni_index.is_some() && alloc.eni_mac.is_some() {
            invalid!("allocation names its ENI by both eniIndex and eniMac");
        }
        if let Some(index) = alloc.eni_index {
            if index > MAX_ENI_INDEX {
                invalid!("eniIndex {index} out of range");
            }
        }
        if let Some(mac) = &alloc.eni_mac {
            if !is_mac(mac) {
                invalid!("eniMac {mac:?} is not a MAC address");
            }
        }
        Ok(())
    }

    pub fn allocation(&self) -> Result<&Allocation> {
        self.allocation
            .as_ref()
            .ok_or_else(|| ConfigError("allocation is required".to_string()).into())
    }

    /// Host veth name for the pod described by `args`
    pub fn host_veth_name(&self, args: &CmdArgs) -> String {
        match args.pod_identity() {
            Some((namespace, pod)) => host_veth_name(&self.host_veth_prefix, namespace, pod),
            None => {
                let id: String = args.container_id.chars().take(VETH_HASH_LEN).collect();
                format!("{}{}", self.host_veth_prefix, id)
            }
        }
    }

    /// Everything setup needs once the ENI index is known
    pub fn to_setup_config(
        &self,
        host_link_name: &str,
        container_if_name: &str,
        eni_index: u32,
    ) -> Result<SetupConfig> {
        let alloc = self.allocation()?;
        Ok(SetupConfig {
            host_link_name: host_link_name.to_string(),
            container_if_name: container_if_name.to_string(),
            container_addresses: alloc.container_addresses(),
            gateway_addresses: alloc.gateway_addresses(),
            mtu: self.mtu,
            eni_index,
            trunk: alloc.trunk,
            extra_routes: alloc.extra_routes.iter().map(|r| r.dst).collect(),
            service_cidrs: self.service_cidrs.clone(),
            host_stack_cidrs: self.host_stack_cidrs.clone(),
            host_addresses: alloc.host_addresses(),
            ingress_limit: alloc.ingress,
            egress_limit: alloc.egress,
        })
    }

    pub fn to_teardown_config(&self, host_link_name: &str, container_if_name: &str) -> TeardownConfig {
        TeardownConfig {
            host_link_name: host_link_name.to_string(),
            container_if_name: container_if_name.to_string(),
            container_addresses: self
                .allocation
                .as_ref()
                .map(Allocation::container_addresses)
                .filter(|set| !set.is_empty()),
        }
    }
}

/// `prefix` followed by the first hex digits of SHA-1(`namespace.pod`).
pub fn host_veth_name(prefix: &str, namespace: &str, pod: &str) -> String {
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, format!("{namespace}.{pod}").as_bytes());
    let hex: String = hash.as_ref().iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}{}", &hex[..VETH_HASH_LEN])
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_name_is_stable_and_short() {
        let a = host_veth_name("cali", "default", "web-0");
        let b = host_veth_name("cali", "default", "web-0");
        let c = host_veth_name("cali", "default", "web-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 15);
        assert!(a.starts_with("cali"));
    }

    #[test]
    fn mac_format() {
        assert!(is_mac("02:42:ac:11:00:02"));
        assert!(!is_mac("02:42:ac:11:00"));
        assert!(!is_mac("02-42-ac-11-00-02"));
        assert!(!is_mac("zz:42:ac:11:00:02"));
    }

    #[test]
    fn eni_reference() {
        let mut alloc = Allocation::default();
        assert_eq!(alloc.eni(), EniRef::Primary);
        alloc.eni_mac = Some("02:42:ac:11:00:02".to_string());
        assert_eq!(alloc.eni(), EniRef::Mac("02:42:ac:11:00:02".to_string()));
        alloc.eni_mac = None;
        alloc.eni_index = Some(0);
        assert_eq!(alloc.eni(), EniRef::Primary);
        alloc.eni_index = Some(4);
        assert_eq!(alloc.eni(), EniRef::Index(4));
    }

    #[test]
    fn empty_host_addresses_are_none() {
        let alloc = Allocation::default();
        assert_eq!(alloc.host_addresses(), None);
    }
}
