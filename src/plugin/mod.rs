use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use tracing::{info, warn};

use crate::config::{Allocation, EniRef, NetConf};
use crate::datapath::link::{format_mac, link_mac, LinkPairManager};
use crate::datapath::route::synthetic_gateway;
use crate::datapath::{DatapathDriver, SetupConfig, PRIMARY_ENI_INDEX};
use crate::netns::{self, NetNs};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult, Route as CniRoute};

/// Veth plugin implementation
pub struct VethPlugin {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    driver: DatapathDriver,
}

impl VethPlugin {
    /// Create a new veth plugin
    pub fn new(config: NetConf, args: CmdArgs) -> Self {
        let driver = DatapathDriver::new(config.enable_ipv4, config.enable_ipv6);
        Self {
            config,
            args,
            driver,
        }
    }

    /// Name of the host end of this pod's veth pair
    pub fn host_veth_name(&self) -> String {
        self.config.host_veth_name(&self.args)
    }

    /// Interface index of the allocation's ENI on the host
    async fn resolve_eni(&self, alloc: &Allocation) -> Result<u32> {
        match alloc.eni() {
            EniRef::Primary => Ok(PRIMARY_ENI_INDEX),
            EniRef::Index(index) => Ok(index),
            EniRef::Mac(mac) => {
                let links = LinkPairManager::new(netns::connect_current()?);
                let index = links
                    .index_by_mac(&mac)
                    .await
                    .with_context(|| format!("Failed to find ENI with MAC {mac}"))?;
                info!("Resolved ENI {} to ifindex {}", mac, index);
                Ok(index)
            }
        }
    }

    async fn setup_config(&self) -> Result<SetupConfig> {
        let alloc = self.config.allocation()?;
        let eni_index = self.resolve_eni(alloc).await?;
        self.config
            .to_setup_config(&self.host_veth_name(), &self.args.ifname, eni_index)
    }

    fn open_netns(&self) -> Result<NetNs> {
        NetNs::open(&self.args.netns)
            .with_context(|| format!("Failed to open network namespace {}", self.args.netns))
    }

    /// Wire the pod into the network
    pub async fn add_network(&self) -> Result<CniResult> {
        let cfg = self.setup_config().await?;
        let ns = self.open_netns()?;
        info!(
            "Setting up {} <-> {}:{} (eni {})",
            cfg.host_link_name, self.args.netns, cfg.container_if_name, cfg.eni_index
        );

        self.driver
            .setup(&cfg, &ns)
            .await
            .with_context(|| format!("Failed to set up datapath for {}", cfg.host_link_name))?;

        self.build_result(&cfg, &ns).await
    }

    /// Remove the pod's datapath. A namespace that is already gone is not
    /// an error; the host side is cleaned either way.
    pub async fn del_network(&self) -> Result<()> {
        let host_link = self.host_veth_name();
        let ns = if self.args.netns.is_empty() {
            None
        } else {
            match NetNs::open(&self.args.netns) {
                Ok(ns) => Some(ns),
                Err(err) => {
                    warn!("Network namespace {} unavailable: {}", self.args.netns, err);
                    None
                }
            }
        };

        let cfg = self.config.to_teardown_config(&host_link, &self.args.ifname);
        info!("Tearing down {}", host_link);
        self.driver
            .teardown(&cfg, ns.as_ref())
            .await
            .with_context(|| format!("Failed to tear down datapath for {host_link}"))
    }

    /// Verify the pod's datapath still matches its configuration
    pub async fn check_network(&self) -> Result<()> {
        let cfg = self.setup_config().await?;
        let ns = self.open_netns()?;
        self.driver
            .check(&cfg, &ns)
            .await
            .with_context(|| format!("Check failed for {}", cfg.host_link_name))
    }

    async fn build_result(&self, cfg: &SetupConfig, ns: &NetNs) -> Result<CniResult> {
        let mut result = CniResult::new(&self.config.cni_version);

        let host_links = LinkPairManager::new(netns::connect_current()?);
        let host_mac = host_links
            .get(&cfg.host_link_name)
            .await?
            .as_ref()
            .and_then(link_mac)
            .map(format_mac);
        result.add_interface(Interface {
            name: cfg.host_link_name.clone(),
            mac: host_mac,
            sandbox: None,
        });

        let container_links = LinkPairManager::new(ns.connect()?);
        let container_mac = container_links
            .get(&cfg.container_if_name)
            .await?
            .as_ref()
            .and_then(link_mac)
            .map(format_mac);
        let container = result.add_interface(Interface {
            name: cfg.container_if_name.clone(),
            mac: container_mac,
            sandbox: Some(self.args.netns.clone()),
        });

        let families = [
            (cfg.container_addresses.ipv4.map(IpNetwork::V4), self.config.enable_ipv4, "0.0.0.0/0"),
            (cfg.container_addresses.ipv6.map(IpNetwork::V6), self.config.enable_ipv6, "::/0"),
        ];
        for (net, enabled, default_dst) in families {
            let Some(net) = net.filter(|_| enabled) else {
                continue;
            };
            let gateway = synthetic_gateway(&net.ip()).to_string();
            result.add_ip(IPConfig {
                interface: Some(container),
                address: net.to_string(),
                gateway: Some(gateway.clone()),
            });
            result.add_route(CniRoute {
                dst: default_dst.to_string(),
                gw: Some(gateway),
            });
        }

        for dst in cfg.container_routes() {
            let enabled = match dst {
                IpNetwork::V4(_) => self.config.enable_ipv4,
                IpNetwork::V6(_) => self.config.enable_ipv6,
            };
            if enabled {
                result.add_route(CniRoute {
                    dst: dst.to_string(),
                    gw: Some(synthetic_gateway(&dst.ip()).to_string()),
                });
            }
        }

        Ok(result)
    }
}
