//! Veth datapath engine.
//!
//! [`DatapathDriver::setup`] wires a pod namespace to the host with a veth
//! pair and, for pods behind a secondary ENI, steers their traffic into the
//! ENI's route table with two policy rules per address.
//! [`DatapathDriver::teardown`] reverses it without any recorded state.

pub mod addr;
pub mod error;
pub mod link;
pub mod rollback;
pub mod route;
pub mod rule;

use std::net::IpAddr;

use ipnetwork::{IpNetwork, Ipv6Network};
use rtnetlink::{Handle, IpVersion};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use addr::AddressConfigurator;
pub use error::{DatapathError, ErrorKind, Result};
pub use link::LinkPairManager;
pub use rollback::{Rollback, UndoAction, UndoContext};
pub use route::RouteManager;
pub use rule::{
    checked_route_table_id, route_table_id, PriorityRuleManager, RuleSpec,
    FROM_CONTAINER_PRIORITY, MAIN_TABLE, MAX_ENI_INDEX, TO_CONTAINER_PRIORITY,
};

use crate::netns::NetNs;
use crate::types::{host_prefix, IpNetSet, IpSet};
use link::{link_is_up, link_mtu, MAX_IFNAME_LEN};
use route::{route_gateway, route_oif, synthetic_gateway, SYNTHETIC_GATEWAY_V6};

/// ENI index of pods routed by the VPC through the primary interface.
pub const PRIMARY_ENI_INDEX: u32 = 0;

/// Everything one pod's setup needs, resolved from its allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConfig {
    /// Host end of the veth pair.
    pub host_link_name: String,
    /// Interface name inside the pod, usually `eth0`.
    pub container_if_name: String,
    pub container_addresses: IpNetSet,
    /// Real subnet gateways of the ENI, used for its route table.
    pub gateway_addresses: IpSet,
    pub mtu: u32,
    /// Interface index of the ENI; [`PRIMARY_ENI_INDEX`] for the primary path.
    pub eni_index: u32,
    pub trunk: bool,
    pub extra_routes: Vec<IpNetwork>,
    pub service_cidrs: Vec<IpNetwork>,
    pub host_stack_cidrs: Vec<IpNetwork>,
    /// Addresses the ENI itself carries on the host.
    pub host_addresses: Option<IpNetSet>,
    /// Bits per second, 0 for unlimited. Carried, not enforced here.
    pub ingress_limit: u64,
    pub egress_limit: u64,
}

impl SetupConfig {
    pub fn is_policy_routed(&self) -> bool {
        self.eni_index != PRIMARY_ENI_INDEX
    }

    /// Route table of the pod's ENI, `None` on the primary path.
    pub fn route_table(&self) -> Option<u32> {
        if self.is_policy_routed() {
            checked_route_table_id(self.eni_index)
        } else {
            None
        }
    }

    /// Extra, service and host-stack destinations, in that order.
    pub fn container_routes(&self) -> impl Iterator<Item = IpNetwork> + '_ {
        self.extra_routes
            .iter()
            .chain(&self.service_cidrs)
            .chain(&self.host_stack_cidrs)
            .copied()
    }

    /// Reject configs that cannot be applied, before any kernel call.
    pub fn validate(&self) -> Result<()> {
        validate_ifname("host link name", &self.host_link_name)?;
        validate_ifname("container interface name", &self.container_if_name)?;
        if self.container_addresses.is_empty() {
            return Err(DatapathError::Validation(
                "no container address configured".to_string(),
            ));
        }
        if !(68..=65535).contains(&self.mtu) {
            return Err(DatapathError::Validation(format!(
                "mtu {} out of range",
                self.mtu
            )));
        }
        if self.container_addresses.ipv6.is_some() && self.mtu < 1280 {
            return Err(DatapathError::Validation(format!(
                "mtu {} below the IPv6 minimum",
                self.mtu
            )));
        }
        if self.eni_index > MAX_ENI_INDEX {
            return Err(DatapathError::Validation(format!(
                "eni index {} is not a valid ifindex",
                self.eni_index
            )));
        }
        for dst in self.container_routes() {
            let has_family = match dst {
                IpNetwork::V4(_) => self.container_addresses.ipv4.is_some(),
                IpNetwork::V6(_) => self.container_addresses.ipv6.is_some(),
            };
            if !has_family {
                return Err(DatapathError::Validation(format!(
                    "route {dst} has no container address of its family"
                )));
            }
        }
        if self.is_policy_routed() {
            for ip in self.container_addresses.addrs() {
                if self.gateway_addresses.for_family_of(&ip).is_none() {
                    return Err(DatapathError::Validation(format!(
                        "no gateway for {ip} on eni {}",
                        self.eni_index
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What teardown gets from the runtime; addresses may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownConfig {
    pub host_link_name: String,
    pub container_if_name: String,
    pub container_addresses: Option<IpNetSet>,
}

fn validate_ifname(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DatapathError::Validation(format!("{what} is empty")));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(DatapathError::Validation(format!(
            "{what} {name:?} longer than {MAX_IFNAME_LEN} bytes"
        )));
    }
    if name.contains(['/', ':']) || name.chars().any(char::is_whitespace) || name == "." || name == ".." {
        return Err(DatapathError::Validation(format!(
            "{what} {name:?} is not a valid interface name"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Unconfigured,
    LinkCreated,
    AddressesAssigned,
    RoutesInstalled,
    /// Ready.
    RulesInstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    Ready,
    RulesRemoved,
    RoutesRemoved,
    LinkRemoved,
    Unconfigured,
}

/// The four managers bound to one namespace.
struct Managers {
    links: LinkPairManager,
    addrs: AddressConfigurator,
    routes: RouteManager,
    rules: PriorityRuleManager,
}

impl Managers {
    fn new(handle: Handle) -> Self {
        Self {
            links: LinkPairManager::new(handle.clone()),
            addrs: AddressConfigurator::new(handle.clone()),
            routes: RouteManager::new(handle.clone()),
            rules: PriorityRuleManager::new(handle),
        }
    }

    fn connect(ns: &NetNs) -> Result<Self> {
        Ok(Self::new(ns.connect()?))
    }

    fn host() -> Result<Self> {
        Ok(Self::new(crate::netns::connect_current()?))
    }

    fn undo_context(&self) -> UndoContext<'_> {
        UndoContext {
            links: &self.links,
            routes: &self.routes,
            rules: &self.rules,
        }
    }
}

/// Temporary name for the container end while it still lives on the host.
fn temp_peer_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("veth{}", &id[..8])
}

/// Written from the calling thread: `/proc/sys/net` resolves against the
/// namespace of the thread that opens it.
fn enable_proxy_arp(host_link: &str) -> Result<()> {
    let path = format!("/proc/sys/net/ipv4/conf/{host_link}/proxy_arp");
    std::fs::write(&path, b"1").map_err(|reason| DatapathError::Io {
        op: format!("write {path}"),
        reason,
    })
}

/// Orchestrates setup, teardown and check.
///
/// Holds no state between calls; concurrent calls for different pods are
/// safe because every rule and route is addressed by exact match.
#[derive(Debug, Clone, Copy)]
pub struct DatapathDriver {
    ipv4: bool,
    ipv6: bool,
}

impl Default for DatapathDriver {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl DatapathDriver {
    /// A driver configuring only the enabled address families.
    pub fn new(ipv4: bool, ipv6: bool) -> Self {
        Self { ipv4, ipv6 }
    }

    fn enabled(&self, set: &IpNetSet) -> IpNetSet {
        IpNetSet::new(
            set.ipv4.filter(|_| self.ipv4),
            set.ipv6.filter(|_| self.ipv6),
        )
    }

    fn family_enabled(&self, net: &IpNetwork) -> bool {
        match net {
            IpNetwork::V4(_) => self.ipv4,
            IpNetwork::V6(_) => self.ipv6,
        }
    }

    /// Build the datapath for one pod. On failure everything this call
    /// created is removed again before the error is returned.
    pub async fn setup(&self, cfg: &SetupConfig, ns: &NetNs) -> Result<()> {
        cfg.validate()?;
        let addrs = self.enabled(&cfg.container_addresses);
        if addrs.is_empty() {
            return Err(DatapathError::Validation(
                "no container address in an enabled family".to_string(),
            ));
        }
        debug!(
            host = %cfg.host_link_name,
            ingress = cfg.ingress_limit,
            egress = cfg.egress_limit,
            "bandwidth limits passed through"
        );

        let host = Managers::host()?;
        let container = Managers::connect(ns)?;

        let mut state = SetupState::Unconfigured;
        let mut rollback = Rollback::new();
        match self
            .apply(cfg, &addrs, ns, &host, &container, &mut state, &mut rollback)
            .await
        {
            Ok(()) => {
                rollback.commit();
                info!(
                    host = %cfg.host_link_name,
                    container = %cfg.container_if_name,
                    eni = cfg.eni_index,
                    trunk = cfg.trunk,
                    "datapath ready"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    host = %cfg.host_link_name,
                    ?state,
                    error = %err,
                    undo = rollback.len(),
                    "setup failed, rolling back"
                );
                let failed = rollback.unwind(&host.undo_context()).await;
                if failed > 0 {
                    warn!(host = %cfg.host_link_name, failed, "rollback incomplete");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        cfg: &SetupConfig,
        addrs: &IpNetSet,
        ns: &NetNs,
        host: &Managers,
        container: &Managers,
        state: &mut SetupState,
        rollback: &mut Rollback,
    ) -> Result<()> {
        if container.links.get(&cfg.container_if_name).await?.is_some() {
            return Err(DatapathError::conflict(format!(
                "link {} in {}",
                cfg.container_if_name,
                ns.path().display()
            )));
        }

        let peer_name = temp_peer_name();
        let (host_link, peer) = host
            .links
            .create_pair(&cfg.host_link_name, &peer_name, cfg.mtu)
            .await?;
        rollback.push(UndoAction::DeleteLink {
            name: cfg.host_link_name.clone(),
        });
        let host_index = host_link.header.index;

        host.links.move_to_namespace(peer.header.index, ns).await?;
        let peer = container
            .links
            .get(&peer_name)
            .await?
            .ok_or_else(|| DatapathError::not_found(format!("link {peer_name}")))?;
        let container_index = peer.header.index;
        container
            .links
            .rename(container_index, &cfg.container_if_name)
            .await?;
        container.links.set_up(container_index).await?;
        host.links.set_up(host_index).await?;
        if addrs.ipv4.is_some() {
            enable_proxy_arp(&cfg.host_link_name)?;
        }
        *state = SetupState::LinkCreated;
        debug!(host = %cfg.host_link_name, host_index, container_index, ?state);

        container.addrs.assign(container_index, addrs).await?;
        if addrs.ipv6.is_some() {
            let gateway = Ipv6Network::new(SYNTHETIC_GATEWAY_V6, 64)
                .map_err(|e| DatapathError::Validation(e.to_string()))?;
            host.addrs
                .assign_one(host_index, IpNetwork::V6(gateway))
                .await?;
        }
        container.addrs.wait_visible(container_index, addrs).await?;
        *state = SetupState::AddressesAssigned;
        debug!(host = %cfg.host_link_name, ?state);

        for ip in addrs.addrs() {
            container
                .routes
                .add_synthetic_default(&ip, container_index)
                .await?;
        }
        for dst in cfg.container_routes().filter(|dst| self.family_enabled(dst)) {
            container.routes.add_via_synthetic(dst, container_index).await?;
        }
        for ip in addrs.addrs() {
            host.routes.add_host_route(ip, host_index).await?;
            rollback.push(UndoAction::DeleteHostRoute { ip, oif: host_index });
        }
        if let Some(table) = cfg.route_table() {
            self.prepare_eni(cfg, addrs, host, table).await?;
        }
        *state = SetupState::RoutesInstalled;
        debug!(host = %cfg.host_link_name, ?state);

        if let Some(table) = cfg.route_table() {
            for ip in addrs.addrs() {
                for spec in [
                    RuleSpec::to_container(ip),
                    RuleSpec::from_container(ip, &cfg.host_link_name, Some(table)),
                ] {
                    if host.rules.ensure(&spec).await? {
                        rollback.push(UndoAction::DeleteRule(spec));
                    }
                }
            }
        }
        *state = SetupState::RulesInstalled;
        debug!(host = %cfg.host_link_name, ?state);
        Ok(())
    }

    /// Bring the ENI up, give it its host addresses and make sure its route
    /// table has a default route. All of it is shared with other pods on
    /// the same ENI, so none of it is rolled back.
    async fn prepare_eni(
        &self,
        cfg: &SetupConfig,
        addrs: &IpNetSet,
        host: &Managers,
        table: u32,
    ) -> Result<()> {
        let eni = host
            .links
            .get_by_index(cfg.eni_index)
            .await?
            .ok_or_else(|| DatapathError::not_found(format!("eni ifindex {}", cfg.eni_index)))?;
        if !link_is_up(&eni) {
            host.links.set_up(cfg.eni_index).await?;
        }
        if let Some(host_addrs) = &cfg.host_addresses {
            for ip in self.enabled(host_addrs).addrs() {
                host.addrs.assign_one(cfg.eni_index, host_prefix(ip)).await?;
            }
        }
        for ip in addrs.addrs() {
            let gateway = cfg.gateway_addresses.for_family_of(&ip).ok_or_else(|| {
                DatapathError::Validation(format!("no gateway for {ip}"))
            })?;
            host.routes
                .ensure_table_default(gateway, cfg.eni_index, table)
                .await?;
        }
        if cfg.trunk {
            debug!(eni = cfg.eni_index, table, "trunk eni, pods told apart by address");
        }
        Ok(())
    }

    /// Remove a pod's datapath. Safe to repeat; anything already gone is
    /// success. Every step runs even when an earlier one failed.
    ///
    /// `ns` is `None` when the pod namespace no longer exists.
    pub async fn teardown(&self, cfg: &TeardownConfig, ns: Option<&NetNs>) -> Result<()> {
        let host = Managers::host()?;
        let mut errors = Vec::new();
        let mut state = TeardownState::Ready;
        debug!(host = %cfg.host_link_name, ?state, "tearing down");

        let host_link = host
            .links
            .get(&cfg.host_link_name)
            .await
            .unwrap_or_else(|err| {
                errors.push(err);
                None
            });

        let mut pod_ips: Vec<IpAddr> = cfg
            .container_addresses
            .iter()
            .flat_map(|set| set.addrs().collect::<Vec<_>>())
            .collect();
        if let Some(link) = &host_link {
            match host.routes.host_route_targets(link.header.index).await {
                Ok(targets) => pod_ips.extend(targets),
                Err(err) => errors.push(err),
            }
        }
        match host.rules.pod_sources(&cfg.host_link_name).await {
            Ok(sources) => pod_ips.extend(sources),
            Err(err) => errors.push(err),
        }
        pod_ips.sort();
        pod_ips.dedup();
        debug!(host = %cfg.host_link_name, ips = ?pod_ips, "pod addresses");

        for ip in &pod_ips {
            for spec in [
                RuleSpec::to_container(*ip),
                RuleSpec::from_container(*ip, &cfg.host_link_name, None),
            ] {
                if let Err(err) = host.rules.remove(&spec).await {
                    errors.push(err);
                }
            }
        }
        state = TeardownState::RulesRemoved;
        debug!(host = %cfg.host_link_name, ?state);

        if let Some(link) = &host_link {
            for ip in &pod_ips {
                if let Err(err) = host.routes.remove_host_route(*ip, link.header.index).await {
                    errors.push(err);
                }
            }
        }
        state = TeardownState::RoutesRemoved;
        debug!(host = %cfg.host_link_name, ?state);

        if let Err(err) = host.links.destroy(&cfg.host_link_name).await {
            errors.push(err);
        }
        if let Some(ns) = ns {
            let res = match Managers::connect(ns) {
                Ok(container) => container.links.destroy(&cfg.container_if_name).await,
                Err(err) => Err(err),
            };
            if let Err(err) = res {
                errors.push(err);
            }
        }
        state = TeardownState::LinkRemoved;
        debug!(host = %cfg.host_link_name, ?state);

        errors.retain(|err| !err.is_not_found());
        match errors.len() {
            0 => {
                state = TeardownState::Unconfigured;
                info!(host = %cfg.host_link_name, ?state, "datapath removed");
                Ok(())
            }
            1 => Err(errors.remove(0)),
            _ => Err(DatapathError::Aggregate(errors)),
        }
    }

    /// Verify a pod's datapath still matches `cfg`.
    pub async fn check(&self, cfg: &SetupConfig, ns: &NetNs) -> Result<()> {
        cfg.validate()?;
        let addrs = self.enabled(&cfg.container_addresses);
        let host = Managers::host()?;
        let container = Managers::connect(ns)?;

        let host_link = host
            .links
            .get(&cfg.host_link_name)
            .await?
            .ok_or_else(|| DatapathError::not_found(format!("link {}", cfg.host_link_name)))?;
        expect_mtu(&cfg.host_link_name, link_mtu(&host_link), cfg.mtu)?;

        let container_link = container
            .links
            .get(&cfg.container_if_name)
            .await?
            .ok_or_else(|| DatapathError::not_found(format!("link {}", cfg.container_if_name)))?;
        expect_mtu(&cfg.container_if_name, link_mtu(&container_link), cfg.mtu)?;
        if !link_is_up(&container_link) {
            return Err(DatapathError::Validation(format!(
                "link {} is down",
                cfg.container_if_name
            )));
        }
        let container_index = container_link.header.index;
        if !container.addrs.verify(container_index, &addrs).await? {
            return Err(DatapathError::not_found(format!(
                "addresses on {}",
                cfg.container_if_name
            )));
        }

        for ip in addrs.addrs() {
            let version = if ip.is_ipv4() { IpVersion::V4 } else { IpVersion::V6 };
            let defaults = container.routes.default_routes(version).await?;
            let gateway = synthetic_gateway(&ip);
            match defaults.as_slice() {
                [] => {
                    return Err(DatapathError::not_found(format!(
                        "default route for {ip}"
                    )))
                }
                [route]
                    if route_gateway(route) == Some(gateway)
                        && route_oif(route) == Some(container_index) => {}
                _ => {
                    return Err(DatapathError::Validation(format!(
                        "expected a single default route via {gateway}, found {}",
                        defaults.len()
                    )))
                }
            }
        }

        if let Some(table) = cfg.route_table() {
            for ip in addrs.addrs() {
                for spec in [
                    RuleSpec::to_container(ip),
                    RuleSpec::from_container(ip, &cfg.host_link_name, Some(table)),
                ] {
                    if host.rules.find(&spec).await?.len() != 1 {
                        return Err(DatapathError::not_found(format!("rule {spec}")));
                    }
                }
            }
        }
        Ok(())
    }
}

fn expect_mtu(name: &str, actual: Option<u32>, wanted: u32) -> Result<()> {
    match actual {
        Some(mtu) if mtu == wanted => Ok(()),
        Some(mtu) => Err(DatapathError::Validation(format!(
            "link {name} has mtu {mtu}, want {wanted}"
        ))),
        None => Err(DatapathError::not_found(format!("mtu of {name}"))),
    }
}

/// Synthetic gateways a pod with `addrs` routes through.
pub fn synthetic_gateways(addrs: &IpNetSet) -> IpSet {
    IpSet::new(
        addrs.ipv4.map(|_| route::SYNTHETIC_GATEWAY_V4),
        addrs.ipv6.map(|_| SYNTHETIC_GATEWAY_V6),
    )
}
