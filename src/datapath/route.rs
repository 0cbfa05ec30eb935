//! Routes on both sides of the veth pair.
//!
//! The container never sees the real subnet gateway: its default route
//! points at a fixed link-local next hop that the host answers for. The
//! host in turn pins each pod address to its veth with a full-length route
//! in the main table.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteScope};
use rtnetlink::{Handle, IpVersion, RouteMessageBuilder};
use tracing::debug;

use super::error::{ignore_not_found, DatapathError, ErrorKind, Result};
use super::rule::MAIN_TABLE;
use crate::types::host_prefix;

/// Next hop of every container's IPv4 default route.
pub const SYNTHETIC_GATEWAY_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);
/// Next hop of every container's IPv6 default route.
pub const SYNTHETIC_GATEWAY_V6: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

/// The synthetic gateway of `ip`'s family.
pub fn synthetic_gateway(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(SYNTHETIC_GATEWAY_V4),
        IpAddr::V6(_) => IpAddr::V6(SYNTHETIC_GATEWAY_V6),
    }
}

/// Destination prefix of a route; `None` for a default route.
pub fn route_dst(msg: &RouteMessage) -> Option<IpNetwork> {
    let len = msg.header.destination_prefix_length;
    msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(RouteAddress::Inet(ip)) => {
            IpNetwork::new(IpAddr::V4(*ip), len).ok()
        }
        RouteAttribute::Destination(RouteAddress::Inet6(ip)) => {
            IpNetwork::new(IpAddr::V6(*ip), len).ok()
        }
        _ => None,
    })
}

pub fn route_gateway(msg: &RouteMessage) -> Option<IpAddr> {
    msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
        RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
        _ => None,
    })
}

pub fn route_oif(msg: &RouteMessage) -> Option<u32> {
    msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

pub fn route_table(msg: &RouteMessage) -> u32 {
    msg.attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(u32::from(msg.header.table))
}

pub fn is_default_route(msg: &RouteMessage) -> bool {
    msg.header.destination_prefix_length == 0
}

/// A route to install or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    /// `None` is a default route of the gateway's family.
    pub dst: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub oif: u32,
    pub table: u32,
    pub scope: RouteScope,
}

impl RouteSpec {
    /// Directly connected route: `dst dev <oif> scope link`.
    pub fn link(dst: IpNetwork, oif: u32, table: u32) -> Self {
        Self {
            dst: Some(dst),
            gateway: None,
            oif,
            table,
            scope: RouteScope::Link,
        }
    }

    /// `dst via gateway dev <oif>`.
    pub fn via(dst: IpNetwork, gateway: IpAddr, oif: u32, table: u32) -> Self {
        Self {
            dst: Some(dst),
            gateway: Some(gateway),
            oif,
            table,
            scope: RouteScope::Universe,
        }
    }

    /// `default via gateway dev <oif>`.
    pub fn default_via(gateway: IpAddr, oif: u32, table: u32) -> Self {
        Self {
            dst: None,
            gateway: Some(gateway),
            oif,
            table,
            scope: RouteScope::Universe,
        }
    }

    fn is_ipv6(&self) -> bool {
        match (self.dst, self.gateway) {
            (Some(dst), _) => dst.is_ipv6(),
            (None, Some(gw)) => gw.is_ipv6(),
            (None, None) => false,
        }
    }

    pub fn build(&self) -> Result<RouteMessage> {
        if self.dst.is_none() && self.gateway.is_none() {
            return Err(DatapathError::Validation(format!(
                "route {self}: default route needs a gateway"
            )));
        }
        let msg = if self.is_ipv6() {
            let mut builder = RouteMessageBuilder::<Ipv6Addr>::new();
            match self.dst {
                Some(IpNetwork::V6(dst)) => {
                    builder = builder.destination_prefix(dst.network(), dst.prefix())
                }
                Some(IpNetwork::V4(_)) => return Err(self.family_mismatch()),
                None => {}
            }
            match self.gateway {
                Some(IpAddr::V6(gw)) => builder = builder.gateway(gw),
                Some(IpAddr::V4(_)) => return Err(self.family_mismatch()),
                None => {}
            }
            builder
                .output_interface(self.oif)
                .table_id(self.table)
                .scope(self.scope)
                .build()
        } else {
            let mut builder = RouteMessageBuilder::<Ipv4Addr>::new();
            match self.dst {
                Some(IpNetwork::V4(dst)) => {
                    builder = builder.destination_prefix(dst.network(), dst.prefix())
                }
                Some(IpNetwork::V6(_)) => return Err(self.family_mismatch()),
                None => {}
            }
            match self.gateway {
                Some(IpAddr::V4(gw)) => builder = builder.gateway(gw),
                Some(IpAddr::V6(_)) => return Err(self.family_mismatch()),
                None => {}
            }
            builder
                .output_interface(self.oif)
                .table_id(self.table)
                .scope(self.scope)
                .build()
        };
        Ok(msg)
    }

    fn family_mismatch(&self) -> DatapathError {
        DatapathError::Validation(format!("route {self}: gateway family differs from destination"))
    }
}

impl std::fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{dst}")?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {} table {}", self.oif, self.table)
    }
}

/// RouteManager
#[derive(Clone)]
pub struct RouteManager {
    handle: Handle,
}

impl RouteManager {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub async fn list(&self, version: IpVersion) -> Result<Vec<RouteMessage>> {
        let filter = match version {
            IpVersion::V4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            IpVersion::V6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        self.handle
            .route()
            .get(filter)
            .execute()
            .try_collect()
            .await
            .map_err(|e| DatapathError::from_netlink("list routes", "route list", e))
    }

    /// Install `spec`; an identical route already in place is success.
    pub async fn add(&self, spec: &RouteSpec) -> Result<()> {
        debug!(route = %spec, "adding route");
        let res = self
            .handle
            .route()
            .add(spec.build()?)
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("add route", &format!("route {spec}"), e));
        match res {
            Err(err) if err.kind() == ErrorKind::Conflict => Ok(()),
            other => other,
        }
    }

    /// Install `spec`, overwriting any route to the same destination.
    pub async fn replace(&self, spec: &RouteSpec) -> Result<()> {
        debug!(route = %spec, "replacing route");
        self.handle
            .route()
            .add(spec.build()?)
            .replace()
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("replace route", &format!("route {spec}"), e))
    }

    /// Delete `spec`; returns whether a route was removed.
    pub async fn remove(&self, spec: &RouteSpec) -> Result<bool> {
        let res = self
            .handle
            .route()
            .del(spec.build()?)
            .execute()
            .await
            .map(|()| true)
            .map_err(|e| DatapathError::from_netlink("delete route", &format!("route {spec}"), e));
        ignore_not_found(res)
    }

    /// Container side: default route through the synthetic gateway of
    /// `family_of`'s family over link `oif`.
    pub async fn add_synthetic_default(&self, family_of: &IpAddr, oif: u32) -> Result<()> {
        let gateway = synthetic_gateway(family_of);
        if gateway.is_ipv4() {
            // The gateway is not on any subnet of the container; make it
            // directly reachable first.
            self.add(&RouteSpec::link(host_prefix(gateway), oif, MAIN_TABLE))
                .await?;
        }
        self.add(&RouteSpec::default_via(gateway, oif, MAIN_TABLE))
            .await
    }

    /// Container side: `dst via <synthetic gateway> dev <oif>`.
    pub async fn add_via_synthetic(&self, dst: IpNetwork, oif: u32) -> Result<()> {
        let gateway = synthetic_gateway(&dst.ip());
        self.add(&RouteSpec::via(dst, gateway, oif, MAIN_TABLE))
            .await
    }

    /// Host side: pin `ip` to the pod's veth.
    pub async fn add_host_route(&self, ip: IpAddr, oif: u32) -> Result<()> {
        self.replace(&RouteSpec::link(host_prefix(ip), oif, MAIN_TABLE))
            .await
    }

    pub async fn remove_host_route(&self, ip: IpAddr, oif: u32) -> Result<bool> {
        self.remove(&RouteSpec::link(host_prefix(ip), oif, MAIN_TABLE))
            .await
    }

    /// Full-length main-table destinations routed out of link `oif`.
    pub async fn host_route_targets(&self, oif: u32) -> Result<Vec<IpAddr>> {
        let mut targets = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            for msg in self.list(version).await? {
                if route_oif(&msg) != Some(oif) || route_table(&msg) != MAIN_TABLE {
                    continue;
                }
                if let Some(dst) = route_dst(&msg) {
                    if dst.prefix() == host_prefix(dst.ip()).prefix() {
                        targets.push(dst.ip());
                    }
                }
            }
        }
        Ok(targets)
    }

    /// Per-ENI table: `gw dev <eni> scope link` then `default via gw dev <eni>`.
    pub async fn ensure_table_default(&self, gateway: IpAddr, oif: u32, table: u32) -> Result<()> {
        self.add(&RouteSpec::link(host_prefix(gateway), oif, table))
            .await?;
        self.add(&RouteSpec::default_via(gateway, oif, table)).await
    }

    /// Main-table default routes of one family.
    pub async fn default_routes(&self, version: IpVersion) -> Result<Vec<RouteMessage>> {
        Ok(self
            .list(version)
            .await?
            .into_iter()
            .filter(|msg| is_default_route(msg) && route_table(msg) == MAIN_TABLE)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_gateway_follows_family() {
        let v4: IpAddr = "169.10.0.10".parse().unwrap();
        let v6: IpAddr = "fd00::10".parse().unwrap();
        assert_eq!(synthetic_gateway(&v4).to_string(), "169.254.1.1");
        assert_eq!(synthetic_gateway(&v6).to_string(), "fe80::1");
    }

    #[test]
    fn default_route_has_no_destination() {
        let spec = RouteSpec::default_via(IpAddr::V4(SYNTHETIC_GATEWAY_V4), 3, MAIN_TABLE);
        let msg = spec.build().unwrap();
        assert!(is_default_route(&msg));
        assert_eq!(route_dst(&msg), None);
        assert_eq!(route_gateway(&msg), Some(IpAddr::V4(SYNTHETIC_GATEWAY_V4)));
        assert_eq!(route_oif(&msg), Some(3));
        assert_eq!(route_table(&msg), MAIN_TABLE);
        assert_eq!(spec.to_string(), "default via 169.254.1.1 dev 3 table 254");
    }

    #[test]
    fn host_route_is_full_length_and_link_scoped() {
        let ip: IpAddr = "169.10.0.10".parse().unwrap();
        let spec = RouteSpec::link(host_prefix(ip), 7, MAIN_TABLE);
        let msg = spec.build().unwrap();
        assert_eq!(route_dst(&msg).unwrap().to_string(), "169.10.0.10/32");
        assert_eq!(msg.header.scope, RouteScope::Link);
        assert_eq!(route_gateway(&msg), None);
    }

    #[test]
    fn eni_table_id_is_kept() {
        let gw: IpAddr = "fd00::1".parse().unwrap();
        let spec = RouteSpec::default_via(gw, 4, 1004);
        let msg = spec.build().unwrap();
        assert_eq!(route_table(&msg), 1004);
        assert_eq!(route_gateway(&msg), Some(gw));
    }

    #[test]
    fn mixed_families_are_rejected() {
        let spec = RouteSpec::via(
            "10.0.0.0/8".parse().unwrap(),
            IpAddr::V6(SYNTHETIC_GATEWAY_V6),
            1,
            MAIN_TABLE,
        );
        assert!(spec.build().is_err());
    }

    #[test]
    fn destination_is_masked_to_network() {
        let spec = RouteSpec::via(
            "10.96.3.4/12".parse().unwrap(),
            IpAddr::V4(SYNTHETIC_GATEWAY_V4),
            1,
            MAIN_TABLE,
        );
        let msg = spec.build().unwrap();
        assert_eq!(route_dst(&msg).unwrap().to_string(), "10.96.0.0/12");
    }
}
