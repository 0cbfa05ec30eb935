//! Policy routing rules at the two fixed priority bands.
//!
//! Pods behind a secondary ENI get two rules per address family:
//!
//! ```text
//! 512:  from all to <pod>/32 lookup main
//! 2048: from <pod>/32 iif <host veth> lookup <1000 + eni index>
//! ```
//!
//! Rules are always matched field by field before deletion, never by
//! priority alone, so rules owned by other pods or other software at the
//! same priority are left alone.

use std::net::IpAddr;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, IpVersion};
use tracing::debug;

use super::error::{ignore_not_found, DatapathError, ErrorKind, Result};
use crate::types::host_prefix;

/// Priority of the rule that sends traffic for a pod through the main table.
pub const TO_CONTAINER_PRIORITY: u32 = 512;
/// Priority of the rule that sends traffic from a pod to its ENI table.
pub const FROM_CONTAINER_PRIORITY: u32 = 2048;
/// Route table ids for ENIs start here.
pub const ROUTE_TABLE_OFFSET: u32 = 1000;
/// `RT_TABLE_MAIN`
pub const MAIN_TABLE: u32 = 254;

/// Largest ENI index with a table; kernel ifindexes are positive `int`s.
pub const MAX_ENI_INDEX: u32 = i32::MAX as u32;

/// Route table for the ENI with interface index `eni_index`.
///
/// Pure and injective over `0..=MAX_ENI_INDEX`, so a restarted plugin
/// derives the same table without persisted state. Callers pass a
/// validated index; use [`checked_route_table_id`] for raw input.
pub const fn route_table_id(eni_index: u32) -> u32 {
    ROUTE_TABLE_OFFSET + eni_index
}

/// [`route_table_id`], or `None` for an index no kernel link can have.
pub const fn checked_route_table_id(eni_index: u32) -> Option<u32> {
    if eni_index > MAX_ENI_INDEX {
        None
    } else {
        Some(ROUTE_TABLE_OFFSET + eni_index)
    }
}

/// One policy rule, as installed or as matched for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub priority: u32,
    /// `None` matches any table; installs fall back to main.
    pub table: Option<u32>,
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub iif: Option<String>,
}

impl RuleSpec {
    /// `to <ip> lookup main` at [`TO_CONTAINER_PRIORITY`].
    pub fn to_container(ip: IpAddr) -> Self {
        Self {
            priority: TO_CONTAINER_PRIORITY,
            table: Some(MAIN_TABLE),
            src: None,
            dst: Some(host_prefix(ip)),
            iif: None,
        }
    }

    /// `from <ip> iif <host_link> lookup <table>` at [`FROM_CONTAINER_PRIORITY`].
    pub fn from_container(ip: IpAddr, host_link: &str, table: Option<u32>) -> Self {
        Self {
            priority: FROM_CONTAINER_PRIORITY,
            table,
            src: Some(host_prefix(ip)),
            dst: None,
            iif: Some(host_link.to_string()),
        }
    }

    fn is_ipv6(&self) -> bool {
        self.src
            .or(self.dst)
            .is_some_and(|net| matches!(net, IpNetwork::V6(_)))
    }

    pub fn ip_version(&self) -> IpVersion {
        if self.is_ipv6() {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }

    /// Exact comparison against a kernel rule.
    pub fn matches(&self, msg: &RuleMessage) -> bool {
        let family = if self.is_ipv6() {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        if msg.header.family != family || rule_priority(msg) != self.priority {
            return false;
        }
        if let Some(table) = self.table {
            if rule_table(msg) != table {
                return false;
            }
        }
        rule_src(msg) == self.src
            && rule_dst(msg) == self.dst
            && rule_iif(msg) == self.iif.as_deref()
    }
}

impl std::fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.priority)?;
        match self.src {
            Some(src) => write!(f, " from {src}")?,
            None => write!(f, " from all")?,
        }
        if let Some(dst) = self.dst {
            write!(f, " to {dst}")?;
        }
        if let Some(iif) = &self.iif {
            write!(f, " iif {iif}")?;
        }
        match self.table {
            Some(table) => write!(f, " lookup {table}"),
            None => write!(f, " lookup *"),
        }
    }
}

pub fn rule_priority(msg: &RuleMessage) -> u32 {
    msg.attributes
        .iter()
        .find_map(|attr| match attr {
            RuleAttribute::Priority(p) => Some(*p),
            _ => None,
        })
        .unwrap_or(0)
}

pub fn rule_table(msg: &RuleMessage) -> u32 {
    msg.attributes
        .iter()
        .find_map(|attr| match attr {
            RuleAttribute::Table(t) => Some(*t),
            _ => None,
        })
        .unwrap_or(u32::from(msg.header.table))
}

pub fn rule_src(msg: &RuleMessage) -> Option<IpNetwork> {
    msg.attributes.iter().find_map(|attr| match attr {
        RuleAttribute::Source(ip) => IpNetwork::new(*ip, msg.header.src_len).ok(),
        _ => None,
    })
}

pub fn rule_dst(msg: &RuleMessage) -> Option<IpNetwork> {
    msg.attributes.iter().find_map(|attr| match attr {
        RuleAttribute::Destination(ip) => IpNetwork::new(*ip, msg.header.dst_len).ok(),
        _ => None,
    })
}

pub fn rule_iif(msg: &RuleMessage) -> Option<&str> {
    msg.attributes.iter().find_map(|attr| match attr {
        RuleAttribute::Iifname(name) => Some(name.as_str()),
        _ => None,
    })
}

/// PriorityRuleManager
#[derive(Clone)]
pub struct PriorityRuleManager {
    handle: Handle,
}

impl PriorityRuleManager {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub async fn list(&self, version: IpVersion) -> Result<Vec<RuleMessage>> {
        self.handle
            .rule()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(|e| DatapathError::from_netlink("list rules", "rule list", e))
    }

    /// Kernel rules exactly matching `spec`.
    pub async fn find(&self, spec: &RuleSpec) -> Result<Vec<RuleMessage>> {
        let rules = self.list(spec.ip_version()).await?;
        Ok(rules.into_iter().filter(|msg| spec.matches(msg)).collect())
    }

    /// Install `spec` unless an identical rule is already there.
    ///
    /// Returns whether a rule was added.
    pub async fn ensure(&self, spec: &RuleSpec) -> Result<bool> {
        if !self.find(spec).await?.is_empty() {
            debug!(rule = %spec, "rule already present");
            return Ok(false);
        }

        let table = spec.table.unwrap_or(MAIN_TABLE);
        let req = self
            .handle
            .rule()
            .add()
            .priority(spec.priority)
            .table_id(table)
            .action(RuleAction::ToTable);
        let req = match &spec.iif {
            Some(iif) => req.input_interface(iif.clone()),
            None => req,
        };

        let res = match (spec.src, spec.dst) {
            (Some(IpNetwork::V4(src)), None) => {
                req.v4().source_prefix(src.ip(), src.prefix()).execute().await
            }
            (None, Some(IpNetwork::V4(dst))) => {
                req.v4()
                    .destination_prefix(dst.ip(), dst.prefix())
                    .execute()
                    .await
            }
            (Some(IpNetwork::V6(src)), None) => {
                req.v6().source_prefix(src.ip(), src.prefix()).execute().await
            }
            (None, Some(IpNetwork::V6(dst))) => {
                req.v6()
                    .destination_prefix(dst.ip(), dst.prefix())
                    .execute()
                    .await
            }
            _ => {
                return Err(DatapathError::Validation(format!(
                    "rule {spec} must match exactly one of source or destination"
                )))
            }
        };

        match res.map_err(|e| DatapathError::from_netlink("add rule", &spec.to_string(), e)) {
            Ok(()) => {
                debug!(rule = %spec, "rule added");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::Conflict => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Delete every kernel rule exactly matching `spec`. Absent rules are fine.
    pub async fn remove(&self, spec: &RuleSpec) -> Result<usize> {
        let mut removed = 0;
        for msg in self.find(spec).await? {
            let res = self
                .handle
                .rule()
                .del(msg)
                .execute()
                .await
                .map(|()| 1)
                .map_err(|e| DatapathError::from_netlink("delete rule", &spec.to_string(), e));
            removed += ignore_not_found(res)?;
        }
        if removed > 0 {
            debug!(rule = %spec, removed, "rule removed");
        }
        Ok(removed)
    }

    /// Source addresses of from-container rules entering through `host_link`.
    pub async fn pod_sources(&self, host_link: &str) -> Result<Vec<IpAddr>> {
        let mut sources = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            for msg in self.list(version).await? {
                if rule_priority(&msg) != FROM_CONTAINER_PRIORITY
                    || rule_iif(&msg) != Some(host_link)
                {
                    continue;
                }
                if let Some(src) = rule_src(&msg) {
                    if src.prefix() == full_length(&src.ip()) {
                        sources.push(src.ip());
                    }
                }
            }
        }
        Ok(sources)
    }
}

fn full_length(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        family: AddressFamily,
        priority: u32,
        table: u32,
        src: Option<(IpAddr, u8)>,
        dst: Option<(IpAddr, u8)>,
        iif: Option<&str>,
    ) -> RuleMessage {
        let mut msg = RuleMessage::default();
        msg.header.family = family;
        msg.header.action = RuleAction::ToTable;
        msg.attributes.push(RuleAttribute::Priority(priority));
        msg.attributes.push(RuleAttribute::Table(table));
        if let Some((ip, len)) = src {
            msg.header.src_len = len;
            msg.attributes.push(RuleAttribute::Source(ip));
        }
        if let Some((ip, len)) = dst {
            msg.header.dst_len = len;
            msg.attributes.push(RuleAttribute::Destination(ip));
        }
        if let Some(iif) = iif {
            msg.attributes.push(RuleAttribute::Iifname(iif.to_string()));
        }
        msg
    }

    fn pod() -> IpAddr {
        "169.10.0.10".parse().unwrap()
    }

    #[test]
    fn table_id_is_offset_and_injective() {
        assert_eq!(route_table_id(0), 1000);
        assert_eq!(route_table_id(7), route_table_id(7));
        assert_ne!(route_table_id(7), route_table_id(8));
        assert_eq!(route_table_id(MAX_ENI_INDEX), 1000 + i32::MAX as u32);
    }

    #[test]
    fn table_id_rejects_out_of_range_index() {
        assert_eq!(checked_route_table_id(4), Some(1004));
        assert_eq!(checked_route_table_id(MAX_ENI_INDEX), Some(route_table_id(MAX_ENI_INDEX)));
        assert_eq!(checked_route_table_id(MAX_ENI_INDEX + 1), None);
        assert_eq!(checked_route_table_id(u32::MAX), None);
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(TO_CONTAINER_PRIORITY < FROM_CONTAINER_PRIORITY);
    }

    #[test]
    fn to_container_matches_only_its_destination() {
        let spec = RuleSpec::to_container(pod());
        let ours = rule(
            AddressFamily::Inet,
            TO_CONTAINER_PRIORITY,
            MAIN_TABLE,
            None,
            Some((pod(), 32)),
            None,
        );
        let wider = rule(
            AddressFamily::Inet,
            TO_CONTAINER_PRIORITY,
            MAIN_TABLE,
            None,
            Some((pod(), 24)),
            None,
        );
        let with_src = rule(
            AddressFamily::Inet,
            TO_CONTAINER_PRIORITY,
            MAIN_TABLE,
            Some((pod(), 32)),
            Some((pod(), 32)),
            None,
        );
        assert!(spec.matches(&ours));
        assert!(!spec.matches(&wider));
        assert!(!spec.matches(&with_src));
    }

    #[test]
    fn from_container_requires_iif_and_table() {
        let table = route_table_id(3);
        let spec = RuleSpec::from_container(pod(), "hostveth", Some(table));
        let ours = rule(
            AddressFamily::Inet,
            FROM_CONTAINER_PRIORITY,
            table,
            Some((pod(), 32)),
            None,
            Some("hostveth"),
        );
        let other_iif = rule(
            AddressFamily::Inet,
            FROM_CONTAINER_PRIORITY,
            table,
            Some((pod(), 32)),
            None,
            Some("otherveth"),
        );
        let other_table = rule(
            AddressFamily::Inet,
            FROM_CONTAINER_PRIORITY,
            route_table_id(4),
            Some((pod(), 32)),
            None,
            Some("hostveth"),
        );
        assert!(spec.matches(&ours));
        assert!(!spec.matches(&other_iif));
        assert!(!spec.matches(&other_table));

        let any_table = RuleSpec::from_container(pod(), "hostveth", None);
        assert!(any_table.matches(&other_table));
    }

    #[test]
    fn family_and_priority_must_agree() {
        let v6: IpAddr = "fd00::10".parse().unwrap();
        let spec = RuleSpec::to_container(v6);
        assert_eq!(spec.ip_version(), IpVersion::V6);
        let v6_rule = rule(
            AddressFamily::Inet6,
            TO_CONTAINER_PRIORITY,
            MAIN_TABLE,
            None,
            Some((v6, 128)),
            None,
        );
        let wrong_priority = rule(
            AddressFamily::Inet6,
            FROM_CONTAINER_PRIORITY,
            MAIN_TABLE,
            None,
            Some((v6, 128)),
            None,
        );
        assert!(spec.matches(&v6_rule));
        assert!(!spec.matches(&wrong_priority));
        assert!(!RuleSpec::to_container(pod()).matches(&v6_rule));
    }

    #[test]
    fn header_table_is_used_without_attribute() {
        let mut msg = RuleMessage::default();
        msg.header.table = 254;
        assert_eq!(rule_table(&msg), MAIN_TABLE);
        assert_eq!(rule_priority(&msg), 0);
    }

    #[test]
    fn display_reads_like_ip_rule() {
        let spec = RuleSpec::from_container(pod(), "hostveth", Some(1003));
        assert_eq!(
            spec.to_string(),
            "2048: from 169.10.0.10/32 iif hostveth lookup 1003"
        );
        assert_eq!(
            RuleSpec::to_container(pod()).to_string(),
            "512: from all to 169.10.0.10/32 lookup 254"
        );
    }
}
