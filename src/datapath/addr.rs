//! Address assignment and convergence checks.

use std::net::IpAddr;
use std::time::Duration;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::Handle;
use tracing::debug;

use super::error::{DatapathError, ErrorKind, Result};
use crate::types::IpNetSet;

const VISIBILITY_ATTEMPTS: u32 = 5;
const VISIBILITY_PAUSE: Duration = Duration::from_millis(20);

/// The local address carried by an address message.
///
/// IPv4 puts the interface's own address in `IFA_LOCAL` (`IFA_ADDRESS` is
/// the peer on point-to-point links); IPv6 only sends `IFA_ADDRESS`.
pub fn address_ip(msg: &AddressMessage) -> Option<IpAddr> {
    let local = msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Local(ip) => Some(*ip),
        _ => None,
    });
    local.or_else(|| {
        msg.attributes.iter().find_map(|attr| match attr {
            AddressAttribute::Address(ip) => Some(*ip),
            _ => None,
        })
    })
}

/// IPv6 link-local addresses (`fe80::/10`) may sit on any number of links
/// at once.
pub fn is_link_scoped(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    }
}

/// AddressConfigurator
#[derive(Clone)]
pub struct AddressConfigurator {
    handle: Handle,
}

impl AddressConfigurator {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Addresses installed in the namespace, optionally only on one link.
    pub async fn list(&self, index: Option<u32>) -> Result<Vec<AddressMessage>> {
        let mut req = self.handle.address().get();
        if let Some(index) = index {
            req = req.set_link_index_filter(index);
        }
        req.execute()
            .try_collect()
            .await
            .map_err(|e| DatapathError::from_netlink("list addresses", "address list", e))
    }

    pub async fn addresses(&self, index: u32) -> Result<Vec<IpAddr>> {
        Ok(self
            .list(Some(index))
            .await?
            .iter()
            .filter(|msg| msg.header.index == index)
            .filter_map(address_ip)
            .collect())
    }

    /// Add every prefix in `set` to link `index`.
    pub async fn assign(&self, index: u32, set: &IpNetSet) -> Result<()> {
        for net in set.networks() {
            self.assign_one(index, net).await?;
        }
        Ok(())
    }

    /// Add one prefix. Already present on the same link is success, present
    /// on another link is a conflict. Link-local addresses are only looked
    /// up on `index` itself.
    pub async fn assign_one(&self, index: u32, net: IpNetwork) -> Result<()> {
        let scope = is_link_scoped(&net.ip()).then_some(index);
        let existing = self.list(scope).await?;
        if let Some(owner) = existing
            .iter()
            .filter(|msg| scope.map_or(true, |index| msg.header.index == index))
            .find(|msg| address_ip(msg) == Some(net.ip()))
        {
            if owner.header.index == index {
                debug!(address = %net, index, "address already assigned");
                return Ok(());
            }
            return Err(DatapathError::conflict(format!(
                "address {} (on ifindex {})",
                net.ip(),
                owner.header.index
            )));
        }

        debug!(address = %net, index, "assigning address");
        match self
            .handle
            .address()
            .add(index, net.ip(), net.prefix())
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("add address", &format!("address {net}"), e))
        {
            Err(err) if err.kind() == ErrorKind::Conflict => Ok(()),
            other => other,
        }
    }

    /// Whether every address in `set` is currently installed on link `index`.
    pub async fn verify(&self, index: u32, set: &IpNetSet) -> Result<bool> {
        let installed = self.addresses(index).await?;
        Ok(set.addrs().all(|ip| installed.contains(&ip)))
    }

    /// Poll [`verify`](Self::verify) briefly; fail instead of waiting forever
    /// if the kernel never reports the addresses.
    pub async fn wait_visible(&self, index: u32, set: &IpNetSet) -> Result<()> {
        for attempt in 1..=VISIBILITY_ATTEMPTS {
            if self.verify(index, set).await? {
                return Ok(());
            }
            debug!(index, attempt, "addresses not visible yet");
            tokio::time::sleep(VISIBILITY_PAUSE).await;
        }
        Err(DatapathError::Io {
            op: format!("assign addresses to ifindex {index}"),
            reason: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "addresses not visible after assignment",
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn local_wins_over_peer_address() {
        let mut msg = AddressMessage::default();
        msg.attributes
            .push(AddressAttribute::Address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        msg.attributes
            .push(AddressAttribute::Local(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(address_ip(&msg), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn ipv6_uses_address_attribute() {
        let v6: IpAddr = "fd00::10".parse().unwrap();
        let mut msg = AddressMessage::default();
        msg.attributes.push(AddressAttribute::Address(v6));
        assert_eq!(address_ip(&msg), Some(v6));
        assert_eq!(address_ip(&AddressMessage::default()), None);
    }

    #[test]
    fn only_ipv6_link_local_is_link_scoped() {
        for ip in ["fe80::1", "fe80::abcd:1", "febf::1"] {
            assert!(is_link_scoped(&ip.parse().unwrap()), "{ip}");
        }
        for ip in ["fd00::1", "fec0::1", "::1", "169.254.1.1", "10.0.0.1"] {
            assert!(!is_link_scoped(&ip.parse().unwrap()), "{ip}");
        }
    }
}
