//! Veth pair lifecycle.

use std::os::fd::AsRawFd;

use futures::TryStreamExt;
use rtnetlink::packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use rtnetlink::{Handle, LinkUnspec, LinkVeth};
use tracing::{debug, warn};

use super::error::{ignore_not_found, DatapathError, Result};
use crate::netns::NetNs;

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_IFNAME_LEN: usize = 15;

pub fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

pub fn link_mtu(link: &LinkMessage) -> Option<u32> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Mtu(mtu) => Some(*mtu),
        _ => None,
    })
}

pub fn link_mac(link: &LinkMessage) -> Option<&[u8]> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(mac) => Some(mac.as_slice()),
        _ => None,
    })
}

pub fn link_is_up(link: &LinkMessage) -> bool {
    link.header.flags.contains(LinkFlags::Up)
}

/// `aa:bb:cc:dd:ee:ff`
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// LinkPairManager
///
/// Operates on links of the namespace its handle is bound to.
#[derive(Clone)]
pub struct LinkPairManager {
    handle: Handle,
}

impl LinkPairManager {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Look a link up by name; `None` when it does not exist.
    pub async fn get(&self, name: &str) -> Result<Option<LinkMessage>> {
        let res = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|e| DatapathError::from_netlink("get link", name, e));
        ignore_not_found(res)
    }

    pub async fn get_by_index(&self, index: u32) -> Result<Option<LinkMessage>> {
        let res = self
            .handle
            .link()
            .get()
            .match_index(index)
            .execute()
            .try_next()
            .await
            .map_err(|e| DatapathError::from_netlink("get link", &format!("ifindex {index}"), e));
        ignore_not_found(res)
    }

    /// Interface index of the link whose hardware address is `mac`.
    pub async fn index_by_mac(&self, mac: &str) -> Result<u32> {
        let wanted = mac.to_ascii_lowercase();
        let links: Vec<LinkMessage> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| DatapathError::from_netlink("list links", "link list", e))?;
        links
            .iter()
            .find(|link| link_mac(link).is_some_and(|m| format_mac(m) == wanted))
            .map(|link| link.header.index)
            .ok_or_else(|| DatapathError::not_found(format!("link with mac {mac}")))
    }

    /// Create `host_name` and its peer `peer_name`, both with `mtu`.
    ///
    /// Either both links exist afterwards and are returned, or neither does.
    pub async fn create_pair(
        &self,
        host_name: &str,
        peer_name: &str,
        mtu: u32,
    ) -> Result<(LinkMessage, LinkMessage)> {
        if self.get(host_name).await?.is_some() {
            return Err(DatapathError::conflict(format!("link {host_name}")));
        }

        debug!(host = host_name, peer = peer_name, mtu, "creating veth pair");
        self.handle
            .link()
            .add(LinkVeth::new(host_name, peer_name).mtu(mtu).build())
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("add veth", &format!("link {host_name}"), e))?;

        match self.finish_pair(host_name, peer_name, mtu).await {
            Ok(pair) => Ok(pair),
            Err(err) => {
                if let Err(cleanup) = self.destroy(host_name).await {
                    warn!(host = host_name, error = %cleanup, "failed to remove half-built veth pair");
                }
                Err(err)
            }
        }
    }

    async fn finish_pair(
        &self,
        host_name: &str,
        peer_name: &str,
        mtu: u32,
    ) -> Result<(LinkMessage, LinkMessage)> {
        let host = self.must_get(host_name).await?;
        let peer = self.must_get(peer_name).await?;
        if link_mtu(&peer) != Some(mtu) {
            self.set_mtu(peer.header.index, mtu).await?;
        }
        Ok((host, peer))
    }

    async fn must_get(&self, name: &str) -> Result<LinkMessage> {
        self.get(name)
            .await?
            .ok_or_else(|| DatapathError::not_found(format!("link {name}")))
    }

    /// Move a link into `ns`. The index is meaningless afterwards.
    pub async fn move_to_namespace(&self, index: u32, ns: &NetNs) -> Result<()> {
        debug!(index, netns = %ns.path().display(), "moving link");
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .setns_by_fd(ns.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("move link", &format!("ifindex {index}"), e))
    }

    pub async fn rename(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).name(name.to_string()).build())
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("rename link", &format!("link {name}"), e))
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("set mtu", &format!("ifindex {index}"), e))
    }

    pub async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| DatapathError::from_netlink("set link up", &format!("ifindex {index}"), e))
    }

    /// Delete a link by name. The kernel removes a veth peer together with
    /// it. Returns whether anything was deleted.
    pub async fn destroy(&self, name: &str) -> Result<bool> {
        let Some(link) = self.get(name).await? else {
            debug!(link = name, "link already absent");
            return Ok(false);
        };
        let res = self
            .handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .map(|()| true)
            .map_err(|e| DatapathError::from_netlink("delete link", &format!("link {name}"), e));
        ignore_not_found(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_lowercase_colon_separated() {
        assert_eq!(
            format_mac(&[0x02, 0xAB, 0x00, 0x10, 0xff, 0x7]),
            "02:ab:00:10:ff:07"
        );
        assert_eq!(format_mac(&[]), "");
    }

    #[test]
    fn attributes_are_read_from_message() {
        let mut link = LinkMessage::default();
        link.header.index = 9;
        link.header.flags = LinkFlags::Up;
        link.attributes.push(LinkAttribute::IfName("veth1".to_string()));
        link.attributes.push(LinkAttribute::Mtu(1499));
        link.attributes
            .push(LinkAttribute::Address(vec![2, 0, 0, 0, 0, 1]));

        assert_eq!(link_name(&link), Some("veth1"));
        assert_eq!(link_mtu(&link), Some(1499));
        assert_eq!(link_mac(&link), Some(&[2u8, 0, 0, 0, 0, 1][..]));
        assert!(link_is_up(&link));

        link.header.flags = LinkFlags::empty();
        assert!(!link_is_up(&link));
    }
}
