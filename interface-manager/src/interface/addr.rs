// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::interface::Device;
use crate::interface::vtep::VtepKernel;
use crate::{DeviceError, Manager};
use futures::TryStreamExt;
use net::ipv4::Ip4Net;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};

use rtnetlink::packet_route::AddressFamily;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};

/// An IPv4 address as assigned to a kernel interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    /// The interface address.
    pub addr: Ipv4Addr,
    /// The prefix length of the attached subnet.
    pub prefix_len: u8,
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl From<Ip4Net> for DeviceAddress {
    fn from(value: Ip4Net) -> DeviceAddress {
        DeviceAddress {
            addr: value.ip.into(),
            prefix_len: value.prefix_len,
        }
    }
}

/// The address-level kernel operations consumed by address reconciliation.
pub trait AddrKernel {
    /// List the IPv4 addresses assigned to the link with the given index.
    fn list(&self, index: u32)
    -> impl Future<Output = Result<Vec<DeviceAddress>, DeviceError>> + Send;
    /// Assign an address to the link with the given index.
    fn add(
        &self,
        index: u32,
        addr: DeviceAddress,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
    /// Remove an address from the link with the given index.
    fn del(
        &self,
        index: u32,
        addr: DeviceAddress,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Drive `device` to a state where `want` is its one and only IPv4 address,
/// then bring the link up.
///
/// An existing address which differs from `want` is removed first (this
/// happens when the agent is restarted and draws a different subnet).
///
/// # Errors
///
/// Fails if the link carries more than one IPv4 address: the agent never
/// assigns more than one, so this can only be caused by an operator, and only
/// an operator should clean it up.  Also fails if the kernel refuses any of
/// the netlink operations.
pub async fn ensure_only_address<A, L>(
    addrs: &A,
    links: &L,
    device: &Device,
    want: DeviceAddress,
) -> Result<(), DeviceError>
where
    A: AddrKernel,
    L: VtepKernel,
{
    let existing = addrs.list(device.index).await?;
    if existing.len() > 1 {
        return Err(DeviceError::MultipleAddresses {
            name: device.name.clone(),
        });
    }
    match existing.first() {
        Some(have) if *have == want => {}
        Some(have) => {
            addrs.del(device.index, *have).await?;
            addrs.add(device.index, want).await?;
        }
        None => addrs.add(device.index, want).await?,
    }
    links.set_up(device.index).await
}

impl AddrKernel for Manager<DeviceAddress> {
    async fn list(&self, index: u32) -> Result<Vec<DeviceAddress>, DeviceError> {
        let mut addresses = Vec::new();
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(message) = messages.try_next().await? {
            if message.header.family != AddressFamily::Inet {
                continue;
            }
            for attribute in &message.attributes {
                if let AddressAttribute::Address(IpAddr::V4(addr)) = attribute {
                    addresses.push(DeviceAddress {
                        addr: *addr,
                        prefix_len: message.header.prefix_len,
                    });
                }
            }
        }
        Ok(addresses)
    }

    async fn add(&self, index: u32, addr: DeviceAddress) -> Result<(), DeviceError> {
        Ok(self
            .handle
            .address()
            .add(index, IpAddr::V4(addr.addr), addr.prefix_len)
            .execute()
            .await?)
    }

    async fn del(&self, index: u32, addr: DeviceAddress) -> Result<(), DeviceError> {
        let mut message = AddressMessage::default();
        message.header.family = AddressFamily::Inet;
        message.header.index = index;
        message.header.prefix_len = addr.prefix_len;
        message
            .attributes
            .push(AddressAttribute::Address(IpAddr::V4(addr.addr)));
        message
            .attributes
            .push(AddressAttribute::Local(IpAddr::V4(addr.addr)));
        Ok(self.handle.address().del(message).execute().await?)
    }
}
