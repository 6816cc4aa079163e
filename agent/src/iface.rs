// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Discovery of the external (underlay) interface: the device carrying the
//! default route, and its IPv4 address.

use crate::AgentError;
use futures::TryStreamExt;
use interface_manager::Manager;
use interface_manager::interface::{AddrKernel, Device, DeviceAddress, VtepKernel};
use rtnetlink::RouteMessageBuilder;
use rtnetlink::packet_route::route::RouteAttribute;
use std::net::Ipv4Addr;
use tracing::info;

/// The interface the agent encapsulates through, plus the address peers will
/// be told to send to.
#[derive(Clone, Debug)]
pub(crate) struct ExternalInterface {
    /// The observed link (index, name, MTU).
    pub device: Device,
    /// The interface's IPv4 address, also used as the agent's public IP.
    pub addr: Ipv4Addr,
}

/// Find the default-route interface and its IPv4 address.
pub(crate) async fn lookup_external_interface(
    handle: &rtnetlink::Handle,
    links: &Manager<Device>,
    addrs: &Manager<DeviceAddress>,
) -> Result<ExternalInterface, AgentError> {
    info!("determining IP address of default interface");
    let index = default_route_interface(handle).await?;
    let device = links
        .observe_index(index)
        .await?
        .ok_or(AgentError::LinkNotFound { index })?;
    let addr = interface_ip4_addr(addrs, index).await?;
    info!(
        "using interface with name {name} and address {addr}",
        name = device.name
    );
    if device.mtu == 0 {
        return Err(AgentError::UnknownMtu {
            name: device.name.clone(),
        });
    }
    Ok(ExternalInterface { device, addr })
}

/// The interface index of the first IPv4 default route.
async fn default_route_interface(handle: &rtnetlink::Handle) -> Result<u32, AgentError> {
    let mut routes = handle
        .route()
        .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
        .execute();
    while let Some(route) = routes.try_next().await? {
        if route.header.destination_prefix_length != 0 {
            continue;
        }
        for attribute in &route.attributes {
            if let RouteAttribute::Oif(index) = attribute {
                return Ok(*index);
            }
        }
        return Err(AgentError::DefaultRouteWithoutInterface);
    }
    Err(AgentError::NoDefaultRoute)
}

/// The interface's IPv4 address, preferring global unicast over link-local.
async fn interface_ip4_addr(
    addrs: &Manager<DeviceAddress>,
    index: u32,
) -> Result<Ipv4Addr, AgentError> {
    let mut link_local = None;
    for assigned in addrs.list(index).await? {
        if is_global_unicast(assigned.addr) {
            return Ok(assigned.addr);
        }
        if assigned.addr.is_link_local() {
            link_local = Some(assigned.addr);
        }
    }
    // didn't find global but found link-local. it'll do.
    link_local.ok_or(AgentError::NoInterfaceAddress { index })
}

fn is_global_unicast(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        || addr.is_link_local()
        || addr.is_broadcast())
}

#[cfg(test)]
mod tests {
    use super::is_global_unicast;
    use std::net::Ipv4Addr;

    #[test]
    fn global_unicast_excludes_special_ranges() {
        assert!(is_global_unicast(Ipv4Addr::new(192, 0, 2, 10)));
        assert!(is_global_unicast(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(!is_global_unicast(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(169, 254, 3, 4)));
        assert!(!is_global_unicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(255, 255, 255, 255)));
    }
}
