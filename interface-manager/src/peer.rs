// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Program the kernel entries which deliver traffic to one overlay peer.
//!
//! Every peer needs three related entries on the VXLAN device: an ARP
//! neighbor for the peer subnet's gateway address, an FDB entry mapping the
//! peer's VTEP MAC to its public IP, and a unicast route for the peer's
//! subnet.  The entries are interdependent and must be installed in that
//! order: the ARP entry first so the kernel never broadcasts an ARP request
//! for the gateway, and the FDB entry before the route so the first
//! encapsulated packet already has a unicast tunnel destination.
//!
//! Peer entries are never removed.  The store's TTL eventually expires a
//! stale peer's subnet key, but the kernel entries installed for it stay
//! behind until the device itself goes away.

use crate::Manager;
use net::eth::mac::Mac;
use net::ipv4::{Ip4, Ip4Net};
use rtnetlink::RouteMessageBuilder;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
};
use rtnetlink::packet_route::route::{RouteFlags, RouteMessage, RouteType};
use std::net::{IpAddr, Ipv4Addr};
use tracing::{info, warn};

/// One remote agent, as learned from the coordination store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peer {
    /// The peer's overlay subnet.
    pub subnet: Ip4Net,
    /// The underlay address of the peer's tunnel endpoint.
    pub public_ip: Ip4,
    /// The MAC address of the peer's tunnel endpoint.
    pub mac: Mac,
}

/// The neighbor-table and route-table operations consumed by peer
/// programming.
pub trait PeerKernel {
    /// Install a permanent ARP entry on the given link.
    fn arp_set(
        &self,
        index: u32,
        ip: Ipv4Addr,
        mac: Mac,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;
    /// Remove an ARP entry installed by [`PeerKernel::arp_set`].
    fn arp_del(
        &self,
        index: u32,
        ip: Ipv4Addr,
        mac: Mac,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;
    /// Install a permanent FDB entry (family bridge, flag self) on the given link.
    fn fdb_set(
        &self,
        index: u32,
        dst: Ipv4Addr,
        mac: Mac,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;
    /// Remove an FDB entry installed by [`PeerKernel::fdb_set`].
    fn fdb_del(
        &self,
        index: u32,
        dst: Ipv4Addr,
        mac: Mac,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;
    /// Install (with replace semantics) an onlink unicast route through the given link.
    fn route_replace(
        &self,
        index: u32,
        dst: Ip4Net,
        gateway: Ipv4Addr,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;
}

/// Installs the kernel entries for discovered peers, backing out partial
/// installations when a step fails.
#[derive(Clone, Debug)]
pub struct PeerProgrammer<K> {
    kernel: K,
    vxlan_index: u32,
}

impl<K: PeerKernel> PeerProgrammer<K> {
    /// Create a [`PeerProgrammer`] which installs entries on the link with
    /// index `vxlan_index`.
    #[must_use]
    pub const fn new(kernel: K, vxlan_index: u32) -> Self {
        PeerProgrammer {
            kernel,
            vxlan_index,
        }
    }

    /// Install the ARP, FDB, and route entries for `peer`, in that order.
    ///
    /// Every step is best-effort.  On failure the entries already installed
    /// for this peer are removed again (also best-effort) and the peer is
    /// abandoned; the next full read of the store will reconsider it.
    /// Nothing is propagated to the caller so the event pipeline keeps
    /// draining.
    pub async fn add(&self, peer: &Peer) {
        let gateway = Ipv4Addr::from(peer.subnet.ip);
        let public_ip = Ipv4Addr::from(peer.public_ip);
        info!(
            "adding subnet {subnet} via {public_ip} ({mac})",
            subnet = peer.subnet,
            mac = peer.mac
        );
        if let Err(err) = self.kernel.arp_set(self.vxlan_index, gateway, peer.mac).await {
            warn!("failed to add ARP entry for {gateway}: {err}");
            return;
        }
        if let Err(err) = self
            .kernel
            .fdb_set(self.vxlan_index, public_ip, peer.mac)
            .await
        {
            warn!("failed to add FDB entry for {public_ip}: {err}");
            if let Err(err) = self.kernel.arp_del(self.vxlan_index, gateway, peer.mac).await {
                warn!("failed to roll back ARP entry for {gateway}: {err}");
            }
            return;
        }
        if let Err(err) = self
            .kernel
            .route_replace(self.vxlan_index, peer.subnet, gateway)
            .await
        {
            warn!(
                "failed to replace route to {subnet}: {err}",
                subnet = peer.subnet
            );
            if let Err(err) = self.kernel.arp_del(self.vxlan_index, gateway, peer.mac).await {
                warn!("failed to roll back ARP entry for {gateway}: {err}");
            }
            if let Err(err) = self
                .kernel
                .fdb_del(self.vxlan_index, public_ip, peer.mac)
                .await
            {
                warn!("failed to roll back FDB entry for {public_ip}: {err}");
            }
            return;
        }
        info!(
            "programmed peer subnet {subnet} via {public_ip}",
            subnet = peer.subnet
        );
    }
}

fn arp_message(index: u32, ip: Ipv4Addr, mac: Mac) -> NeighbourMessage {
    let mut message = NeighbourMessage::default();
    message.header.family = AddressFamily::Inet;
    message.header.ifindex = index;
    message.header.state = NeighbourState::Permanent;
    message.header.kind = RouteType::Unicast;
    message
        .attributes
        .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)));
    message
        .attributes
        .push(NeighbourAttribute::LinkLocalAddress(mac.0.to_vec()));
    message
}

fn fdb_message(index: u32, dst: Ipv4Addr, mac: Mac) -> NeighbourMessage {
    let mut message = NeighbourMessage::default();
    message.header.family = AddressFamily::Bridge;
    message.header.ifindex = index;
    message.header.state = NeighbourState::Permanent;
    message.header.flags = NeighbourFlags::Own;
    message
        .attributes
        .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(dst)));
    message
        .attributes
        .push(NeighbourAttribute::LinkLocalAddress(mac.0.to_vec()));
    message
}

fn peer_route(index: u32, dst: Ip4Net, gateway: Ipv4Addr) -> RouteMessage {
    let mut route = RouteMessageBuilder::<Ipv4Addr>::new()
        .destination_prefix(dst.ip.into(), dst.prefix_len)
        .gateway(gateway)
        .output_interface(index)
        .build();
    // the gateway is the peer subnet's network address and is only reachable
    // through the tunnel itself
    route.header.flags |= RouteFlags::Onlink;
    route
}

impl PeerKernel for Manager<Peer> {
    async fn arp_set(&self, index: u32, ip: Ipv4Addr, mac: Mac) -> Result<(), rtnetlink::Error> {
        self.handle
            .neighbours()
            .add(index, IpAddr::V4(ip))
            .link_local_address(&mac.0)
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await
    }

    async fn arp_del(&self, index: u32, ip: Ipv4Addr, mac: Mac) -> Result<(), rtnetlink::Error> {
        self.handle
            .neighbours()
            .del(arp_message(index, ip, mac))
            .execute()
            .await
    }

    async fn fdb_set(&self, index: u32, dst: Ipv4Addr, mac: Mac) -> Result<(), rtnetlink::Error> {
        self.handle
            .neighbours()
            .add_bridge(index, &mac.0)
            .destination(IpAddr::V4(dst))
            .state(NeighbourState::Permanent)
            .flags(NeighbourFlags::Own)
            .replace()
            .execute()
            .await
    }

    async fn fdb_del(&self, index: u32, dst: Ipv4Addr, mac: Mac) -> Result<(), rtnetlink::Error> {
        self.handle
            .neighbours()
            .del(fdb_message(index, dst, mac))
            .execute()
            .await
    }

    async fn route_replace(
        &self,
        index: u32,
        dst: Ip4Net,
        gateway: Ipv4Addr,
    ) -> Result<(), rtnetlink::Error> {
        self.handle
            .route()
            .add(peer_route(index, dst, gateway))
            .replace()
            .execute()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::{Peer, PeerKernel, PeerProgrammer};
    use net::eth::mac::Mac;
    use net::ipv4::{Ip4, Ip4Net};
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    fn peer() -> Peer {
        Peer {
            subnet: Ip4Net::new(Ip4::from_octets([10, 5, 42, 0]), 24),
            public_ip: Ip4::from_octets([192, 0, 2, 11]),
            mac: Mac([0x02, 0, 0, 0, 0, 0x0b]),
        }
    }

    #[derive(Default)]
    struct RecordingKernel {
        calls: Arc<Mutex<Vec<String>>>,
        fail_fdb_set: Mutex<bool>,
        fail_route: bool,
        fail_arp_del: bool,
    }

    impl RecordingKernel {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Arc<Mutex<Vec<String>>> {
            self.calls.clone()
        }
    }

    impl PeerKernel for RecordingKernel {
        async fn arp_set(
            &self,
            _index: u32,
            ip: Ipv4Addr,
            _mac: Mac,
        ) -> Result<(), rtnetlink::Error> {
            self.record(format!("arp_set {ip}"));
            Ok(())
        }

        async fn arp_del(
            &self,
            _index: u32,
            ip: Ipv4Addr,
            _mac: Mac,
        ) -> Result<(), rtnetlink::Error> {
            self.record(format!("arp_del {ip}"));
            if self.fail_arp_del {
                return Err(rtnetlink::Error::RequestFailed);
            }
            Ok(())
        }

        async fn fdb_set(
            &self,
            _index: u32,
            dst: Ipv4Addr,
            _mac: Mac,
        ) -> Result<(), rtnetlink::Error> {
            self.record(format!("fdb_set {dst}"));
            let mut fail = self.fail_fdb_set.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(rtnetlink::Error::RequestFailed);
            }
            Ok(())
        }

        async fn fdb_del(
            &self,
            _index: u32,
            dst: Ipv4Addr,
            _mac: Mac,
        ) -> Result<(), rtnetlink::Error> {
            self.record(format!("fdb_del {dst}"));
            Ok(())
        }

        async fn route_replace(
            &self,
            _index: u32,
            dst: Ip4Net,
            gateway: Ipv4Addr,
        ) -> Result<(), rtnetlink::Error> {
            self.record(format!("route_replace {dst} via {gateway}"));
            if self.fail_route {
                return Err(rtnetlink::Error::RequestFailed);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn installs_arp_then_fdb_then_route() {
        let kernel = RecordingKernel::default();
        let calls = kernel.calls();
        let programmer = PeerProgrammer::new(kernel, 9);
        programmer.add(&peer()).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "arp_set 10.5.42.0",
                "fdb_set 192.0.2.11",
                "route_replace 10.5.42.0/24 via 10.5.42.0",
            ]
        );
    }

    #[tokio::test]
    async fn fdb_failure_rolls_back_the_arp_entry() {
        let kernel = RecordingKernel {
            fail_fdb_set: Mutex::new(true),
            ..RecordingKernel::default()
        };
        let calls = kernel.calls();
        let programmer = PeerProgrammer::new(kernel, 9);
        programmer.add(&peer()).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["arp_set 10.5.42.0", "fdb_set 192.0.2.11", "arp_del 10.5.42.0"]
        );
    }

    #[tokio::test]
    async fn route_failure_rolls_back_arp_and_fdb() {
        let kernel = RecordingKernel {
            fail_route: true,
            ..RecordingKernel::default()
        };
        let calls = kernel.calls();
        let programmer = PeerProgrammer::new(kernel, 9);
        programmer.add(&peer()).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "arp_set 10.5.42.0",
                "fdb_set 192.0.2.11",
                "route_replace 10.5.42.0/24 via 10.5.42.0",
                "arp_del 10.5.42.0",
                "fdb_del 192.0.2.11",
            ]
        );
    }

    #[tokio::test]
    async fn rollback_failures_are_swallowed_and_the_next_peer_proceeds() {
        let kernel = RecordingKernel {
            fail_fdb_set: Mutex::new(true),
            fail_arp_del: true,
            ..RecordingKernel::default()
        };
        let calls = kernel.calls();
        let programmer = PeerProgrammer::new(kernel, 9);
        programmer.add(&peer()).await;
        // the first event was abandoned after cleanup, the second goes through
        programmer.add(&peer()).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "arp_set 10.5.42.0",
                "fdb_set 192.0.2.11",
                "arp_del 10.5.42.0",
                "arp_set 10.5.42.0",
                "fdb_set 192.0.2.11",
                "route_replace 10.5.42.0/24 via 10.5.42.0",
            ]
        );
    }
}
