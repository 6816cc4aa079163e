// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reconcile the intended state of the VXLAN tunnel endpoint with its observed state.

mod addr;
mod vtep;

#[allow(unused_imports)] // re-export
pub use addr::*;
#[allow(unused_imports)] // re-export
pub use vtep::*;

use net::eth::mac::Mac;
use net::vxlan::Vni;
use rtnetlink::packet_route::link::{InfoData, InfoKind, InfoVxlan, LinkAttribute, LinkInfo, LinkMessage};
use std::net::Ipv4Addr;

/// The observed state of a kernel network interface.
///
/// This type represents external state as reported by the kernel, not a plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Hardware address assigned by the kernel (or by us).
    pub mac: Mac,
    /// Interface MTU as reported by the kernel.
    pub mtu: u32,
    /// Type-specific properties.
    pub properties: DeviceProperties,
}

/// Type-specific properties of an observed interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceProperties {
    /// The interface is a VXLAN link.
    Vxlan(VxlanProperties),
    /// Any other link type.
    Other,
}

/// Observed properties of a VXLAN link.
///
/// Fields the kernel did not report are `None`; flag attributes default to
/// `false`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VxlanProperties {
    pub vni: Option<Vni>,
    pub vtep_dev_index: Option<u32>,
    pub local: Option<Ipv4Addr>,
    pub group: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub l2miss: bool,
    pub gbp: bool,
    pub learning: bool,
}

impl VxlanProperties {
    fn from_infos(infos: &[InfoVxlan]) -> VxlanProperties {
        let mut properties = VxlanProperties::default();
        for info in infos {
            match info {
                InfoVxlan::Id(id) => properties.vni = Vni::new_checked(*id).ok(),
                InfoVxlan::Link(link) => {
                    properties.vtep_dev_index = (*link != 0).then_some(*link);
                }
                InfoVxlan::Local(ip) => properties.local = Some(*ip),
                InfoVxlan::Group(ip) => properties.group = Some(*ip),
                InfoVxlan::Port(port) => properties.port = (*port != 0).then_some(*port),
                InfoVxlan::L2Miss(l2miss) => properties.l2miss = *l2miss,
                InfoVxlan::Gbp(gbp) => properties.gbp = *gbp,
                InfoVxlan::Learning(learning) => properties.learning = *learning,
                _ => {}
            }
        }
        properties
    }
}

impl Device {
    /// Map a netlink link message to a [`Device`].
    ///
    /// Returns `None` for messages which lack a name or hardware address
    /// (such links exist, but none of them can be our tunnel endpoint).
    #[must_use]
    pub fn from_link_message(message: &LinkMessage) -> Option<Device> {
        let mut name = None;
        let mut mac = None;
        let mut mtu = 0;
        let mut properties = DeviceProperties::Other;
        for attribute in &message.attributes {
            match attribute {
                LinkAttribute::IfName(ifname) => name = Some(ifname.clone()),
                LinkAttribute::Address(bytes) => mac = Mac::try_from(bytes.as_slice()).ok(),
                LinkAttribute::Mtu(value) => mtu = *value,
                LinkAttribute::LinkInfo(infos) => {
                    let mut is_vxlan = false;
                    let mut vxlan = VxlanProperties::default();
                    for info in infos {
                        match info {
                            LinkInfo::Kind(InfoKind::Vxlan) => is_vxlan = true,
                            LinkInfo::Data(InfoData::Vxlan(data)) => {
                                vxlan = VxlanProperties::from_infos(data);
                            }
                            _ => {}
                        }
                    }
                    if is_vxlan {
                        properties = DeviceProperties::Vxlan(vxlan);
                    }
                }
                _ => {}
            }
        }
        Some(Device {
            index: message.header.index,
            name: name?,
            mac: mac?,
            mtu,
            properties,
        })
    }
}
