// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::interface::{Device, DeviceProperties};
use crate::{DeviceError, Manager};
use derive_builder::Builder;
use futures::TryStreamExt;
use net::vxlan::Vni;
use rtnetlink::packet_route::link::{InfoData, InfoVxlan};
use rtnetlink::{LinkUnspec, LinkVxlan};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// The "planned" properties of the VXLAN tunnel endpoint device.
#[derive(Builder, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct VtepSpec {
    /// The intended name of the device.
    pub name: String,
    /// The VXLAN network identifier to be used for this device.
    pub vni: Vni,
    /// Index of the underlay interface used to reach peers (0 leaves the
    /// choice to the kernel).
    #[builder(default)]
    pub vtep_dev_index: u32,
    /// The local IPv4 address encapsulated packets are sourced from.
    #[builder(default)]
    pub src_addr: Option<Ipv4Addr>,
    /// Multicast group for learned flooding.  Never set by this agent.
    #[builder(default)]
    pub group: Option<Ipv4Addr>,
    /// UDP port for encapsulated traffic (0 leaves the kernel default).
    #[builder(default)]
    pub port: u16,
    /// Whether to generate l2miss netlink notifications.
    #[builder(default)]
    pub l2miss: bool,
    /// Whether to use VXLAN group based policy extensions.
    #[builder(default)]
    pub gbp: bool,
    /// Whether the kernel may learn FDB entries from the wire.  The agent
    /// programs all entries itself and keeps this off.
    #[builder(default)]
    pub learning: bool,
}

/// The link-level kernel operations consumed by VTEP reconciliation.
pub trait VtepKernel {
    /// Create a VXLAN link with the given intended properties.
    fn create(&self, spec: &VtepSpec) -> impl Future<Output = Result<(), DeviceError>> + Send;
    /// Look up a link by name.
    fn observe(&self, name: &str)
    -> impl Future<Output = Result<Option<Device>, DeviceError>> + Send;
    /// Look up a link by index.
    fn observe_index(
        &self,
        index: u32,
    ) -> impl Future<Output = Result<Option<Device>, DeviceError>> + Send;
    /// Delete the link with the given index.
    fn remove(&self, index: u32) -> impl Future<Output = Result<(), DeviceError>> + Send;
    /// Set the link with the given index administratively up.
    fn set_up(&self, index: u32) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Drive the kernel to a state where exactly one VXLAN device with the
/// intended name exists and its essential attributes match `spec`.
///
/// A pre-existing device with a compatible configuration is adopted as-is;
/// an incompatible one is deleted and recreated.  Either way the returned
/// handle is re-fetched by index so it reflects what the kernel actually
/// holds.
///
/// # Errors
///
/// Fails if the kernel refuses any of the netlink operations, or if the link
/// disappears (or stops being a VXLAN link) mid-reconciliation.
pub async fn ensure_device<K: VtepKernel>(kernel: &K, spec: &VtepSpec) -> Result<Device, DeviceError> {
    match kernel.create(spec).await {
        Ok(()) => {}
        Err(DeviceError::Exists { .. }) => {
            // it's ok if the device already exists as long as the config is similar
            info!("vxlan device {name} already exists", name = spec.name);
            let existing = kernel.observe(&spec.name).await?.ok_or_else(|| {
                DeviceError::Disappeared {
                    name: spec.name.clone(),
                }
            })?;
            match incompatible(spec, &existing) {
                None => {
                    info!("returning existing device {name}", name = spec.name);
                    return authoritative(kernel, &spec.name, existing.index).await;
                }
                Some(reason) => {
                    warn!(
                        "{name:?} already exists with incompatible configuration: {reason}; recreating device",
                        name = spec.name
                    );
                    kernel.remove(existing.index).await?;
                    kernel.create(spec).await?;
                }
            }
        }
        Err(err) => return Err(err),
    }
    let created = kernel
        .observe(&spec.name)
        .await?
        .ok_or_else(|| DeviceError::Disappeared {
            name: spec.name.clone(),
        })?;
    authoritative(kernel, &spec.name, created.index).await
}

/// Re-fetch the device by index and insist it still is a VXLAN link.
async fn authoritative<K: VtepKernel>(
    kernel: &K,
    name: &str,
    index: u32,
) -> Result<Device, DeviceError> {
    let device = kernel
        .observe_index(index)
        .await?
        .ok_or_else(|| DeviceError::Disappeared {
            name: name.to_string(),
        })?;
    match device.properties {
        DeviceProperties::Vxlan(_) => Ok(device),
        DeviceProperties::Other => Err(DeviceError::NotVxlan { index }),
    }
}

/// Compare an intended VTEP against an observed link.
///
/// Returns `None` when the observed link may be adopted, or a description of
/// the first incompatible attribute.  Attributes which are unset on either
/// side (index 0, port 0, missing address) are not compared.
fn incompatible(spec: &VtepSpec, observed: &Device) -> Option<String> {
    let DeviceProperties::Vxlan(props) = &observed.properties else {
        return Some(String::from("link type: vxlan vs non-vxlan"));
    };
    if props.vni != Some(spec.vni) {
        return Some(format!(
            "vni: {want} vs {have:?}",
            want = spec.vni.as_u32(),
            have = props.vni.map(Vni::as_u32)
        ));
    }
    match (spec.vtep_dev_index, props.vtep_dev_index) {
        (want @ 1.., Some(have)) if want != have => {
            return Some(format!("vtep (external) interface: {want} vs {have}"));
        }
        _ => {}
    }
    match (spec.src_addr, props.local) {
        (Some(want), Some(have)) if want != have => {
            return Some(format!("vtep (external) IP: {want} vs {have}"));
        }
        _ => {}
    }
    match (spec.group, props.group) {
        (Some(want), Some(have)) if want != have => {
            return Some(format!("group address: {want} vs {have}"));
        }
        _ => {}
    }
    if props.l2miss != spec.l2miss {
        return Some(format!(
            "l2miss: {want} vs {have}",
            want = spec.l2miss,
            have = props.l2miss
        ));
    }
    match (spec.port, props.port) {
        (want @ 1.., Some(have)) if want != have => {
            return Some(format!("port: {want} vs {have}"));
        }
        _ => {}
    }
    if props.gbp != spec.gbp {
        return Some(format!(
            "gbp: {want} vs {have}",
            want = spec.gbp,
            have = props.gbp
        ));
    }
    None
}

impl VtepKernel for Manager<Device> {
    async fn create(&self, spec: &VtepSpec) -> Result<(), DeviceError> {
        let mut info = vec![InfoVxlan::Id(spec.vni.as_u32())];
        if spec.vtep_dev_index != 0 {
            info.push(InfoVxlan::Link(spec.vtep_dev_index));
        }
        if let Some(local) = spec.src_addr {
            info.push(InfoVxlan::Local(local));
        }
        if let Some(group) = spec.group {
            info.push(InfoVxlan::Group(group));
        }
        if spec.port != 0 {
            info.push(InfoVxlan::Port(spec.port));
        }
        info.push(InfoVxlan::Learning(spec.learning));
        if spec.gbp {
            info.push(InfoVxlan::Gbp(true));
        }
        let message = LinkVxlan::new(&spec.name, spec.vni.as_u32())
            .set_info_data(InfoData::Vxlan(info))
            .build();
        self.handle
            .link()
            .add(message)
            .execute()
            .await
            .map_err(|err| match &err {
                rtnetlink::Error::NetlinkError(message)
                    if message.to_io().kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    DeviceError::Exists {
                        name: spec.name.clone(),
                    }
                }
                _ => DeviceError::Netlink(err),
            })
    }

    async fn observe(&self, name: &str) -> Result<Option<Device>, DeviceError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(message)) => Ok(Device::from_link_message(&message)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(message))
                if message.to_io().raw_os_error() == Some(libc::ENODEV) =>
            {
                Ok(None)
            }
            Err(err) => Err(DeviceError::Netlink(err)),
        }
    }

    async fn observe_index(&self, index: u32) -> Result<Option<Device>, DeviceError> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(message)) => Ok(Device::from_link_message(&message)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(message))
                if message.to_io().raw_os_error() == Some(libc::ENODEV) =>
            {
                Ok(None)
            }
            Err(err) => Err(DeviceError::Netlink(err)),
        }
    }

    async fn remove(&self, index: u32) -> Result<(), DeviceError> {
        Ok(self.handle.link().del(index).execute().await?)
    }

    async fn set_up(&self, index: u32) -> Result<(), DeviceError> {
        Ok(self
            .handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?)
    }
}
