// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The overlay agent: brings up this host's VXLAN tunnel endpoint, publishes
//! the subnet it serves, and programs kernel entries for every peer the
//! subnet registry reveals.

use interface_manager::interface::{
    Device, DeviceAddress, VtepSpecBuilder, VtepSpecBuilderError, ensure_device,
    ensure_only_address,
};
use interface_manager::peer::{Peer, PeerKernel, PeerProgrammer};
use interface_manager::{DeviceError, Manager, manager_of};
use net::ipv4::{Ip4, Ip4Net};
use net::vxlan::{InvalidVni, Vni};
use rand::Rng;
use registry::{Event, RegistryClient, RegistryError, SubnetWatcher};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod args;
mod iface;
mod iptables;

use args::{CmdArgs, Parser};

const DEFAULT_VNI: u32 = 1;
const ENCAP_OVERHEAD: u32 = 50;
const OVERLAY_NETWORK: &str = "10.5.0.0/16";
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Vni(#[from] InvalidVni),
    #[error("invalid vxlan device spec: {0}")]
    Spec(#[from] VtepSpecBuilderError),
    #[error("unable to find default route")]
    NoDefaultRoute,
    #[error("found default route but could not determine interface")]
    DefaultRouteWithoutInterface,
    #[error("no link with index {index}")]
    LinkNotFound { index: u32 },
    #[error("no IPv4 address found for interface {index}")]
    NoInterfaceAddress { index: u32 },
    #[error("failed to determine MTU for {name} interface")]
    UnknownMtu { name: String },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(true)
        .with_thread_names(true)
        .init();
}

#[tokio::main]
async fn main() {
    let cmd_args = CmdArgs::parse();
    init_tracing();
    if let Err(err) = run(&cmd_args).await {
        error!("agent startup failed: {err}");
        std::process::exit(1);
    }
}

async fn run(cmd_args: &CmdArgs) -> Result<(), AgentError> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);
    let handle = Arc::new(handle);
    let links = Manager::<Device>::new(handle.clone());
    let addrs = manager_of::<DeviceAddress>(&links);

    let external = iface::lookup_external_interface(&handle, &links, &addrs).await?;

    let spec = VtepSpecBuilder::default()
        .name(format!("vxlan.{DEFAULT_VNI}"))
        .vni(Vni::new_checked(DEFAULT_VNI)?)
        .vtep_dev_index(external.device.index)
        .src_addr(Some(external.addr))
        .build()?;
    let device = ensure_device(&links, &spec).await?;

    let mut rng = rand::rng();
    let subnet = pick_subnet(&mut rng);
    let attrs = registry::Attrs {
        public_ip: Ip4::from(external.addr),
        subnet,
        hardware_addr: device.mac,
    };

    let store = RegistryClient::new(&cmd_args.etcd_endpoint)?;
    store.create_subnet(subnet, &attrs).await?;
    info!(
        "created subnet: {ip}, net mask: {prefix_len}",
        ip = subnet.ip,
        prefix_len = subnet.prefix_len
    );

    let token = CancellationToken::new();
    let (batches_tx, batches_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watcher = SubnetWatcher::new(store, subnet, batches_tx, token.clone());
    tokio::spawn(watcher.run());

    let programmer = PeerProgrammer::new(manager_of::<Peer>(&links), device.index);
    let consumer = tokio::spawn(consume_events(programmer, batches_rx, token.clone()));

    tokio::spawn(iptables::supervise(
        iptables::forward_rules(OVERLAY_NETWORK),
        token.clone(),
    ));

    ensure_only_address(&addrs, &links, &device, vtep_address(subnet)).await?;

    info!("MTU: {}", external.device.mtu.saturating_sub(ENCAP_OVERHEAD));
    info!("VXLAN hardware address: {}", device.mac);
    info!("running backend");

    wait_for_shutdown().await?;
    info!("shutdown signal received");
    token.cancel();
    // let the programmer finish the batch it is working on
    let _join = consumer.await;
    Ok(())
}

/// Draw this agent's /24 from the overlay /16.
///
/// The published subnet is the network address `10.5.X.0/24`; the third
/// octet is drawn at random, so colliding agents are caught by the store's
/// create-only write rather than by coordination.
fn pick_subnet<R: Rng>(rng: &mut R) -> Ip4Net {
    let host_octet = rng.random_range(50..=253u8);
    Ip4Net::new(Ip4::from_octets([10, 5, host_octet, 0]), 24)
}

/// The address assigned to the tunnel endpoint itself: the `.1` of the
/// drawn subnet, attached as a /30.
fn vtep_address(subnet: Ip4Net) -> DeviceAddress {
    let [a, b, c, _] = subnet.ip.octets();
    DeviceAddress {
        addr: Ipv4Addr::new(a, b, c, 1),
        prefix_len: 30,
    }
}

/// Sequentially apply event batches to the kernel, in store order.
///
/// Peer programming is deliberately not parallelized: one consumer keeps the
/// kernel operations for a peer from interleaving.  Cancellation is only
/// honored between batches, so a batch in progress is always drained.
async fn consume_events<K: PeerKernel>(
    programmer: PeerProgrammer<K>,
    mut batches: mpsc::Receiver<Vec<Event>>,
    token: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            () = token.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        for event in &batch {
            match event {
                Event::Add { subnet, attrs } => {
                    programmer
                        .add(&Peer {
                            subnet: *subnet,
                            public_ip: attrs.public_ip,
                            mac: attrs.hardware_addr,
                        })
                        .await;
                }
                Event::Remove { subnet } => {
                    info!("remove event for {subnet} not supported; skipping");
                }
            }
        }
    }
}

async fn wait_for_shutdown() -> Result<(), std::io::Error> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
