// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reconcile the intended state of the overlay's kernel data plane with its
//! observed state: the VXLAN tunnel endpoint device, its address, and the
//! ARP / FDB / route entries installed for each peer.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(missing_docs)] // derive_builder generates undocumented structures

use std::marker::PhantomData;
use std::sync::Arc;

pub mod interface;
pub mod peer;

use rtnetlink::Handle;

/// `Manager` is the primary entry point to kernel reconciliation logic.
///
/// It is a newtype wrapper around a netlink handle, with a `PhantomData<R>` use to allow
/// for multiple implementations of the kernel-facing traits (based on the type `R`) which
/// we are reconciling.
#[derive(Clone, Debug)]
pub struct Manager<R: ?Sized> {
    handle: Arc<Handle>,
    _marker: PhantomData<R>,
}

impl<R> Manager<R> {
    /// Create a new `Manager` from an [`Arc<Handle>`].
    #[must_use]
    pub fn new(handle: Arc<Handle>) -> Self {
        Manager {
            handle,
            _marker: PhantomData,
        }
    }
}

/// Convenience method for reducing syntactic noise when creating ephemeral `Manager` structs.
pub fn manager_of<T>(other: impl Into<Manager<T>>) -> Manager<T> {
    other.into()
}

impl<T, U> From<&Manager<T>> for Manager<U> {
    fn from(handle: &Manager<T>) -> Self {
        Self::new(handle.handle.clone())
    }
}

/// Errors surfaced by device and address reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// A netlink operation failed.
    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),
    /// A link with the requested name already exists.
    #[error("a link named {name} already exists")]
    Exists { name: String },
    /// The link vanished between operations.
    #[error("can't locate vxlan device {name}")]
    Disappeared { name: String },
    /// The link found at the given index is not a VXLAN link.
    #[error("device with index {index} is not a vxlan device")]
    NotVxlan { index: u32 },
    /// The link carries addresses this agent did not assign.
    #[error(
        "link {name} has incompatible addresses; remove the additional addresses and try again"
    )]
    MultipleAddresses { name: String },
}
