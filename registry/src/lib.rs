// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Client for the shared subnet registry.
//!
//! Every agent publishes the subnet it drew, together with its public IP and
//! VTEP MAC, under a well-known prefix in a strongly consistent key-value
//! store (the etcd v2 key space).  Peers are discovered by reading that
//! prefix recursively once and then following it with an indexed watch.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod client;
pub mod subnet;
pub mod watch;

pub use client::{RegistryClient, RegistryError};
pub use subnet::{Attrs, Event, make_subnet_key, parse_subnet_key};
pub use watch::{SubnetStore, SubnetWatcher};
