// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPv4 address and network types

mod addr;
mod net;

pub use addr::*;
pub use net::*;
