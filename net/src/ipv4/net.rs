// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Compact IPv4 network type

use crate::ipv4::Ip4;
use std::fmt::{Debug, Display, Formatter};

/// An IPv4 network: an [`Ip4`] address plus a prefix length.
///
/// The serde field names (`IP`, `PrefixLen`) are the coordination-store wire
/// names and must not change.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Ip4Net {
    /// The network address.
    #[serde(rename = "IP")]
    pub ip: Ip4,
    /// The prefix length, in `[0, 32]`.
    #[serde(rename = "PrefixLen")]
    pub prefix_len: u8,
}

impl Ip4Net {
    /// Build an [`Ip4Net`] from an address and prefix length.
    #[must_use]
    pub const fn new(ip: Ip4, prefix_len: u8) -> Ip4Net {
        Ip4Net { ip, prefix_len }
    }

    /// Format the network with arbitrary separators, e.g.
    /// `string_sep(".", "-")` yields `10.5.42.0-24`.
    #[must_use]
    pub fn string_sep(self, octet_sep: &str, prefix_sep: &str) -> String {
        format!(
            "{ip}{prefix_sep}{prefix_len}",
            ip = self.ip.string_with_sep(octet_sep),
            prefix_len = self.prefix_len
        )
    }
}

impl Display for Ip4Net {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl Debug for Ip4Net {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::Ip4Net;
    use crate::ipv4::Ip4;

    #[test]
    fn formats_as_cidr() {
        let net = Ip4Net::new(Ip4::from_octets([10, 5, 42, 0]), 24);
        assert_eq!(net.to_string(), "10.5.42.0/24");
        assert_eq!(net.string_sep(".", "-"), "10.5.42.0-24");
    }

    #[test]
    fn equality_requires_ip_and_prefix() {
        let net = Ip4Net::new(Ip4::from_octets([10, 5, 42, 0]), 24);
        assert_eq!(net, Ip4Net::new(net.ip, 24));
        assert_ne!(net, Ip4Net::new(net.ip, 16));
        assert_ne!(net, Ip4Net::new(Ip4::from_octets([10, 5, 43, 0]), 24));
    }
}
