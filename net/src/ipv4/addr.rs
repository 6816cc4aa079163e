// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Compact IPv4 address type

use std::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;

/// An IPv4 address packed into a `u32`.
///
/// The integer is interpreted in network byte order: the most significant
/// octet is the first dotted octet.  This is the representation used on the
/// coordination-store wire, where addresses are serialized as bare unsigned
/// integers.
///
/// This wrapper is zero cost; it exists to keep the wire representation and
/// the host representation ([`Ipv4Addr`]) from being mixed up.
#[repr(transparent)]
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
#[serde(transparent)]
pub struct Ip4(u32);

impl Ip4 {
    /// Get the raw `u32` value (network byte order).
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Build an [`Ip4`] from dotted-quad octets, first octet first.
    #[must_use]
    pub const fn from_octets(octets: [u8; 4]) -> Ip4 {
        Ip4(u32::from_be_bytes(octets))
    }

    /// The dotted-quad octets, first octet first.
    #[must_use]
    pub const fn octets(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Format the address with an arbitrary separator between octets.
    #[must_use]
    pub fn string_with_sep(self, sep: &str) -> String {
        let [a, b, c, d] = self.octets();
        format!("{a}{sep}{b}{sep}{c}{sep}{d}")
    }
}

impl Display for Ip4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&Ipv4Addr::from(*self), f)
    }
}

impl Debug for Ip4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<Ipv4Addr> for Ip4 {
    fn from(value: Ipv4Addr) -> Ip4 {
        Ip4::from_octets(value.octets())
    }
}

impl From<Ip4> for Ipv4Addr {
    fn from(value: Ip4) -> Ipv4Addr {
        Ipv4Addr::from(value.octets())
    }
}

impl From<[u8; 4]> for Ip4 {
    fn from(value: [u8; 4]) -> Ip4 {
        Ip4::from_octets(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Ip4;
    use std::net::Ipv4Addr;

    #[test]
    fn octets_round_trip() {
        bolero::check!().with_type().for_each(|octets: &[u8; 4]| {
            let ip = Ip4::from_octets(*octets);
            assert_eq!(ip.octets(), *octets);
            assert_eq!(Ipv4Addr::from(ip).octets(), *octets);
            assert_eq!(Ip4::from(Ipv4Addr::from(ip)), ip);
        });
    }

    #[test]
    fn first_octet_is_most_significant() {
        bolero::check!().with_type().for_each(|octets: &[u8; 4]| {
            let ip = Ip4::from_octets(*octets);
            assert_eq!((ip.as_u32() >> 24) as u8, octets[0]);
        });
    }

    #[test]
    fn formats_as_dotted_quad() {
        let ip = Ip4::from_octets([10, 5, 42, 0]);
        assert_eq!(ip.to_string(), "10.5.42.0");
        assert_eq!(ip.string_with_sep("."), "10.5.42.0");
        assert_eq!(ip.string_with_sep("-"), "10-5-42-0");
    }
}
