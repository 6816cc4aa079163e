// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Subnet records: the attribute payload stored for each agent and the
//! text key its subnet is filed under.

use net::eth::mac::Mac;
use net::ipv4::{Ip4, Ip4Net};
use serde::{Deserialize, Serialize};

/// The attributes an agent publishes for its subnet.
///
/// For a given agent instance all three fields are fixed once published.
/// The serde field names are the store's wire names and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    /// The underlay address peers send encapsulated traffic to.
    #[serde(rename = "PublicIP")]
    pub public_ip: Ip4,
    /// The overlay subnet this agent serves.
    #[serde(rename = "Subnet")]
    pub subnet: Ip4Net,
    /// The MAC address of this agent's tunnel endpoint.
    #[serde(rename = "HardwareAddr", with = "mac_base64")]
    pub hardware_addr: Mac,
}

/// A change to the set of known subnets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A subnet appeared (or its record was re-read).
    Add {
        /// The subnet the event concerns.
        subnet: Ip4Net,
        /// The publishing agent's attributes.
        attrs: Attrs,
    },
    /// A subnet's record was deleted or expired.  Parsed and delivered, but
    /// peer removal is not implemented; consumers skip these.
    Remove {
        /// The subnet the event concerns.
        subnet: Ip4Net,
    },
}

impl Event {
    /// The subnet the event concerns.
    #[must_use]
    pub fn subnet(&self) -> Ip4Net {
        match self {
            Event::Add { subnet, .. } | Event::Remove { subnet } => *subnet,
        }
    }
}

/// Format the text key a subnet is filed under, e.g. `10.5.42.0-24`.
#[must_use]
pub fn make_subnet_key(subnet: Ip4Net) -> String {
    subnet.string_sep(".", "-")
}

/// Parse a subnet from the final segment of a store key.
///
/// Accepts `A.B.C.D-P` where every octet fits a `u8` and the prefix length
/// fits five bits; `P >= 32` is rejected.  Returns `None` for anything else;
/// keys under the subnet prefix which do not parse are skipped by callers,
/// not fatal.
#[must_use]
pub fn parse_subnet_key(key: &str) -> Option<Ip4Net> {
    let segment = key.rsplit('/').next()?;
    let (ip_part, prefix_part) = segment.rsplit_once('-')?;
    let mut octets = [0u8; 4];
    let mut parts = ip_part.split('.');
    for octet in &mut octets {
        *octet = parse_decimal_u8(parts.next()?)?;
    }
    if parts.next().is_some() {
        return None;
    }
    let prefix_len = parse_decimal_u8(prefix_part)?;
    if prefix_len > 31 {
        return None;
    }
    Some(Ip4Net::new(Ip4::from_octets(octets), prefix_len))
}

fn parse_decimal_u8(s: &str) -> Option<u8> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

mod mac_base64 {
    //! The original publisher marshals the hardware address as base64 (the
    //! default JSON encoding of a byte string); interoperate with that.

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use net::eth::mac::Mac;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mac: &Mac, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(mac.0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Mac, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(&encoded)
            .map_err(|err| D::Error::custom(format!("invalid hardware address: {err}")))?;
        Mac::try_from(bytes.as_slice())
            .map_err(|err| D::Error::custom(format!("invalid hardware address: {err}")))
    }
}
