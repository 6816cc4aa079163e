// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Mac address type and logic.

use arrayvec::ArrayVec;
use std::fmt::Display;

/// A [MAC Address] type.
///
/// `Mac` is a transparent wrapper around `[u8; 6]` which provides a
/// small collection of methods and type safety.
///
/// [MAC Address]: https://en.wikipedia.org/wiki/MAC_address
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct Mac(pub [u8; 6]);

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl From<Mac> for [u8; 6] {
    fn from(value: Mac) -> Self {
        value.0
    }
}

/// Errors which can occur while converting another representation to a [`Mac`]
#[derive(Debug, thiserror::Error)]
pub enum MacParseError {
    /// Invalid string representation of mac address
    #[error("invalid string representation of mac address: {0}")]
    InvalidString(String),
    /// A byte slice of a length other than 6 is not a mac address
    #[error("invalid mac address length: {0} (expected 6)")]
    InvalidLength(usize),
}

impl TryFrom<&str> for Mac {
    type Error = MacParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        const MAX_OCTETS: usize = 6;
        let mut octets_strs = value.split(':');
        let octets_parsed =
            octets_strs.try_fold(ArrayVec::<_, MAX_OCTETS>::new(), |mut acc, octet_str| {
                if octet_str.len() != 2 {
                    return Err(MacParseError::InvalidString(value.to_string()));
                }
                if octet_str.chars().any(|c| !c.is_ascii_hexdigit()) {
                    return Err(MacParseError::InvalidString(value.to_string()));
                }
                let parsed = u8::from_str_radix(octet_str, 16)
                    .map_err(|_| MacParseError::InvalidString(value.to_string()))?;
                acc.try_push(parsed)
                    .map_err(|_| MacParseError::InvalidString(value.to_string()))?;
                Ok(acc)
            })?;

        let octets = match octets_parsed.as_slice() {
            [o0, o1, o2, o3, o4, o5] => [*o0, *o1, *o2, *o3, *o4, *o5],
            _ => return Err(MacParseError::InvalidString(value.to_string())),
        };

        Ok(Mac(octets))
    }
}

impl TryFrom<&[u8]> for Mac {
    type Error = MacParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match <[u8; 6]>::try_from(value) {
            Ok(octets) => Ok(Mac(octets)),
            Err(_) => Err(MacParseError::InvalidLength(value.len())),
        }
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<02x}:{:<02x}:{:<02x}:{:<02x}:{:<02x}:{:<02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Mac, MacParseError};

    #[test]
    fn parse_from_string() {
        let mac = Mac::try_from("02:00:00:00:00:0b").unwrap();
        assert_eq!(mac, Mac([0x02, 0, 0, 0, 0, 0x0b]));
        assert!(matches!(
            Mac::try_from("02:00:00:00:00"),
            Err(MacParseError::InvalidString(_))
        ));
        assert!(matches!(
            Mac::try_from("02:00:00:00:00:zz"),
            Err(MacParseError::InvalidString(_))
        ));
    }

    #[test]
    fn parse_from_bytes() {
        let raw = [0x02u8, 0x15, 0xb2, 0x00, 0x01, 0x42];
        let mac = Mac::try_from(raw.as_slice()).unwrap();
        assert_eq!(mac.0, raw);
        assert!(matches!(
            Mac::try_from([0u8; 4].as_slice()),
            Err(MacParseError::InvalidLength(4))
        ));
    }

    #[test]
    fn display_is_colon_separated_hex() {
        let mac = Mac([0x02, 0x15, 0xb2, 0x00, 0x01, 0x42]);
        assert_eq!(mac.to_string(), "02:15:b2:00:01:42");
    }
}
