// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use core::fmt::Display;
use std::fmt::Formatter;
use std::num::NonZero;

/// A [VXLAN][RFC7348] Network Identifier.
///
/// A `Vni` is a 24-bit value that identifies a VXLAN [overlay network].
///
/// # Legal values
///
/// * Value `0` is reserved by many implementations and should not be used.
/// * The maximum legal value is <var>2<sup>24</sup> - 1 = 16,777,215 = `0x00_FF_FF_FF`</var>.
///
/// It is deliberately not possible to create a `Vni` from a `u32` directly, as that would
/// allow the creation of illegal `Vni` values.
/// Instead, use [`Vni::new_checked`] to create a `Vni` from a `u32`.
///
/// [RFC7348]: https://datatracker.ietf.org/doc/html/rfc7348#section-5
/// [overlay network]: https://en.wikipedia.org/wiki/Overlay_network
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(try_from = "u32", into = "u32")]
#[repr(transparent)]
pub struct Vni(NonZero<u32>);

impl Display for Vni {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl Vni {
    /// The minimum legal [`Vni`] value (1).
    pub const MIN: u32 = 1;
    /// The maximum legal [`Vni`] value (2<sup>24</sup> - 1).
    pub const MAX: u32 = 0x00_FF_FF_FF;

    /// Create a new [`Vni`] from a `u32`.
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidVni`] error if the value is 0 or greater than [`Vni::MAX`].
    pub fn new_checked(vni: u32) -> Result<Vni, InvalidVni> {
        match NonZero::<u32>::new(vni) {
            None => Err(InvalidVni::ReservedZero),
            _ if vni > Vni::MAX => Err(InvalidVni::TooLarge(vni)),
            Some(vni) => Ok(Vni(vni)),
        }
    }

    /// Get the value of the [`Vni`] as a `u32`.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0.get()
    }
}

/// Errors that can occur when converting a `u32` to a [`Vni`]
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, thiserror::Error)]
pub enum InvalidVni {
    /// Zero is not a legal Vni in many EVPN / VXLAN implementations.  Don't use it.
    #[error("Zero is not a legal Vni")]
    ReservedZero,
    /// This error type contains the (illegal) value used to attempt creation of a [`Vni`].
    /// The max legal value is found in [`Vni::MAX`].
    #[error("The value {0} is too large to be a Vni (max is {MAX})", MAX = Vni::MAX)]
    TooLarge(u32),
}

impl From<Vni> for u32 {
    fn from(vni: Vni) -> u32 {
        vni.as_u32()
    }
}

impl TryFrom<u32> for Vni {
    type Error = InvalidVni;

    fn try_from(vni: u32) -> Result<Vni, Self::Error> {
        Vni::new_checked(vni)
    }
}

#[cfg(test)]
mod tests {
    use super::{InvalidVni, Vni};

    #[test]
    fn bounds_are_enforced() {
        assert_eq!(Vni::new_checked(0), Err(InvalidVni::ReservedZero));
        assert_eq!(Vni::new_checked(Vni::MIN).unwrap().as_u32(), 1);
        assert_eq!(Vni::new_checked(Vni::MAX).unwrap().as_u32(), Vni::MAX);
        assert_eq!(
            Vni::new_checked(Vni::MAX + 1),
            Err(InvalidVni::TooLarge(Vni::MAX + 1))
        );
    }
}
