//! `bMaxPower` is expressed on the wire in 2 mA units (USB 2.x; USB 3 power units are a
//! non-goal). [`MaxPower`] keeps the raw wire value and the mA conversion
//! together so callers never have to remember which direction the `/2` goes.

use crate::error::{Error, Result};

/// Maximum bus power a configuration may draw, stored as the raw 2 mA wire unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaxPower(u8);

impl MaxPower {
    /// Builds a `MaxPower` from a raw 2 mA unit count (the value written to
    /// `MaxPower` in ConfigFS).
    pub const fn from_units(units: u8) -> Self {
        Self(units)
    }

    /// Builds a `MaxPower` from milliamps, rounding down to the nearest 2 mA unit.
    ///
    /// Rejects values outside `0..=510` (the range representable in a `u8` of 2 mA
    /// units).
    pub fn from_milliamps(ma: u16) -> Result<Self> {
        if ma > 510 {
            return Err(Error::InvalidArgument {
                syscall: "MaxPower::from_milliamps",
                context: crate::error::Context::Description(format!("{ma} mA exceeds 510 mA maximum")),
                source: nix::errno::Errno::EINVAL,
            });
        }
        Ok(Self((ma / 2) as u8))
    }

    /// The raw 2 mA unit count, as written to ConfigFS's `MaxPower` attribute.
    pub const fn units(&self) -> u8 {
        self.0
    }

    /// The milliamp value this unit count represents (always even).
    pub const fn to_milliamps(&self) -> u16 {
        (self.0 as u16) * 2
    }
}

impl Default for MaxPower {
    fn default() -> Self {
        // 100 mA is the USB 2.0 default a device may draw before configuration.
        Self(50)
    }
}
