use num_derive::FromPrimitive;

use crate::config::SLOTS_PER_SECOND;

/// Sleep mode requested by SLEEP_TEST.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepMode {
    Active = 0,
    Extended = 1,
    Deep = 2,
}

/// How the device wakes up from extended sleep.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wakeup {
    /// Only an external event wakes the device.
    External,
    /// Periodic wake-up after the given number of 625us slots.
    Periodic(u32),
}

impl Wakeup {
    /// A zero duration means external wake-up only.
    pub const fn from_time(mins: u8, secs: u8) -> Self {
        if mins == 0 && secs == 0 {
            Wakeup::External
        } else {
            Wakeup::Periodic(mins as u32 * 60 * SLOTS_PER_SECOND + secs as u32 * SLOTS_PER_SECOND)
        }
    }
}

/// Low power clock selected by SLEEP_CLK_SEL on DA1458x.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepClock {
    Rcx20 = 0,
    Xtal32k = 1,
}

/// Behaviour of the DA14531 P0_0 reset pad.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetMode {
    HwReset = 0,
    PorReset = 1,
    Disabled = 2,
}
