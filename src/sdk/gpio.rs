use num_derive::FromPrimitive;

use crate::config::Platform;

pub type GpioPort = u8;
pub type GpioPin = u8;

// Highest pin number per port
const DA14531_MAX_PIN: [GpioPin; 1] = [11];
const DA1458X_MAX_PIN: [GpioPin; 4] = [7, 5, 9, 7];

/// Electrical mode of a pad, numbered as in the GPIO_SET request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinMode {
    Input = 0,
    InputPullUp = 1,
    InputPullDown = 2,
    Output = 3,
}

/// Peripheral signal routed to a pad.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinFunction {
    Gpio,
    Pwm0,
    Pwm2,
    UartTx,
    UartRx,
    SpiClk,
    SpiDi,
    SpiDo,
    SpiEn,
    I2cScl,
    I2cSda,
}

/// Supply rail of a pad. 0 selects 3V, 1 selects 1V8.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRail {
    V3 = 0,
    V1 = 1,
}

/// A port/pin pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pad {
    pub port: GpioPort,
    pub pin: GpioPin,
}

impl Pad {
    pub const fn new(port: GpioPort, pin: GpioPin) -> Self {
        Self { port, pin }
    }
}

const fn max_pins(platform: Platform) -> &'static [GpioPin] {
    match platform {
        Platform::Da14531 => &DA14531_MAX_PIN,
        Platform::Da1458x => &DA1458X_MAX_PIN,
    }
}

/// Checks a port/pin pair against the pad table of the platform.
///
/// # Parameters
///
/// * `platform` - Silicon family
/// * `port` - GPIO port number
/// * `pin` - Pin number inside the port
///
/// # Notes
///
/// * DA14531 has a single port with pins 0 to 11
/// * DA1458x has ports 0 to 3 with 8, 6, 10 and 8 pins
pub fn pin_is_valid(platform: Platform, port: GpioPort, pin: GpioPin) -> bool {
    max_pins(platform)
        .get(port as usize)
        .is_some_and(|max| pin <= *max)
}

/// Splits a single pad byte as sent by the host into a port/pin pair.
///
/// DA14531 numbers its pads 0 to 11 on port 0. DA1458x encodes the port in the
/// tens digit, so pad 23 is P2_3.
pub const fn decode_pad(platform: Platform, pad: u8) -> Pad {
    match platform {
        Platform::Da14531 => Pad::new(0, pad),
        Platform::Da1458x => Pad::new(pad / 10, pad % 10),
    }
}

/// Inverse of [`decode_pad`].
pub const fn encode_pad(platform: Platform, pad: Pad) -> u8 {
    match platform {
        Platform::Da14531 => pad.pin,
        Platform::Da1458x => pad.port * 10 + pad.pin,
    }
}

/// Every valid pad of the platform, port by port.
pub fn valid_pads(platform: Platform) -> impl Iterator<Item = Pad> {
    max_pins(platform)
        .iter()
        .enumerate()
        .flat_map(|(port, max)| (0..=*max).map(move |pin| Pad::new(port as GpioPort, pin)))
}
