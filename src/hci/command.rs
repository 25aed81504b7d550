//! Typed vendor and LE test commands.
//!
//! Every command has a fixed little-endian layout except OTP_WRITE, which carries a
//! word count followed by that many words. Bytes past the end of a fixed layout are
//! ignored. A short buffer fails with [`PackError::InBufOverflow`] and nothing is
//! dispatched.

use heapless::Vec;

use crate::config::Platform;
use crate::error::Error;
use crate::hci::opcode::Opcode;
use crate::hci::pack::{OtpWriteParams, PackError, Packer, Unpacker};
use crate::sdk::gpio::Pad;

pub const UART_LOOP_LEN: usize = 100;

// Largest request payload, an OTP_WRITE with 60 words
pub const MAX_PARAM_LEN: usize = 3 + crate::hci::pack::OTP_DATA_MAX;

/// SENSOR_TEST request.
///
/// The first pad is the SPI clock or the I2C SCL, the second one the SPI DI or the I2C
/// SDA. `do_` and `cs` are only used by SPI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorTestParams {
    pub interface: u8,
    pub rw: u8,
    pub clk_scl: Pad,
    pub di_sda: Pad,
    pub do_: Pad,
    pub cs: Pad,
    pub reg_addr: u8,
    pub reg_data: u8,
    pub i2c_slave_addr: u8,
    pub int_check: u8,
    pub int_pad: Pad,
    pub voltage_level: u8,
}

/// GPIO_SET request. `pad` is the packed pad byte, see [`crate::sdk::gpio::decode_pad`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpioSetParams {
    pub pad: u8,
    pub mode: u8,
    pub rail: u8,
    pub val: u8,
    /// PWM frequency in kHz, zero for a plain GPIO.
    pub pwm: u8,
    pub duty: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CustomAction(u8),
    SleepTest { mode: u8, mins: u8, secs: u8 },
    XtalTrim { op: u8, lsb: u8, msb: u8 },
    OtpRw { op: u8, data: [u8; 6] },
    OtpRead { addr: u16, num_words: u8 },
    OtpWrite(OtpWriteParams),
    RegisterRw { op: u8, addr: u32, data: u32 },
    AudioTest,
    FirmwareVersionGet,
    ChangeUartPins { tx: Pad, rx: Pad },
    RdTester { op: u8, data: u16 },
    TxTest { freq: u8, data_len: u8, payload: u8, packets: u16 },
    StartProdRxTest { freq: u8 },
    EndProdRxTest,
    UnmodulatedOn { op: u8, freq: u8 },
    TxStartContinueTest { freq: u8, payload: u8 },
    TxEndContinueTest,
    SensorTest(SensorTestParams),
    GpioSet(GpioSetParams),
    GpioRead { pad: u8 },
    UartLoop([u8; UART_LOOP_LEN]),
    UartBaud(u8),
    Ext32kTest,
    GpioWd { pad: u8, rail: u8 },
    SleepClkSel(u8),
    AdcVbat(u8),
    SetTxPower(u8),
    ConfigureTestMode(u8),
    PlatformReset,
    ResetMode(u8),
    LeRxTest { freq: u8 },
    LeTxTest { freq: u8, data_len: u8, payload: u8 },
    LeTestEnd,
}

fn unpack_pad(rd: &mut Unpacker) -> Result<Pad, PackError> {
    Ok(Pad::new(rd.u8()?, rd.u8()?))
}

impl Command {
    /// Decodes a raw opcode and parameter block.
    ///
    /// # Parameters
    ///
    /// * `platform` - Silicon family, DA14531-only opcodes are unknown elsewhere
    /// * `opcode` - Raw 16-bit HCI opcode
    /// * `params` - Parameter bytes following the length field
    ///
    /// # Notes
    ///
    /// * Range checks of individual fields are left to the handlers, which answer them
    ///   with a status inside the completion event
    pub fn decode(platform: Platform, opcode: u16, params: &[u8]) -> Result<Self, Error> {
        let op = Opcode::lookup(opcode, platform).ok_or(Error::UnknownOpcode(opcode))?;
        let mut rd = Unpacker::new(params);

        let cmd = match op {
            Opcode::CustomAction => Command::CustomAction(rd.u8()?),
            Opcode::SleepTest => Command::SleepTest {
                mode: rd.u8()?,
                mins: rd.u8()?,
                secs: rd.u8()?,
            },
            Opcode::XtalTrim => Command::XtalTrim {
                op: rd.u8()?,
                lsb: rd.u8()?,
                msb: rd.u8()?,
            },
            Opcode::OtpRw => Command::OtpRw {
                op: rd.u8()?,
                data: rd.array()?,
            },
            Opcode::OtpRead => Command::OtpRead {
                addr: rd.u16()?,
                num_words: rd.u8()?,
            },
            Opcode::OtpWrite => Command::OtpWrite(OtpWriteParams::unpack(params)?),
            Opcode::RegisterRw => Command::RegisterRw {
                op: rd.u8()?,
                addr: rd.u32()?,
                data: rd.u32()?,
            },
            Opcode::AudioTest => Command::AudioTest,
            Opcode::FirmwareVersionGet => Command::FirmwareVersionGet,
            Opcode::ChangeUartPins => Command::ChangeUartPins {
                tx: unpack_pad(&mut rd)?,
                rx: unpack_pad(&mut rd)?,
            },
            Opcode::RdTester => Command::RdTester {
                op: rd.u8()?,
                data: rd.u16()?,
            },
            Opcode::TxTest => Command::TxTest {
                freq: rd.u8()?,
                data_len: rd.u8()?,
                payload: rd.u8()?,
                packets: rd.u16()?,
            },
            Opcode::StartProdRxTest => Command::StartProdRxTest { freq: rd.u8()? },
            Opcode::EndProdRxTest => Command::EndProdRxTest,
            Opcode::UnmodulatedOn => Command::UnmodulatedOn {
                op: rd.u8()?,
                freq: rd.u8()?,
            },
            Opcode::TxStartContinueTest => Command::TxStartContinueTest {
                freq: rd.u8()?,
                payload: rd.u8()?,
            },
            Opcode::TxEndContinueTest => Command::TxEndContinueTest,
            Opcode::SensorTest => Command::SensorTest(SensorTestParams {
                interface: rd.u8()?,
                rw: rd.u8()?,
                clk_scl: unpack_pad(&mut rd)?,
                di_sda: unpack_pad(&mut rd)?,
                do_: unpack_pad(&mut rd)?,
                cs: unpack_pad(&mut rd)?,
                reg_addr: rd.u8()?,
                reg_data: rd.u8()?,
                i2c_slave_addr: rd.u8()?,
                int_check: rd.u8()?,
                int_pad: unpack_pad(&mut rd)?,
                voltage_level: rd.u8()?,
            }),
            Opcode::GpioSet => Command::GpioSet(GpioSetParams {
                pad: rd.u8()?,
                mode: rd.u8()?,
                rail: rd.u8()?,
                val: rd.u8()?,
                pwm: rd.u8()?,
                duty: rd.u8()?,
            }),
            Opcode::GpioRead => Command::GpioRead { pad: rd.u8()? },
            Opcode::UartLoop => Command::UartLoop(rd.array()?),
            Opcode::UartBaud => Command::UartBaud(rd.u8()?),
            Opcode::Ext32kTest => Command::Ext32kTest,
            Opcode::GpioWd => Command::GpioWd {
                pad: rd.u8()?,
                rail: rd.u8()?,
            },
            Opcode::SleepClkSel => Command::SleepClkSel(rd.u8()?),
            Opcode::AdcVbat => Command::AdcVbat(rd.u8()?),
            Opcode::SetTxPower => Command::SetTxPower(rd.u8()?),
            Opcode::ConfigureTestMode => Command::ConfigureTestMode(rd.u8()?),
            Opcode::PlatformReset => Command::PlatformReset,
            Opcode::ResetMode => Command::ResetMode(rd.u8()?),
            Opcode::LeRxTest => Command::LeRxTest { freq: rd.u8()? },
            Opcode::LeTxTest => Command::LeTxTest {
                freq: rd.u8()?,
                data_len: rd.u8()?,
                payload: rd.u8()?,
            },
            Opcode::LeTestEnd => Command::LeTestEnd,
        };

        Ok(cmd)
    }

    pub const fn opcode(&self) -> Opcode {
        match self {
            Command::CustomAction(_) => Opcode::CustomAction,
            Command::SleepTest { .. } => Opcode::SleepTest,
            Command::XtalTrim { .. } => Opcode::XtalTrim,
            Command::OtpRw { .. } => Opcode::OtpRw,
            Command::OtpRead { .. } => Opcode::OtpRead,
            Command::OtpWrite(_) => Opcode::OtpWrite,
            Command::RegisterRw { .. } => Opcode::RegisterRw,
            Command::AudioTest => Opcode::AudioTest,
            Command::FirmwareVersionGet => Opcode::FirmwareVersionGet,
            Command::ChangeUartPins { .. } => Opcode::ChangeUartPins,
            Command::RdTester { .. } => Opcode::RdTester,
            Command::TxTest { .. } => Opcode::TxTest,
            Command::StartProdRxTest { .. } => Opcode::StartProdRxTest,
            Command::EndProdRxTest => Opcode::EndProdRxTest,
            Command::UnmodulatedOn { .. } => Opcode::UnmodulatedOn,
            Command::TxStartContinueTest { .. } => Opcode::TxStartContinueTest,
            Command::TxEndContinueTest => Opcode::TxEndContinueTest,
            Command::SensorTest(_) => Opcode::SensorTest,
            Command::GpioSet(_) => Opcode::GpioSet,
            Command::GpioRead { .. } => Opcode::GpioRead,
            Command::UartLoop(_) => Opcode::UartLoop,
            Command::UartBaud(_) => Opcode::UartBaud,
            Command::Ext32kTest => Opcode::Ext32kTest,
            Command::GpioWd { .. } => Opcode::GpioWd,
            Command::SleepClkSel(_) => Opcode::SleepClkSel,
            Command::AdcVbat(_) => Opcode::AdcVbat,
            Command::SetTxPower(_) => Opcode::SetTxPower,
            Command::ConfigureTestMode(_) => Opcode::ConfigureTestMode,
            Command::PlatformReset => Opcode::PlatformReset,
            Command::ResetMode(_) => Opcode::ResetMode,
            Command::LeRxTest { .. } => Opcode::LeRxTest,
            Command::LeTxTest { .. } => Opcode::LeTxTest,
            Command::LeTestEnd => Opcode::LeTestEnd,
        }
    }

    /// Packs the parameter block, the inverse of [`Command::decode`].
    ///
    /// Used by the sequencer to feed its table through the same decoder as host
    /// traffic, and by host side tooling.
    pub fn encode<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<(), PackError> {
        let mut pk = Packer::new(out);

        match self {
            Command::CustomAction(v)
            | Command::UartBaud(v)
            | Command::SleepClkSel(v)
            | Command::AdcVbat(v)
            | Command::SetTxPower(v)
            | Command::ConfigureTestMode(v)
            | Command::ResetMode(v) => {
                pk.u8(*v)?;
            }
            Command::SleepTest { mode, mins, secs } => {
                pk.u8(*mode)?.u8(*mins)?.u8(*secs)?;
            }
            Command::XtalTrim { op, lsb, msb } => {
                pk.u8(*op)?.u8(*lsb)?.u8(*msb)?;
            }
            Command::OtpRw { op, data } => {
                pk.u8(*op)?.bytes(data)?;
            }
            Command::OtpRead { addr, num_words } => {
                pk.u16(*addr)?.u8(*num_words)?;
            }
            Command::OtpWrite(p) => {
                pk.u16(p.addr)?.u8(p.num_words)?.bytes(&p.data)?;
            }
            Command::RegisterRw { op, addr, data } => {
                pk.u8(*op)?.u32(*addr)?.u32(*data)?;
            }
            Command::ChangeUartPins { tx, rx } => {
                pk.u8(tx.port)?.u8(tx.pin)?.u8(rx.port)?.u8(rx.pin)?;
            }
            Command::RdTester { op, data } => {
                pk.u8(*op)?.u16(*data)?;
            }
            Command::TxTest { freq, data_len, payload, packets } => {
                pk.u8(*freq)?.u8(*data_len)?.u8(*payload)?.u16(*packets)?;
            }
            Command::StartProdRxTest { freq } | Command::LeRxTest { freq } => {
                pk.u8(*freq)?;
            }
            Command::UnmodulatedOn { op, freq } => {
                pk.u8(*op)?.u8(*freq)?;
            }
            Command::TxStartContinueTest { freq, payload } => {
                pk.u8(*freq)?.u8(*payload)?;
            }
            Command::SensorTest(p) => {
                pk.u8(p.interface)?.u8(p.rw)?;
                for pad in [p.clk_scl, p.di_sda, p.do_, p.cs] {
                    pk.u8(pad.port)?.u8(pad.pin)?;
                }
                pk.u8(p.reg_addr)?
                    .u8(p.reg_data)?
                    .u8(p.i2c_slave_addr)?
                    .u8(p.int_check)?
                    .u8(p.int_pad.port)?
                    .u8(p.int_pad.pin)?
                    .u8(p.voltage_level)?;
            }
            Command::GpioSet(p) => {
                pk.u8(p.pad)?.u8(p.mode)?.u8(p.rail)?.u8(p.val)?.u8(p.pwm)?.u8(p.duty)?;
            }
            Command::GpioRead { pad } => {
                pk.u8(*pad)?;
            }
            Command::UartLoop(data) => {
                pk.bytes(data)?;
            }
            Command::GpioWd { pad, rail } => {
                pk.u8(*pad)?.u8(*rail)?;
            }
            Command::LeTxTest { freq, data_len, payload } => {
                pk.u8(*freq)?.u8(*data_len)?.u8(*payload)?;
            }
            Command::AudioTest
            | Command::FirmwareVersionGet
            | Command::EndProdRxTest
            | Command::TxEndContinueTest
            | Command::Ext32kTest
            | Command::PlatformReset
            | Command::LeTestEnd => {}
        }

        Ok(())
    }
}
