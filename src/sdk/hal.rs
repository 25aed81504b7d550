//! Hardware boundary of the production test engine.
//!
//! Register level drivers live behind these traits. The engine only sequences calls and
//! never touches a peripheral directly. Host tests use the recording [`fake::FakeHal`].

use num_derive::FromPrimitive;

use crate::config::Platform;
use crate::sdk::gpio::{pin_is_valid, Pad, PinFunction, PinMode, PowerRail};
use crate::sdk::pm::{ResetMode, SleepClock, Wakeup};
use crate::sdk::rf::{ArpTable, RfTestCntl, TxPowerLevel};
use crate::sdk::timer::{Tim02ClkDiv, Timer0Config, Timer0Reload, Timer2Pwm};

pub const MEMORY_OTP_BASE: u32 = 0x07F8_0000;

/// OTP header offsets, relative to [`MEMORY_OTP_BASE`].
pub const fn otp_bdaddr_offset(platform: Platform) -> u32 {
    match platform {
        Platform::Da14531 => 0x7FD4,
        Platform::Da1458x => 0xFFA8,
    }
}

/// Only DA1458x keeps the XTAL16M trim in the OTP header.
pub const OTP_HDR_TRIM_XTAL16M_OFFSET: u32 = 0xFF18;

/// Failed OTP program/verify.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtpError;

/// Outcome of a failed xtal auto-trim.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrimError {
    /// A pulse was seen but the trim ended outside the acceptable range.
    OutOfRange,
    /// No pulse, or a pulse longer than 740 ms.
    NoPulse,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartBaud {
    B9600 = 0,
    B19200 = 1,
    B57600 = 2,
    B115200 = 3,
    B1M = 4,
    B38400 = 5,
}

impl UartBaud {
    pub const fn bits_per_second(&self) -> u32 {
        match self {
            UartBaud::B9600 => 9600,
            UartBaud::B19200 => 19200,
            UartBaud::B57600 => 57600,
            UartBaud::B115200 => 115200,
            UartBaud::B1M => 1_000_000,
            UartBaud::B38400 => 38400,
        }
    }
}

/// Operations of the external rd-tester board, DA1458x only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RdTesterOp {
    Init = 0,
    UartConnect = 1,
    UartLoopback = 2,
    VbatCntrl = 3,
    VppCntrl = 4,
    RstPulse = 5,
    UartPulse = 6,
    XtalPulse = 7,
    PulseWidth = 8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiPads {
    pub clk: Pad,
    pub di: Pad,
    pub do_: Pad,
    pub cs: Pad,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cPads {
    pub scl: Pad,
    pub sda: Pad,
}

pub trait Gpio {
    fn platform(&self) -> Platform;

    /// Validity predicate every GPIO taking command runs before touching a pad.
    fn gpio_is_valid(&self, pad: Pad) -> bool {
        pin_is_valid(self.platform(), pad.port, pad.pin)
    }

    /// Frees the pad from SWD and hardware reset functions.
    fn gpio_claim(&mut self, pad: Pad);

    fn gpio_configure(&mut self, pad: Pad, mode: PinMode, function: PinFunction, high: bool);

    fn gpio_configure_power(&mut self, pad: Pad, rail: PowerRail);

    fn gpio_pin_status(&mut self, pad: Pad) -> bool;

    /// First pad, in port/pin order, currently routed to `function`.
    fn gpio_find_function(&mut self, function: PinFunction) -> Option<Pad>;
}

pub trait Timers {
    fn timer0_2_clk_enable(&mut self);
    fn timer0_2_clk_disable(&mut self);
    fn timer0_2_clk_div_set(&mut self, div: Tim02ClkDiv);
    fn timer0_init(&mut self, config: Timer0Config);
    fn timer0_set(&mut self, reload: Timer0Reload);
    fn timer0_enable_irq(&mut self);
    fn timer0_disable_irq(&mut self);
    fn timer0_start(&mut self);
    fn timer0_stop(&mut self);

    /// Runs PWM2 with the requested frequency and duty.
    fn timer2_pwm_start(&mut self, pwm: Timer2Pwm);
    fn timer2_stop(&mut self);
}

pub trait Radio {
    fn rf_pa_pwr_set(&mut self, level: TxPowerLevel);

    /// Reapplies radio and ADPLL settings after a power change.
    fn rf_reinit(&mut self);

    fn rf_diag_irq_disable(&mut self);

    /// Enables the RF diagnostic IRQ and clears any pending request.
    fn rf_diag_irq_enable(&mut self);

    fn rf_overrule_write(&mut self, value: u32);

    /// Byte write into RF_RADIO_INIT_REG, `lane` 0 is the low byte.
    fn rf_radio_init_write(&mut self, lane: u8, value: u8);

    fn rf_adpll_activate(&mut self);
    fn rf_adpll_deactivate(&mut self);
    fn rf_adpll_cn_ctrl_write(&mut self, value: u32);

    fn rf_test_cntl_set(&mut self, bits: RfTestCntl);
    fn rf_test_cntl_clear(&mut self, bits: RfTestCntl);
    fn rf_test_cntl_write(&mut self, value: u32);

    fn rf_ldo_ctrl_read(&mut self) -> u32;
    fn rf_ldo_ctrl_write(&mut self, value: u32);

    fn dcdc_level_set(&mut self, level: u8);
    fn boost_mode(&mut self) -> bool;

    /// Current content of the ARP table kept by the radio driver.
    fn arp_table(&self) -> ArpTable;

    /// DA1458x: pins the synthesiser to `cn`, going through the LUT when present.
    fn rf_channel_overrule(&mut self, cn: u8);
    fn rf_channel_release(&mut self);
    fn rf_modulation_enable(&mut self, enable: bool);
}

pub trait LinkLayer {
    /// Starts an LE transmitter test.
    ///
    /// Returns `false` when the link layer could not allocate its test element yet.
    fn ll_test_start_tx(&mut self, freq: u8, data_len: u8, payload: u8) -> bool;
    fn ll_test_start_rx(&mut self, freq: u8);
    fn ll_test_stop(&mut self);
    fn ll_set_task_idle(&mut self);

    /// Ends a standard LE test and returns its packet count.
    fn ll_test_end(&mut self) -> u16;
}

pub trait Otp {
    /// `offset` is relative to [`MEMORY_OTP_BASE`].
    fn otp_read(&mut self, offset: u32, buf: &mut [u8]);

    /// Programs and verifies consecutive 32-bit words starting at `offset`.
    fn otp_write_words(&mut self, offset: u32, words: &[u32]) -> Result<(), OtpError>;
}

pub trait System {
    /// Busy wait, used for every settling delay.
    fn delay_us(&mut self, us: u32);

    /// Forces a watchdog reset.
    fn watchdog_reset(&mut self);
    fn sw_restart(&mut self);

    fn reg_read32(&mut self, addr: u32) -> u32;
    fn reg_write32(&mut self, addr: u32, value: u32);
    fn reg_read16(&mut self, addr: u32) -> u16;
    fn reg_write16(&mut self, addr: u32, value: u16);
    fn reg_write8(&mut self, addr: u32, value: u8);

    fn xtal_trim_read(&mut self) -> u16;
    fn xtal_trim_write(&mut self, value: u16);

    /// Routes the system clock (DA14531) or the XTAL test output (DA1458x) to P0_5.
    fn xtal_clock_output(&mut self, enable: bool);

    /// Measures a reference pulse on `pad` and trims the crystal. Returns the new trim.
    fn xtal_auto_trim(&mut self, pad: Pad, trim_msb: u8) -> Result<u16, TrimError>;

    fn sleep_disable(&mut self);
    fn sleep_extended(&mut self, wakeup: Wakeup);
    fn sleep_deep(&mut self);

    /// Waits until pending UART transmissions are out.
    fn uart_flush(&mut self);
    fn uart_release_pads(&mut self);
    fn uart_restore_pads(&mut self);
    fn uart_set_baud(&mut self, baud: UartBaud);
    fn uart_set_pins(&mut self, tx: Pad, rx: Pad);

    fn adc_vbat_sample(&mut self, vbat_type: u8) -> u16;

    fn sleep_clock_select(&mut self, clk: SleepClock);

    fn xtal32k_enabled(&mut self) -> bool;
    fn xtal32k_enable(&mut self, enable: bool);
    fn rc32k_enable(&mut self);

    /// Starts the reference counter calibration against XTAL32K.
    fn ref_cal_start(&mut self);
    fn ref_cal_busy(&mut self) -> bool;

    fn reset_mode(&mut self) -> ResetMode;
    fn reset_mode_set(&mut self, mode: ResetMode);

    fn rdtester(&mut self, op: RdTesterOp, data: u16);
}

pub trait Sensor {
    fn spi_open(&mut self, pads: SpiPads);
    fn spi_write(&mut self, addr: u8, data: u8);
    fn spi_read(&mut self, addr: u8) -> u8;

    fn i2c_open(&mut self, pads: I2cPads, slave_addr: u8);
    fn i2c_write(&mut self, addr: u8, data: u8);
    fn i2c_read(&mut self, addr: u8) -> u8;

    /// Releases the bus and restores the previous mode of its pads.
    fn sensor_close(&mut self);
}

/// Everything the engine needs from the platform.
pub trait ProdTestHal: Gpio + Timers + Radio + LinkLayer + Otp + System + Sensor {}

impl<T: Gpio + Timers + Radio + LinkLayer + Otp + System + Sensor> ProdTestHal for T {}
