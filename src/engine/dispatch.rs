//! Per-command handlers.
//!
//! Every decoded command ends in exactly one [`Response`]. Handlers return
//! `Result<Response, Error>` and [`ProdTestEngine::dispatch`] turns an `Err` into a
//! Command Status carrying [`Error::status`]. Range checks that the host tooling
//! expects inside the completion payload (GPIO, OTP word counts) are answered there
//! instead.

use heapless::Vec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::config::{
    APP_VERSION, EXT32K_CAL_POLLS, EXT32K_CAL_POLL_US, MAX_READ_WRITE_OTP_WORDS, SDK_VERSION, SENSOR_SETTLE_US,
    VERSION_FIELD_LEN, XTAL32K_STARTUP_US, XTAL_PULSE_GUARD_US, XTAL_TRIM_FIND_RX_PAD,
};
use crate::engine::{Deferred, ProdTestEngine, Response};
use crate::error::{Error, CO_ERROR_INVALID_HCI_PARAM, CO_ERROR_NO_ERROR, VENDOR_ERROR};
use crate::hci::command::{Command, GpioSetParams, SensorTestParams};
use crate::hci::event::{Event, ReturnParams};
use crate::hci::opcode::Opcode;
use crate::hci::pack::{pack_otp_read_cmp, OtpWriteParams, Packer, OTP_DATA_MAX, OTP_WORD_LEN};
use crate::sdk::gpio::{decode_pad, Pad, PinFunction, PinMode, PowerRail};
use crate::sdk::hal::{
    otp_bdaddr_offset, I2cPads, ProdTestHal, RdTesterOp, SpiPads, TrimError, UartBaud,
    OTP_HDR_TRIM_XTAL16M_OFFSET,
};
use crate::sdk::pm::{ResetMode, SleepClock, SleepMode, Wakeup};
use crate::sdk::rf::TxPowerLevel;
use crate::sdk::timer::{Timer2Pwm, TIM0_2_CLK_DIV};
use crate::state::{TestState, WatchdogGpio};

// DA14531 hardware reset input
const RESET_PAD: Pad = Pad::new(0, 0);

// CUSTOM_ACTION code that reads back the crystal trim
const CUSTOM_ACTION_READ_TRIM: u8 = 0x33;

// SPI read strobe in the register address byte
const SPI_READ_FLAG: u8 = 0x80;

const MAX_DUTY_CYCLE: u8 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum XtalTrimOp {
    Read = 0,
    Write = 1,
    Enable = 2,
    Increment = 3,
    Decrement = 4,
    Disable = 5,
    CalibrateTest = 6,
    Calibrate = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum OtpRwOp {
    ReadXtalTrim = 0,
    WriteXtalTrim = 1,
    ReadBdAddr = 2,
    WriteBdAddr = 3,
    ReadExtXtalTrim = 4,
    WriteExtXtalTrim = 5,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum RegisterRwOp {
    Read32 = 0,
    Write32 = 1,
    Read16 = 2,
    Write16 = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum SensorInterface {
    Spi = 0,
    I2c = 1,
}

fn complete(opcode: Opcode, params: &[u8]) -> Result<Response, Error> {
    Ok(Event::complete_with(opcode, params)?.into())
}

/// Zero padded, NUL terminated version field and its length including the NUL.
fn version_field(version: &str) -> (u8, [u8; VERSION_FIELD_LEN]) {
    let mut field = [0u8; VERSION_FIELD_LEN];
    let len = version.len().min(VERSION_FIELD_LEN - 1);
    field[..len].copy_from_slice(&version.as_bytes()[..len]);
    ((len + 1) as u8, field)
}

impl<'a, H: ProdTestHal> ProdTestEngine<'a, H> {
    /// Decodes and runs one raw command. Always yields a reply.
    pub fn handle(&mut self, opcode: u16, params: &[u8]) -> Response {
        trace!("HCI command {:#x}, {} parameter bytes", opcode, params.len());

        match Command::decode(self.platform(), opcode, params) {
            Ok(cmd) => self.dispatch(cmd),
            Err(e) => {
                warn!("Rejecting command {:#x}: {:?}", opcode, e);
                Event::status(opcode, e.status()).into()
            }
        }
    }

    /// Runs a decoded command.
    pub fn dispatch(&mut self, cmd: Command) -> Response {
        let opcode = cmd.opcode();

        let res = match cmd {
            Command::CustomAction(code) => self.custom_action(code),
            Command::SleepTest { mode, mins, secs } => self.sleep_test(mode, mins, secs),
            Command::XtalTrim { op, lsb, msb } => self.xtal_trim(op, lsb, msb),
            Command::OtpRw { op, data } => self.otp_rw(op, data),
            Command::OtpRead { addr, num_words } => self.otp_read(addr, num_words),
            Command::OtpWrite(p) => self.otp_write(&p),
            Command::RegisterRw { op, addr, data } => self.register_rw(op, addr, data),
            Command::AudioTest => complete(Opcode::AudioTest, &[]),
            Command::FirmwareVersionGet => self.firmware_version(),
            Command::ChangeUartPins { tx, rx } => self.change_uart_pins(tx, rx),
            Command::RdTester { op, data } => self.rdtester(op, data),
            Command::TxTest {
                freq,
                data_len,
                payload,
                packets,
            } => self.tx_test(freq, data_len, payload, packets),
            Command::StartProdRxTest { freq } => self.start_prod_rx(freq),
            Command::EndProdRxTest => self.end_prod_rx(),
            Command::UnmodulatedOn { op, freq } => self
                .unmodulated_on(op, freq)
                .and_then(|_| complete(Opcode::UnmodulatedOn, &[])),
            Command::TxStartContinueTest { freq, payload } => self.tx_start_continue(freq, payload),
            Command::TxEndContinueTest => self.tx_end_continue(),
            Command::SensorTest(p) => self.sensor_test(&p),
            Command::GpioSet(p) => self.gpio_set(&p),
            Command::GpioRead { pad } => self.gpio_read(pad),
            Command::UartLoop(data) => complete(Opcode::UartLoop, &data),
            Command::UartBaud(sel) => self.uart_baud(sel),
            Command::Ext32kTest => self.ext32k_test(),
            Command::GpioWd { pad, rail } => self.gpio_wd(pad, rail),
            Command::SleepClkSel(clk) => self.sleep_clk_sel(clk),
            Command::AdcVbat(vbat_type) => {
                let sample = self.hal.adc_vbat_sample(vbat_type);
                complete(Opcode::AdcVbat, &sample.to_le_bytes())
            }
            Command::SetTxPower(level) => self.set_tx_power(level),
            Command::ConfigureTestMode(data) => {
                self.set_radio_ldo_configuration(data != 0);
                complete(Opcode::ConfigureTestMode, &[CO_ERROR_NO_ERROR])
            }
            Command::PlatformReset => {
                complete(Opcode::PlatformReset, &[CO_ERROR_NO_ERROR]).map(|r| r.then(Deferred::PlatformReset))
            }
            Command::ResetMode(mode) => self.reset_mode(mode),
            Command::LeRxTest { freq } => self.le_rx_test(freq),
            Command::LeTxTest {
                freq,
                data_len,
                payload,
            } => self.le_tx_test(freq, data_len, payload),
            Command::LeTestEnd => self.le_test_end(),
        };

        res.unwrap_or_else(|e| {
            warn!("{:?} failed: {:?}", opcode, e);
            Event::status(opcode, e.status()).into()
        })
    }

    /// DA14531 resets on P0_0 unless told otherwise. Returns the mode to restore.
    fn release_reset_pad(&mut self, pad: Pad) -> Option<ResetMode> {
        if !self.platform().is_531() || pad != RESET_PAD {
            return None;
        }
        let prev = self.hal.reset_mode();
        if prev == ResetMode::Disabled {
            return None;
        }
        self.hal.reset_mode_set(ResetMode::Disabled);
        Some(prev)
    }

    fn check_pad(&self, pad: Pad) -> Result<Pad, Error> {
        if self.hal.gpio_is_valid(pad) {
            Ok(pad)
        } else {
            Err(Error::InvalidGpio {
                port: pad.port,
                pin: pad.pin,
            })
        }
    }

    fn custom_action(&mut self, code: u8) -> Result<Response, Error> {
        let value = match code {
            CUSTOM_ACTION_READ_TRIM => self.hal.xtal_trim_read() as u32,
            _ => code as u32,
        };
        complete(Opcode::CustomAction, &value.to_le_bytes())
    }

    fn sleep_test(&mut self, mode: u8, mins: u8, secs: u8) -> Result<Response, Error> {
        let mode = SleepMode::from_u8(mode).ok_or(Error::InvalidParam)?;
        let wakeup = match mode {
            SleepMode::Extended => Wakeup::from_time(mins, secs),
            _ => Wakeup::External,
        };

        info!("Entering {:?} sleep", mode);
        Ok(Response::reply(Event::status(Opcode::SleepTest, CO_ERROR_NO_ERROR)).then(Deferred::Sleep { mode, wakeup }))
    }

    fn xtal_trim(&mut self, op: u8, lsb: u8, msb: u8) -> Result<Response, Error> {
        let delta = u16::from_le_bytes([lsb, msb]);
        let max_trim: u16 = if self.platform().is_531() { 0xFF } else { 0xFFFF };

        let value = match XtalTrimOp::from_u8(op) {
            Some(XtalTrimOp::Read) => self.hal.xtal_trim_read(),
            Some(XtalTrimOp::Write) => {
                self.hal.xtal_trim_write(delta);
                0
            }
            Some(XtalTrimOp::Enable) => {
                self.hal.xtal_clock_output(true);
                0
            }
            Some(XtalTrimOp::Increment) => {
                let cur = self.hal.xtal_trim_read();
                if max_trim.checked_sub(delta).is_some_and(|limit| cur <= limit) {
                    self.hal.xtal_trim_write(cur + delta);
                }
                0
            }
            Some(XtalTrimOp::Decrement) => {
                let cur = self.hal.xtal_trim_read();
                if cur >= delta {
                    self.hal.xtal_trim_write(cur - delta);
                }
                0
            }
            Some(XtalTrimOp::Disable) => {
                self.hal.xtal_clock_output(false);
                0
            }
            Some(XtalTrimOp::CalibrateTest) => return self.xtal_calibrate(false, lsb, msb),
            Some(XtalTrimOp::Calibrate) => return self.xtal_calibrate(true, lsb, msb),
            None => {
                warn!("Unknown xtal trim operation {}", op);
                0
            }
        };

        complete(Opcode::XtalTrim, &value.to_le_bytes())
    }

    /// Auto-trims the crystal against a reference pulse.
    ///
    /// # Algorithm
    ///
    /// 1. Pick the pulse pad, the UART RX pad when the pad byte is 0xFE
    /// 2. Free the pad and make it a pulled-up input
    /// 3. Trim, then store the result in OTP when calibrating a DA1458x
    /// 4. If the pulse arrived on UART RX, wait for it to end before replying and hand
    ///    the pad back to the UART after the reply
    ///
    /// # Notes
    ///
    /// * Status 1 pulse out of range, 2 no pulse, 3 OTP write failed, 4 no such pad
    fn xtal_calibrate(&mut self, store: bool, lsb: u8, msb: u8) -> Result<Response, Error> {
        let uart_rx = self.hal.gpio_find_function(PinFunction::UartRx);
        let pad = if lsb == XTAL_TRIM_FIND_RX_PAD {
            uart_rx
        } else {
            let pad = decode_pad(self.platform(), lsb);
            self.check_pad(pad).ok()
        };

        let Some(pad) = pad else {
            warn!("No pad for the trim pulse");
            return complete(Opcode::XtalTrim, &4u16.to_le_bytes());
        };
        let on_uart_rx = uart_rx == Some(pad);

        self.hal.gpio_claim(pad);
        let prev_reset = self.release_reset_pad(pad);
        self.hal.gpio_configure(pad, PinMode::InputPullUp, PinFunction::Gpio, false);

        let status: u16 = match self.hal.xtal_auto_trim(pad, msb) {
            Err(TrimError::OutOfRange) => 1,
            Err(TrimError::NoPulse) => 2,
            Ok(trim) if store && !self.platform().is_531() => {
                match self.hal.otp_write_words(OTP_HDR_TRIM_XTAL16M_OFFSET, &[trim as u32, 0]) {
                    Ok(()) => 0,
                    Err(_) => {
                        error!("Storing xtal trim {:#x} in OTP failed", trim);
                        3
                    }
                }
            }
            Ok(_) => 0,
        };

        if on_uart_rx {
            self.wait_pin_while(pad, true);
            self.wait_pin_while(pad, false);
            self.hal.delay_us(XTAL_PULSE_GUARD_US);
        }
        if let Some(mode) = prev_reset {
            self.hal.reset_mode_set(mode);
        }

        let resp = complete(Opcode::XtalTrim, &status.to_le_bytes())?;
        Ok(if on_uart_rx {
            resp.then(Deferred::XtalPulseEnd(pad))
        } else {
            resp
        })
    }

    fn otp_rw(&mut self, op: u8, data: [u8; 6]) -> Result<Response, Error> {
        let platform = self.platform();
        let mut out = [0u8; 6];

        match OtpRwOp::from_u8(op) {
            Some(OtpRwOp::ReadXtalTrim) if !platform.is_531() => {
                self.hal.otp_read(OTP_HDR_TRIM_XTAL16M_OFFSET, &mut out[..2]);
            }
            Some(OtpRwOp::WriteXtalTrim) if !platform.is_531() => {
                let trim = u16::from_le_bytes([data[0], data[1]]) as u32;
                if self.hal.otp_write_words(OTP_HDR_TRIM_XTAL16M_OFFSET, &[trim, 0]).is_err() {
                    warn!("OTP xtal trim write failed");
                }
            }
            Some(OtpRwOp::ReadBdAddr) => {
                self.hal.otp_read(otp_bdaddr_offset(platform), &mut out);
            }
            Some(OtpRwOp::WriteBdAddr) => {
                let words = [
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                    u16::from_le_bytes([data[4], data[5]]) as u32,
                ];
                if self.hal.otp_write_words(otp_bdaddr_offset(platform), &words).is_err() {
                    warn!("OTP BD address write failed");
                }
            }
            _ => {}
        }

        let mut params = [0u8; 7];
        params[0] = op;
        params[1..].copy_from_slice(&out);
        complete(Opcode::OtpRw, &params)
    }

    fn otp_read(&mut self, addr: u16, num_words: u8) -> Result<Response, Error> {
        let n = num_words as usize;
        let mut data = [0u8; OTP_DATA_MAX];
        let status = if n == 0 || n > MAX_READ_WRITE_OTP_WORDS {
            warn!("OTP read of {} words rejected", n);
            CO_ERROR_INVALID_HCI_PARAM
        } else {
            self.hal.otp_read(addr as u32, &mut data[..n * OTP_WORD_LEN]);
            CO_ERROR_NO_ERROR
        };

        let mut params = ReturnParams::new();
        pack_otp_read_cmp(&mut params, status, num_words, &data)?;
        Ok(Event::CommandComplete {
            opcode: Opcode::OtpRead.into(),
            params,
        }
        .into())
    }

    /// Programs the words two at a time, the OTP cell being 64 bits wide. An odd last
    /// word is paired with zero. The first failing cell ends the write.
    fn otp_write(&mut self, p: &OtpWriteParams) -> Result<Response, Error> {
        let n = p.num_words as usize;
        if n == 0 || n > MAX_READ_WRITE_OTP_WORDS {
            warn!("OTP write of {} words rejected", n);
            return complete(Opcode::OtpWrite, &[CO_ERROR_INVALID_HCI_PARAM, p.num_words]);
        }

        let words: Vec<u32, MAX_READ_WRITE_OTP_WORDS> = p.words().collect();
        let mut status = CO_ERROR_NO_ERROR;
        let mut offset = p.addr as u32;
        for pair in words.chunks(2) {
            let cell = [pair[0], pair.get(1).copied().unwrap_or(0)];
            if self.hal.otp_write_words(offset, &cell).is_err() {
                error!("OTP write failed at {:#x}", offset);
                status = VENDOR_ERROR;
                break;
            }
            offset += 8;
        }

        complete(Opcode::OtpWrite, &[status, p.num_words])
    }

    fn register_rw(&mut self, op: u8, addr: u32, data: u32) -> Result<Response, Error> {
        let value = match RegisterRwOp::from_u8(op) {
            Some(RegisterRwOp::Read32) => self.hal.reg_read32(addr),
            Some(RegisterRwOp::Write32) => {
                self.hal.reg_write32(addr, data);
                0
            }
            Some(RegisterRwOp::Read16) => self.hal.reg_read16(addr) as u32,
            Some(RegisterRwOp::Write16) => {
                self.hal.reg_write16(addr, data as u16);
                0
            }
            None => 0,
        };

        let mut params = ReturnParams::new();
        Packer::new(&mut params).u8(op)?.u8(0)?.u32(value)?;
        complete(Opcode::RegisterRw, &params)
    }

    fn firmware_version(&mut self) -> Result<Response, Error> {
        let (ble_len, ble) = version_field(SDK_VERSION);
        let (app_len, app) = version_field(APP_VERSION);

        let mut params = ReturnParams::new();
        Packer::new(&mut params).u8(ble_len)?.u8(app_len)?.bytes(&ble)?.bytes(&app)?;
        complete(Opcode::FirmwareVersionGet, &params)
    }

    fn change_uart_pins(&mut self, tx: Pad, rx: Pad) -> Result<Response, Error> {
        if let Err(e) = self.check_pad(tx).and_then(|_| self.check_pad(rx)) {
            warn!("Invalid UART pins: {:?}", e);
            return complete(Opcode::ChangeUartPins, &1u16.to_le_bytes());
        }

        complete(Opcode::ChangeUartPins, &0u16.to_le_bytes()).map(|r| r.then(Deferred::UartPins { tx, rx }))
    }

    fn rdtester(&mut self, op: u8, data: u16) -> Result<Response, Error> {
        if !self.platform().is_531() {
            match RdTesterOp::from_u8(op) {
                Some(op) => self.hal.rdtester(op, data),
                None => warn!("Unknown rd-tester operation {}", op),
            }
        }
        complete(Opcode::RdTester, &[])
    }

    fn tx_test(&mut self, freq: u8, data_len: u8, payload: u8, packets: u16) -> Result<Response, Error> {
        self.ensure_idle()?;
        self.shared.with(|s| {
            s.params.freq = freq;
            s.params.data_len = data_len;
            s.params.data_pattern = payload;
            s.params.tx_packets = packets;
        });
        self.start_tx()?;
        Ok(Event::status(Opcode::TxTest, CO_ERROR_NO_ERROR).into())
    }

    fn start_prod_rx(&mut self, freq: u8) -> Result<Response, Error> {
        self.ensure_idle()?;
        self.shared.with(|s| s.params.freq = freq);
        self.start_rx()?;
        complete(Opcode::StartProdRxTest, &[])
    }

    /// Stops the RX test and reports packets, sync errors, CRC errors and RSSI.
    fn end_prod_rx(&mut self) -> Result<Response, Error> {
        let state = self.shared.test_state();
        if state != TestState::StartRx {
            return Err(Error::NotRunning(state));
        }

        self.stop();
        let m = self.shared.metrics();
        debug!("RX test done, {} packets", m.rx_pkt);

        let mut params = ReturnParams::new();
        Packer::new(&mut params)
            .u16(m.rx_pkt)?
            .u16(m.rx_err_sync)?
            .u16(m.rx_err_crc)?
            .u16(m.rx_rssi)?;
        complete(Opcode::EndProdRxTest, &params)
    }

    fn tx_start_continue(&mut self, freq: u8, payload: u8) -> Result<Response, Error> {
        self.ensure_idle()?;
        self.shared.with(|s| {
            s.params.freq = freq;
            s.params.data_pattern = payload;
        });
        self.start_continue_tx()?;
        complete(Opcode::TxStartContinueTest, &[])
    }

    fn tx_end_continue(&mut self) -> Result<Response, Error> {
        let state = self.shared.test_state();
        if state != TestState::StartContinueTx {
            return Err(Error::NotRunning(state));
        }

        if self.platform().is_531() {
            self.stop_refresh_timer();
        }
        self.stop();
        self.hal.rf_test_cntl_write(0);
        complete(Opcode::TxEndContinueTest, &[])
    }

    /// Talks to an external sensor over SPI or I2C and returns the register read.
    ///
    /// # Algorithm
    ///
    /// 1. Validate every pad the interface uses, the INT pad only when checked
    /// 2. DA14531: a bus on P0_0 switches the reset pad to POR only for the test
    /// 3. Open the bus, optionally write the register, settle, read it back
    /// 4. With the INT check the result is the INT pad level instead
    /// 5. Close the bus and give the UART its pads back
    ///
    /// # Notes
    ///
    /// * Any invalid pad answers 0xFF without touching the hardware
    fn sensor_test(&mut self, p: &SensorTestParams) -> Result<Response, Error> {
        let Some(interface) = SensorInterface::from_u8(p.interface) else {
            warn!("Unknown sensor interface {}", p.interface);
            return complete(Opcode::SensorTest, &0u16.to_le_bytes());
        };
        let int_check = p.int_check != 0;

        let mut pads: Vec<Pad, 5> = Vec::new();
        let _ = pads.extend_from_slice(&[p.clk_scl, p.di_sda]);
        if interface == SensorInterface::Spi {
            let _ = pads.extend_from_slice(&[p.do_, p.cs]);
        }
        if int_check {
            let _ = pads.push(p.int_pad);
        }

        if let Some(e) = pads.iter().find_map(|pad| self.check_pad(*pad).err()) {
            warn!("Sensor test rejected: {:?}", e);
            return complete(Opcode::SensorTest, &(e.status() as u16).to_le_bytes());
        }

        let prev_reset = if self.platform().is_531() && pads.contains(&RESET_PAD) {
            let prev = self.hal.reset_mode();
            self.hal.reset_mode_set(ResetMode::PorReset);
            Some(prev)
        } else {
            None
        };

        for pad in pads.iter() {
            self.hal.gpio_claim(*pad);
        }

        match interface {
            SensorInterface::Spi => self.hal.spi_open(SpiPads {
                clk: p.clk_scl,
                di: p.di_sda,
                do_: p.do_,
                cs: p.cs,
            }),
            SensorInterface::I2c => self.hal.i2c_open(
                I2cPads {
                    scl: p.clk_scl,
                    sda: p.di_sda,
                },
                p.i2c_slave_addr,
            ),
        }

        if int_check {
            self.hal.gpio_configure(p.int_pad, PinMode::InputPullDown, PinFunction::Gpio, false);
        }

        if p.rw == 1 {
            match interface {
                SensorInterface::Spi => self.hal.spi_write(p.reg_addr, p.reg_data),
                SensorInterface::I2c => self.hal.i2c_write(p.reg_addr, p.reg_data),
            }
        }
        self.hal.delay_us(SENSOR_SETTLE_US);

        let mut value = match interface {
            SensorInterface::Spi => self.hal.spi_read(p.reg_addr | SPI_READ_FLAG),
            SensorInterface::I2c => self.hal.i2c_read(p.reg_addr),
        };
        if int_check {
            value = self.hal.gpio_pin_status(p.int_pad) as u8;
        }

        self.hal.sensor_close();
        if let Some(mode) = prev_reset {
            self.hal.reset_mode_set(mode);
        }
        self.hal.uart_restore_pads();

        complete(Opcode::SensorTest, &(value as u16).to_le_bytes())
    }

    /// Drives a pad as plain GPIO or as PWM2.
    ///
    /// # Notes
    ///
    /// * With a PWM frequency, `val` 0 stops Timer2 and 1 starts it
    /// * Every parameter is checked before the pad is touched
    fn gpio_set(&mut self, p: &GpioSetParams) -> Result<Response, Error> {
        let pad = decode_pad(self.platform(), p.pad);
        let mode = PinMode::from_u8(p.mode);
        let rail = PowerRail::from_u8(p.rail);
        let drives = mode == Some(PinMode::Output) || p.pwm > 0;

        let (Some(mode), Some(rail)) = (mode, rail) else {
            warn!("GPIO_SET with mode {} rail {}", p.mode, p.rail);
            return complete(Opcode::GpioSet, &[VENDOR_ERROR]);
        };
        if let Err(e) = self.check_pad(pad) {
            warn!("GPIO_SET rejected: {:?}", e);
            return complete(Opcode::GpioSet, &[e.status()]);
        }
        if (drives && p.val > 1) || p.duty > MAX_DUTY_CYCLE {
            warn!("GPIO_SET rejected for pad {}", p.pad);
            return complete(Opcode::GpioSet, &[VENDOR_ERROR]);
        }

        self.hal.gpio_claim(pad);
        self.release_reset_pad(pad);

        if p.pwm > 0 {
            if p.val == 0 {
                self.hal.timer2_stop();
                self.hal.gpio_configure(pad, PinMode::InputPullDown, PinFunction::Gpio, false);
                self.hal.gpio_configure_power(pad, rail);
            } else {
                self.hal.gpio_configure(pad, PinMode::Output, PinFunction::Pwm2, false);
                self.hal.gpio_configure_power(pad, rail);
                self.hal.timer0_2_clk_enable();
                self.hal.timer0_2_clk_div_set(TIM0_2_CLK_DIV);
                self.hal.timer2_pwm_start(Timer2Pwm::from_khz(p.pwm, p.duty));
            }
        } else {
            self.hal.gpio_configure(pad, mode, PinFunction::Gpio, p.val == 1);
            self.hal.gpio_configure_power(pad, rail);
        }

        complete(Opcode::GpioSet, &[CO_ERROR_NO_ERROR])
    }

    fn gpio_read(&mut self, pad: u8) -> Result<Response, Error> {
        let level = match self.check_pad(decode_pad(self.platform(), pad)) {
            Ok(pad) => self.hal.gpio_pin_status(pad) as u8,
            Err(e) => e.status(),
        };
        complete(Opcode::GpioRead, &[level])
    }

    /// Unknown selections report 1 and fall back to 115200 baud.
    fn uart_baud(&mut self, sel: u8) -> Result<Response, Error> {
        let (error, baud) = match UartBaud::from_u8(sel) {
            Some(baud) => (0, baud),
            None => (1, UartBaud::B115200),
        };
        info!("UART moving to {} baud", baud.bits_per_second());
        complete(Opcode::UartBaud, &[error]).map(|r| r.then(Deferred::UartBaud(baud)))
    }

    /// Checks for a mounted 32 kHz crystal with a reference counter calibration.
    fn ext32k_test(&mut self) -> Result<Response, Error> {
        let is_531 = self.platform().is_531();
        let was_enabled = !is_531 || self.hal.xtal32k_enabled();

        if !was_enabled {
            self.hal.xtal32k_enable(true);
            self.hal.delay_us(XTAL32K_STARTUP_US);
        }

        let error = if is_531 && !self.hal.xtal32k_enabled() {
            VENDOR_ERROR
        } else {
            match self.ref_cal_wait() {
                Ok(()) => CO_ERROR_NO_ERROR,
                Err(e) => e.status(),
            }
        };

        if !was_enabled {
            self.hal.xtal32k_enable(false);
        }
        complete(Opcode::Ext32kTest, &[error])
    }

    /// Runs the reference counter calibration with a bounded number of polls.
    fn ref_cal_wait(&mut self) -> Result<(), Error> {
        self.hal.ref_cal_start();
        let mut polls = 0;
        while self.hal.ref_cal_busy() && polls < EXT32K_CAL_POLLS {
            self.hal.delay_us(EXT32K_CAL_POLL_US);
            polls += 1;
        }
        if self.hal.ref_cal_busy() {
            error!("32k reference calibration still busy after {} polls", EXT32K_CAL_POLLS);
            return Err(Error::HardwareTimeout);
        }
        Ok(())
    }

    fn gpio_wd(&mut self, pad: u8, rail: u8) -> Result<Response, Error> {
        let pad = match self.check_pad(decode_pad(self.platform(), pad)) {
            Ok(pad) => pad,
            Err(e) => {
                warn!("GPIO_WD rejected: {:?}", e);
                return complete(Opcode::GpioWd, &[e.status()]);
            }
        };
        let Some(volt_rail) = PowerRail::from_u8(rail) else {
            warn!("GPIO_WD rejected for rail {}", rail);
            return complete(Opcode::GpioWd, &[VENDOR_ERROR]);
        };

        self.hal.gpio_claim(pad);
        self.release_reset_pad(pad);
        self.start_wd_keepalive(WatchdogGpio { pad, volt_rail });
        complete(Opcode::GpioWd, &[CO_ERROR_NO_ERROR])
    }

    fn sleep_clk_sel(&mut self, clk: u8) -> Result<Response, Error> {
        let error = if self.platform().is_531() {
            CO_ERROR_NO_ERROR
        } else {
            match SleepClock::from_u8(clk) {
                Some(clk) => {
                    self.hal.sleep_clock_select(clk);
                    CO_ERROR_NO_ERROR
                }
                None => VENDOR_ERROR,
            }
        };
        complete(Opcode::SleepClkSel, &[error])
    }

    fn set_tx_power(&mut self, level: u8) -> Result<Response, Error> {
        match TxPowerLevel::from_u8(level) {
            Some(level) => {
                complete(Opcode::SetTxPower, &[CO_ERROR_NO_ERROR]).map(|r| r.then(Deferred::SetTxPower(level)))
            }
            None => {
                warn!("TX power level {} out of range", level);
                complete(Opcode::SetTxPower, &[VENDOR_ERROR])
            }
        }
    }

    fn reset_mode(&mut self, mode: u8) -> Result<Response, Error> {
        match ResetMode::from_u8(mode) {
            Some(mode) => {
                self.hal.reset_mode_set(mode);
                complete(Opcode::ResetMode, &[CO_ERROR_NO_ERROR])
            }
            None => complete(Opcode::ResetMode, &[VENDOR_ERROR]),
        }
    }

    fn le_rx_test(&mut self, freq: u8) -> Result<Response, Error> {
        self.ensure_idle()?;
        self.hal.ll_test_start_rx(freq);
        self.set_state(TestState::DirectRxTest);
        complete(Opcode::LeRxTest, &[CO_ERROR_NO_ERROR])
    }

    fn le_tx_test(&mut self, freq: u8, data_len: u8, payload: u8) -> Result<Response, Error> {
        self.ensure_idle()?;
        self.ll_start_tx(freq, data_len, payload)?;
        self.set_state(TestState::DirectTxTest);
        complete(Opcode::LeTxTest, &[CO_ERROR_NO_ERROR])
    }

    fn le_test_end(&mut self) -> Result<Response, Error> {
        let state = self.shared.test_state();
        if !matches!(state, TestState::DirectTxTest | TestState::DirectRxTest) {
            return Err(Error::NotRunning(state));
        }

        let packets = self.hal.ll_test_end();
        self.set_state(TestState::Idle);

        let mut params = ReturnParams::new();
        Packer::new(&mut params).u8(CO_ERROR_NO_ERROR)?.u16(packets)?;
        complete(Opcode::LeTestEnd, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, Platform};
    use crate::error::CO_ERROR_COMMAND_DISALLOWED;
    use crate::hci::command::UART_LOOP_LEN;
    use crate::hci::pack::OtpReadCmp;
    use crate::sdk::hal::fake::{FakeHal, HalCall};
    use crate::state::SharedState;

    fn engine(shared: &SharedState, platform: Platform) -> ProdTestEngine<'_, FakeHal> {
        let config = EngineConfig::default().with_platform(platform);
        ProdTestEngine::new(FakeHal::new(platform), shared, config)
    }

    fn hw_writes(hal: &FakeHal) -> usize {
        hal.count(|c| {
            matches!(
                c,
                HalCall::GpioConfigure(..)
                    | HalCall::GpioPower(..)
                    | HalCall::GpioClaim(_)
                    | HalCall::RegWrite8(..)
                    | HalCall::RegWrite16(..)
                    | HalCall::RegWrite32(..)
            )
        })
    }

    /// UNMODULATED_ON TX from idle starts the carrier and the refresh timer.
    #[test]
    fn test_scenario_unmodulated_tx_from_idle() {
        // Arrange
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        // Act
        let resp = eng.handle(0xFE0E, &[0x54, 10]);

        // Assert
        assert_eq!(resp.event, Event::complete(Opcode::UnmodulatedOn));
        assert_eq!(resp.event.status_code(), 0);
        assert_eq!(eng.test_state(), TestState::UnmodulatedOn);
        assert!(shared.with(|s| s.refresh_running));
        assert!(eng.hal().position(&HalCall::Timer0Start).is_some());
    }

    /// A second UNMODULATED_ON TX without OFF is a state conflict.
    #[test]
    fn test_scenario_unmodulated_tx_twice() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.handle(0xFE0E, &[0x54, 10]);
        eng.hal_mut().take_calls();

        let resp = eng.handle(0xFE0E, &[0x54, 10]);

        assert_eq!(resp.event, Event::status(Opcode::UnmodulatedOn, CO_ERROR_COMMAND_DISALLOWED));
        assert_eq!(eng.test_state(), TestState::UnmodulatedOn);
        assert!(eng.hal().calls.is_empty());
    }

    /// 61 words is an invalid parameter and the OTP is never read.
    #[test]
    fn test_scenario_otp_read_too_many_words() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE04, &[0x10, 0x00, 61]);

        assert_eq!(resp.event.return_params(), &[CO_ERROR_INVALID_HCI_PARAM, 61]);
        assert_eq!(eng.hal().count(|c| matches!(c, HalCall::OtpRead(..))), 0);
    }

    /// An out of range pad answers 0xFF without any register write.
    #[test]
    fn test_scenario_gpio_set_invalid_pad() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE12, &[200, 3, 0, 1, 0, 0]);

        assert_eq!(resp.event.return_params(), &[VENDOR_ERROR]);
        assert_eq!(hw_writes(eng.hal()), 0);
    }

    #[test]
    fn test_otp_read_zero_words() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE04, &[0x10, 0x00, 0]);

        assert_eq!(resp.event.return_params(), &[CO_ERROR_INVALID_HCI_PARAM, 0]);
        assert!(eng.hal().calls.is_empty());
    }

    /// Every valid word count returns exactly the stored words.
    #[test]
    fn test_otp_read_returns_stored_words() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        for (i, b) in eng.hal_mut().otp[0x100..0x100 + OTP_DATA_MAX].iter_mut().enumerate() {
            *b = i as u8;
        }

        for n in 1..=MAX_READ_WRITE_OTP_WORDS as u8 {
            let resp = eng.handle(0xFE04, &[0x00, 0x01, n]);

            let cmp = OtpReadCmp::unpack(resp.event.return_params()).unwrap();
            assert_eq!(cmp.status, 0);
            assert_eq!(cmp.num_words, n);
            assert_eq!(cmp.data.as_slice(), &eng.hal().otp[0x100..0x100 + n as usize * 4]);
        }
    }

    /// Words go out in 64-bit cells, the odd last word paired with zero.
    #[test]
    fn test_otp_write_pairs_words() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);
        let buf = [0x00, 0x02, 3, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0];

        let resp = eng.handle(0xFE05, &buf);

        assert_eq!(resp.event.return_params(), &[0, 3]);
        assert_eq!(
            eng.hal().calls,
            vec![HalCall::OtpWrite(0x200, vec![1, 2]), HalCall::OtpWrite(0x208, vec![3, 0])]
        );
    }

    #[test]
    fn test_otp_write_too_many_words() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let mut buf = std::vec![0u8; 3 + 61 * 4];
        buf[2] = 61;

        let resp = eng.handle(0xFE05, &buf);

        assert_eq!(resp.event.return_params(), &[CO_ERROR_INVALID_HCI_PARAM, 61]);
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_otp_rw_bdaddr() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.handle(0xFE03, &[3, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let resp = eng.handle(0xFE03, &[2, 0, 0, 0, 0, 0, 0]);

        assert_eq!(
            eng.hal().calls[0],
            HalCall::OtpWrite(0x7FD4, vec![0x4433_2211, 0x6655])
        );
        assert_eq!(resp.event.return_params(), &[2, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    /// The OTP xtal trim only exists on DA1458x.
    #[test]
    fn test_otp_rw_xtal_trim_ignored_on_da14531() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE03, &[1, 0x34, 0x12, 0, 0, 0, 0]);

        assert_eq!(resp.event.return_params(), &[1, 0, 0, 0, 0, 0, 0]);
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_tx_test_replies_with_status() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE0B, &[5, 37, 2, 0x10, 0x27]);

        assert_eq!(resp.event, Event::status(Opcode::TxTest, 0));
        assert_eq!(shared.params().tx_packets, 10000);
        assert_eq!(eng.test_state(), TestState::StartTx);
    }

    /// Parameters of a running test are not overwritten by a rejected start.
    #[test]
    fn test_tx_test_while_busy_keeps_params() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.handle(0xFE0C, &[7]);

        let resp = eng.handle(0xFE0B, &[5, 37, 2, 0x10, 0x27]);

        assert_eq!(resp.event, Event::status(Opcode::TxTest, CO_ERROR_COMMAND_DISALLOWED));
        assert_eq!(shared.params().freq, 7);
    }

    #[test]
    fn test_prod_rx_report() {
        // Arrange
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.handle(0xFE0C, &[3]);
        shared.record_rx_packet(true, true, 0x50);
        shared.record_rx_packet(true, false, 0x51);
        shared.record_rx_packet(false, true, 0x52);

        // Act
        let resp = eng.handle(0xFE0D, &[]);

        // Assert
        assert_eq!(resp.event.return_params(), &[1, 0, 1, 0, 1, 0, 0x52, 0]);
        assert_eq!(eng.test_state(), TestState::Idle);
        assert!(eng.hal().position(&HalCall::LlStop).is_some());
    }

    #[test]
    fn test_end_prod_rx_when_not_running() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE0D, &[]);

        assert_eq!(resp.event, Event::status(Opcode::EndProdRxTest, CO_ERROR_COMMAND_DISALLOWED));
    }

    #[test]
    fn test_continuous_tx_start_and_end() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let start = eng.handle(0xFE0F, &[20, 0]);
        eng.hal_mut().take_calls();
        let end = eng.handle(0xFE10, &[]);

        assert_eq!(start.event, Event::complete(Opcode::TxStartContinueTest));
        assert_eq!(end.event, Event::complete(Opcode::TxEndContinueTest));
        assert_eq!(
            eng.hal().calls,
            vec![
                HalCall::Timer0IrqDisable,
                HalCall::Timer0Stop,
                HalCall::Timer0ClkDisable,
                HalCall::LlStop,
                HalCall::LlTaskIdle,
                HalCall::RfTestCntlWrite(0),
            ]
        );
        assert_eq!(eng.test_state(), TestState::Idle);
    }

    #[test]
    fn test_tx_end_continue_when_not_running() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE10, &[]);

        assert_eq!(resp.event.status_code(), CO_ERROR_COMMAND_DISALLOWED);
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_unmodulated_invalid_operation_gets_reply() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE0E, &[0x58, 10]);

        assert_eq!(resp.event, Event::status(Opcode::UnmodulatedOn, CO_ERROR_INVALID_HCI_PARAM));
    }

    #[test]
    fn test_short_payload_is_rejected_before_dispatch() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE0E, &[0x54]);

        assert_eq!(resp.event, Event::status(0xFE0Eu16, CO_ERROR_INVALID_HCI_PARAM));
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_531_only_command_on_da1458x() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);

        let resp = eng.handle(0xFE1B, &[3]);

        assert_eq!(resp.event, Event::status(0xFE1Bu16, 0x01));
        assert_eq!(resp.deferred, None);
    }

    /// A valid PWM request routes PWM2 to the pad and runs Timer2.
    #[test]
    fn test_gpio_set_pwm_start() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE12, &[9, 3, 1, 1, 4, 25]);

        assert_eq!(resp.event.return_params(), &[0]);
        let pad = Pad::new(0, 9);
        assert_eq!(
            eng.hal().calls,
            vec![
                HalCall::GpioClaim(pad),
                HalCall::GpioConfigure(pad, PinMode::Output, PinFunction::Pwm2, false),
                HalCall::GpioPower(pad, PowerRail::V1),
                HalCall::Timer0ClkEnable,
                HalCall::Timer0ClkDiv(TIM0_2_CLK_DIV),
                HalCall::Timer2PwmStart(Timer2Pwm::from_khz(4, 25)),
            ]
        );
    }

    #[test]
    fn test_gpio_set_pwm_stop() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);

        let resp = eng.handle(0xFE12, &[23, 3, 0, 0, 4, 25]);

        let pad = Pad::new(2, 3);
        assert_eq!(resp.event.return_params(), &[0]);
        assert_eq!(eng.hal().calls[1], HalCall::Timer2Stop);
        assert_eq!(
            eng.hal().calls[2],
            HalCall::GpioConfigure(pad, PinMode::InputPullDown, PinFunction::Gpio, false)
        );
    }

    #[test]
    fn test_gpio_set_plain_output() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.handle(0xFE12, &[4, 3, 0, 1, 0, 0]);

        let pad = Pad::new(0, 4);
        assert_eq!(
            &eng.hal().calls[1..],
            &[
                HalCall::GpioConfigure(pad, PinMode::Output, PinFunction::Gpio, true),
                HalCall::GpioPower(pad, PowerRail::V3),
            ]
        );
    }

    /// Each parameter check rejects on its own.
    #[test]
    fn test_gpio_set_parameter_checks() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let cases: [[u8; 6]; 4] = [
            [4, 4, 0, 0, 0, 0],
            [4, 0, 2, 0, 0, 0],
            [4, 3, 0, 2, 0, 0],
            [4, 3, 0, 1, 4, 101],
        ];

        for case in cases {
            let resp = eng.handle(0xFE12, &case);
            assert_eq!(resp.event.return_params(), &[VENDOR_ERROR], "{:?}", case);
        }
        assert!(eng.hal().calls.is_empty());
    }

    /// The P0_0 reset function is switched off before the pad becomes a GPIO.
    #[test]
    fn test_gpio_set_reset_pad_da14531() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.handle(0xFE12, &[0, 0, 0, 0, 0, 0]);

        assert_eq!(eng.hal().calls[1], HalCall::ResetModeSet(ResetMode::Disabled));
    }

    #[test]
    fn test_gpio_read() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);
        eng.hal_mut().pin_levels.insert(Pad::new(1, 2), true);

        let high = eng.handle(0xFE13, &[12]);
        let low = eng.handle(0xFE13, &[13]);
        let bad = eng.handle(0xFE13, &[16]);

        assert_eq!(high.event.return_params(), &[1]);
        assert_eq!(low.event.return_params(), &[0]);
        assert_eq!(bad.event.return_params(), &[VENDOR_ERROR]);
    }

    #[test]
    fn test_gpio_wd_starts_keepalive() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE17, &[8, 0]);

        assert_eq!(resp.event.return_params(), &[0]);
        assert!(shared.with(|s| s.wdog_enabled));
        assert_eq!(
            shared.with(|s| s.wd_gpio),
            Some(WatchdogGpio {
                pad: Pad::new(0, 8),
                volt_rail: PowerRail::V3
            })
        );
    }

    /// Every command that takes a pad rejects an invalid one before any pad is
    /// configured.
    #[test]
    fn test_invalid_pad_rejected_by_every_gpio_command() {
        // Arrange
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let cases: [(u16, &[u8], &[u8]); 6] = [
            (0xFE12, &[12, 3, 0, 1, 0, 0], &[VENDOR_ERROR]),
            (0xFE13, &[12], &[VENDOR_ERROR]),
            (0xFE17, &[12, 0], &[VENDOR_ERROR]),
            (0xFE09, &[0, 4, 0, 12], &[1, 0]),
            (
                0xFE11,
                &[1, 0, 0, 12, 0, 3, 0, 0, 0, 0, 0x0F, 0, 0x18, 0, 0, 0, 0],
                &[VENDOR_ERROR, 0],
            ),
            (0xFE02, &[6, 12, 0], &[4, 0]),
        ];

        for (opcode, params, status) in cases {
            // Act
            let resp = eng.handle(opcode, params);

            // Assert
            assert_eq!(resp.event.return_params(), status, "{:#x}", opcode);
            assert_eq!(resp.deferred, None, "{:#x}", opcode);
        }
        assert_eq!(eng.hal().count(|c| matches!(c, HalCall::GpioConfigure(..))), 0);
        assert_eq!(hw_writes(eng.hal()), 0);
        assert!(!shared.with(|s| s.wdog_enabled));
    }

    #[test]
    fn test_gpio_wd_invalid_rail() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE17, &[8, 2]);

        assert_eq!(resp.event.return_params(), &[VENDOR_ERROR]);
        assert!(eng.hal().calls.is_empty());
        assert!(!shared.with(|s| s.wdog_enabled));
    }

    #[test]
    fn test_xtal_trim_increment_saturates() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.hal_mut().xtal_trim = 0xF0;

        eng.handle(0xFE02, &[3, 0x0F, 0]);
        eng.handle(0xFE02, &[3, 0x01, 0]);
        let read = eng.handle(0xFE02, &[0, 0, 0]);

        assert_eq!(read.event.return_params(), &[0xFF, 0]);
        assert_eq!(eng.hal().count(|c| matches!(c, HalCall::XtalTrimWrite(_))), 1);
    }

    #[test]
    fn test_xtal_trim_decrement_floor() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);
        eng.hal_mut().xtal_trim = 5;

        eng.handle(0xFE02, &[4, 6, 0]);
        eng.handle(0xFE02, &[4, 5, 0]);

        assert_eq!(eng.hal().xtal_trim, 0);
        assert_eq!(eng.hal().calls, vec![HalCall::XtalTrimWrite(0)]);
    }

    #[test]
    fn test_xtal_calibrate_status_codes() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.hal_mut().trim_result = Err(TrimError::OutOfRange);
        let out_of_range = eng.handle(0xFE02, &[6, 3, 0]);
        eng.hal_mut().trim_result = Err(TrimError::NoPulse);
        let no_pulse = eng.handle(0xFE02, &[6, 3, 0]);
        let no_pad = eng.handle(0xFE02, &[6, 12, 0]);
        let no_rx = eng.handle(0xFE02, &[6, XTAL_TRIM_FIND_RX_PAD, 0]);

        assert_eq!(out_of_range.event.return_params(), &[1, 0]);
        assert_eq!(no_pulse.event.return_params(), &[2, 0]);
        assert_eq!(no_pad.event.return_params(), &[4, 0]);
        assert_eq!(no_rx.event.return_params(), &[4, 0]);
    }

    /// Calibration on DA1458x stores the trim in the OTP header.
    #[test]
    fn test_xtal_calibrate_stores_trim_da1458x() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);
        eng.hal_mut().trim_result = Ok(0x1234);

        let resp = eng.handle(0xFE02, &[7, 23, 0]);

        assert_eq!(resp.event.return_params(), &[0, 0]);
        assert_eq!(eng.hal().calls.last(), Some(&HalCall::OtpWrite(0xFF18, vec![0x1234, 0])));
        assert_eq!(resp.deferred, None);
    }

    /// A pulse on the UART RX pad is waited out and the pad handed back after the reply.
    ///
    /// # Notes
    ///
    /// * The pin reads low throughout, so the wait for the pulse end runs to its timeout
    #[test]
    fn test_xtal_calibrate_on_uart_rx() {
        // Arrange
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let rx = Pad::new(0, 5);
        eng.hal_mut().uart_rx_pad = Some(rx);

        // Act
        let resp = eng.handle(0xFE02, &[6, XTAL_TRIM_FIND_RX_PAD, 0]);

        // Assert
        assert_eq!(resp.event.return_params(), &[0, 0]);
        assert_eq!(resp.deferred, Some(Deferred::XtalPulseEnd(rx)));
        assert_eq!(eng.hal().calls.last(), Some(&HalCall::DelayUs(XTAL_PULSE_GUARD_US)));

        eng.hal_mut().pin_levels.insert(rx, true);
        eng.hal_mut().take_calls();
        eng.run_deferred(Deferred::XtalPulseEnd(rx));
        assert_eq!(
            eng.hal().calls,
            vec![
                HalCall::GpioStatus(rx),
                HalCall::GpioConfigure(rx, PinMode::Input, PinFunction::UartRx, false),
            ]
        );
    }

    #[test]
    fn test_sensor_test_spi_write_then_read() {
        // Arrange
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.hal_mut().sensor_value = 0x33;
        let buf = [0, 1, 0, 4, 0, 5, 0, 6, 0, 7, 0x0F, 0x55, 0, 0, 0, 0, 0];

        // Act
        let resp = eng.handle(0xFE11, &buf);

        // Assert
        assert_eq!(resp.event.return_params(), &[0x33, 0]);
        let hal = eng.hal();
        let write = hal.position(&HalCall::SpiWrite(0x0F, 0x55)).unwrap();
        let settle = hal.position(&HalCall::DelayUs(SENSOR_SETTLE_US)).unwrap();
        let read = hal.position(&HalCall::SpiRead(0x8F)).unwrap();
        let close = hal.position(&HalCall::SensorClose).unwrap();
        assert!(write < settle && settle < read && read < close);
        assert_eq!(hal.calls.last(), Some(&HalCall::UartRestorePads));
    }

    /// With the INT check the reply is the INT pad level.
    #[test]
    fn test_sensor_test_i2c_int_check() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.hal_mut().sensor_value = 0x33;
        eng.hal_mut().pin_levels.insert(Pad::new(0, 9), true);
        let buf = [1, 0, 0, 2, 0, 3, 0, 0, 0, 0, 0x0F, 0, 0x18, 1, 0, 9, 0];

        let resp = eng.handle(0xFE11, &buf);

        assert_eq!(resp.event.return_params(), &[1, 0]);
        assert!(eng.hal().position(&HalCall::I2cRead(0x0F)).is_some());
        assert_eq!(eng.hal().count(|c| matches!(c, HalCall::I2cWrite(..))), 0);
    }

    #[test]
    fn test_sensor_test_invalid_pad() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let buf = [0, 1, 0, 4, 0, 5, 0, 6, 0, 12, 0x0F, 0x55, 0, 0, 0, 0, 0];

        let resp = eng.handle(0xFE11, &buf);

        assert_eq!(resp.event.return_params(), &[0xFF, 0]);
        assert!(eng.hal().calls.is_empty());
    }

    /// A bus on P0_0 switches the reset pad to POR for the duration of the test.
    #[test]
    fn test_sensor_test_reset_pad_restored() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let buf = [1, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0x0F, 0, 0x18, 0, 0, 0, 0];

        eng.handle(0xFE11, &buf);

        assert_eq!(eng.hal().calls[0], HalCall::ResetModeSet(ResetMode::PorReset));
        assert!(eng
            .hal()
            .position(&HalCall::ResetModeSet(ResetMode::HwReset))
            .is_some());
        assert_eq!(eng.hal().reset_mode, ResetMode::HwReset);
    }

    #[test]
    fn test_ext32k_test_timeout() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);
        eng.hal_mut().ref_cal_busy_polls = u32::MAX;

        let resp = eng.handle(0xFE16, &[]);

        assert_eq!(resp.event.return_params(), &[VENDOR_ERROR]);
        assert_eq!(
            eng.hal().count(|c| *c == HalCall::DelayUs(EXT32K_CAL_POLL_US)),
            EXT32K_CAL_POLLS as usize
        );
    }

    /// An XTAL32K that was off is started for the test and switched off again.
    #[test]
    fn test_ext32k_test_restores_xtal32k() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.hal_mut().xtal32k = false;
        eng.hal_mut().ref_cal_busy_polls = 3;

        let resp = eng.handle(0xFE16, &[]);

        assert_eq!(resp.event.return_params(), &[0]);
        let calls = &eng.hal().calls;
        assert_eq!(calls[0], HalCall::Xtal32kEnable(true));
        assert_eq!(calls[1], HalCall::DelayUs(XTAL32K_STARTUP_US));
        assert_eq!(calls.last(), Some(&HalCall::Xtal32kEnable(false)));
    }

    #[test]
    fn test_sleep_test_defers_sleep() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE01, &[1, 1, 30]);

        assert_eq!(resp.event, Event::status(Opcode::SleepTest, 0));
        assert_eq!(
            resp.deferred,
            Some(Deferred::Sleep {
                mode: SleepMode::Extended,
                wakeup: Wakeup::Periodic(90 * 1600),
            })
        );
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_uart_baud_fallback() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let ok = eng.handle(0xFE15, &[4]);
        let bad = eng.handle(0xFE15, &[9]);

        assert_eq!(ok.event.return_params(), &[0]);
        assert_eq!(ok.deferred, Some(Deferred::UartBaud(UartBaud::B1M)));
        assert_eq!(bad.event.return_params(), &[1]);
        assert_eq!(bad.deferred, Some(Deferred::UartBaud(UartBaud::B115200)));
    }

    #[test]
    fn test_change_uart_pins() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);

        let ok = eng.handle(0xFE09, &[0, 4, 0, 5]);
        let bad = eng.handle(0xFE09, &[0, 4, 1, 7]);

        assert_eq!(ok.event.return_params(), &[0, 0]);
        assert_eq!(
            ok.deferred,
            Some(Deferred::UartPins {
                tx: Pad::new(0, 4),
                rx: Pad::new(0, 5)
            })
        );
        assert_eq!(bad.event.return_params(), &[1, 0]);
        assert_eq!(bad.deferred, None);
    }

    #[test]
    fn test_set_tx_power() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let ok = eng.handle(0xFE1B, &[12]);
        let bad = eng.handle(0xFE1B, &[13]);

        assert_eq!(ok.event.return_params(), &[0]);
        assert_eq!(ok.deferred, Some(Deferred::SetTxPower(TxPowerLevel::Plus3d1)));
        assert_eq!(bad.event.return_params(), &[VENDOR_ERROR]);
        assert_eq!(bad.deferred, None);
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_firmware_version_layout() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        let resp = eng.handle(0xFE08, &[]);

        let p = resp.event.return_params();
        assert_eq!(p.len(), 2 + 2 * VERSION_FIELD_LEN);
        assert_eq!(p[0] as usize, SDK_VERSION.len() + 1);
        assert_eq!(p[1] as usize, APP_VERSION.len() + 1);
        assert_eq!(&p[2..2 + SDK_VERSION.len()], SDK_VERSION.as_bytes());
        assert_eq!(p[2 + SDK_VERSION.len()], 0);
    }

    #[test]
    fn test_register_rw() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.handle(0xFE06, &[1, 0x00, 0x10, 0x00, 0x50, 0x78, 0x56, 0x34, 0x12]);
        let read = eng.handle(0xFE06, &[0, 0x00, 0x10, 0x00, 0x50, 0, 0, 0, 0]);
        let unknown = eng.handle(0xFE06, &[9, 0x00, 0x10, 0x00, 0x50, 0, 0, 0, 0]);

        assert_eq!(read.event.return_params(), &[0, 0, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(unknown.event.return_params(), &[9, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_custom_action() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.hal_mut().xtal_trim = 0x1A2;

        let trim = eng.handle(0xFE00, &[0x33]);
        let echo = eng.handle(0xFE00, &[0x5F]);

        assert_eq!(trim.event.return_params(), &[0xA2, 0x01, 0, 0]);
        assert_eq!(echo.event.return_params(), &[0x5F, 0, 0, 0]);
    }

    #[test]
    fn test_le_tx_test_and_end() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        eng.hal_mut().le_test_packets = 1500;

        let start = eng.handle(0x201E, &[39, 37, 0]);
        let end = eng.handle(0x201F, &[]);
        let again = eng.handle(0x201F, &[]);

        assert_eq!(start.event.return_params(), &[0]);
        assert_eq!(end.event.return_params(), &[0, 0xDC, 0x05]);
        assert_eq!(again.event.status_code(), CO_ERROR_COMMAND_DISALLOWED);
        assert_eq!(eng.test_state(), TestState::Idle);
    }

    #[test]
    fn test_le_rx_test_enters_direct_rx() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.handle(0x201D, &[12]);

        assert_eq!(eng.test_state(), TestState::DirectRxTest);
        assert_eq!(eng.hal().calls, vec![HalCall::LlStartRx(12)]);
    }

    #[test]
    fn test_sleep_clk_sel() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da1458x);

        let xtal = eng.handle(0xFE18, &[1]);
        let bad = eng.handle(0xFE18, &[2]);

        assert_eq!(xtal.event.return_params(), &[0]);
        assert_eq!(bad.event.return_params(), &[VENDOR_ERROR]);
        assert_eq!(eng.hal().calls, vec![HalCall::SleepClock(SleepClock::Xtal32k)]);
    }

    #[test]
    fn test_rdtester_da1458x_only() {
        let shared = SharedState::new();
        let mut eng_58x = engine(&shared, Platform::Da1458x);
        let shared_531 = SharedState::new();
        let mut eng_531 = engine(&shared_531, Platform::Da14531);

        eng_58x.handle(0xFE0A, &[5, 0x10, 0x00]);
        let resp = eng_531.handle(0xFE0A, &[5, 0x10, 0x00]);

        assert_eq!(eng_58x.hal().calls, vec![HalCall::RdTester(RdTesterOp::RstPulse, 0x10)]);
        assert_eq!(resp.event, Event::complete(Opcode::RdTester));
        assert!(eng_531.hal().calls.is_empty());
    }

    #[test]
    fn test_configure_test_mode_and_reset_mode() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);

        eng.handle(0xFE1C, &[1]);
        let ok = eng.handle(0xFE1E, &[1]);
        let bad = eng.handle(0xFE1E, &[3]);

        assert!(shared.radio_cont_mode());
        assert_eq!(ok.event.return_params(), &[0]);
        assert_eq!(bad.event.return_params(), &[VENDOR_ERROR]);
        assert_eq!(eng.hal().reset_mode, ResetMode::PorReset);
    }

    #[test]
    fn test_uart_loop_echo() {
        let shared = SharedState::new();
        let mut eng = engine(&shared, Platform::Da14531);
        let mut data = [0u8; UART_LOOP_LEN];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }

        let resp = eng.handle(0xFE14, &data);

        assert_eq!(resp.event.return_params(), &data[..]);
    }
}
