//! Production test engine.
//!
//! The engine owns the HAL and a reference to the [`SharedState`] that interrupt
//! handlers update. All RF test modes go through the transitions in this module, every
//! start is gated on [`TestState::Idle`] and a failed start leaves the state untouched.
//! The per-command handlers live in [`dispatch`].

pub mod dispatch;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::config::{EngineConfig, Platform, CONTINUOUS_TX_DATA_LEN, PULSE_TIMEOUT_POLLS, REFRESH_SETTLE_US};
use crate::error::Error;
use crate::hci::event::Event;
use crate::sdk::gpio::{Pad, PinFunction, PinMode};
use crate::sdk::hal::{ProdTestHal, UartBaud};
use crate::sdk::pm::{SleepMode, Wakeup};
use crate::sdk::rf::{
    adpll_cn_word, ldo_ctrl_value, RadioInit, RfTestCntl, TxPowerLevel, OVERRULE_RELEASE, OVERRULE_TX_ON,
    OVERRULE_TX_RX_OFF, RX_DIS_WR, RX_EN_WR, TX_DIS_WR, TX_EN_WR,
};
use crate::sdk::timer::{REFRESH_TIMER_CONFIG, REFRESH_TIMER_RELOAD, TIM0_2_CLK_DIV, WD_TIMER_CONFIG, WD_TIMER_RELOAD};
use crate::state::{RxMetrics, SharedState, TestParams, TestState, WatchdogGpio};

/// Sub-operation of UNMODULATED_ON, the ASCII letters 'O', 'T' and 'R'.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnmodulatedOp {
    Off = 0x4F,
    Tx = 0x54,
    Rx = 0x52,
}

/// Work that must only happen once the reply has left the UART.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Deferred {
    PlatformReset,
    SetTxPower(TxPowerLevel),
    UartBaud(UartBaud),
    UartPins { tx: Pad, rx: Pad },
    Sleep { mode: SleepMode, wakeup: Wakeup },
    /// The xtal trim pulse came in on the UART RX pad. Wait for its end, then hand
    /// the pad back to the UART.
    XtalPulseEnd(Pad),
}

/// Reply to a command plus the action to run after it was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub event: Event,
    pub deferred: Option<Deferred>,
}

impl Response {
    pub fn reply(event: Event) -> Self {
        Self { event, deferred: None }
    }

    pub fn then(mut self, deferred: Deferred) -> Self {
        self.deferred = Some(deferred);
        self
    }
}

impl From<Event> for Response {
    fn from(event: Event) -> Self {
        Response::reply(event)
    }
}

pub struct ProdTestEngine<'a, H: ProdTestHal> {
    hal: H,
    shared: &'a SharedState,
    config: EngineConfig,
}

impl<'a, H: ProdTestHal> ProdTestEngine<'a, H> {
    pub fn new(hal: H, shared: &'a SharedState, config: EngineConfig) -> Self {
        Self { hal, shared, config }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn shared(&self) -> &'a SharedState {
        self.shared
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.config.platform
    }

    pub fn test_state(&self) -> TestState {
        self.shared.test_state()
    }

    /// Boot defaults: idle, default test parameters, cleared metrics and, on DA14531,
    /// the configured TX power.
    pub fn init(&mut self) {
        self.shared.with(|s| {
            s.test_state = TestState::Idle;
            s.params = TestParams::default();
            s.metrics = RxMetrics::new();
            s.tx_packet_nr = 0;
            s.rx_irq_cnt = 0;
        });

        if self.platform().is_531() {
            self.hal.rf_pa_pwr_set(self.config.initial_tx_power);
            self.hal.rf_reinit();
        }

        info!("Production test engine ready, {:?} in {:?} mode", self.config.platform, self.config.mode);
    }

    fn set_state(&self, state: TestState) {
        let prev = self.shared.with(|s| core::mem::replace(&mut s.test_state, state));
        if prev != state {
            debug!("Test state {:?} -> {:?}", prev, state);
        }
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        let state = self.shared.test_state();
        if state.is_idle() {
            Ok(())
        } else {
            warn!("Start rejected, {:?} is running", state);
            Err(Error::AlreadyRunning(state))
        }
    }

    /// Starts the link layer TX test, retrying while it has no test element yet.
    fn ll_start_tx(&mut self, freq: u8, data_len: u8, payload: u8) -> Result<(), Error> {
        let attempts = self.config.ll_start_retries.max(1);
        for attempt in 1..=attempts {
            if self.hal.ll_test_start_tx(freq, data_len, payload) {
                if attempt > 1 {
                    debug!("Link layer TX started after {} attempts", attempt);
                }
                return Ok(());
            }
        }

        error!("Link layer TX did not start after {} attempts", attempts);
        Err(Error::LinkLayerBusy)
    }

    /// Starts the packet TX test with the current test parameters.
    pub fn start_tx(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;

        let p = self.shared.params();
        self.shared.with(|s| s.tx_packet_nr = 0);
        self.ll_start_tx(p.freq, p.data_len, p.data_pattern)?;
        self.set_state(TestState::StartTx);
        Ok(())
    }

    /// Starts the production RX test on the current test frequency with fresh metrics.
    pub fn start_rx(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;

        let freq = self.shared.with(|s| {
            s.metrics = RxMetrics::new();
            s.rx_irq_cnt = 0;
            s.params.freq
        });
        self.hal.ll_test_start_rx(freq);
        self.set_state(TestState::StartRx);
        Ok(())
    }

    /// Starts continuous modulated TX.
    ///
    /// # Algorithm
    ///
    /// 1. DA14531: apply the radio LDO continuous mode bits
    /// 2. Start the link layer TX test with the test frequency and pattern, length 37
    /// 3. Make the test endless: set INFINITETX, clear the length and payload sources
    /// 4. Enter `StartContinueTx`
    /// 5. Mask the RF diagnostic IRQ
    /// 6. DA14531: start the refresh timer
    pub fn start_continue_tx(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;

        let p = self.shared.params();
        let is_531 = self.platform().is_531();

        if is_531 {
            self.configure_radio_ldo();
        }
        self.ll_start_tx(p.freq, CONTINUOUS_TX_DATA_LEN, p.data_pattern)?;
        self.hal.rf_test_cntl_set(RfTestCntl::INFINITETX);
        self.hal.rf_test_cntl_clear(RfTestCntl::CONTINUOUS_TX_CLEAR);
        self.set_state(TestState::StartContinueTx);
        self.hal.rf_diag_irq_disable();
        if is_531 {
            self.start_refresh_timer();
        }
        Ok(())
    }

    /// Returns to `Idle`, stopping whatever the link layer still runs. Idempotent.
    pub fn stop(&mut self) {
        let prev = self.shared.test_state();
        match prev {
            TestState::DirectTxTest | TestState::DirectRxTest => {
                self.hal.ll_test_end();
            }
            s if s.is_link_layer_owned(self.platform()) => {
                self.hal.ll_test_stop();
                self.hal.ll_set_task_idle();
            }
            _ => {}
        }
        self.set_state(TestState::Idle);
    }

    /// Turns the unmodulated carrier on or off.
    ///
    /// # Parameters
    ///
    /// * `op` - Raw operation byte, 'O' off, 'T' TX carrier, 'R' RX
    /// * `cn` - RF channel index
    ///
    /// # Notes
    ///
    /// * OFF is accepted in any state, TX and RX only from `Idle`
    /// * On DA1458x the RX carrier is folded into `UnmodulatedOn`
    pub fn unmodulated_on(&mut self, op: u8, cn: u8) -> Result<(), Error> {
        let op = UnmodulatedOp::from_u8(op).ok_or_else(|| {
            warn!("Unknown unmodulated operation {:#x}", op);
            Error::InvalidOperation(op)
        })?;

        match op {
            UnmodulatedOp::Off => {
                self.unmodulated_off();
                Ok(())
            }
            UnmodulatedOp::Tx => {
                self.ensure_idle()?;
                self.unmodulated_tx(cn);
                Ok(())
            }
            UnmodulatedOp::Rx => {
                self.ensure_idle()?;
                self.unmodulated_rx(cn);
                Ok(())
            }
        }
    }

    fn unmodulated_tx(&mut self, cn: u8) {
        self.hal.rf_diag_irq_disable();

        if self.platform().is_531() {
            self.configure_radio_ldo();
            self.apply_arp_tx_configuration();
            let adpll_on = RadioInit::ADPLLDIG_HRESET_N | RadioInit::ADPLLDIG_HCLK_EN;
            self.hal.rf_radio_init_write(1, (adpll_on.bits() >> 8) as u8);
            self.hal.rf_adpll_cn_ctrl_write(adpll_cn_word(cn));
            self.hal.rf_overrule_write(OVERRULE_TX_ON);
            self.set_state(TestState::UnmodulatedOn);
            self.start_refresh_timer();
        } else {
            self.hal.rf_channel_overrule(cn);
            self.hal.rf_modulation_enable(false);
            self.hal.rf_overrule_write(RX_DIS_WR);
            self.hal.rf_overrule_write(TX_EN_WR);
            self.set_state(TestState::UnmodulatedOn);
        }
    }

    fn unmodulated_rx(&mut self, cn: u8) {
        self.hal.rf_diag_irq_disable();

        if self.platform().is_531() {
            self.configure_radio_ldo();
            self.hal.ll_test_start_rx(cn);
            self.hal.rf_test_cntl_set(RfTestCntl::INFINITERX);
            self.set_state(TestState::UnmodulatedRxOn);
            self.start_refresh_timer();
        } else {
            self.hal.rf_channel_overrule(cn);
            self.hal.rf_modulation_enable(false);
            self.hal.rf_overrule_write(TX_DIS_WR);
            self.hal.rf_overrule_write(RX_EN_WR);
            self.set_state(TestState::UnmodulatedOn);
        }
    }

    fn unmodulated_off(&mut self) {
        let prev = self.shared.test_state();

        if self.platform().is_531() {
            self.stop_refresh_timer();
            match self.shared.test_state() {
                TestState::UnmodulatedRxOn => {
                    self.stop();
                    self.hal.rf_test_cntl_clear(RfTestCntl::INFINITERX);
                }
                TestState::UnmodulatedOn => {
                    self.hal.rf_overrule_write(OVERRULE_RELEASE);
                    self.hal.rf_adpll_deactivate();
                }
                _ => self.stop(),
            }
        } else {
            self.hal.rf_channel_release();
            self.hal.rf_overrule_write(OVERRULE_RELEASE);
            self.hal.rf_modulation_enable(true);
            self.stop();
        }
        if prev == TestState::StartContinueTx {
            self.hal.rf_test_cntl_clear(RfTestCntl::INFINITETX);
        }

        self.hal.rf_diag_irq_enable();
        self.set_state(TestState::Idle);
    }

    /// Starts the ~10 ms Timer0 interrupt that keeps the radio LDOs alive.
    ///
    /// Skipped in radio continuous mode, where the LDOs never power down.
    pub fn start_refresh_timer(&mut self) {
        if self.shared.radio_cont_mode() {
            debug!("Radio continuous mode, no refresh timer");
            return;
        }

        self.hal.timer0_2_clk_enable();
        self.hal.timer0_2_clk_div_set(TIM0_2_CLK_DIV);
        self.hal.timer0_init(REFRESH_TIMER_CONFIG);
        self.hal.timer0_set(REFRESH_TIMER_RELOAD);
        self.hal.timer0_enable_irq();
        self.hal.timer0_start();
        self.shared.with(|s| s.refresh_running = true);
    }

    pub fn stop_refresh_timer(&mut self) {
        let was_running = self.shared.with(|s| core::mem::replace(&mut s.refresh_running, false));
        if !was_running {
            return;
        }

        self.hal.timer0_disable_irq();
        self.hal.timer0_stop();
        self.hal.timer0_2_clk_disable();
    }

    /// Timer0 interrupt body of the refresh timer.
    ///
    /// # Algorithm
    ///
    /// 1. Force TX and RX off
    /// 2. Leave only the ADPLL digital power switch enabled in RF_RADIO_INIT
    /// 3. Wait for the supplies to settle
    /// 4. Re-activate the ADPLL
    /// 5. Give the radio back: TX on for the unmodulated carrier, released otherwise
    pub fn on_refresh_timer(&mut self) {
        let (running, state) = self.shared.with(|s| (s.refresh_running, s.test_state));
        if !running {
            return;
        }

        self.hal.rf_overrule_write(OVERRULE_TX_RX_OFF);
        self.hal.rf_radio_init_write(0, RadioInit::ADPLLDIG_PWR_SW1_EN.bits() as u8);
        self.hal.delay_us(REFRESH_SETTLE_US);
        self.hal.rf_adpll_activate();

        let overrule = match state {
            TestState::UnmodulatedOn => OVERRULE_TX_ON,
            _ => OVERRULE_RELEASE,
        };
        self.hal.rf_overrule_write(overrule);
    }

    /// Stores the watchdog pad and starts its PWM keep-alive on Timer0.
    ///
    /// A keep-alive already running on another pad is stopped first.
    pub fn start_wd_keepalive(&mut self, wd: WatchdogGpio) {
        self.stop_wd_keepalive();

        self.shared.with(|s| {
            s.wd_gpio = Some(wd);
            s.wdog_enabled = true;
        });

        self.hal.gpio_configure(wd.pad, PinMode::Output, PinFunction::Pwm0, true);
        self.hal.gpio_configure_power(wd.pad, wd.volt_rail);

        self.hal.timer0_stop();
        self.hal.rc32k_enable();
        self.hal.timer0_2_clk_enable();
        self.hal.timer0_2_clk_div_set(TIM0_2_CLK_DIV);
        self.hal.timer0_init(WD_TIMER_CONFIG);
        self.hal.timer0_set(WD_TIMER_RELOAD);
        self.hal.timer0_start();

        info!("Watchdog keep-alive on P{}_{}", wd.pad.port, wd.pad.pin);
    }

    /// Only acts when a keep-alive was started.
    pub fn stop_wd_keepalive(&mut self) {
        let wd = self.shared.with(|s| {
            if s.wdog_enabled {
                s.wdog_enabled = false;
                s.wd_gpio
            } else {
                None
            }
        });

        if let Some(wd) = wd {
            self.hal.gpio_configure(wd.pad, PinMode::InputPullDown, PinFunction::Gpio, true);
            self.hal.timer0_stop();
        }
    }

    /// Records radio continuous mode and moves the DC/DC converter to match.
    pub fn set_radio_ldo_configuration(&mut self, enable: bool) {
        self.shared.with(|s| s.radio_cont_mode = enable);
        if !self.hal.boost_mode() {
            self.hal.dcdc_level_set(if enable { 2 } else { 0 });
        }
    }

    fn configure_radio_ldo(&mut self) {
        let cont = self.shared.radio_cont_mode();
        let current = self.hal.rf_ldo_ctrl_read();
        self.hal.rf_ldo_ctrl_write(ldo_ctrl_value(current, cont));
    }

    fn apply_arp_tx_configuration(&mut self) {
        let table = self.hal.arp_table();
        for entry in table.tx_configuration() {
            if entry.is_8bit() {
                self.hal.reg_write8(entry.reg_address(), entry.data() as u8);
            } else {
                self.hal.reg_write16(entry.reg_address(), entry.data());
            }
        }
    }

    /// Polls `pad` while it reads `level`. Returns `false` on timeout.
    fn wait_pin_while(&mut self, pad: Pad, level: bool) -> bool {
        for _ in 0..PULSE_TIMEOUT_POLLS {
            if self.hal.gpio_pin_status(pad) != level {
                return true;
            }
        }
        warn!("P{}_{} stuck {}", pad.port, pad.pin, level);
        false
    }

    /// Runs the post-reply part of a command. Called once the reply was sent.
    pub fn run_deferred(&mut self, deferred: Deferred) {
        match deferred {
            Deferred::PlatformReset => {
                info!("Platform reset");
                self.hal.watchdog_reset();
            }
            Deferred::SetTxPower(level) => {
                self.hal.rf_pa_pwr_set(level);
                self.hal.rf_reinit();
            }
            Deferred::UartBaud(baud) => {
                self.hal.uart_flush();
                self.hal.uart_set_baud(baud);
            }
            Deferred::UartPins { tx, rx } => {
                self.hal.uart_flush();
                self.hal.uart_set_pins(tx, rx);
            }
            Deferred::Sleep { mode, wakeup } => {
                self.hal.uart_flush();
                match mode {
                    SleepMode::Active => self.hal.sleep_disable(),
                    SleepMode::Extended => {
                        self.hal.uart_release_pads();
                        self.hal.sleep_extended(wakeup);
                    }
                    SleepMode::Deep => {
                        self.hal.uart_release_pads();
                        self.hal.sleep_deep();
                    }
                }
            }
            Deferred::XtalPulseEnd(pad) => {
                self.wait_pin_while(pad, false);
                self.hal.gpio_configure(pad, PinMode::Input, PinFunction::UartRx, false);
            }
        }
    }
}
