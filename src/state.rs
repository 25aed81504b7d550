use core::cell::RefCell;
use embassy_sync::blocking_mutex::CriticalSectionMutex;

use crate::config::{
    Platform, DEFAULT_TEST_DATA_LEN, DEFAULT_TEST_DATA_PATTERN, DEFAULT_TEST_FREQ, DEFAULT_TX_PACKETS,
};
use crate::sdk::gpio::{Pad, PowerRail};

/// RF test mode the engine is currently in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TestState {
    Idle,
    StartTx,
    StartRx,
    /// Entered by the standard LE transmitter test.
    DirectTxTest,
    /// Entered by the standard LE receiver test.
    DirectRxTest,
    StartContinueTx,
    UnmodulatedOn,
    /// DA14531 only, other platforms fold unmodulated RX into `UnmodulatedOn`.
    UnmodulatedRxOn,
}

impl TestState {
    pub const fn is_idle(&self) -> bool {
        matches!(self, TestState::Idle)
    }

    /// States whose radio activity is owned by the link layer and must be stopped there.
    pub const fn is_link_layer_owned(&self, platform: Platform) -> bool {
        match self {
            TestState::StartTx | TestState::StartRx | TestState::StartContinueTx => true,
            TestState::UnmodulatedRxOn => platform.is_531(),
            _ => false,
        }
    }
}

/// Receiver statistics collected while a production RX test runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxMetrics {
    pub rx_pkt: u16,
    pub rx_err_sync: u16,
    pub rx_err_crc: u16,
    pub rx_rssi: u16,
}

impl RxMetrics {
    pub const fn new() -> Self {
        Self {
            rx_pkt: 0,
            rx_err_sync: 0,
            rx_err_crc: 0,
            rx_rssi: 0,
        }
    }
}

/// Parameters used by the next TX/RX start.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TestParams {
    pub freq: u8,
    pub data_len: u8,
    pub data_pattern: u8,
    pub tx_packets: u16,
}

impl TestParams {
    pub const fn default() -> Self {
        Self {
            freq: DEFAULT_TEST_FREQ,
            data_len: DEFAULT_TEST_DATA_LEN,
            data_pattern: DEFAULT_TEST_DATA_PATTERN,
            tx_packets: DEFAULT_TX_PACKETS,
        }
    }
}

/// GPIO driven by the PWM keep-alive of an external watchdog.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WatchdogGpio {
    pub pad: Pad,
    pub volt_rail: PowerRail,
}

pub struct EngineState {
    pub test_state: TestState,
    pub params: TestParams,
    pub metrics: RxMetrics,
    pub tx_packet_nr: u16,
    pub rx_irq_cnt: u16,
    pub wd_gpio: Option<WatchdogGpio>,
    pub wdog_enabled: bool,
    /// Radio LDOs stay on in continuous mode, no refresh needed.
    pub radio_cont_mode: bool,
    pub refresh_running: bool,
    /// Set when a sequencer command needs a BLE end event before the next start.
    pub ble_event_pending: bool,
}

impl EngineState {
    pub const fn new() -> Self {
        Self {
            test_state: TestState::Idle,
            params: TestParams::default(),
            metrics: RxMetrics::new(),
            tx_packet_nr: 0,
            rx_irq_cnt: 0,
            wd_gpio: None,
            wdog_enabled: false,
            radio_cont_mode: false,
            refresh_running: false,
            ble_event_pending: false,
        }
    }
}

/// Engine state shared between command handlers and interrupt callbacks.
///
/// Every access runs inside a critical section. The closures passed to
/// [`SharedState::with`] must not call back into the same `SharedState`.
pub struct SharedState {
    inner: CriticalSectionMutex<RefCell<EngineState>>,
}

impl SharedState {
    pub const fn new() -> Self {
        Self {
            inner: CriticalSectionMutex::new(RefCell::new(EngineState::new())),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn test_state(&self) -> TestState {
        self.with(|s| s.test_state)
    }

    pub fn metrics(&self) -> RxMetrics {
        self.with(|s| s.metrics)
    }

    pub fn params(&self) -> TestParams {
        self.with(|s| s.params)
    }

    pub fn radio_cont_mode(&self) -> bool {
        self.with(|s| s.radio_cont_mode)
    }

    /// Called from the radio RX interrupt for every received test packet.
    pub fn record_rx_packet(&self, sync_ok: bool, crc_ok: bool, rssi: u16) {
        self.with(|s| {
            s.rx_irq_cnt = s.rx_irq_cnt.wrapping_add(1);
            if !sync_ok {
                s.metrics.rx_err_sync = s.metrics.rx_err_sync.wrapping_add(1);
            } else if !crc_ok {
                s.metrics.rx_err_crc = s.metrics.rx_err_crc.wrapping_add(1);
            } else {
                s.metrics.rx_pkt = s.metrics.rx_pkt.wrapping_add(1);
            }
            s.metrics.rx_rssi = rssi;
        })
    }

    /// Called from the radio TX interrupt for every transmitted test packet.
    pub fn record_tx_packet(&self) {
        self.with(|s| s.tx_packet_nr = s.tx_packet_nr.wrapping_add(1))
    }

    pub fn tx_packet_count(&self) -> u16 {
        self.with(|s| s.tx_packet_nr)
    }

    /// Called by the BLE stack at the end of every radio event.
    pub fn record_ble_end_event(&self) {
        self.with(|s| s.ble_event_pending = false)
    }

    pub fn ble_event_pending(&self) -> bool {
        self.with(|s| s.ble_event_pending)
    }
}
