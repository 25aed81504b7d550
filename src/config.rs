use const_format::concatcp;
use embassy_time::Duration;

use crate::sdk::rf::TxPowerLevel;

// Test channels (RF channel index, 2402 + 2*n MHz)
pub const LOW_CHANNEL: u8 = 0; // 2402 MHz (BLE channel 37)
pub const MID_CHANNEL: u8 = 12; // 2426 MHz (BLE channel 38)
pub const HIGH_CHANNEL: u8 = 39; // 2480 MHz (BLE channel 39)
pub const MAX_CHANNEL: u8 = 39;

// Payload types as defined by the LE test commands
pub const PAYL_PSEUDO_RAND_9: u8 = 0x00;
pub const PAYL_10101010: u8 = 0x02;
pub const MAX_PAYLOAD_TYPE: u8 = 0x07;

// Sequencer LE TX parameters
pub const PAYLOAD_TYPE: u8 = PAYL_PSEUDO_RAND_9;
pub const PAYLOAD_LENGTH: u8 = 37;

// Engine defaults applied on init
pub const DEFAULT_TEST_DATA_PATTERN: u8 = PAYL_10101010;
pub const DEFAULT_TEST_FREQ: u8 = 0;
pub const DEFAULT_TEST_DATA_LEN: u8 = 37;
pub const DEFAULT_TX_PACKETS: u16 = 50;

// Continuous TX always uses a valid fixed length
pub const CONTINUOUS_TX_DATA_LEN: u8 = 37;

pub const MAX_READ_WRITE_OTP_WORDS: usize = 60;

// Link layer start attempts before giving up with LinkLayerBusy
pub const LL_START_RETRIES: u8 = 8;

// Polls of the 32k reference calibration bit, 100us apart
pub const EXT32K_CAL_POLLS: u32 = 100;
pub const EXT32K_CAL_POLL_US: u32 = 100;
// XTAL32K start-up time when the oscillator had to be enabled
pub const XTAL32K_STARTUP_US: u32 = 200_000;

// Wait before the sensor read after a write
pub const SENSOR_SETTLE_US: u32 = 30_000;

// Settling time inside the refresh timer callback
pub const REFRESH_SETTLE_US: u32 = 5;

// Pulse timeout of the xtal auto-trim, in 10us polls
pub const PULSE_TIMEOUT_POLLS: u32 = 100_000;
// Guard after a trim pulse on the UART RX pad, before the reply goes out
pub const XTAL_PULSE_GUARD_US: u32 = 2_000;
// XTAL_TRIM pad byte asking for the pad currently routed to UART RX
pub const XTAL_TRIM_FIND_RX_PAD: u8 = 0xFE;

// Dwell time of a sequencer step, in 10 ms timer units
pub const END_OF_TEST_TIME: u32 = 500;
pub const END_OF_TEST_DURATION: Duration = Duration::from_millis(END_OF_TEST_TIME as u64 * 10);
pub const REFRESH_PERIOD: Duration = Duration::from_millis(10);

// One sleep slot is 625us, 1600 per second
pub const SLOTS_PER_SECOND: u32 = 1600;

pub const SDK_VERSION: &str = concatcp!("v_", 6u8, ".", 0u8, ".", 14u8, ".", 1114u16);
pub const APP_VERSION: &str = concatcp!("prodtest_", env!("CARGO_PKG_VERSION"));
pub const VERSION_FIELD_LEN: usize = 32;

/// Silicon family the engine runs on.
///
/// The families differ in GPIO layout, the OTP cell width and in the radio workarounds
/// needed for continuous and unmodulated modes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Platform {
    Da14531,
    Da1458x,
}

impl Platform {
    pub const fn is_531(&self) -> bool {
        matches!(self, Platform::Da14531)
    }
}

/// Who feeds commands into the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperatingMode {
    /// A test host drives the engine over HCI.
    Host,
    /// A button walks through the built-in test table.
    Standalone,
    /// A dwell timer walks through the test table after a BLE trigger.
    BatchRemote,
    /// A BLE central writes one test at a time into the control point.
    Remote,
}

#[derive(Copy, Clone, Debug)]
pub struct EngineConfig {
    pub platform: Platform,
    pub mode: OperatingMode,
    pub initial_tx_power: TxPowerLevel,
    pub ll_start_retries: u8,
    /// Standalone mode starts the first test without waiting for a button press.
    pub start_immediately: bool,
}

impl EngineConfig {
    pub const fn default() -> Self {
        Self {
            platform: Platform::Da14531,
            mode: OperatingMode::Host,
            initial_tx_power: TxPowerLevel::Plus0d6,
            ll_start_retries: LL_START_RETRIES,
            start_immediately: false,
        }
    }

    pub const fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub const fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }
}
