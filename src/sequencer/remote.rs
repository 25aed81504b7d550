//! BLE remote control of single tests.
//!
//! A central writes `[op_hi, op_lo, operation, channel, data_length, payload_type]`
//! into the control point. A valid test is parked until the peripheral itself has
//! dropped the link, then started. After the dwell time it is stopped and the device
//! restarts to advertise again.

use bitflags::bitflags;
use embassy_time::Timer;
use num_traits::FromPrimitive;

use crate::config::{END_OF_TEST_DURATION, MAX_CHANNEL, MAX_PAYLOAD_TYPE};
use crate::engine::{ProdTestEngine, UnmodulatedOp};
use crate::hci::command::Command;
use crate::hci::opcode::Opcode;
use crate::sdk::hal::ProdTestHal;
use crate::sdk::pm::SleepMode;
use crate::sequencer::send_command;

// Control point field offsets
const CP_OPERATION: usize = 2;
const CP_CHANNEL: usize = 3;
const CP_DATA_LENGTH: usize = 4;
const CP_PAYLOAD_TYPE: usize = 5;

bitflags! {
    /// Every violated constraint of a control point write, sent back as one byte.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ValidationFlags: u8 {
        const INVALID_OPCODE = 0x01;
        const INVALID_CHANNEL = 0x02;
        const INVALID_PAYLOAD_TYPE = 0x04;
        const INVALID_OPERATION = 0x08;
        const INVALID_DATA_LEN = 0x10;
        const INVALID_SLEEP_MODE = 0x20;
        const INVALID_PARAM = 0x40;
    }
}

/// Commands a central may start.
const SUPPORTED_OPCODES: [Opcode; 8] = [
    Opcode::UnmodulatedOn,
    Opcode::TxStartContinueTest,
    Opcode::TxEndContinueTest,
    Opcode::LeTxTest,
    Opcode::LeTestEnd,
    Opcode::StartProdRxTest,
    Opcode::EndProdRxTest,
    Opcode::SleepTest,
];

/// A validated remote test. End commands have nothing to undo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTest {
    pub on: Command,
    pub off: Option<Command>,
}

/// What the BLE glue does after a control point write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlPointResult {
    /// Notify the flags, the link stays up.
    Notify(ValidationFlags),
    /// Drop the link, the test starts once it is down.
    Disconnect,
}

struct Fields<'a> {
    value: &'a [u8],
    flags: ValidationFlags,
}

impl Fields<'_> {
    fn get(&mut self, offset: usize) -> Option<u8> {
        let v = self.value.get(offset).copied();
        if v.is_none() {
            self.flags |= ValidationFlags::INVALID_PARAM;
        }
        v
    }

    fn check(&mut self, value: Option<u8>, ok: impl Fn(u8) -> bool, flag: ValidationFlags) -> u8 {
        match value {
            Some(v) if !ok(v) => {
                self.flags |= flag;
                v
            }
            Some(v) => v,
            None => 0,
        }
    }

    fn channel(&mut self) -> u8 {
        let v = self.get(CP_CHANNEL);
        self.check(v, |c| c <= MAX_CHANNEL, ValidationFlags::INVALID_CHANNEL)
    }

    fn payload_type(&mut self) -> u8 {
        let v = self.get(CP_PAYLOAD_TYPE);
        self.check(v, |p| p <= MAX_PAYLOAD_TYPE, ValidationFlags::INVALID_PAYLOAD_TYPE)
    }
}

/// Validates a control point write and derives the test and its stop command.
///
/// All violations are collected, not just the first one.
///
/// # Notes
///
/// * The opcode is big-endian, unlike the HCI layout
/// * SLEEP takes its mode from the operation byte and is stopped by an Active sleep
pub fn parse_control_point(value: &[u8]) -> Result<RemoteTest, ValidationFlags> {
    let opcode = match value {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => return Err(ValidationFlags::INVALID_OPCODE),
    };
    let Some(op) = Opcode::from_u16(opcode).filter(|op| SUPPORTED_OPCODES.contains(op)) else {
        return Err(ValidationFlags::INVALID_OPCODE);
    };

    let mut f = Fields {
        value,
        flags: ValidationFlags::empty(),
    };

    let test = match op {
        Opcode::UnmodulatedOn => {
            let operation = f.get(CP_OPERATION);
            let operation = f.check(
                operation,
                |o| UnmodulatedOp::from_u8(o).is_some(),
                ValidationFlags::INVALID_OPERATION,
            );
            let freq = f.channel();
            RemoteTest {
                on: Command::UnmodulatedOn { op: operation, freq },
                off: Some(Command::UnmodulatedOn {
                    op: UnmodulatedOp::Off as u8,
                    freq: 0,
                }),
            }
        }
        Opcode::LeTxTest => {
            let freq = f.channel();
            let data_len = f.get(CP_DATA_LENGTH);
            let data_len = f.check(data_len, |l| l >= 1, ValidationFlags::INVALID_DATA_LEN);
            let payload = f.payload_type();
            RemoteTest {
                on: Command::LeTxTest {
                    freq,
                    data_len,
                    payload,
                },
                off: Some(Command::LeTestEnd),
            }
        }
        Opcode::TxStartContinueTest => {
            let freq = f.channel();
            let payload = f.payload_type();
            RemoteTest {
                on: Command::TxStartContinueTest { freq, payload },
                off: Some(Command::TxEndContinueTest),
            }
        }
        Opcode::StartProdRxTest => RemoteTest {
            on: Command::StartProdRxTest { freq: f.channel() },
            off: Some(Command::EndProdRxTest),
        },
        Opcode::SleepTest => {
            let mode = f.get(CP_OPERATION);
            let mode = f.check(
                mode,
                |m| SleepMode::from_u8(m).is_some(),
                ValidationFlags::INVALID_SLEEP_MODE,
            );
            RemoteTest {
                on: Command::SleepTest { mode, mins: 0, secs: 0 },
                off: Some(Command::SleepTest {
                    mode: SleepMode::Active as u8,
                    mins: 0,
                    secs: 0,
                }),
            }
        }
        Opcode::TxEndContinueTest => RemoteTest {
            on: Command::TxEndContinueTest,
            off: None,
        },
        Opcode::EndProdRxTest => RemoteTest {
            on: Command::EndProdRxTest,
            off: None,
        },
        _ => RemoteTest {
            on: Command::LeTestEnd,
            off: None,
        },
    };

    if f.flags.is_empty() {
        Ok(test)
    } else {
        Err(f.flags)
    }
}

/// Batch-remote starts the table when the first control point byte is non-zero.
pub fn batch_trigger(value: &[u8]) -> bool {
    value.first().is_some_and(|b| *b != 0)
}

pub struct RemoteControl {
    pending: Option<RemoteTest>,
    running_off: Option<Command>,
}

impl RemoteControl {
    pub const fn default() -> Self {
        Self {
            pending: None,
            running_off: None,
        }
    }

    pub fn pending(&self) -> Option<&RemoteTest> {
        self.pending.as_ref()
    }

    pub fn on_control_point_write(&mut self, value: &[u8]) -> ControlPointResult {
        match parse_control_point(value) {
            Ok(test) => {
                debug!("Remote test {:?} accepted", test.on.opcode());
                self.pending = Some(test);
                ControlPointResult::Disconnect
            }
            Err(flags) => {
                warn!("Remote test rejected, flags {:#x}", flags.bits());
                ControlPointResult::Notify(flags)
            }
        }
    }

    /// Starts the parked test when the link was dropped by this side.
    ///
    /// Returns `true` when the end-of-test timer has to run. On any other disconnect
    /// nothing starts and the caller resumes advertising.
    pub fn on_disconnect<H: ProdTestHal>(&mut self, local: bool, engine: &mut ProdTestEngine<'_, H>) -> bool {
        if !local {
            return false;
        }

        if let Some(test) = self.pending.take() {
            send_command(engine, &test.on);
            self.running_off = test.off;
        }
        true
    }

    /// Stops the running test and restarts the device.
    pub fn on_end_of_test<H: ProdTestHal>(&mut self, engine: &mut ProdTestEngine<'_, H>) {
        if let Some(off) = self.running_off.take() {
            send_command(engine, &off);
        }
        info!("Remote test done, restarting");
        engine.hal_mut().sw_restart();
    }

    /// Dwell then stop, for the local disconnect case.
    pub async fn run_test<H: ProdTestHal>(&mut self, engine: &mut ProdTestEngine<'_, H>) {
        Timer::after(END_OF_TEST_DURATION).await;
        self.on_end_of_test(engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, Platform};
    use crate::sdk::hal::fake::{FakeHal, HalCall};
    use crate::state::{SharedState, TestState};

    fn engine(shared: &SharedState) -> ProdTestEngine<'_, FakeHal> {
        let config = EngineConfig::default().with_platform(Platform::Da14531);
        ProdTestEngine::new(FakeHal::new(Platform::Da14531), shared, config)
    }

    /// Accepted write, local disconnect, dwell end: the carrier runs and is stopped.
    #[test]
    fn test_remote_unmodulated_cycle() {
        // Arrange
        let shared = SharedState::new();
        let mut eng = engine(&shared);
        let mut remote = RemoteControl::default();

        // Act
        let res = remote.on_control_point_write(&[0xFE, 0x0E, 0x54, 20, 0, 0]);
        let armed = remote.on_disconnect(true, &mut eng);
        let during = eng.test_state();
        remote.on_end_of_test(&mut eng);

        // Assert
        assert_eq!(res, ControlPointResult::Disconnect);
        assert!(armed);
        assert_eq!(during, TestState::UnmodulatedOn);
        assert_eq!(eng.test_state(), TestState::Idle);
        assert_eq!(eng.hal().calls.last(), Some(&HalCall::SwRestart));
    }

    /// Channel and payload errors are both reported.
    #[test]
    fn test_le_tx_collects_all_violations() {
        let res = parse_control_point(&[0x20, 0x1E, 0, 40, 37, 8]);

        assert_eq!(
            res,
            Err(ValidationFlags::INVALID_CHANNEL | ValidationFlags::INVALID_PAYLOAD_TYPE)
        );
    }

    #[test]
    fn test_le_tx_zero_length() {
        let res = parse_control_point(&[0x20, 0x1E, 0, 10, 0, 0]);

        assert_eq!(res, Err(ValidationFlags::INVALID_DATA_LEN));
    }

    #[test]
    fn test_opcode_outside_whitelist() {
        assert_eq!(
            parse_control_point(&[0xFE, 0x12, 0, 0, 0, 0]),
            Err(ValidationFlags::INVALID_OPCODE)
        );
        assert_eq!(parse_control_point(&[0xFE]), Err(ValidationFlags::INVALID_OPCODE));
    }

    #[test]
    fn test_unmodulated_bad_operation_and_short_write() {
        assert_eq!(
            parse_control_point(&[0xFE, 0x0E, 0x58, 3]),
            Err(ValidationFlags::INVALID_OPERATION)
        );
        assert_eq!(
            parse_control_point(&[0xFE, 0x0E, 0x54]),
            Err(ValidationFlags::INVALID_PARAM)
        );
    }

    #[test]
    fn test_sleep_mode_range() {
        let ok = parse_control_point(&[0xFE, 0x01, 1]).unwrap();

        assert_eq!(ok.on, Command::SleepTest { mode: 1, mins: 0, secs: 0 });
        assert_eq!(ok.off, Some(Command::SleepTest { mode: 0, mins: 0, secs: 0 }));
        assert_eq!(
            parse_control_point(&[0xFE, 0x01, 3]),
            Err(ValidationFlags::INVALID_SLEEP_MODE)
        );
    }

    /// End commands need no parameters and have no stop command.
    #[test]
    fn test_end_commands() {
        let test = parse_control_point(&[0x20, 0x1F]).unwrap();

        assert_eq!(test.on, Command::LeTestEnd);
        assert_eq!(test.off, None);
    }

    #[test]
    fn test_rejected_write_notifies() {
        let mut remote = RemoteControl::default();

        let res = remote.on_control_point_write(&[0xFE, 0x0C, 50]);

        assert_eq!(res, ControlPointResult::Notify(ValidationFlags::INVALID_CHANNEL));
        assert!(remote.pending().is_none());
    }

    /// A disconnect by the central starts nothing.
    #[test]
    fn test_remote_disconnect_keeps_test_parked() {
        let shared = SharedState::new();
        let mut eng = engine(&shared);
        let mut remote = RemoteControl::default();
        remote.on_control_point_write(&[0xFE, 0x0C, 5]);

        let armed = remote.on_disconnect(false, &mut eng);

        assert!(!armed);
        assert!(remote.pending().is_some());
        assert!(eng.hal().calls.is_empty());
    }

    #[test]
    fn test_batch_trigger() {
        assert!(batch_trigger(&[1]));
        assert!(!batch_trigger(&[0, 1]));
        assert!(!batch_trigger(&[]));
    }
}
