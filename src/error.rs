use core::fmt;

use crate::hci::pack::PackError;
use crate::state::TestState;

// HCI status codes used in replies
pub const CO_ERROR_NO_ERROR: u8 = 0x00;
pub const CO_ERROR_UNKNOWN_HCI_COMMAND: u8 = 0x01;
pub const CO_ERROR_COMMAND_DISALLOWED: u8 = 0x0C;
pub const CO_ERROR_INVALID_HCI_PARAM: u8 = 0x12;
pub const CO_ERROR_CONTROLLER_BUSY: u8 = 0x3A;
pub const VENDOR_ERROR: u8 = 0xFF;

/// Errors raised while decoding or executing a production test command.
///
/// None of these are fatal. The dispatcher turns every one of them into a status byte
/// in the reply so the host always gets an answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Payload did not fit the declared layout.
    Pack(PackError),
    /// Opcode outside the supported table, or not supported on this platform.
    UnknownOpcode(u16),
    /// A parameter is outside its allowed range.
    InvalidParam,
    /// GPIO port/pin rejected by the platform validity table.
    InvalidGpio { port: u8, pin: u8 },
    /// A start was requested while another test is running.
    AlreadyRunning(TestState),
    /// A stop or read-out was requested for a test that is not running.
    NotRunning(TestState),
    /// Unknown sub-operation of a multi-operation command.
    InvalidOperation(u8),
    /// The link layer never allocated its test element.
    LinkLayerBusy,
    /// A bounded hardware poll ran out.
    HardwareTimeout,
}

impl Error {
    /// Status byte reported to the host.
    pub const fn status(&self) -> u8 {
        match self {
            Error::Pack(_) => CO_ERROR_INVALID_HCI_PARAM,
            Error::UnknownOpcode(_) => CO_ERROR_UNKNOWN_HCI_COMMAND,
            Error::InvalidParam => CO_ERROR_INVALID_HCI_PARAM,
            Error::InvalidGpio { .. } => VENDOR_ERROR,
            Error::AlreadyRunning(_) => CO_ERROR_COMMAND_DISALLOWED,
            Error::NotRunning(_) => CO_ERROR_COMMAND_DISALLOWED,
            Error::InvalidOperation(_) => CO_ERROR_INVALID_HCI_PARAM,
            Error::LinkLayerBusy => CO_ERROR_CONTROLLER_BUSY,
            Error::HardwareTimeout => VENDOR_ERROR,
        }
    }
}

impl From<PackError> for Error {
    fn from(err: PackError) -> Self {
        Error::Pack(err)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Pack(e) => defmt::write!(f, "Pack error: {}", e),
            Error::UnknownOpcode(op) => defmt::write!(f, "Unknown opcode 0x{:04x}", op),
            Error::InvalidParam => defmt::write!(f, "Invalid parameter"),
            Error::InvalidGpio { port, pin } => defmt::write!(f, "Invalid GPIO P{}_{}", port, pin),
            Error::AlreadyRunning(s) => defmt::write!(f, "Test already running: {}", s),
            Error::NotRunning(s) => defmt::write!(f, "Test not running, state {}", s),
            Error::InvalidOperation(op) => defmt::write!(f, "Invalid operation 0x{:02x}", op),
            Error::LinkLayerBusy => defmt::write!(f, "Link layer busy"),
            Error::HardwareTimeout => defmt::write!(f, "Hardware timeout"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Pack(e) => write!(f, "Pack error: {}", e),
            Error::UnknownOpcode(op) => write!(f, "Unknown opcode 0x{:04x}", op),
            Error::InvalidParam => write!(f, "Invalid parameter"),
            Error::InvalidGpio { port, pin } => write!(f, "Invalid GPIO P{}_{}", port, pin),
            Error::AlreadyRunning(s) => write!(f, "Test already running: {:?}", s),
            Error::NotRunning(s) => write!(f, "Test not running, state {:?}", s),
            Error::InvalidOperation(op) => write!(f, "Invalid operation 0x{:02x}", op),
            Error::LinkLayerBusy => write!(f, "Link layer busy"),
            Error::HardwareTimeout => write!(f, "Hardware timeout"),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every error maps to the status byte the host tooling expects.
    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Pack(PackError::InBufOverflow).status(), 0x12);
        assert_eq!(Error::UnknownOpcode(0xFE19).status(), 0x01);
        assert_eq!(Error::AlreadyRunning(TestState::StartTx).status(), 0x0C);
        assert_eq!(Error::NotRunning(TestState::Idle).status(), 0x0C);
        assert_eq!(Error::InvalidOperation(0x42).status(), 0x12);
        assert_eq!(Error::LinkLayerBusy.status(), 0x3A);
        assert_eq!(Error::InvalidGpio { port: 4, pin: 0 }.status(), 0xFF);
    }

    #[test]
    fn test_from_pack_error() {
        let err: Error = PackError::OutBufOverflow.into();
        assert_eq!(err, Error::Pack(PackError::OutBufOverflow));
    }
}
