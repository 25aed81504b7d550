use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::config::Platform;

pub const VENDOR_OPCODE_BASE: u16 = 0xFE00;

pub const HCI_LE_RX_TEST_CMD_OPCODE: u16 = 0x201D;
pub const HCI_LE_TX_TEST_CMD_OPCODE: u16 = 0x201E;
pub const HCI_LE_TEST_END_CMD_OPCODE: u16 = 0x201F;

/// Commands understood by the production test engine.
///
/// Vendor commands sit at `0xFE00 + index`. Offset 0x19 (range extender enable) is
/// reserved and not part of the table, so it decodes as an unknown command.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    CustomAction = VENDOR_OPCODE_BASE,
    SleepTest = VENDOR_OPCODE_BASE + 0x01,
    XtalTrim = VENDOR_OPCODE_BASE + 0x02,
    OtpRw = VENDOR_OPCODE_BASE + 0x03,
    OtpRead = VENDOR_OPCODE_BASE + 0x04,
    OtpWrite = VENDOR_OPCODE_BASE + 0x05,
    RegisterRw = VENDOR_OPCODE_BASE + 0x06,
    AudioTest = VENDOR_OPCODE_BASE + 0x07,
    FirmwareVersionGet = VENDOR_OPCODE_BASE + 0x08,
    ChangeUartPins = VENDOR_OPCODE_BASE + 0x09,
    RdTester = VENDOR_OPCODE_BASE + 0x0A,
    TxTest = VENDOR_OPCODE_BASE + 0x0B,
    StartProdRxTest = VENDOR_OPCODE_BASE + 0x0C,
    EndProdRxTest = VENDOR_OPCODE_BASE + 0x0D,
    UnmodulatedOn = VENDOR_OPCODE_BASE + 0x0E,
    TxStartContinueTest = VENDOR_OPCODE_BASE + 0x0F,
    TxEndContinueTest = VENDOR_OPCODE_BASE + 0x10,
    SensorTest = VENDOR_OPCODE_BASE + 0x11,
    GpioSet = VENDOR_OPCODE_BASE + 0x12,
    GpioRead = VENDOR_OPCODE_BASE + 0x13,
    UartLoop = VENDOR_OPCODE_BASE + 0x14,
    UartBaud = VENDOR_OPCODE_BASE + 0x15,
    Ext32kTest = VENDOR_OPCODE_BASE + 0x16,
    GpioWd = VENDOR_OPCODE_BASE + 0x17,
    SleepClkSel = VENDOR_OPCODE_BASE + 0x18,
    AdcVbat = VENDOR_OPCODE_BASE + 0x1A,
    SetTxPower = VENDOR_OPCODE_BASE + 0x1B,
    ConfigureTestMode = VENDOR_OPCODE_BASE + 0x1C,
    PlatformReset = VENDOR_OPCODE_BASE + 0x1D,
    ResetMode = VENDOR_OPCODE_BASE + 0x1E,

    LeRxTest = HCI_LE_RX_TEST_CMD_OPCODE,
    LeTxTest = HCI_LE_TX_TEST_CMD_OPCODE,
    LeTestEnd = HCI_LE_TEST_END_CMD_OPCODE,
}

impl Opcode {
    /// Looks up a raw opcode, rejecting commands the platform does not carry.
    pub fn lookup(raw: u16, platform: Platform) -> Option<Self> {
        Self::from_u16(raw).filter(|op| platform.is_531() || !op.is_531_only())
    }

    /// Commands that only exist in the DA14531 build.
    pub const fn is_531_only(&self) -> bool {
        matches!(
            self,
            Opcode::SetTxPower | Opcode::ConfigureTestMode | Opcode::ResetMode
        )
    }

    pub const fn is_vendor(&self) -> bool {
        (*self as u16) >= VENDOR_OPCODE_BASE
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> Self {
        op as u16
    }
}
