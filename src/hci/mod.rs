//! Host controller interface of the production test engine.

pub mod command;
pub mod event;
pub mod opcode;
pub mod pack;
pub mod transport;

// H4 packet indicators
pub const HCI_CMD_MSG_TYPE: u8 = 0x01;
pub const HCI_EVT_MSG_TYPE: u8 = 0x04;
