use heapless::Vec;

use crate::hci::pack::{PackError, Packer, Unpacker, OTP_DATA_MAX};
use crate::hci::HCI_EVT_MSG_TYPE;

pub const HCI_CMD_CMP_EVT_CODE: u8 = 0x0E;
pub const HCI_CMD_STAT_EVT_CODE: u8 = 0x0F;

// Credits granted back to the host with every event
const HCI_NB_CMD_PKTS: u8 = 1;

/// Largest completion payload, an OTP_READ of 60 words.
pub const MAX_RETURN_PARAMS: usize = 2 + OTP_DATA_MAX;
/// Indicator, event code and length, plus the Command Complete header.
pub const MAX_EVENT_LEN: usize = 3 + 3 + MAX_RETURN_PARAMS;

pub type ReturnParams = Vec<u8, MAX_RETURN_PARAMS>;

/// Reply to a single command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// HCI Command Complete with the command specific return parameters.
    CommandComplete { opcode: u16, params: ReturnParams },
    /// HCI Command Status, used for early errors and for commands that complete later.
    CommandStatus { opcode: u16, status: u8 },
}

impl Event {
    /// Command Complete without return parameters.
    pub fn complete(opcode: impl Into<u16>) -> Self {
        Event::CommandComplete {
            opcode: opcode.into(),
            params: Vec::new(),
        }
    }

    pub fn complete_with(opcode: impl Into<u16>, params: &[u8]) -> Result<Self, PackError> {
        let mut out = ReturnParams::new();
        Packer::new(&mut out).bytes(params)?;
        Ok(Event::CommandComplete {
            opcode: opcode.into(),
            params: out,
        })
    }

    pub fn status(opcode: impl Into<u16>, status: u8) -> Self {
        Event::CommandStatus {
            opcode: opcode.into(),
            status,
        }
    }

    pub fn opcode(&self) -> u16 {
        match self {
            Event::CommandComplete { opcode, .. } | Event::CommandStatus { opcode, .. } => *opcode,
        }
    }

    /// HCI level status, zero for every Command Complete.
    pub fn status_code(&self) -> u8 {
        match self {
            Event::CommandComplete { .. } => 0,
            Event::CommandStatus { status, .. } => *status,
        }
    }

    /// Return parameters of a Command Complete, empty for a Command Status.
    pub fn return_params(&self) -> &[u8] {
        match self {
            Event::CommandComplete { params, .. } => params,
            Event::CommandStatus { .. } => &[],
        }
    }

    /// Writes the H4 framed event.
    ///
    /// # Algorithm
    ///
    /// * Command Complete: `04 0E len 01 op_lo op_hi params..`
    /// * Command Status: `04 0F 04 status 01 op_lo op_hi`
    pub fn frame<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<(), PackError> {
        let mut pk = Packer::new(out);
        match self {
            Event::CommandComplete { opcode, params } => {
                let len = u8::try_from(3 + params.len()).map_err(|_| PackError::OutBufOverflow)?;
                pk.u8(HCI_EVT_MSG_TYPE)?
                    .u8(HCI_CMD_CMP_EVT_CODE)?
                    .u8(len)?
                    .u8(HCI_NB_CMD_PKTS)?
                    .u16(*opcode)?
                    .bytes(params)?;
            }
            Event::CommandStatus { opcode, status } => {
                pk.u8(HCI_EVT_MSG_TYPE)?
                    .u8(HCI_CMD_STAT_EVT_CODE)?
                    .u8(4)?
                    .u8(*status)?
                    .u8(HCI_NB_CMD_PKTS)?
                    .u16(*opcode)?;
            }
        }
        Ok(())
    }

    /// Host side parse of an H4 framed event, the inverse of [`Event::frame`].
    pub fn parse(buf: &[u8]) -> Result<Self, PackError> {
        let mut rd = Unpacker::new(buf);
        if rd.u8()? != HCI_EVT_MSG_TYPE {
            return Err(PackError::InBufOverflow);
        }
        let code = rd.u8()?;
        let len = rd.u8()? as usize;
        let mut body = Unpacker::new(rd.bytes(len)?);

        match code {
            HCI_CMD_CMP_EVT_CODE => {
                body.u8()?;
                let opcode = body.u16()?;
                let rest = body.bytes(body.remaining())?;
                Event::complete_with(opcode, rest)
            }
            HCI_CMD_STAT_EVT_CODE => {
                let status = body.u8()?;
                body.u8()?;
                Ok(Event::status(body.u16()?, status))
            }
            _ => Err(PackError::InBufOverflow),
        }
    }
}
