use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embedded_io_async::{Error as _, Write};
use heapless::Vec;

use crate::engine::{ProdTestEngine, Response};
use crate::error::Error;
use crate::hci::command::MAX_PARAM_LEN;
use crate::hci::event::{Event, MAX_EVENT_LEN};
use crate::hci::pack::{PackError, Unpacker};
use crate::hci::HCI_CMD_MSG_TYPE;
use crate::sdk::hal::ProdTestHal;

// Packets the RX interrupt may queue before the loop drains them
pub const RX_QUEUE_DEPTH: usize = 4;

// Indicator, opcode and length ahead of the parameters
pub const MAX_PACKET_LEN: usize = 4 + MAX_PARAM_LEN;

pub type RawPacket = Vec<u8, MAX_PACKET_LEN>;

/// An H4 command packet split into opcode and parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandPacket<'a> {
    pub opcode: u16,
    pub params: &'a [u8],
}

/// Why a received packet could not be split.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketError {
    /// Not a command packet, or too short to carry an opcode. Nothing can be answered.
    Header,
    /// The opcode is known but the length byte or parameters are cut short.
    Params { opcode: u16, err: PackError },
}

/// Splits `01 op_lo op_hi plen params..` into its parts.
///
/// Trailing bytes past the declared length are dropped.
pub fn parse_command(buf: &[u8]) -> Result<CommandPacket<'_>, PacketError> {
    let mut rd = Unpacker::new(buf);
    if rd.u8() != Ok(HCI_CMD_MSG_TYPE) {
        return Err(PacketError::Header);
    }
    let opcode = rd.u16().map_err(|_| PacketError::Header)?;

    let params = rd
        .u8()
        .and_then(|plen| rd.bytes(plen as usize))
        .map_err(|err| PacketError::Params { opcode, err })?;

    Ok(CommandPacket { opcode, params })
}

/// H4 transport between the UART and the engine.
///
/// The UART RX interrupt hands complete packets to [`HciTransport::on_rx_packet`]. The
/// [`HciTransport::run`] loop takes them one at a time, dispatches them and writes the
/// framed reply before running any action that has to follow the reply.
pub struct HciTransport {
    channel: Channel<CriticalSectionRawMutex, RawPacket, RX_QUEUE_DEPTH>,
}

impl HciTransport {
    pub const fn default() -> Self {
        Self {
            channel: Channel::<CriticalSectionRawMutex, RawPacket, RX_QUEUE_DEPTH>::new(),
        }
    }

    /// Queues a received packet. Called from interrupt context.
    ///
    /// Returns `false` when the packet was dropped, either because the queue is full or
    /// because it is larger than any valid command.
    pub fn on_rx_packet(&self, data: &[u8]) -> bool {
        let Ok(pkt) = RawPacket::from_slice(data) else {
            return false;
        };
        self.channel.try_send(pkt).is_ok()
    }

    /// Handles the next queued packet.
    ///
    /// # Algorithm
    ///
    /// 1. Wait for a packet and split it. Without an opcode the packet is dropped, cut
    ///    parameters are answered with an invalid parameter status
    /// 2. Dispatch into the engine, which always produces a reply
    /// 3. Frame the reply, write it and flush the writer
    /// 4. Run the deferred action of the command, if any
    ///
    /// # Notes
    ///
    /// * A write error skips the deferred action so a reset or baud change never
    ///   happens without the host having seen the reply
    pub async fn process_next<H: ProdTestHal, W: Write>(
        &self,
        engine: &mut ProdTestEngine<'_, H>,
        writer: &mut W,
    ) -> Result<(), W::Error> {
        let raw = self.channel.receive().await;
        let response = match parse_command(&raw) {
            Ok(pkt) => engine.handle(pkt.opcode, pkt.params),
            Err(PacketError::Params { opcode, err }) => {
                warn!("Truncated command {:#x}: {:?}", opcode, err);
                Response::reply(Event::status(opcode, Error::Pack(err).status()))
            }
            Err(PacketError::Header) => {
                warn!("Dropping HCI packet without a command header");
                return Ok(());
            }
        };

        let mut out: Vec<u8, MAX_EVENT_LEN> = Vec::new();
        if let Err(e) = response.event.frame(&mut out) {
            error!("Reply to {:#x} does not fit an event: {:?}", response.event.opcode(), e);
            return Ok(());
        }
        writer.write_all(&out).await?;
        writer.flush().await?;

        if let Some(deferred) = response.deferred {
            engine.run_deferred(deferred);
        }
        Ok(())
    }

    pub async fn run<H: ProdTestHal, W: Write>(&self, engine: &mut ProdTestEngine<'_, H>, writer: &mut W) -> ! {
        loop {
            if let Err(e) = self.process_next(engine, writer).await {
                warn!("HCI write failed: {:?}", e.kind());
            }
        }
    }
}
