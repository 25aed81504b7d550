use core::fmt;

use heapless::Vec;

use crate::config::MAX_READ_WRITE_OTP_WORDS;

pub const OTP_WORD_LEN: usize = 4;
pub const OTP_DATA_MAX: usize = MAX_READ_WRITE_OTP_WORDS * OTP_WORD_LEN;

/// Failure of a parameter pack or unpack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PackError {
    /// The input ended before the layout was complete.
    InBufOverflow,
    /// The output buffer cannot hold the packed layout.
    OutBufOverflow,
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackError::InBufOverflow => write!(f, "input buffer overflow"),
            PackError::OutBufOverflow => write!(f, "output buffer overflow"),
        }
    }
}

impl core::error::Error for PackError {}

/// Little-endian reader over a received parameter block.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], PackError> {
        let end = self.pos.checked_add(len).ok_or(PackError::InBufOverflow)?;
        let out = self.buf.get(self.pos..end).ok_or(PackError::InBufOverflow)?;
        self.pos = end;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], PackError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, PackError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, PackError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, PackError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Little-endian writer into a bounded buffer.
pub struct Packer<'a, const N: usize> {
    out: &'a mut Vec<u8, N>,
}

impl<'a, const N: usize> Packer<'a, N> {
    pub fn new(out: &'a mut Vec<u8, N>) -> Self {
        Self { out }
    }

    pub fn bytes(&mut self, data: &[u8]) -> Result<&mut Self, PackError> {
        self.out
            .extend_from_slice(data)
            .map_err(|_| PackError::OutBufOverflow)?;
        Ok(self)
    }

    pub fn u8(&mut self, v: u8) -> Result<&mut Self, PackError> {
        self.bytes(&[v])
    }

    pub fn u16(&mut self, v: u16) -> Result<&mut Self, PackError> {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> Result<&mut Self, PackError> {
        self.bytes(&v.to_le_bytes())
    }
}

/// OTP_WRITE request: `addr u16, n u8, n x 4 bytes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpWriteParams {
    pub addr: u16,
    pub num_words: u8,
    pub data: Vec<u8, OTP_DATA_MAX>,
}

impl OtpWriteParams {
    /// Walks the variable layout byte by byte.
    ///
    /// # Notes
    ///
    /// * A word count above 60 leaves `data` empty, the handler rejects it with a status
    /// * A word count of zero is accepted here and rejected by the handler as well
    pub fn unpack(buf: &[u8]) -> Result<Self, PackError> {
        let mut rd = Unpacker::new(buf);
        let addr = rd.u16()?;
        let num_words = rd.u8()?;

        let mut data = Vec::new();
        if num_words as usize <= MAX_READ_WRITE_OTP_WORDS {
            let bytes = rd.bytes(num_words as usize * OTP_WORD_LEN)?;
            data.extend_from_slice(bytes)
                .map_err(|_| PackError::OutBufOverflow)?;
        }

        Ok(Self {
            addr,
            num_words,
            data,
        })
    }

    /// Data words in transmission order.
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.data
            .chunks_exact(OTP_WORD_LEN)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

/// Packs the OTP_READ completion: `status, n, n x 4 bytes`.
///
/// Only `n` words of `data` are emitted. An error status still reports `n`.
pub fn pack_otp_read_cmp<const N: usize>(
    out: &mut Vec<u8, N>,
    status: u8,
    num_words: u8,
    data: &[u8],
) -> Result<(), PackError> {
    let len = num_words as usize * OTP_WORD_LEN;
    let words = if status == 0 {
        data.get(..len).ok_or(PackError::InBufOverflow)?
    } else {
        &[]
    };
    Packer::new(out).u8(status)?.u8(num_words)?.bytes(words)?;
    Ok(())
}

/// Host side view of an OTP_READ completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpReadCmp {
    pub status: u8,
    pub num_words: u8,
    pub data: Vec<u8, OTP_DATA_MAX>,
}

impl OtpReadCmp {
    pub fn unpack(buf: &[u8]) -> Result<Self, PackError> {
        let mut rd = Unpacker::new(buf);
        let status = rd.u8()?;
        let num_words = rd.u8()?;
        let mut data = Vec::new();
        if status == 0 {
            let bytes = rd.bytes(num_words as usize * OTP_WORD_LEN)?;
            data.extend_from_slice(bytes)
                .map_err(|_| PackError::OutBufOverflow)?;
        }
        Ok(Self {
            status,
            num_words,
            data,
        })
    }
}
