//! Status header carried by every bulk IN transfer.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::STATUS_HEADER_LEN;

/// Modem and line status decoded from the two header bytes.
///
/// Byte 0 carries the modem status register in its upper nibble, byte 1
/// the line status register.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemStatus {
    raw: u16,
}

impl ModemStatus {
    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    /// Decodes a header. Returns `None` if fewer than two bytes are given.
    pub fn from_header(header: &[u8]) -> Option<Self> {
        if header.len() < STATUS_HEADER_LEN {
            return None;
        }
        Some(Self::from_raw(LittleEndian::read_u16(header)))
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    fn modem(&self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    fn line(&self) -> u8 {
        (self.raw >> 8) as u8
    }

    pub fn cts(&self) -> bool {
        self.modem() & 0x10 != 0
    }

    pub fn dsr(&self) -> bool {
        self.modem() & 0x20 != 0
    }

    pub fn ring_indicator(&self) -> bool {
        self.modem() & 0x40 != 0
    }

    /// Receive line signal detect (carrier).
    pub fn rlsd(&self) -> bool {
        self.modem() & 0x80 != 0
    }

    pub fn data_ready(&self) -> bool {
        self.line() & 0x01 != 0
    }

    pub fn overrun_error(&self) -> bool {
        self.line() & 0x02 != 0
    }

    pub fn parity_error(&self) -> bool {
        self.line() & 0x04 != 0
    }

    pub fn framing_error(&self) -> bool {
        self.line() & 0x08 != 0
    }

    pub fn break_interrupt(&self) -> bool {
        self.line() & 0x10 != 0
    }

    /// Transmitter holding register empty.
    pub fn thre(&self) -> bool {
        self.line() & 0x20 != 0
    }

    /// Transmitter empty.
    pub fn temt(&self) -> bool {
        self.line() & 0x40 != 0
    }

    pub fn fifo_error(&self) -> bool {
        self.line() & 0x80 != 0
    }

    /// Any of the receive error bits is set.
    pub fn has_error(&self) -> bool {
        self.overrun_error()
            || self.parity_error()
            || self.framing_error()
            || self.break_interrupt()
            || self.fifo_error()
    }
}

impl fmt::Debug for ModemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemStatus")
            .field("raw", &format_args!("0x{:04X}", self.raw))
            .field("cts", &self.cts())
            .field("dsr", &self.dsr())
            .field("ri", &self.ring_indicator())
            .field("rlsd", &self.rlsd())
            .field("error", &self.has_error())
            .finish()
    }
}

/// One bulk IN transfer, split into header and payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub status: Option<ModemStatus>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Splits a raw transfer.
    ///
    /// A transfer no longer than the header carries no data and yields an
    /// empty payload. The payload is always a copy, never a view into `raw`.
    pub fn parse(raw: &[u8]) -> Self {
        let status = ModemStatus::from_header(raw);
        let payload = if raw.len() <= STATUS_HEADER_LEN {
            Vec::new()
        } else {
            raw[STATUS_HEADER_LEN..].to_vec()
        };
        Self { status, payload }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_header() {
        // Idle FT232R: CTS|DSR, THRE|TEMT.
        let status = ModemStatus::from_header(&[0x31, 0x60]).unwrap();
        assert!(status.cts());
        assert!(status.dsr());
        assert!(!status.rlsd());
        assert!(status.thre());
        assert!(status.temt());
        assert!(!status.data_ready());
        assert!(!status.has_error());
    }

    #[test]
    fn test_error_bits() {
        let status = ModemStatus::from_raw(0x0A00);
        assert!(status.overrun_error());
        assert!(status.framing_error());
        assert!(!status.parity_error());
        assert!(status.has_error());
    }

    #[test]
    fn test_header_only_frame_is_empty() {
        let frame = Frame::parse(&[0x01, 0x60]);
        assert!(frame.is_empty());
        assert!(frame.status.is_some());
    }

    #[test]
    fn test_payload_after_header() {
        let frame = Frame::parse(&[0x01, 0x60, 0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.payload, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_short_transfer() {
        assert!(Frame::parse(&[]).is_empty());
        let frame = Frame::parse(&[0x01]);
        assert!(frame.is_empty());
        assert!(frame.status.is_none());
    }
}
