//! CAN frame representation and its SLCAN line encoding.

use core::fmt::{Display, Formatter};
use embedded_can::Id;

pub use embedded_can::Frame;

/// Smallest output buffer [`encode`] accepts.
///
/// Covers the worst case: command char, eight identifier digits, data
/// length, sixteen data digits, four timestamp digits and the `z\r`
/// terminator, with room to spare.
pub const MIN_BUFFER_LEN: usize = 35;

/// A classic CAN frame: 11- or 29-bit identifier, up to eight data bytes,
/// optionally a remote-transmission request.
///
/// The data length code of a remote frame is carried on the wire even
/// though the frame has no payload, so it is stored separately from the
/// data buffer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CanFrame {
    id: Id,
    rtr: bool,
    dlc: u8,
    data: [u8; 8],
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }

        let mut buf = [0; 8];

        buf[..data.len()].copy_from_slice(data);

        Some(Self {
            id: id.into(),
            rtr: false,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }

        Some(Self {
            id: id.into(),
            rtr: true,
            dlc: dlc as u8,
            data: [0; 8],
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.rtr
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc.into()
    }

    fn data(&self) -> &[u8] {
        if self.rtr {
            &[]
        } else {
            &self.data[..self.dlc.into()]
        }
    }
}

/// Error type for [`encode`].
#[derive(PartialEq, Eq, Debug)]
pub enum EncodeError {
    /// The output buffer is smaller than [`MIN_BUFFER_LEN`].
    BufferTooSmall,
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "output buffer too small"),
        }
    }
}

impl core::error::Error for EncodeError {}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Writes `value` as fixed-width uppercase hex, returning the width.
pub(crate) fn put_hex(buf: &mut [u8], value: u32, digits: usize) -> usize {
    for (i, slot) in buf[..digits].iter_mut().enumerate() {
        let shift = 4 * (digits - 1 - i);

        *slot = HEX_DIGITS[((value >> shift) & 0xf) as usize];
    }

    digits
}

/// Encodes a frame as an SLCAN line.
///
/// The line starts with `t`, `T`, `r` or `R` depending on the identifier
/// width and the remote flag, followed by the fixed-width hex identifier,
/// the data length and the data bytes (omitted for remote frames). When
/// `timestamp` is given it is appended as four hex digits. The terminator
/// is `\r`, or `z\r` when `auto_poll_ack` is set — the acknowledgement form
/// used for replies to transmit commands in auto-poll mode, never for
/// spontaneously emitted frames.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// - [`EncodeError::BufferTooSmall`] if `buf` is shorter than
///   [`MIN_BUFFER_LEN`].
pub fn encode(
    frame: &CanFrame,
    auto_poll_ack: bool,
    timestamp: Option<u16>,
    buf: &mut [u8],
) -> Result<usize, EncodeError> {
    if buf.len() < MIN_BUFFER_LEN {
        return Err(EncodeError::BufferTooSmall);
    }

    let mut len = 0;

    buf[len] = match (frame.is_remote_frame(), frame.is_extended()) {
        (false, false) => b't',
        (true, false) => b'r',
        (false, true) => b'T',
        (true, true) => b'R',
    };
    len += 1;

    len += match frame.id() {
        Id::Standard(id) => put_hex(&mut buf[len..], id.as_raw().into(), 3),
        Id::Extended(id) => put_hex(&mut buf[len..], id.as_raw(), 8),
    };

    len += put_hex(&mut buf[len..], frame.dlc() as u32, 1);

    for byte in frame.data() {
        len += put_hex(&mut buf[len..], (*byte).into(), 2);
    }

    if let Some(timestamp) = timestamp {
        len += put_hex(&mut buf[len..], timestamp.into(), 4);
    }

    if auto_poll_ack {
        buf[len] = b'z';
        len += 1;
    }

    buf[len] = b'\r';
    len += 1;

    Ok(len)
}

/// Builds a standard-identifier frame, for tests.
#[cfg(test)]
pub(crate) fn standard(id: u16, data: &[u8]) -> CanFrame {
    CanFrame::new(embedded_can::StandardId::new(id).unwrap(), data).unwrap()
}
