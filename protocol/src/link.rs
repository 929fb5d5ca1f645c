//! Serial link contract and receive helpers.
//!
//! The wireless transport (Bluetooth SPP or similar) lives outside this
//! crate; it hands data over through a byte ring buffer. [`Transport`] is
//! the narrow contract the protocol core consumes: timed sends and timed
//! reads, shareable between the dispatcher and the auto-poll pump.

use core::fmt::{Debug, Display, Formatter};
use core::time::Duration;

/// Error type for [`Transport`] operations.
///
/// The generic parameter `E` allows the error type to carry a
/// transport-specific error.
#[derive(PartialEq, Eq, Debug)]
pub enum LinkError<E> {
    /// No data arrived (or no send credit came up) within the timeout.
    Timeout,
    /// A transport-specific input/output error.
    Io(E),
}

impl<E: Debug> Display for LinkError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "link timeout"),
            Self::Io(err) => write!(f, "link error: {err:?}"),
        }
    }
}

impl<E: Debug> core::error::Error for LinkError<E> {}

/// Bidirectional serial link to the host.
///
/// Both methods take `&self`: the link is shared between the dispatcher and
/// the auto-poll pump, and implementations are expected to serialise access
/// internally (the underlying transport is a ring buffer plus flow-control
/// flags).
pub trait Transport {
    /// Transport-specific error type.
    type Error: Debug;

    /// Sends `data`, waiting at most `timeout` for send credit.
    async fn send(&self, data: &[u8], timeout: Duration) -> Result<(), LinkError<Self::Error>>;

    /// Reads available bytes into `buf`, waiting at most `timeout` for the
    /// first byte. Returns the number of bytes read, at least one.
    async fn recv(&self, buf: &mut [u8], timeout: Duration)
    -> Result<usize, LinkError<Self::Error>>;
}

/// Error type for the receive helpers.
#[derive(PartialEq, Eq, Debug)]
pub enum ReadError<E> {
    /// Nothing arrived before the first-byte timeout.
    Timeout,
    /// Data arrived but the delimiter did not, and the link went idle.
    Truncated,
    /// The buffer filled up before the delimiter arrived.
    Overflow,
    /// A transport-specific input/output error.
    Io(E),
}

impl<E: Debug> Display for ReadError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for data"),
            Self::Truncated => write!(f, "message truncated"),
            Self::Overflow => write!(f, "message exceeds buffer"),
            Self::Io(err) => write!(f, "link error: {err:?}"),
        }
    }
}

impl<E: Debug> core::error::Error for ReadError<E> {}

impl<E> From<LinkError<E>> for ReadError<E> {
    fn from(err: LinkError<E>) -> Self {
        match err {
            LinkError::Timeout => Self::Timeout,
            LinkError::Io(err) => Self::Io(err),
        }
    }
}

/// Reads one delimiter-terminated message into `buf`.
///
/// Bytes are consumed one at a time so that nothing beyond the delimiter is
/// taken from the link. The first byte is awaited for `first_timeout`,
/// subsequent bytes for `next_timeout`. On success the returned length
/// includes the delimiter.
pub(crate) async fn read_delimited<T: Transport>(
    link: &T,
    buf: &mut [u8],
    delimiter: &[u8],
    first_timeout: Duration,
    next_timeout: Duration,
) -> Result<usize, ReadError<T::Error>> {
    let mut read = 0;

    while read < buf.len() {
        let timeout = if read == 0 { first_timeout } else { next_timeout };

        match link.recv(&mut buf[read..=read], timeout).await {
            Ok(_) => read += 1,
            Err(LinkError::Timeout) if read == 0 => return Err(ReadError::Timeout),
            Err(LinkError::Timeout) => return Err(ReadError::Truncated),
            Err(LinkError::Io(err)) => return Err(ReadError::Io(err)),
        }

        if read >= delimiter.len() && buf[read - delimiter.len()..read] == *delimiter {
            return Ok(read);
        }
    }

    Err(ReadError::Overflow)
}

/// Reads one burst of raw bytes into `buf`.
///
/// The first byte is awaited for `first_timeout`; after that the link is
/// drained until it stays idle for `idle_timeout` or the buffer is full.
/// Used for the binary chunks of the firmware upload.
pub(crate) async fn read_chunk<T: Transport>(
    link: &T,
    buf: &mut [u8],
    first_timeout: Duration,
    idle_timeout: Duration,
) -> Result<usize, LinkError<T::Error>> {
    let mut read = link.recv(buf, first_timeout).await?;

    while read < buf.len() {
        match link.recv(&mut buf[read..], idle_timeout).await {
            Ok(len) => read += len,
            Err(LinkError::Timeout) => break,
            Err(err) => return Err(err),
        }
    }

    Ok(read)
}
