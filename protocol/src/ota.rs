//! Wireless firmware update: an ASCII handshake interleaved with binary
//! chunk streaming into the inactive application partition.
//!
//! The dialogue is driven by the adapter. All dialogue lines are
//! `\r\n`-terminated, unlike the `\r` of the SLCAN side:
//!
//! ```text
//! adapter: DO FIRMWARE UPLOAD?      host: YES
//! adapter: FIRMWARE FILESIZE?       host: <decimal byte count>
//! adapter: MAX CHUNK SIZE = 950     host: OK
//! adapter: START UPLOAD!            host: <binary chunk>
//! adapter: NEXT CHUNK!              host: <binary chunk>   (repeated)
//! adapter: UPLOAD COMPLETE?         host: YES
//! adapter: OK!                      (adapter reboots)
//! ```
//!
//! The first chunk must contain the application image headers; the
//! embedded descriptor is checked against the image that previously failed
//! to boot before anything is written. Any mismatch, timeout or partition
//! error ends the session with `ABORT!` (or the specific validation
//! message) and returns control to the dispatcher.

use crate::link::{self, LinkError, ReadError, Transport};
use core::fmt::{Debug, Display, Formatter};
use core::str;
use core::time::Duration;
use log::{debug, error, info, warn};

/// Largest chunk the host may send at once, announced during the
/// handshake.
pub const MAX_CHUNK_SIZE: usize = 950;

/// Announcement of [`MAX_CHUNK_SIZE`] in the dialogue.
const MAX_CHUNK_LINE: &[u8] = b"MAX CHUNK SIZE = 950\r\n";

/// Work buffer for dialogue replies and binary chunks.
const BUFFER_SIZE: usize = 1024;

const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
const REPLY_IDLE_TIMEOUT: Duration = Duration::from_millis(100);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(2);
const CHUNK_IDLE_TIMEOUT: Duration = Duration::from_millis(10);

/// Size of the image header at the start of an application binary.
pub const IMAGE_HEADER_LEN: usize = 24;
/// Size of the segment header following the image header.
pub const SEGMENT_HEADER_LEN: usize = 8;
/// Size of the application descriptor embedded in the first segment.
pub const APP_DESC_LEN: usize = 256;
/// Offset of the application descriptor within the image.
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;

/// The application descriptor embedded in every firmware image.
///
/// Treated as opaque except for the version string used in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AppDescriptor([u8; APP_DESC_LEN]);

impl AppDescriptor {
    /// Extracts the descriptor from the start of an application image.
    ///
    /// Returns `None` if `image` is too short to contain the image header,
    /// a segment header and the descriptor.
    #[must_use]
    pub fn from_image_prefix(image: &[u8]) -> Option<Self> {
        let field = image.get(APP_DESC_OFFSET..APP_DESC_OFFSET + APP_DESC_LEN)?;
        let mut bytes = [0; APP_DESC_LEN];

        bytes.copy_from_slice(field);

        Some(Self(bytes))
    }

    /// Returns the version string recorded in the descriptor.
    #[must_use]
    pub fn version(&self) -> &str {
        let field = &self.0[16..48];
        let len = field.iter().position(|&byte| byte == 0).unwrap_or(field.len());

        str::from_utf8(&field[..len]).unwrap_or("<invalid>")
    }
}

impl From<[u8; APP_DESC_LEN]> for AppDescriptor {
    fn from(bytes: [u8; APP_DESC_LEN]) -> Self {
        Self(bytes)
    }
}

impl Debug for AppDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "AppDescriptor({:?})", self.version())
    }
}

/// Error type for [`Updater::finish`].
#[derive(PartialEq, Eq, Debug)]
pub enum FinishError<E> {
    /// The written image failed cryptographic or checksum validation.
    ValidationFailed,
    /// Any other finalisation failure.
    Other(E),
}

/// Firmware partition interface.
///
/// Wraps the platform's dual-partition update scheme: an opaque write
/// handle into the inactive partition, descriptor queries for rollback
/// protection, and the switch that selects the freshly written image for
/// the next boot.
pub trait Updater {
    /// Platform-specific error type.
    type Error: Debug;

    /// Descriptor of the currently running image, if readable.
    fn running_descriptor(&self) -> Option<AppDescriptor>;

    /// Descriptor of the image that last failed to boot, if any.
    fn last_invalid_descriptor(&self) -> Option<AppDescriptor>;

    /// Opens the write handle into the inactive partition.
    async fn begin(&mut self) -> Result<(), Self::Error>;

    /// Appends a chunk to the partition.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Self::Error>;

    /// Closes the write handle and validates the written image.
    async fn finish(&mut self) -> Result<(), FinishError<Self::Error>>;

    /// Marks the written partition as the next boot target.
    async fn set_boot_target(&mut self) -> Result<(), Self::Error>;

    /// Discards the session. May be called before [`Updater::begin`].
    async fn abort(&mut self);

    /// Reboots the system.
    fn restart(&self) -> !;
}

/// Error type for a firmware update session.
#[derive(PartialEq, Eq, Debug)]
pub enum OtaError<L, U> {
    /// The serial link failed.
    Link(LinkError<L>),
    /// The host stopped answering.
    Timeout,
    /// The host answered something unexpected.
    UnexpectedReply,
    /// The announced file size is not a decimal number.
    InvalidFileSize,
    /// The first chunk is too short to contain the image headers.
    ImageTooShort,
    /// The image matches the one that previously failed to boot.
    RejectedImage,
    /// The partition interface failed.
    Update(U),
    /// The written image failed validation.
    ValidationFailed,
}

impl<L: Debug, U: Debug> Display for OtaError<L, U> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Link(err) => write!(f, "{err}"),
            Self::Timeout => write!(f, "host stopped answering"),
            Self::UnexpectedReply => write!(f, "unexpected reply"),
            Self::InvalidFileSize => write!(f, "invalid file size"),
            Self::ImageTooShort => write!(f, "first chunk too short for image headers"),
            Self::RejectedImage => write!(f, "image previously failed to boot"),
            Self::Update(err) => write!(f, "partition error: {err:?}"),
            Self::ValidationFailed => write!(f, "image validation failed"),
        }
    }
}

impl<L: Debug, U: Debug> core::error::Error for OtaError<L, U> {}

/// Runs one firmware update session.
///
/// On success the new image is written, validated and selected for the
/// next boot; the caller is expected to reboot. On failure the session is
/// aborted and the adapter keeps running the current image.
///
/// # Errors
///
/// Any [`OtaError`]; the corresponding dialogue message (`ABORT!`,
/// `OTA ERROR!` or the validation message) has already been sent.
pub async fn run<T: Transport, U: Updater>(
    link: &T,
    updater: &mut U,
) -> Result<(), OtaError<T::Error, U::Error>> {
    info!("starting firmware update");

    let mut buf = [0; BUFFER_SIZE];
    let total = match upload(link, updater, &mut buf).await {
        Ok(total) => total,
        Err(err) => {
            warn!("firmware upload aborted: {err}");
            updater.abort().await;

            let _ = link.send(b"ABORT!\r\n", SEND_TIMEOUT).await;

            return Err(err);
        }
    };

    info!("received firmware image, {total} bytes");

    match updater.finish().await {
        Ok(()) => {}
        Err(FinishError::ValidationFailed) => {
            error!("image validation failed, image is corrupted");

            let _ = link
                .send(b"VALIDATION FAILED, IMAGE IS CORRUPTED!\r\n", SEND_TIMEOUT)
                .await;

            return Err(OtaError::ValidationFailed);
        }
        Err(FinishError::Other(err)) => {
            error!("failed to finalise the update: {err:?}");

            let _ = link.send(b"OTA ERROR!\r\n", SEND_TIMEOUT).await;

            return Err(OtaError::Update(err));
        }
    }

    if let Err(err) = updater.set_boot_target().await {
        error!("failed to select the new image for boot: {err:?}");

        let _ = link.send(b"OTA ERROR!\r\n", SEND_TIMEOUT).await;

        return Err(OtaError::Update(err));
    }

    link.send(b"OK!\r\n", SEND_TIMEOUT)
        .await
        .map_err(OtaError::Link)?;

    Ok(())
}

/// Handshake and chunk loop. Returns the number of uploaded bytes.
async fn upload<T: Transport, U: Updater>(
    link: &T,
    updater: &mut U,
    buf: &mut [u8],
) -> Result<u64, OtaError<T::Error, U::Error>> {
    send_line(link, b"DO FIRMWARE UPLOAD?\r\n").await?;
    expect_reply(link, buf, b"YES\r\n").await?;

    send_line(link, b"FIRMWARE FILESIZE?\r\n").await?;

    let len = read_reply(link, buf).await?;
    let file_size = parse_file_size(&buf[..len])?;

    info!("firmware file size: {file_size} bytes");

    send_line(link, MAX_CHUNK_LINE).await?;
    expect_reply(link, buf, b"OK\r\n").await?;

    send_line(link, b"START UPLOAD!\r\n").await?;

    let mut total: u64 = 0;
    let mut header_checked = false;

    loop {
        let read = link::read_chunk(link, buf, CHUNK_TIMEOUT, CHUNK_IDLE_TIMEOUT)
            .await
            .map_err(|err| match err {
                LinkError::Timeout => OtaError::Timeout,
                err => OtaError::Link(err),
            })?;

        if !header_checked {
            check_image(updater, &buf[..read]).await?;
            header_checked = true;
        }

        updater
            .write(&buf[..read])
            .await
            .map_err(OtaError::Update)?;
        total += read as u64;

        if file_size > 0 {
            debug!(
                "upload progress: {total}/{file_size} bytes ({}%)",
                total * 100 / file_size
            );
        }

        if total < file_size {
            send_line(link, b"NEXT CHUNK!\r\n").await?;
        } else {
            break;
        }
    }

    send_line(link, b"UPLOAD COMPLETE?\r\n").await?;
    expect_reply(link, buf, b"YES\r\n").await?;

    Ok(total)
}

/// Validates the first chunk and opens the partition write handle.
async fn check_image<U: Updater, L>(
    updater: &mut U,
    chunk: &[u8],
) -> Result<(), OtaError<L, U::Error>> {
    let descriptor = AppDescriptor::from_image_prefix(chunk).ok_or(OtaError::ImageTooShort)?;

    info!("new firmware version: {}", descriptor.version());

    let running = updater.running_descriptor();

    if let Some(running) = &running {
        info!("running firmware version: {}", running.version());
    }

    if let Some(invalid) = updater.last_invalid_descriptor() {
        info!("last failed firmware version: {}", invalid.version());

        if invalid == descriptor {
            error!("this image previously failed to boot and was rolled back");

            return Err(OtaError::RejectedImage);
        }
    }

    if running.is_some_and(|running| running == descriptor) {
        warn!("new image matches the running image, continuing anyway");
    }

    updater.begin().await.map_err(OtaError::Update)
}

async fn send_line<T: Transport, U>(link: &T, line: &[u8]) -> Result<(), OtaError<T::Error, U>> {
    link.send(line, SEND_TIMEOUT).await.map_err(OtaError::Link)
}

async fn read_reply<T: Transport, U>(
    link: &T,
    buf: &mut [u8],
) -> Result<usize, OtaError<T::Error, U>> {
    link::read_delimited(link, buf, b"\r\n", REPLY_TIMEOUT, REPLY_IDLE_TIMEOUT)
        .await
        .map_err(|err| match err {
            ReadError::Timeout | ReadError::Truncated => OtaError::Timeout,
            ReadError::Overflow => OtaError::UnexpectedReply,
            ReadError::Io(err) => OtaError::Link(LinkError::Io(err)),
        })
}

async fn expect_reply<T: Transport, U>(
    link: &T,
    buf: &mut [u8],
    expected: &[u8],
) -> Result<(), OtaError<T::Error, U>> {
    let len = read_reply(link, buf).await?;

    if &buf[..len] == expected {
        Ok(())
    } else {
        warn!("unexpected reply from host");

        Err(OtaError::UnexpectedReply)
    }
}

fn parse_file_size<L, U>(line: &[u8]) -> Result<u64, OtaError<L, U>> {
    let digits = line.strip_suffix(b"\r\n").ok_or(OtaError::InvalidFileSize)?;

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(OtaError::InvalidFileSize);
    }

    digits
        .iter()
        .try_fold(0_u64, |size, &digit| {
            size.checked_mul(10)?
                .checked_add(u64::from(digit - b'0'))
        })
        .ok_or(OtaError::InvalidFileSize)
}
