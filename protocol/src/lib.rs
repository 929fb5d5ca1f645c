//! SLCAN protocol engine for wireless CAN bus adapters.
//!
//! # Overview
//!
//! The `blucan` crate implements the ASCII command protocol of the Lawicel
//! CAN232/CANUSB adapter family ("SLCAN") together with a wireless
//! firmware-update dialogue. It is the portable core of a CAN-to-serial
//! bridge: a host speaks SLCAN over a serial link, the engine translates
//! commands into CAN bus operations and streams received frames back as
//! ASCII lines.
//!
//! The crate is `no_std` and fully asynchronous. All hardware access goes
//! through narrow traits supplied by the integrator:
//!
//! - [`Transport`](link::Transport) — the serial link (Bluetooth SPP, UART
//!   to a radio module, a mock in tests).
//! - [`CanDriver`](channel::CanDriver) — the CAN controller.
//! - [`Storage`](config::Storage) — persistent storage for the adapter
//!   configuration blobs.
//! - [`Updater`](ota::Updater) — the firmware partition interface used by
//!   the update dialogue.
//! - [`Clock`] — monotonic time and delays.
//!
//! A running adapter consists of two long-lived tasks:
//!
//! - The **dispatcher** ([`dispatch::Dispatcher`]) reads one CR-terminated
//!   line at a time and either runs the firmware-update dialogue (on the
//!   exact trigger line) or hands the line to the SLCAN engine.
//! - The **auto-poll pump** ([`pump::run`]) drains received CAN frames and
//!   emits them on the serial link while the channel is open with auto-poll
//!   enabled.
//!
//! # Protocol summary
//!
//! Commands are CR-terminated; `\r` is the OK reply, the single byte 0x08
//! is the error reply. Frames are encoded as
//!
//! ```text
//! t<iii><l><dd...>[<tttt>]\r      standard data frame
//! T<iiiiiiii><l><dd...>[<tttt>]\r extended data frame
//! r<iii><l>\r                     standard remote frame
//! R<iiiiiiii><l>\r                extended remote frame
//! ```
//!
//! with hex identifier, single-digit data length, two hex digits per data
//! byte and an optional four-digit millisecond timestamp. See [`engine`]
//! for the full command set and [`ota`] for the update dialogue.

#![no_std]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(test)]
extern crate alloc;

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod frame;
pub mod link;
pub mod ota;
pub mod pump;

use core::time::Duration;

/// Monotonic time source and delay provider.
///
/// Implementations must be monotonic across the adapter's uptime; the
/// resolution should be microseconds or better. On the target this is the
/// system timer, in tests a settable counter.
pub trait Clock {
    /// Returns the monotonic time since boot in microseconds.
    fn now_micros(&self) -> u64;

    /// Waits for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Derives the 16-bit frame timestamp from a [`Clock`].
///
/// The timestamp counts milliseconds and wraps every 60 s (0x0000..=0xEA5F),
/// matching the CAN232 timer documented for the `Z` command.
pub(crate) fn timestamp_ms(clock: &impl Clock) -> u16 {
    ((clock.now_micros() / 1_000) % 60_000) as u16
}
