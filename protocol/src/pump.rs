//! Background pump that streams received CAN frames to the host while the
//! channel is open with auto-poll enabled.
//!
//! The pump runs as its own task. It shares nothing mutable with the
//! dispatcher except [`PumpFlags`]: the dispatcher flips the flags, the
//! pump only reads them. Closing the channel clears the open flag and
//! waits out the pump's blocking receive before the driver is torn down.

use crate::channel::{CanDriver, DriverError};
use crate::engine::BELL;
use crate::frame;
use crate::link::Transport;
use crate::{Clock, timestamp_ms};
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{info, trace, warn};

/// Receive timeout of one pump iteration. Bounds how long the pump can
/// keep the driver busy after the channel was closed.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Send timeout for emitted frames. A frame that cannot be sent within
/// this window is dropped; a saturated peer must not stall the bus side.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared state between the dispatcher and the pump.
///
/// The dispatcher is the sole writer. The atomics let the pump observe a
/// channel close promptly from another task.
pub struct PumpFlags {
    open: AtomicBool,
    timestamps: AtomicBool,
    start: Signal<CriticalSectionRawMutex, ()>,
}

impl PumpFlags {
    /// Creates flags for a closed channel.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            timestamps: AtomicBool::new(false),
            start: Signal::new(),
        }
    }

    /// Whether the channel is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Whether emitted frames carry a timestamp.
    #[must_use]
    pub fn timestamps_enabled(&self) -> bool {
        self.timestamps.load(Ordering::Acquire)
    }

    pub(crate) fn set_timestamps(&self, enabled: bool) {
        self.timestamps.store(enabled, Ordering::Release);
    }

    /// Wakes the pump for a freshly opened channel.
    pub(crate) fn start(&self) {
        self.start.signal(());
    }
}

impl Default for PumpFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the pump forever.
///
/// Sleeps until the dispatcher signals a channel open with auto-poll
/// enabled, then drains frames until the channel closes again.
pub async fn run<D: CanDriver, T: Transport, C: Clock>(
    driver: &D,
    link: &T,
    clock: &C,
    flags: &PumpFlags,
) -> ! {
    loop {
        flags.start.wait().await;
        drain(driver, link, clock, flags).await;
    }
}

/// One pump session: drains frames until the channel closes or the driver
/// fails.
pub(crate) async fn drain<D: CanDriver, T: Transport, C: Clock>(
    driver: &D,
    link: &T,
    clock: &C,
    flags: &PumpFlags,
) {
    info!("starting auto-poll pump");

    let mut buf = [0; frame::MIN_BUFFER_LEN];

    while flags.is_open() {
        match driver.receive(RECEIVE_TIMEOUT).await {
            Ok(received) => {
                let timestamp = flags.timestamps_enabled().then(|| timestamp_ms(clock));

                // Spontaneously emitted frames always end in a plain CR;
                // z only ever acknowledges a transmit command.
                match frame::encode(&received, false, timestamp, &mut buf) {
                    Ok(len) => {
                        if let Err(err) = link.send(&buf[..len], SEND_TIMEOUT).await {
                            trace!("auto-poll: dropping frame: {err}");
                        }
                    }
                    Err(err) => warn!("auto-poll: failed to encode frame: {err}"),
                }
            }
            Err(DriverError::Timeout) => {
                trace!("auto-poll: no pending frames");
            }
            Err(DriverError::Hardware(err)) => {
                warn!("auto-poll: receive failed: {err:?}");

                let _ = link.send(BELL, SEND_TIMEOUT).await;

                break;
            }
        }
    }

    info!("stopping auto-poll pump");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::standard;
    use crate::tests::{TestClock, TestDriver, TestLink, init_logger};
    use alloc::boxed::Box;

    fn leaked_flags() -> &'static PumpFlags {
        Box::leak(Box::new(PumpFlags::new()))
    }

    #[tokio::test]
    async fn emits_frames_in_receive_order() {
        init_logger();

        let driver = TestDriver::with_frames([
            standard(0x100, &[0x11, 0x33]),
            standard(0x020, &[]),
        ]);
        let link = TestLink::default();
        let clock = TestClock::default();
        let flags = leaked_flags();

        flags.set_open(true);
        driver.close_when_drained.set(Some(flags));

        drain(&driver, &link, &clock, flags).await;

        assert_eq!(
            link.sent(),
            b"t10021133\rt0200\r",
            "frames should stream out in order with plain CR"
        );
    }

    #[tokio::test]
    async fn appends_timestamps_when_enabled() {
        init_logger();

        let driver = TestDriver::with_frames([standard(0x123, &[0xab])]);
        let link = TestLink::default();
        let clock = TestClock::default();
        let flags = leaked_flags();

        clock.micros.set(1234 * 1000);
        flags.set_open(true);
        flags.set_timestamps(true);
        driver.close_when_drained.set(Some(flags));

        drain(&driver, &link, &clock, flags).await;

        assert_eq!(
            link.sent(),
            b"t1231AB04D2\r",
            "emitted line should carry the timestamp"
        );
    }

    #[tokio::test]
    async fn stops_with_bell_on_hardware_error() {
        init_logger();

        let driver = TestDriver::default();
        let link = TestLink::default();
        let clock = TestClock::default();
        let flags = leaked_flags();

        flags.set_open(true);
        driver.fail_receive.set(true);

        drain(&driver, &link, &clock, flags).await;

        assert_eq!(link.sent(), b"\x08", "pump should emit BELL once and stop");
        assert!(flags.is_open(), "pump must not mutate the open flag");
    }

    #[tokio::test]
    async fn does_nothing_while_closed() {
        init_logger();

        let driver = TestDriver::with_frames([standard(0x100, &[])]);
        let link = TestLink::default();
        let clock = TestClock::default();
        let flags = leaked_flags();

        drain(&driver, &link, &clock, flags).await;

        assert!(link.sent().is_empty(), "nothing should be emitted");
        assert_eq!(
            driver.rx_queue.borrow().len(),
            1,
            "queue should be untouched"
        );
    }
}
