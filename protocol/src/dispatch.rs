//! Line dispatcher: the adapter's main loop.
//!
//! Reads one CR-terminated line at a time from the serial link. The exact
//! trigger line hands the task over to the firmware-update dialogue, which
//! occupies it until the session fails or the adapter reboots; every other
//! line goes to the SLCAN engine. Partial reads and idle timeouts are
//! dropped silently.

use crate::channel::CanDriver;
use crate::config::Storage;
use crate::engine::Engine;
use crate::link::{self, ReadError, Transport};
use crate::ota::{self, Updater};
use crate::Clock;
use core::time::Duration;
use log::{debug, info, warn};

/// Line that starts the firmware-update dialogue.
pub const UPDATE_TRIGGER: &[u8] = b"START BT-OTA\r";

/// Longest accepted command line, terminator included.
const LINE_BUFFER_LEN: usize = 128;

/// Inter-line receive timeout.
const LINE_TIMEOUT: Duration = Duration::from_secs(1);

/// Seconds counted down before the post-update reboot.
const RESTART_COUNTDOWN: u32 = 5;

const RESTART_TICK: Duration = Duration::from_secs(1);

/// The dispatcher task body.
///
/// Owns the line-assembly buffer, the engine and the partition interface.
pub struct Dispatcher<'a, D, T, S, C, U> {
    engine: Engine<'a, D, T, S, C>,
    updater: U,
    line: [u8; LINE_BUFFER_LEN],
}

impl<'a, D, T, S, C, U> Dispatcher<'a, D, T, S, C, U>
where
    D: CanDriver,
    T: Transport,
    S: Storage,
    C: Clock,
    U: Updater,
{
    /// Creates a dispatcher around a started engine.
    pub fn new(engine: Engine<'a, D, T, S, C>, updater: U) -> Self {
        Self {
            engine,
            updater,
            line: [0; LINE_BUFFER_LEN],
        }
    }

    /// Runs the dispatch loop forever.
    pub async fn run(mut self) -> ! {
        info!("dispatcher running");

        loop {
            self.poll_line().await;
        }
    }

    /// Waits for one line and handles it.
    pub(crate) async fn poll_line(&mut self) {
        match link::read_delimited(
            self.engine.link,
            &mut self.line,
            b"\r",
            LINE_TIMEOUT,
            LINE_TIMEOUT,
        )
        .await
        {
            Ok(len) => {
                let line = &self.line[..len];

                if line == UPDATE_TRIGGER {
                    self.run_update().await;
                } else {
                    self.engine.process(line).await;
                }
            }
            Err(ReadError::Timeout) => {}
            Err(err) => debug!("dropping input: {err}"),
        }
    }

    async fn run_update(&mut self) {
        match ota::run(self.engine.link, &mut self.updater).await {
            Ok(()) => {
                info!("firmware update staged, preparing to restart");

                for i in (1..=RESTART_COUNTDOWN).rev() {
                    info!("restarting in {i}...");
                    self.engine.clock.sleep(RESTART_TICK).await;
                }

                info!("restarting");
                self.engine.clock.sleep(RESTART_TICK).await;
                self.updater.restart()
            }
            Err(err) => warn!("firmware update failed: {err}"),
        }
    }
}
