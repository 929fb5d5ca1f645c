//! CAN channel lifecycle on top of the hardware controller driver.
//!
//! The controller itself lives outside this crate behind [`CanDriver`].
//! [`CanChannel`] adds the state machine the protocol needs: a channel is
//! uninitialised until a bit rate is chosen, initialised until it is
//! opened, and open in either normal or listen-only mode until closed.

use crate::Clock;
use crate::config::{FilterConfig, TimingConfig};
use crate::frame::CanFrame;
use crate::pump::PumpFlags;
use bitflags::bitflags;
use core::fmt::{Debug, Display, Formatter};
use core::time::Duration;
use log::warn;

/// Hardware transmit queue depth. Not user-tunable.
pub const TX_QUEUE_CAPACITY: usize = 10;
/// Hardware receive queue depth. Not user-tunable.
pub const RX_QUEUE_CAPACITY: usize = 1024;

/// How long the closer waits after clearing the open flag before the driver
/// is uninstalled, so the pump can fall out of its blocking receive.
const PUMP_SETTLE_DELAY: Duration = Duration::from_millis(1100);

/// Bus operating mode of an open channel.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ChannelMode {
    /// Sending and receiving.
    Normal,
    /// Receiving only; transmit commands are rejected.
    ListenOnly,
}

/// Lifecycle state of the CAN channel.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ChannelState {
    /// No bit rate has been chosen yet.
    Uninitialised,
    /// A bit rate is armed, the bus is closed.
    Initialised,
    /// The bus is active.
    Open(ChannelMode),
}

bitflags! {
    /// Controller status snapshot, laid out as the SJA1000 flag byte read
    /// by the `F` command. Bit 4 is reserved and always zero.
    #[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
    pub struct StatusFlags: u8 {
        /// Receive FIFO queue full.
        const RX_QUEUE_FULL = 0x01;
        /// Transmit FIFO queue full.
        const TX_QUEUE_FULL = 0x02;
        /// Error warning limit reached.
        const ERROR_WARNING = 0x04;
        /// Data overrun.
        const DATA_OVERRUN = 0x08;
        /// Controller is error passive.
        const ERROR_PASSIVE = 0x20;
        /// Arbitration lost.
        const ARBITRATION_LOST = 0x40;
        /// Bus error.
        const BUS_ERROR = 0x80;
    }
}

/// Error type for [`CanDriver`] operations.
#[derive(PartialEq, Eq, Debug)]
pub enum DriverError<E> {
    /// No frame arrived (or no queue slot freed up) within the timeout.
    Timeout,
    /// A driver-specific hardware error.
    Hardware(E),
}

/// Asynchronous CAN controller driver.
///
/// Methods take `&self`: the underlying driver works on hardware queues
/// that are shared between the dispatcher (transmit) and the auto-poll
/// pump (receive).
pub trait CanDriver {
    /// Driver-specific error type.
    type Error: Debug;

    /// Configures and starts the controller.
    async fn install(
        &self,
        timing: &TimingConfig,
        filter: &FilterConfig,
        mode: ChannelMode,
    ) -> Result<(), Self::Error>;

    /// Stops the controller and releases it.
    async fn uninstall(&self) -> Result<(), Self::Error>;

    /// Enqueues a frame for transmission, waiting at most `timeout` for a
    /// queue slot.
    async fn transmit(
        &self,
        frame: &CanFrame,
        timeout: Duration,
    ) -> Result<(), DriverError<Self::Error>>;

    /// Returns the next received frame, waiting at most `timeout`.
    async fn receive(&self, timeout: Duration) -> Result<CanFrame, DriverError<Self::Error>>;

    /// Reads a status snapshot.
    async fn status(&self) -> Result<StatusFlags, Self::Error>;
}

/// Error type for [`CanChannel`] operations.
///
/// The generic parameter `E` carries the driver-specific error.
#[derive(PartialEq, Eq, Debug)]
pub enum ChannelError<E> {
    /// The operation requires an open channel.
    NotOpen,
    /// The channel is already open.
    AlreadyOpen,
    /// The channel is open in listen-only mode; transmitting is invalid.
    ListenOnly,
    /// The transmit queue stayed full for the whole timeout.
    Busy,
    /// No frame arrived within the timeout.
    Timeout,
    /// The hardware controller failed or is unavailable.
    Hardware(E),
}

impl<E: Debug> Display for ChannelError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotOpen => write!(f, "channel is not open"),
            Self::AlreadyOpen => write!(f, "channel is already open"),
            Self::ListenOnly => write!(f, "channel is listen-only"),
            Self::Busy => write!(f, "transmit queue full"),
            Self::Timeout => write!(f, "no frame received"),
            Self::Hardware(err) => write!(f, "hardware error: {err:?}"),
        }
    }
}

impl<E: Debug> core::error::Error for ChannelError<E> {}

/// The CAN channel state machine.
///
/// Owns the lifecycle state and the shared open flag observed by the
/// auto-poll pump. The dispatcher is the sole caller of the mutating
/// operations.
pub struct CanChannel<'a, D> {
    driver: &'a D,
    flags: &'a PumpFlags,
    state: ChannelState,
}

impl<'a, D: CanDriver> CanChannel<'a, D> {
    /// Creates a closed, uninitialised channel.
    pub fn new(driver: &'a D, flags: &'a PumpFlags) -> Self {
        Self {
            driver,
            flags,
            state: ChannelState::Uninitialised,
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the bus is active.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open(_))
    }

    /// Whether a bit rate has been armed.
    #[must_use]
    pub fn is_initialised(&self) -> bool {
        !matches!(self.state, ChannelState::Uninitialised)
    }

    /// Arms the channel after a bit rate was chosen. A no-op while open.
    pub fn mark_initialised(&mut self) {
        if self.state == ChannelState::Uninitialised {
            self.state = ChannelState::Initialised;
        }
    }

    /// Configures and starts the controller, transitioning to open.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::AlreadyOpen`] if the channel is open.
    /// - [`ChannelError::Hardware`] if the controller cannot be configured.
    pub async fn install(
        &mut self,
        timing: &TimingConfig,
        filter: &FilterConfig,
        mode: ChannelMode,
    ) -> Result<(), ChannelError<D::Error>> {
        if self.is_open() {
            return Err(ChannelError::AlreadyOpen);
        }

        self.driver
            .install(timing, filter, mode)
            .await
            .map_err(ChannelError::Hardware)?;

        self.state = ChannelState::Open(mode);
        self.flags.set_open(true);

        Ok(())
    }

    /// Stops the controller, transitioning back to initialised.
    ///
    /// Clears the shared open flag first; when `pump_active` is set, the
    /// uninstall is delayed until the pump has had time to leave its
    /// blocking receive.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotOpen`] if the channel is not open.
    pub async fn uninstall(
        &mut self,
        clock: &impl Clock,
        pump_active: bool,
    ) -> Result<(), ChannelError<D::Error>> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }

        self.flags.set_open(false);

        if pump_active {
            clock.sleep(PUMP_SETTLE_DELAY).await;
        }

        if let Err(err) = self.driver.uninstall().await {
            warn!("failed to stop the CAN controller: {err:?}");
        }

        self.state = ChannelState::Initialised;

        Ok(())
    }

    /// Enqueues a frame for transmission.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotOpen`] if the channel is not open.
    /// - [`ChannelError::ListenOnly`] if the channel is listen-only.
    /// - [`ChannelError::Busy`] if no queue slot freed up in time.
    /// - [`ChannelError::Hardware`] on driver failure.
    pub async fn transmit(
        &self,
        frame: &CanFrame,
        timeout: Duration,
    ) -> Result<(), ChannelError<D::Error>> {
        match self.state {
            ChannelState::Open(ChannelMode::Normal) => {}
            ChannelState::Open(ChannelMode::ListenOnly) => return Err(ChannelError::ListenOnly),
            _ => return Err(ChannelError::NotOpen),
        }

        self.driver
            .transmit(frame, timeout)
            .await
            .map_err(|err| match err {
                DriverError::Timeout => ChannelError::Busy,
                DriverError::Hardware(err) => ChannelError::Hardware(err),
            })
    }

    /// Returns the next received frame.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotOpen`] if the channel is not open.
    /// - [`ChannelError::Timeout`] if no frame arrived in time.
    /// - [`ChannelError::Hardware`] on driver failure.
    pub async fn receive(&self, timeout: Duration) -> Result<CanFrame, ChannelError<D::Error>> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }

        self.driver.receive(timeout).await.map_err(|err| match err {
            DriverError::Timeout => ChannelError::Timeout,
            DriverError::Hardware(err) => ChannelError::Hardware(err),
        })
    }

    /// Reads the controller status snapshot.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotOpen`] if the channel is not open.
    /// - [`ChannelError::Hardware`] on driver failure.
    pub async fn status(&self) -> Result<StatusFlags, ChannelError<D::Error>> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }

        self.driver.status().await.map_err(ChannelError::Hardware)
    }
}
