//! The SLCAN engine: command parser, channel state machine and response
//! emitter.
//!
//! One CR-terminated command in, exactly one reply out: `\r` for OK, `z\r`
//! for a transmit acknowledged in auto-poll mode, a data line for queries,
//! or the error byte for everything that is malformed or arrives in the
//! wrong channel state. The `A` command additionally streams the pending
//! frames before its closing `A\r`.
//!
//! # Command set
//!
//! | Command | Effect |
//! |---|---|
//! | `S<0..8>` | arm a bit rate preset (channel closed) |
//! | `s<xxyy>` | BTR0/BTR1 timing; not supported, always rejected |
//! | `O` / `L` | open the channel in normal / listen-only mode |
//! | `C` | close the channel |
//! | `t`/`T`/`r`/`R` | transmit a data / remote frame |
//! | `P` / `A` | poll one / all pending frames (auto-poll off only) |
//! | `F` | read the status flag byte |
//! | `X<0\|1>` | auto-poll off/on (channel closed) |
//! | `W<0\|1>` | filter dual/single mode (initialised, closed) |
//! | `M`/`m<8 hex>` | acceptance code / mask, LSB first (initialised, closed) |
//! | `V` / `N` | version / serial number |
//! | `Z<0\|1>` | timestamps off/on (channel closed) |
//! | `Q<0\|1\|2>` | auto-startup off / normal / listen-only (channel open) |

use crate::channel::{CanChannel, CanDriver, ChannelError, ChannelMode};
use crate::config::{
    BehaviorConfig, BitRate, ConfigStore, FilterConfig, FilterMode, Storage, TimingConfig,
};
use crate::frame::{self, CanFrame, Frame};
use crate::link::Transport;
use crate::pump::PumpFlags;
use crate::{Clock, timestamp_ms};
use core::fmt::{Display, Formatter};
use core::str;
use core::time::Duration;
use embedded_can::{ExtendedId, Id, StandardId};
use log::{debug, info, warn};

/// Hardware and software version digits reported by the `V` command.
pub const VERSION: &str = "01D0";
/// Serial number reported by the `N` command.
pub const SERIAL_NUMBER: &str = "1118";

pub(crate) const CR: u8 = b'\r';
/// OK reply.
pub(crate) const OK: &[u8] = b"\r";
/// Transmit acknowledgement in auto-poll mode.
pub(crate) const Z_OK: &[u8] = b"z\r";
/// Error reply. The byte is 0x08 (backspace, not ASCII BEL); the name is
/// historical.
pub(crate) const BELL: &[u8] = b"\x08";

/// Timeout for sending a command reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout for enqueueing a frame on the transmit queue.
const TRANSMIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Auto-startup setting carried by the `Q` command.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) enum AutoStartup {
    Off,
    Normal,
    ListenOnly,
}

/// A decoded SLCAN command with its typed arguments.
#[derive(PartialEq, Eq, Clone, Debug)]
pub(crate) enum Command {
    SetBitRate(BitRate),
    /// `s` with raw BTR0/BTR1 registers; recognised but unsupported.
    SetBtrRegisters,
    Open(ChannelMode),
    Close,
    Transmit(CanFrame),
    Poll,
    PollAll,
    ReadStatus,
    SetAutoPoll(bool),
    SetFilterMode(FilterMode),
    SetAcceptanceCode(u32),
    SetAcceptanceMask(u32),
    Version,
    SerialNumber,
    SetTimestamps(bool),
    SetAutoStartup(AutoStartup),
}

/// Reason a line failed to decode. Every variant is answered with the
/// error byte; the distinction only feeds the logs.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) enum ParseError {
    Empty,
    UnknownCommand,
    Malformed,
    InvalidDigit,
    IdentifierOutOfRange,
    LengthCodeOutOfRange,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::Malformed => write!(f, "malformed command"),
            Self::InvalidDigit => write!(f, "invalid hex digit"),
            Self::IdentifierOutOfRange => write!(f, "identifier out of range"),
            Self::LengthCodeOutOfRange => write!(f, "data length code out of range"),
        }
    }
}

fn hex_digit(byte: u8) -> Result<u8, ParseError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(ParseError::InvalidDigit),
    }
}

fn hex_value(digits: &[u8]) -> Result<u32, ParseError> {
    digits.iter().try_fold(0, |value, &digit| {
        Ok(value << 4 | u32::from(hex_digit(digit)?))
    })
}

fn switch_digit(byte: u8) -> Result<bool, ParseError> {
    match byte {
        b'0' => Ok(false),
        b'1' => Ok(true),
        _ => Err(ParseError::Malformed),
    }
}

/// Checks the exact command length, terminator included.
fn expect_len(line: &[u8], len: usize) -> Result<(), ParseError> {
    if line.len() == len && line[len - 1] == CR {
        Ok(())
    } else {
        Err(ParseError::Malformed)
    }
}

/// Decodes the four transmit commands, which share one layout: identifier,
/// single-digit data length, and for data frames the data bytes.
fn parse_transmit(line: &[u8]) -> Result<Command, ParseError> {
    let extended = matches!(line[0], b'T' | b'R');
    let remote = matches!(line[0], b'r' | b'R');
    let id_digits = if extended { 8 } else { 3 };
    let header = 1 + id_digits + 1;

    if line.len() < header + 1 {
        return Err(ParseError::Malformed);
    }

    let raw_id = hex_value(&line[1..1 + id_digits])?;
    let dlc = hex_digit(line[1 + id_digits])?;

    if dlc > 8 {
        return Err(ParseError::LengthCodeOutOfRange);
    }

    let len = if remote {
        header + 1
    } else {
        header + 2 * usize::from(dlc) + 1
    };

    expect_len(line, len)?;

    let id: Id = if extended {
        ExtendedId::new(raw_id)
            .ok_or(ParseError::IdentifierOutOfRange)?
            .into()
    } else {
        u16::try_from(raw_id)
            .ok()
            .and_then(StandardId::new)
            .ok_or(ParseError::IdentifierOutOfRange)?
            .into()
    };

    let transmitted = if remote {
        CanFrame::new_remote(id, dlc.into())
    } else {
        let mut data = [0; 8];

        for (k, byte) in data[..dlc.into()].iter_mut().enumerate() {
            let offset = header + 2 * k;

            *byte = hex_digit(line[offset])? << 4 | hex_digit(line[offset + 1])?;
        }

        CanFrame::new(id, &data[..dlc.into()])
    };

    transmitted
        .map(Command::Transmit)
        .ok_or(ParseError::LengthCodeOutOfRange)
}

impl Command {
    /// Decodes one CR-terminated command line.
    pub(crate) fn parse(line: &[u8]) -> Result<Self, ParseError> {
        let command = *line.first().ok_or(ParseError::Empty)?;

        match command {
            b'S' => {
                expect_len(line, 3)?;

                BitRate::from_digit(line[1])
                    .map(Self::SetBitRate)
                    .ok_or(ParseError::Malformed)
            }
            b's' => Ok(Self::SetBtrRegisters),
            b'O' => expect_len(line, 2).map(|()| Self::Open(ChannelMode::Normal)),
            b'L' => expect_len(line, 2).map(|()| Self::Open(ChannelMode::ListenOnly)),
            b'C' => expect_len(line, 2).map(|()| Self::Close),
            b't' | b'T' | b'r' | b'R' => parse_transmit(line),
            b'P' => expect_len(line, 2).map(|()| Self::Poll),
            b'A' => expect_len(line, 2).map(|()| Self::PollAll),
            b'F' => expect_len(line, 2).map(|()| Self::ReadStatus),
            b'X' => {
                expect_len(line, 3)?;

                Ok(Self::SetAutoPoll(switch_digit(line[1])?))
            }
            b'W' => {
                expect_len(line, 3)?;

                Ok(Self::SetFilterMode(if switch_digit(line[1])? {
                    FilterMode::Single
                } else {
                    FilterMode::Dual
                }))
            }
            b'M' => {
                expect_len(line, 10)?;

                Ok(Self::SetAcceptanceCode(hex_value(&line[1..9])?))
            }
            b'm' => {
                expect_len(line, 10)?;

                Ok(Self::SetAcceptanceMask(hex_value(&line[1..9])?))
            }
            b'V' => expect_len(line, 2).map(|()| Self::Version),
            b'N' => expect_len(line, 2).map(|()| Self::SerialNumber),
            b'Z' => {
                expect_len(line, 3)?;

                Ok(Self::SetTimestamps(switch_digit(line[1])?))
            }
            b'Q' => {
                expect_len(line, 3)?;

                match line[1] {
                    b'0' => Ok(Self::SetAutoStartup(AutoStartup::Off)),
                    b'1' => Ok(Self::SetAutoStartup(AutoStartup::Normal)),
                    b'2' => Ok(Self::SetAutoStartup(AutoStartup::ListenOnly)),
                    _ => Err(ParseError::Malformed),
                }
            }
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

/// The protocol engine.
///
/// Holds the channel state machine, the active configuration and the
/// reply path. [`Engine::process`] handles one command line at a time;
/// the dispatcher is its only caller.
pub struct Engine<'a, D, T, S, C> {
    pub(crate) link: &'a T,
    pub(crate) clock: &'a C,
    flags: &'a PumpFlags,
    channel: CanChannel<'a, D>,
    store: ConfigStore<'a, S>,
    pub(crate) timing: TimingConfig,
    pub(crate) filter: FilterConfig,
    pub(crate) behavior: BehaviorConfig,
}

impl<'a, D, T, S, C> Engine<'a, D, T, S, C>
where
    D: CanDriver,
    T: Transport,
    S: Storage,
    C: Clock,
{
    /// Creates an engine with default configuration and a closed channel.
    pub fn new(
        link: &'a T,
        driver: &'a D,
        storage: &'a S,
        clock: &'a C,
        flags: &'a PumpFlags,
    ) -> Self {
        Self {
            link,
            clock,
            flags,
            channel: CanChannel::new(driver, flags),
            store: ConfigStore::new(storage),
            timing: TimingConfig::default(),
            filter: FilterConfig::default(),
            behavior: BehaviorConfig::default(),
        }
    }

    /// Restores the persisted configuration and, if auto-startup is
    /// armed, opens the channel.
    pub async fn startup(&mut self) {
        self.timing = self.store.load_timing().await;
        self.filter = self.store.load_filter().await;
        self.behavior = self.store.load_behavior().await;

        if self.behavior.auto_startup {
            info!("auto-startup");
            self.channel.mark_initialised();

            let mode = if self.behavior.listen_at_startup {
                ChannelMode::ListenOnly
            } else {
                ChannelMode::Normal
            };

            if let Err(err) = self.open_channel(mode).await {
                warn!("auto-startup failed: {err}");
            }
        }
    }

    /// Handles one command line, replying on the serial link.
    pub async fn process(&mut self, line: &[u8]) {
        if let Ok(text) = str::from_utf8(line) {
            debug!("processing command {:?}", text.trim_end_matches('\r'));
        }

        match Command::parse(line) {
            Ok(command) => self.execute(command).await,
            Err(err) => {
                debug!("rejecting command: {err}");
                self.reply(BELL).await;
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::SetBitRate(rate) => {
                if self.channel.is_open() {
                    self.reply(BELL).await;
                } else {
                    self.timing = rate.timing();
                    self.channel.mark_initialised();
                    self.store.save_timing(&self.timing).await;
                    info!("bit rate set to {} bit/s", rate.bits_per_second());
                    self.reply(OK).await;
                }
            }
            Command::SetBtrRegisters => {
                // Raw BTR0/BTR1 pairs program the SJA1000 directly; this
                // controller has no equivalent registers.
                debug!("BTR register timing not supported");
                self.reply(BELL).await;
            }
            Command::Open(mode) => {
                if !self.channel.is_initialised() || self.channel.is_open() {
                    self.reply(BELL).await;
                } else {
                    match self.open_channel(mode).await {
                        Ok(()) => self.reply(OK).await,
                        Err(err) => {
                            warn!("failed to open channel: {err}");
                            self.reply(BELL).await;
                        }
                    }
                }
            }
            Command::Close => {
                match self
                    .channel
                    .uninstall(self.clock, self.behavior.auto_poll)
                    .await
                {
                    Ok(()) => self.reply(OK).await,
                    Err(_) => self.reply(BELL).await,
                }
            }
            Command::Transmit(outgoing) => {
                match self.channel.transmit(&outgoing, TRANSMIT_TIMEOUT).await {
                    Ok(()) => {
                        let reply = if self.behavior.auto_poll { Z_OK } else { OK };

                        self.reply(reply).await;
                    }
                    Err(err) => {
                        debug!("transmit rejected: {err}");
                        self.reply(BELL).await;
                    }
                }
            }
            Command::Poll => {
                if !self.channel.is_open() || self.behavior.auto_poll {
                    self.reply(BELL).await;
                } else {
                    match self.channel.receive(Duration::ZERO).await {
                        Ok(received) => self.send_frame(&received).await,
                        Err(ChannelError::Timeout) => self.reply(OK).await,
                        Err(err) => {
                            warn!("poll failed: {err}");
                            self.reply(BELL).await;
                        }
                    }
                }
            }
            Command::PollAll => {
                if !self.channel.is_open() || self.behavior.auto_poll {
                    self.reply(BELL).await;
                } else {
                    loop {
                        match self.channel.receive(Duration::ZERO).await {
                            Ok(received) => self.send_frame(&received).await,
                            Err(ChannelError::Timeout) => {
                                self.reply(b"A\r").await;

                                break;
                            }
                            Err(err) => {
                                warn!("poll failed: {err}");
                                self.reply(BELL).await;

                                break;
                            }
                        }
                    }
                }
            }
            Command::ReadStatus => match self.channel.status().await {
                Ok(status) => {
                    let mut reply = [b'F', 0, 0, CR];

                    frame::put_hex(&mut reply[1..], status.bits().into(), 2);
                    self.reply(&reply).await;
                }
                Err(err) => {
                    debug!("status read rejected: {err}");
                    self.reply(BELL).await;
                }
            },
            Command::SetAutoPoll(enabled) => {
                if self.channel.is_open() {
                    self.reply(BELL).await;
                } else {
                    self.behavior.auto_poll = enabled;
                    self.store.save_behavior(&self.behavior).await;
                    self.reply(OK).await;
                }
            }
            Command::SetFilterMode(mode) => {
                if !self.filter_configurable() {
                    self.reply(BELL).await;
                } else {
                    self.filter.mode = mode;
                    self.store.save_filter(&self.filter).await;
                    self.reply(OK).await;
                }
            }
            Command::SetAcceptanceCode(value) => {
                if !self.filter_configurable() {
                    self.reply(BELL).await;
                } else {
                    // The host transmits the register bytes least
                    // significant first.
                    self.filter.acceptance_code = value.swap_bytes();
                    self.store.save_filter(&self.filter).await;
                    self.reply(OK).await;
                }
            }
            Command::SetAcceptanceMask(value) => {
                if !self.filter_configurable() {
                    self.reply(BELL).await;
                } else {
                    self.filter.acceptance_mask = value.swap_bytes();
                    self.store.save_filter(&self.filter).await;
                    self.reply(OK).await;
                }
            }
            Command::Version => {
                let mut reply = [0; 6];

                reply[0] = b'V';
                reply[1..5].copy_from_slice(VERSION.as_bytes());
                reply[5] = CR;
                self.reply(&reply).await;
            }
            Command::SerialNumber => {
                let mut reply = [0; 6];

                reply[0] = b'N';
                reply[1..5].copy_from_slice(SERIAL_NUMBER.as_bytes());
                reply[5] = CR;
                self.reply(&reply).await;
            }
            Command::SetTimestamps(enabled) => {
                if self.channel.is_open() {
                    self.reply(BELL).await;
                } else {
                    self.behavior.timestamps = enabled;
                    self.store.save_behavior(&self.behavior).await;
                    self.reply(OK).await;
                }
            }
            Command::SetAutoStartup(setting) => {
                // The CAN232 accepts Q only on an open channel, after speed
                // and filters are proven good; kept for compatibility.
                if !self.channel.is_open() {
                    self.reply(BELL).await;
                } else {
                    match setting {
                        AutoStartup::Off => self.behavior.auto_startup = false,
                        AutoStartup::Normal => {
                            self.behavior.auto_startup = true;
                            self.behavior.listen_at_startup = false;
                        }
                        AutoStartup::ListenOnly => {
                            self.behavior.auto_startup = true;
                            self.behavior.listen_at_startup = true;
                        }
                    }

                    self.store.save_behavior(&self.behavior).await;
                    self.reply(OK).await;
                }
            }
        }
    }

    /// Whether the filter registers may be written: bit rate armed, bus
    /// closed.
    fn filter_configurable(&self) -> bool {
        self.channel.is_initialised() && !self.channel.is_open()
    }

    async fn open_channel(&mut self, mode: ChannelMode) -> Result<(), ChannelError<D::Error>> {
        self.flags.set_timestamps(self.behavior.timestamps);
        self.channel
            .install(&self.timing, &self.filter, mode)
            .await?;

        if self.behavior.auto_poll {
            self.flags.start();
        }

        Ok(())
    }

    async fn send_frame(&self, received: &CanFrame) {
        let mut buf = [0; frame::MIN_BUFFER_LEN];
        let timestamp = self.behavior.timestamps.then(|| timestamp_ms(self.clock));

        match frame::encode(received, false, timestamp, &mut buf) {
            Ok(len) => self.reply(&buf[..len]).await,
            Err(err) => {
                warn!("failed to encode frame: {err}");
                self.reply(BELL).await;
            }
        }
    }

    async fn reply(&self, reply: &[u8]) {
        if let Err(err) = self.link.send(reply, REPLY_TIMEOUT).await {
            warn!("failed to send reply: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StatusFlags;
    use crate::frame::standard;
    use crate::tests::{TestClock, TestDriver, TestLink, TestStorage, init_logger};
    use alloc::boxed::Box;

    struct Harness {
        link: TestLink,
        driver: TestDriver,
        storage: TestStorage,
        clock: TestClock,
        flags: &'static PumpFlags,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                link: TestLink::default(),
                driver: TestDriver::default(),
                storage: TestStorage::default(),
                clock: TestClock::default(),
                flags: Box::leak(Box::new(PumpFlags::new())),
            }
        }

        async fn engine(&self) -> Engine<'_, TestDriver, TestLink, TestStorage, TestClock> {
            let mut engine = Engine::new(&self.link, &self.driver, &self.storage, &self.clock, self.flags);

            engine.startup().await;

            engine
        }
    }

    async fn run(
        engine: &mut Engine<'_, TestDriver, TestLink, TestStorage, TestClock>,
        lines: &[&[u8]],
    ) {
        for line in lines {
            engine.process(line).await;
        }
    }

    #[tokio::test]
    async fn cold_start_setup_open_transmit() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S6\r", b"O\r", b"t10021133\r"]).await;

        assert_eq!(harness.link.sent(), b"\r\r\r", "replies should be three OKs");
        assert_eq!(
            harness.driver.transmitted.borrow().as_slice(),
            &[standard(0x100, &[0x11, 0x33])],
            "frame on the bus should be correct"
        );

        let installed = harness.driver.installed.borrow();
        let (timing, _, mode) = installed.as_ref().unwrap();

        assert_eq!(
            *timing,
            BitRate::Rate500Kbit.timing(),
            "bus should run at 500 kbit/s"
        );
        assert_eq!(*mode, ChannelMode::Normal, "bus should be in normal mode");
    }

    #[tokio::test]
    async fn auto_poll_cannot_change_while_open() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"O\r", b"X1\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\x08",
            "setting auto-poll on an open channel should fail"
        );
        assert!(!engine.behavior.auto_poll, "auto-poll should stay off");
    }

    #[tokio::test]
    async fn transmit_acknowledgement_in_auto_poll_mode() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"X1\r", b"O\r", b"t0200\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\rz\r",
            "transmit should be acknowledged with z CR"
        );
        assert_eq!(
            harness.driver.transmitted.borrow().as_slice(),
            &[standard(0x020, &[])],
            "frame on the bus should be correct"
        );
    }

    #[tokio::test]
    async fn version_and_serial_number_in_any_state() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"V\r", b"N\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"V01D0\rN1118\r",
            "replies should be correct"
        );

        harness.link.clear_sent();
        run(&mut engine, &[b"S4\r", b"O\r", b"V\r", b"N\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\rV01D0\rN1118\r",
            "replies should not depend on channel state"
        );
    }

    #[tokio::test]
    async fn open_requires_an_armed_bit_rate() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"O\r", b"L\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\x08\x08",
            "opening without a bit rate should fail"
        );
        assert!(
            harness.driver.installed.borrow().is_none(),
            "driver should stay uninstalled"
        );
    }

    #[tokio::test]
    async fn close_requires_an_open_channel() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"C\r", b"S4\r", b"C\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\x08\r\x08",
            "closing a closed channel should fail"
        );
    }

    #[tokio::test]
    async fn reopen_after_close() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"O\r", b"C\r", b"L\r"]).await;

        assert_eq!(harness.link.sent(), b"\r\r\r\r", "replies should be OKs");

        let installed = harness.driver.installed.borrow();
        let (_, _, mode) = installed.as_ref().unwrap();

        assert_eq!(
            *mode,
            ChannelMode::ListenOnly,
            "second open should be listen-only"
        );
    }

    #[tokio::test]
    async fn listen_only_rejects_transmit_commands() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"L\r", b"t0200\r", b"r1002\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\x08\x08",
            "transmit commands should fail in listen-only mode"
        );
    }

    #[tokio::test]
    async fn hardware_failure_on_open_keeps_the_channel_closed() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        harness.driver.fail_install.set(true);
        run(&mut engine, &[b"S4\r", b"O\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\x08",
            "open should fail on hardware error"
        );

        harness.driver.fail_install.set(false);
        harness.link.clear_sent();
        run(&mut engine, &[b"O\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r",
            "open should succeed once the hardware recovers"
        );
    }

    #[tokio::test]
    async fn transmit_failure_is_bell() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        harness.driver.fail_transmit.set(true);
        run(&mut engine, &[b"S4\r", b"O\r", b"t0200\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\x08",
            "driver failure should surface as BELL"
        );
    }

    #[tokio::test]
    async fn malformed_commands_are_rejected() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"O\r"]).await;
        harness.link.clear_sent();

        run(
            &mut engine,
            &[
                b"U\r",        // unknown command
                b"\r",         // bare terminator
                b"S9\r",       // preset out of range
                b"t8000\r",    // identifier above 11 bits
                b"t1239\r",    // data length code above 8
                b"t12321\r",   // data bytes missing
                b"t123211335\r", // trailing junk before CR
                b"tx0y0\r",    // non-hex digits
                b"X2\r",       // flag digit out of range
                b"Q3\r",       // startup digit out of range
                b"s031C\r",    // BTR registers unsupported
            ],
        )
        .await;

        assert_eq!(
            harness.link.sent(),
            b"\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08",
            "every malformed command should be answered with BELL"
        );
        assert!(
            harness.driver.transmitted.borrow().is_empty(),
            "nothing should reach the bus"
        );
    }

    #[tokio::test]
    async fn extended_identifier_range() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(
            &mut engine,
            &[b"S4\r", b"O\r", b"T1FFFFFFF1AB\r", b"T200000000\r"],
        )
        .await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\r\x08",
            "only the 29-bit identifier should pass"
        );
        assert_eq!(
            harness.driver.transmitted.borrow().len(),
            1,
            "one frame should reach the bus"
        );
    }

    #[tokio::test]
    async fn remote_frames_carry_the_length_code() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"O\r", b"r1002\r", b"R000001002\r"]).await;

        assert_eq!(harness.link.sent(), b"\r\r\r\r", "replies should be OKs");

        let transmitted = harness.driver.transmitted.borrow();

        assert_eq!(transmitted.len(), 2, "two frames should reach the bus");
        assert!(
            transmitted.iter().all(|frame| frame.is_remote_frame()),
            "frames should be remote"
        );
        assert!(
            transmitted.iter().all(|frame| frame.dlc() == 2),
            "length codes should be carried"
        );
    }

    #[tokio::test]
    async fn hex_input_is_case_insensitive() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"O\r", b"t7ff1ab\r", b"t7FF1AB\r"]).await;

        assert_eq!(harness.link.sent(), b"\r\r\r\r", "replies should be OKs");
        assert_eq!(
            harness.driver.transmitted.borrow().as_slice(),
            &[standard(0x7ff, &[0xab]), standard(0x7ff, &[0xab])],
            "both spellings should decode identically"
        );
    }

    #[tokio::test]
    async fn poll_drains_one_frame() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        harness
            .driver
            .rx_queue
            .borrow_mut()
            .push_back(standard(0x123, &[0xab]));

        run(&mut engine, &[b"S4\r", b"O\r", b"P\r", b"P\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\rt1231AB\r\r",
            "poll should emit the frame, then an empty OK"
        );
    }

    #[tokio::test]
    async fn poll_all_drains_the_queue_in_order() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        {
            let mut queue = harness.driver.rx_queue.borrow_mut();

            queue.push_back(standard(0x100, &[0x11, 0x33]));
            queue.push_back(standard(0x020, &[]));
        }

        run(&mut engine, &[b"S4\r", b"O\r", b"A\r", b"A\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\rt10021133\rt0200\rA\rA\r",
            "frames should drain in order, each batch closed by A CR"
        );
    }

    #[tokio::test]
    async fn polling_is_disabled_in_auto_poll_mode() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"X1\r", b"O\r", b"P\r", b"A\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\r\x08\x08",
            "P and A should be rejected while auto-poll is on"
        );
    }

    #[tokio::test]
    async fn poll_appends_timestamps_when_enabled() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        harness.clock.micros.set(1234 * 1000);
        harness
            .driver
            .rx_queue
            .borrow_mut()
            .push_back(standard(0x123, &[0xab]));

        run(&mut engine, &[b"S4\r", b"Z1\r", b"O\r", b"P\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\rt1231AB04D2\r",
            "polled frame should carry the timestamp"
        );
    }

    #[tokio::test]
    async fn status_flags_format() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"F\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\x08",
            "status read should fail while closed"
        );

        harness.link.clear_sent();
        harness
            .driver
            .status
            .set(StatusFlags::BUS_ERROR | StatusFlags::RX_QUEUE_FULL);

        run(&mut engine, &[b"S4\r", b"O\r", b"F\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\rF81\r",
            "status byte should be correct"
        );
    }

    #[tokio::test]
    async fn status_bit_four_stays_reserved() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        harness.driver.status.set(StatusFlags::all());
        run(&mut engine, &[b"S4\r", b"O\r", b"F\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\rFEF\r",
            "bit 4 of the status byte should be zero"
        );
    }

    #[tokio::test]
    async fn acceptance_registers_are_byte_reversed() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"S4\r", b"M12345678\r", b"mDEADBEEF\r"]).await;

        assert_eq!(harness.link.sent(), b"\r\r\r", "replies should be OKs");
        assert_eq!(
            engine.filter.acceptance_code, 0x7856_3412,
            "code should be stored least significant byte first"
        );
        assert_eq!(
            engine.filter.acceptance_mask, 0xefbe_adde,
            "mask should be stored least significant byte first"
        );
    }

    #[tokio::test]
    async fn filter_setup_requires_an_armed_closed_channel() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"W1\r", b"M00000000\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\x08\x08",
            "filter setup should fail while uninitialised"
        );

        harness.link.clear_sent();
        run(&mut engine, &[b"S4\r", b"O\r", b"W1\r", b"mFFFFFFFF\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\r\r\x08\x08",
            "filter setup should fail while open"
        );
    }

    #[tokio::test]
    async fn auto_startup_requires_an_open_channel() {
        init_logger();

        let harness = Harness::new();
        let mut engine = harness.engine().await;

        run(&mut engine, &[b"Q1\r", b"S4\r", b"O\r", b"Q2\r"]).await;

        assert_eq!(
            harness.link.sent(),
            b"\x08\r\r\r",
            "Q should only work on an open channel"
        );
        assert!(engine.behavior.auto_startup, "auto-startup should be armed");
        assert!(
            engine.behavior.listen_at_startup,
            "listen-only startup should be armed"
        );
    }

    #[tokio::test]
    async fn settings_survive_a_power_cycle() {
        init_logger();

        let harness = Harness::new();

        {
            let mut engine = harness.engine().await;

            run(
                &mut engine,
                &[
                    b"S4\r",
                    b"X1\r",
                    b"Z1\r",
                    b"W1\r",
                    b"M12345678\r",
                    b"m00FF00FF\r",
                    b"O\r",
                    b"Q1\r",
                ],
            )
            .await;

            assert_eq!(
                harness.link.sent(),
                b"\r\r\r\r\r\r\r\r",
                "setup commands should succeed"
            );
        }

        // Power cycle: fresh engine over the same storage.
        harness.flags.set_open(false);
        harness.link.clear_sent();

        let engine = harness.engine().await;

        assert_eq!(
            engine.timing,
            BitRate::Rate125Kbit.timing(),
            "timing should be restored"
        );
        assert!(engine.behavior.auto_poll, "auto-poll should be restored");
        assert!(engine.behavior.timestamps, "timestamps should be restored");
        assert_eq!(
            engine.filter.mode,
            FilterMode::Single,
            "filter mode should be restored"
        );
        assert_eq!(
            engine.filter.acceptance_code, 0x7856_3412,
            "acceptance code should be restored"
        );
        assert_eq!(
            engine.filter.acceptance_mask, 0xff00_ff00,
            "acceptance mask should be restored"
        );
        assert!(
            engine.channel.is_open(),
            "auto-startup should have opened the channel"
        );

        let installed = harness.driver.installed.borrow();
        let (_, _, mode) = installed.as_ref().unwrap();

        assert_eq!(
            *mode,
            ChannelMode::Normal,
            "auto-startup should open in normal mode"
        );
    }

    #[tokio::test]
    async fn encoded_frames_decode_back_to_themselves() {
        init_logger();

        let frames = [
            standard(0x000, &[]),
            standard(0x7ff, &[0x00, 0xff, 0x55, 0xaa, 0x01, 0x02, 0x03, 0x04]),
            CanFrame::new(ExtendedId::new(0x1fff_ffff).unwrap(), &[0xde, 0xad]).unwrap(),
            CanFrame::new_remote(StandardId::new(0x123).unwrap(), 8).unwrap(),
            CanFrame::new_remote(ExtendedId::new(0x42).unwrap(), 0).unwrap(),
        ];

        for original in frames {
            let mut buf = [0; frame::MIN_BUFFER_LEN];
            let len = frame::encode(&original, false, None, &mut buf).unwrap();
            let command = Command::parse(&buf[..len]).unwrap();

            assert_eq!(
                command,
                Command::Transmit(original),
                "decoding should invert encoding"
            );
        }
    }
}
