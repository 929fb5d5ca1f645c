//! Adapter configuration: bit timing, acceptance filter and protocol
//! behaviour, with persistence in platform storage.
//!
//! Each configuration kind is stored as one small fixed-size blob under a
//! well-known name. Load failures of any sort silently fall back to the
//! built-in defaults; save failures are logged and swallowed, so a command
//! that triggered a save still reports OK. Both behaviours match the
//! CAN232 adapters this protocol originates from.

use core::fmt::Debug;
use log::{debug, warn};
use strum::FromRepr;

/// Storage key for the bit timing blob.
const TIMING_FILE: &str = "timing_config.bin";
/// Storage key for the acceptance filter blob.
const FILTER_FILE: &str = "filter_config.bin";
/// Storage key for the protocol behaviour blob.
const SLCAN_FILE: &str = "slcan_config.bin";

/// Nominal bus bit rate preset, selected by the digit of the `S` command.
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum BitRate {
    /// 10 kbit/s.
    Rate10Kbit,
    /// 20 kbit/s.
    Rate20Kbit,
    /// 50 kbit/s.
    Rate50Kbit,
    /// 100 kbit/s.
    Rate100Kbit,
    /// 125 kbit/s.
    Rate125Kbit,
    /// 250 kbit/s.
    Rate250Kbit,
    /// 500 kbit/s.
    Rate500Kbit,
    /// 800 kbit/s.
    Rate800Kbit,
    /// 1 Mbit/s.
    Rate1Mbit,
}

impl BitRate {
    /// Looks up the preset for an ASCII digit `'0'..='8'`.
    #[must_use]
    pub fn from_digit(digit: u8) -> Option<Self> {
        digit
            .checked_sub(b'0')
            .and_then(Self::from_repr)
    }

    /// Returns the nominal bit rate in bits per second.
    #[must_use]
    pub const fn bits_per_second(self) -> u32 {
        match self {
            Self::Rate10Kbit => 10_000,
            Self::Rate20Kbit => 20_000,
            Self::Rate50Kbit => 50_000,
            Self::Rate100Kbit => 100_000,
            Self::Rate125Kbit => 125_000,
            Self::Rate250Kbit => 250_000,
            Self::Rate500Kbit => 500_000,
            Self::Rate800Kbit => 800_000,
            Self::Rate1Mbit => 1_000_000,
        }
    }

    /// Returns the controller timing parameters for this preset.
    ///
    /// The parameter sets assume the 40 MHz quantum clock of the original
    /// adapter hardware.
    #[must_use]
    pub const fn timing(self) -> TimingConfig {
        let (brp, tseg_1, tseg_2) = match self {
            Self::Rate10Kbit => (400, 15, 4),
            Self::Rate20Kbit => (200, 15, 4),
            Self::Rate50Kbit => (80, 15, 4),
            Self::Rate100Kbit => (40, 15, 4),
            Self::Rate125Kbit => (32, 15, 4),
            Self::Rate250Kbit => (16, 15, 4),
            Self::Rate500Kbit => (8, 15, 4),
            Self::Rate800Kbit => (4, 16, 8),
            Self::Rate1Mbit => (4, 15, 4),
        };

        TimingConfig {
            brp,
            tseg_1,
            tseg_2,
            sjw: 3,
            triple_sampling: false,
        }
    }
}

/// CAN controller bit timing parameters.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TimingConfig {
    /// Baud rate prescaler.
    pub brp: u32,
    /// Length of timing segment 1, in time quanta.
    pub tseg_1: u8,
    /// Length of timing segment 2, in time quanta.
    pub tseg_2: u8,
    /// Synchronisation jump width, in time quanta.
    pub sjw: u8,
    /// Whether the bus is sampled three times per bit.
    pub triple_sampling: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        BitRate::Rate500Kbit.timing()
    }
}

impl TimingConfig {
    const BLOB_LEN: usize = 8;

    fn to_blob(&self) -> [u8; Self::BLOB_LEN] {
        let mut blob = [0; Self::BLOB_LEN];

        blob[..4].copy_from_slice(&self.brp.to_le_bytes());
        blob[4] = self.tseg_1;
        blob[5] = self.tseg_2;
        blob[6] = self.sjw;
        blob[7] = u8::from(self.triple_sampling);

        blob
    }

    fn from_blob(blob: &[u8; Self::BLOB_LEN]) -> Self {
        Self {
            brp: u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]),
            tseg_1: blob[4],
            tseg_2: blob[5],
            sjw: blob[6],
            triple_sampling: blob[7] != 0,
        }
    }
}

/// Acceptance filter mode of the SJA1000-compatible filter registers.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum FilterMode {
    /// Dual filter mode, the power-on default.
    Dual,
    /// Single filter mode.
    Single,
}

/// Acceptance filter configuration.
///
/// A received identifier passes the single-filter interpretation when
/// `(id ^ code) & mask == 0`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FilterConfig {
    /// Acceptance code register value.
    pub acceptance_code: u32,
    /// Acceptance mask register value.
    pub acceptance_mask: u32,
    /// Single or dual filter mode.
    pub mode: FilterMode,
}

impl Default for FilterConfig {
    fn default() -> Self {
        // Accept everything.
        Self {
            acceptance_code: 0,
            acceptance_mask: u32::MAX,
            mode: FilterMode::Dual,
        }
    }
}

impl FilterConfig {
    const BLOB_LEN: usize = 9;

    fn to_blob(&self) -> [u8; Self::BLOB_LEN] {
        let mut blob = [0; Self::BLOB_LEN];

        blob[..4].copy_from_slice(&self.acceptance_code.to_le_bytes());
        blob[4..8].copy_from_slice(&self.acceptance_mask.to_le_bytes());
        blob[8] = u8::from(self.mode == FilterMode::Single);

        blob
    }

    fn from_blob(blob: &[u8; Self::BLOB_LEN]) -> Self {
        Self {
            acceptance_code: u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]),
            acceptance_mask: u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]),
            mode: if blob[8] != 0 {
                FilterMode::Single
            } else {
                FilterMode::Dual
            },
        }
    }
}

/// Protocol behaviour switches, set by the `X`, `Z` and `Q` commands.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BehaviorConfig {
    /// Emit received frames spontaneously instead of waiting for `P`/`A`.
    pub auto_poll: bool,
    /// Append a millisecond timestamp to emitted frames.
    pub timestamps: bool,
    /// Open the channel automatically at power-on.
    pub auto_startup: bool,
    /// Open in listen-only mode when auto-startup runs.
    pub listen_at_startup: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        // Everything off, compatible with host software written for the
        // original polled CAN232.
        Self {
            auto_poll: false,
            timestamps: false,
            auto_startup: false,
            listen_at_startup: false,
        }
    }
}

impl BehaviorConfig {
    const BLOB_LEN: usize = 4;

    fn to_blob(&self) -> [u8; Self::BLOB_LEN] {
        [
            u8::from(self.auto_poll),
            u8::from(self.timestamps),
            u8::from(self.auto_startup),
            u8::from(self.listen_at_startup),
        ]
    }

    fn from_blob(blob: &[u8; Self::BLOB_LEN]) -> Self {
        Self {
            auto_poll: blob[0] != 0,
            timestamps: blob[1] != 0,
            auto_startup: blob[2] != 0,
            listen_at_startup: blob[3] != 0,
        }
    }
}

/// Persistent storage for the configuration blobs.
///
/// On the target this is a small flash filesystem or key-value store; in
/// tests an in-memory map.
pub trait Storage {
    /// Storage-specific error type.
    type Error: Debug;

    /// Reads the blob stored under `name` into `buf`, returning its length.
    async fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Stores `data` under `name`, replacing any previous blob.
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Removes the blob stored under `name`, if present.
    async fn remove(&self, name: &str) -> Result<(), Self::Error>;
}

/// Typed access to the three persisted configurations.
pub struct ConfigStore<'a, S> {
    storage: &'a S,
}

impl<'a, S: Storage> ConfigStore<'a, S> {
    /// Creates a store on top of the given storage.
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    async fn load<const N: usize>(&self, name: &str) -> Option<[u8; N]> {
        let mut blob = [0; N];

        match self.storage.read(name, &mut blob).await {
            Ok(len) if len == N => Some(blob),
            Ok(len) => {
                warn!("{name}: unexpected size {len}, using defaults");

                None
            }
            Err(err) => {
                debug!("{name}: not restored ({err:?}), using defaults");

                None
            }
        }
    }

    async fn save(&self, name: &str, blob: &[u8]) {
        if let Err(err) = self.storage.write(name, blob).await {
            warn!("failed to persist {name}: {err:?}");
        }
    }

    /// Loads the bit timing configuration, or its default.
    pub async fn load_timing(&self) -> TimingConfig {
        self.load(TIMING_FILE)
            .await
            .map_or_else(TimingConfig::default, |blob| TimingConfig::from_blob(&blob))
    }

    /// Persists the bit timing configuration. Failures are logged and
    /// swallowed.
    pub async fn save_timing(&self, timing: &TimingConfig) {
        self.save(TIMING_FILE, &timing.to_blob()).await;
    }

    /// Removes the persisted bit timing configuration.
    pub async fn reset_timing(&self) -> Result<(), S::Error> {
        self.storage.remove(TIMING_FILE).await
    }

    /// Loads the acceptance filter configuration, or its default.
    pub async fn load_filter(&self) -> FilterConfig {
        self.load(FILTER_FILE)
            .await
            .map_or_else(FilterConfig::default, |blob| FilterConfig::from_blob(&blob))
    }

    /// Persists the acceptance filter configuration. Failures are logged
    /// and swallowed.
    pub async fn save_filter(&self, filter: &FilterConfig) {
        self.save(FILTER_FILE, &filter.to_blob()).await;
    }

    /// Removes the persisted acceptance filter configuration.
    pub async fn reset_filter(&self) -> Result<(), S::Error> {
        self.storage.remove(FILTER_FILE).await
    }

    /// Loads the protocol behaviour configuration, or its default.
    pub async fn load_behavior(&self) -> BehaviorConfig {
        self.load(SLCAN_FILE)
            .await
            .map_or_else(BehaviorConfig::default, |blob| {
                BehaviorConfig::from_blob(&blob)
            })
    }

    /// Persists the protocol behaviour configuration. Failures are logged
    /// and swallowed.
    pub async fn save_behavior(&self, behavior: &BehaviorConfig) {
        self.save(SLCAN_FILE, &behavior.to_blob()).await;
    }

    /// Removes the persisted protocol behaviour configuration.
    pub async fn reset_behavior(&self) -> Result<(), S::Error> {
        self.storage.remove(SLCAN_FILE).await
    }
}
