#![no_std]

//! ESP32 shell for the `blucan` protocol engine.
//!
//! Provides the platform implementations of the engine's collaborator
//! traits: the UART link to the Bluetooth SPP radio module, the TWAI
//! controller, the flash-backed configuration store and the dual-partition
//! firmware updater.

use blucan::Clock;
use blucan::channel::{CanDriver, ChannelMode, DriverError, StatusFlags};
use blucan::config::{FilterConfig, FilterMode, Storage, TimingConfig};
use blucan::frame::{CanFrame, Frame};
use blucan::link::{LinkError, Transport};
use blucan::ota::{APP_DESC_LEN, APP_DESC_OFFSET, AppDescriptor, FinishError, Updater};
use core::cell::RefCell;
use core::time::Duration;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Instant, Timer, TimeoutError, with_timeout};
use embedded_io_async::{Read, Write};
use embedded_storage::{ReadStorage, Storage as FlashOps};
use esp_bootloader_esp_idf::ota::{Ota, Slot};
use esp_bootloader_esp_idf::partitions::{self, AppPartitionSubType, PartitionType};
use esp_hal::Async;
use esp_hal::gpio::AnyPin;
use esp_hal::twai::{
    self, BaudRate, EspTwaiFrame, TwaiConfiguration, TwaiMode, TwaiRx, TwaiTx,
    filter::{Filter, FilterType},
};
use esp_hal::uart::{Config as UartConfig, Instance as UartInstance, IoError, Uart, UartRx, UartTx};
use esp_storage::FlashStorage;
use log::{info, warn};

#[macro_export]
macro_rules! num_from_env {
    ($name:literal, $type:ty) => {
        match <$type>::from_str_radix(env!($name), 10) {
            Ok(val) => val,
            Err(_) => panic!("failed to parse environment variable as number"),
        }
    };
}

fn embassy_duration(duration: Duration) -> embassy_time::Duration {
    embassy_time::Duration::from_micros(duration.as_micros() as u64)
}

/// UART link to the external Bluetooth SPP radio module.
///
/// The module handles pairing and framing; on this side the link is a
/// plain byte stream. The halves are guarded separately so the dispatcher
/// can wait for input while the pump writes.
pub struct RadioPort<'a> {
    rx: Mutex<CriticalSectionRawMutex, UartRx<'a, Async>>,
    tx: Mutex<CriticalSectionRawMutex, UartTx<'a, Async>>,
}

impl Transport for RadioPort<'_> {
    type Error = IoError;

    async fn send(&self, data: &[u8], timeout: Duration) -> Result<(), LinkError<IoError>> {
        let mut tx = self.tx.lock().await;
        let write = async {
            tx.write_all(data).await?;
            tx.flush().await
        };

        match with_timeout(embassy_duration(timeout), write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(LinkError::Io(err)),
            Err(TimeoutError) => Err(LinkError::Timeout),
        }
    }

    async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError<IoError>> {
        let mut rx = self.rx.lock().await;

        match with_timeout(embassy_duration(timeout), rx.read(buf)).await {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(err)) => Err(LinkError::Io(err)),
            Err(TimeoutError) => Err(LinkError::Timeout),
        }
    }
}

/// Opens the UART to the radio module on the configured pins.
pub fn new_radio_port<'a>(
    uart: impl UartInstance + 'a,
) -> Result<RadioPort<'a>, esp_hal::uart::ConfigError> {
    const PIN_RX: u8 = num_from_env!("PIN_RADIO_RX", u8);
    const PIN_TX: u8 = num_from_env!("PIN_RADIO_TX", u8);
    const BAUD_RATE: u32 = num_from_env!("RADIO_BAUD_RATE", u32);

    let rx = unsafe { AnyPin::steal(PIN_RX) };
    let tx = unsafe { AnyPin::steal(PIN_TX) };
    let cfg = UartConfig::default().with_baudrate(BAUD_RATE);
    let (rx, tx) = Uart::new(uart, cfg)?
        .with_rx(rx)
        .with_tx(tx)
        .into_async()
        .split();

    Ok(RadioPort {
        rx: Mutex::new(rx),
        tx: Mutex::new(tx),
    })
}

/// Acceptance filter built from the runtime code/mask registers.
///
/// The register layout matches the SJA1000: acceptance code bytes first,
/// acceptance mask bytes second, most significant byte in the lowest
/// register.
struct CodeMaskFilter<const SINGLE: bool> {
    code: u32,
    mask: u32,
}

impl<const SINGLE: bool> Filter for CodeMaskFilter<SINGLE> {
    const FILTER_TYPE: FilterType = if SINGLE {
        FilterType::Single
    } else {
        FilterType::Dual
    };

    fn to_registers(&self) -> [u8; 8] {
        let mut registers = [0; 8];

        registers[..4].copy_from_slice(&self.code.to_be_bytes());
        registers[4..].copy_from_slice(&self.mask.to_be_bytes());

        registers
    }
}

/// The TWAI controller behind the [`CanDriver`] contract.
///
/// The controller is rebuilt from the peripheral on every install, since
/// the armed bit rate and filter may change between opens. While open,
/// the receive and transmit halves live in their own locks so the pump
/// can block on receive without stalling transmissions.
pub struct TwaiBus<'a> {
    rx: Mutex<CriticalSectionRawMutex, Option<TwaiRx<'a, Async>>>,
    tx: Mutex<CriticalSectionRawMutex, Option<TwaiTx<'a, Async>>>,
    status: BlockingMutex<CriticalSectionRawMutex, RefCell<StatusFlags>>,
}

/// Errors of the TWAI driver surface as their raw cause for the logs.
#[derive(Debug)]
pub enum TwaiError {
    /// The controller is in the wrong state for the operation.
    NotRunning,
    /// The controller is already running.
    AlreadyRunning,
    /// The hardware reported an error.
    Hardware(esp_hal::twai::EspTwaiError),
}

impl TwaiBus<'_> {
    fn baud_rate(timing: &TimingConfig) -> BaudRate {
        BaudRate::Custom(twai::TimingConfig {
            baud_rate_prescaler: timing.brp as u16,
            sync_jump_width: timing.sjw,
            tseg_1: timing.tseg_1,
            tseg_2: timing.tseg_2,
            triple_sample: timing.triple_sampling,
        })
    }

    fn record_status<T>(&self, frame_result: &Result<T, esp_hal::twai::EspTwaiError>) {
        if frame_result.is_err() {
            self.status.lock(|status| {
                status.borrow_mut().insert(StatusFlags::BUS_ERROR);
            });
        }
    }
}

impl CanDriver for TwaiBus<'_> {
    type Error = TwaiError;

    async fn install(
        &self,
        timing: &TimingConfig,
        filter: &FilterConfig,
        mode: ChannelMode,
    ) -> Result<(), TwaiError> {
        const PIN_RX: u8 = num_from_env!("PIN_CAN_RX", u8);
        const PIN_TX: u8 = num_from_env!("PIN_CAN_TX", u8);

        let mut rx_slot = self.rx.lock().await;
        let mut tx_slot = self.tx.lock().await;

        if rx_slot.is_some() || tx_slot.is_some() {
            return Err(TwaiError::AlreadyRunning);
        }

        // The halves were dropped on uninstall; reclaim the peripheral.
        let twai = unsafe { esp_hal::peripherals::TWAI0::steal() };
        let rx_pin = unsafe { AnyPin::steal(PIN_RX) };
        let tx_pin = unsafe { AnyPin::steal(PIN_TX) };
        let twai_mode = match mode {
            ChannelMode::Normal => TwaiMode::Normal,
            ChannelMode::ListenOnly => TwaiMode::ListenOnly,
        };
        let mut config =
            TwaiConfiguration::new(twai, rx_pin, tx_pin, Self::baud_rate(timing), twai_mode)
                .into_async();

        match filter.mode {
            FilterMode::Single => config.set_filter(CodeMaskFilter::<true> {
                code: filter.acceptance_code,
                mask: filter.acceptance_mask,
            }),
            FilterMode::Dual => config.set_filter(CodeMaskFilter::<false> {
                code: filter.acceptance_code,
                mask: filter.acceptance_mask,
            }),
        }

        let (rx, tx) = config.start().split();

        *rx_slot = Some(rx);
        *tx_slot = Some(tx);
        self.status.lock(|status| {
            *status.borrow_mut() = StatusFlags::empty();
        });

        Ok(())
    }

    async fn uninstall(&self) -> Result<(), TwaiError> {
        let rx = self.rx.lock().await.take();
        let tx = self.tx.lock().await.take();

        if rx.is_none() && tx.is_none() {
            return Err(TwaiError::NotRunning);
        }

        // Dropping the halves disables the controller.
        drop(rx);
        drop(tx);

        Ok(())
    }

    async fn transmit(
        &self,
        frame: &CanFrame,
        timeout: Duration,
    ) -> Result<(), DriverError<TwaiError>> {
        let mut tx = self.tx.lock().await;
        let tx = tx
            .as_mut()
            .ok_or(DriverError::Hardware(TwaiError::NotRunning))?;
        let outgoing = if frame.is_remote_frame() {
            EspTwaiFrame::new_remote(frame.id(), frame.dlc())
        } else {
            EspTwaiFrame::new(frame.id(), frame.data())
        }
        .ok_or(DriverError::Hardware(TwaiError::NotRunning))?;

        match with_timeout(embassy_duration(timeout), tx.transmit_async(&outgoing)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DriverError::Hardware(TwaiError::Hardware(err))),
            Err(TimeoutError) => Err(DriverError::Timeout),
        }
    }

    async fn receive(&self, timeout: Duration) -> Result<CanFrame, DriverError<TwaiError>> {
        let mut rx = self.rx.lock().await;
        let rx = rx
            .as_mut()
            .ok_or(DriverError::Hardware(TwaiError::NotRunning))?;

        match with_timeout(embassy_duration(timeout), rx.receive_async()).await {
            Ok(result) => {
                self.record_status(&result);

                let received = result.map_err(|err| DriverError::Hardware(TwaiError::Hardware(err)))?;
                let frame = if received.is_remote_frame() {
                    CanFrame::new_remote(received.id(), received.dlc())
                } else {
                    CanFrame::new(received.id(), received.data())
                };

                frame.ok_or(DriverError::Hardware(TwaiError::NotRunning))
            }
            Err(TimeoutError) => Err(DriverError::Timeout),
        }
    }

    async fn status(&self) -> Result<StatusFlags, TwaiError> {
        Ok(self.status.lock(|status| *status.borrow()))
    }
}

/// Creates the TWAI bus, initially stopped.
///
/// Takes the peripheral so nothing else can claim it; the controller
/// itself is configured on demand each time the channel opens.
pub fn new_can_bus<'a>(twai: esp_hal::peripherals::TWAI0<'a>) -> TwaiBus<'a> {
    let _ = twai;

    TwaiBus {
        rx: Mutex::new(None),
        tx: Mutex::new(None),
        status: BlockingMutex::new(RefCell::new(StatusFlags::empty())),
    }
}

/// Flash region reserved for the configuration blobs, one fixed slot per
/// well-known name.
const CONFIG_FLASH_OFFSET: u32 = 0x9000;
const CONFIG_SLOT_SIZE: u32 = 0x100;
const CONFIG_NAMES: [&str; 3] = ["timing_config.bin", "filter_config.bin", "slcan_config.bin"];
const CONFIG_MAGIC: u8 = 0xb5;

/// Configuration store in the NVS flash region.
pub struct ConfigFlash {
    flash: BlockingMutex<CriticalSectionRawMutex, RefCell<FlashStorage>>,
}

/// Error type for [`ConfigFlash`] operations.
#[derive(Debug)]
pub enum ConfigFlashError {
    /// The name is not one of the three known blobs.
    UnknownName,
    /// No blob has been written to the slot yet.
    Missing,
    /// The blob does not fit its slot.
    TooLarge,
    /// The flash driver failed.
    Flash(esp_storage::FlashStorageError),
}

impl ConfigFlash {
    /// Opens the configuration region.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flash: BlockingMutex::new(RefCell::new(FlashStorage::new())),
        }
    }

    fn slot_offset(name: &str) -> Result<u32, ConfigFlashError> {
        CONFIG_NAMES
            .iter()
            .position(|&known| known == name)
            .map(|index| CONFIG_FLASH_OFFSET + index as u32 * CONFIG_SLOT_SIZE)
            .ok_or(ConfigFlashError::UnknownName)
    }
}

impl Default for ConfigFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for ConfigFlash {
    type Error = ConfigFlashError;

    async fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize, ConfigFlashError> {
        let offset = Self::slot_offset(name)?;

        self.flash.lock(|flash| {
            let mut flash = flash.borrow_mut();
            let mut header = [0; 2];

            flash
                .read(offset, &mut header)
                .map_err(ConfigFlashError::Flash)?;

            if header[0] != CONFIG_MAGIC {
                return Err(ConfigFlashError::Missing);
            }

            let len = usize::from(header[1]).min(buf.len());

            flash
                .read(offset + 2, &mut buf[..len])
                .map_err(ConfigFlashError::Flash)?;

            Ok(len)
        })
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), ConfigFlashError> {
        let offset = Self::slot_offset(name)?;
        let len = u8::try_from(data.len())
            .ok()
            .filter(|&len| u32::from(len) + 2 <= CONFIG_SLOT_SIZE)
            .ok_or(ConfigFlashError::TooLarge)?;

        self.flash.lock(|flash| {
            let mut flash = flash.borrow_mut();

            flash
                .write(offset, &[CONFIG_MAGIC, len])
                .map_err(ConfigFlashError::Flash)?;
            flash
                .write(offset + 2, data)
                .map_err(ConfigFlashError::Flash)
        })
    }

    async fn remove(&self, name: &str) -> Result<(), ConfigFlashError> {
        let offset = Self::slot_offset(name)?;

        self.flash.lock(|flash| {
            flash
                .borrow_mut()
                .write(offset, &[0, 0])
                .map_err(ConfigFlashError::Flash)
        })
    }
}

/// Dual-partition firmware updater over the ESP-IDF partition table.
pub struct OtaFlash {
    flash: FlashStorage,
    table: [u8; partitions::PARTITION_TABLE_MAX_LEN],
    target_offset: u32,
    target_len: u32,
    target_slot: Slot,
    running: Option<AppDescriptor>,
    written: u32,
}

/// Error type for [`OtaFlash`] operations.
#[derive(Debug)]
pub enum OtaFlashError {
    /// No inactive application partition was found.
    NoTargetPartition,
    /// No write handle is open.
    NotStarted,
    /// The image exceeds the target partition.
    ImageTooLarge,
    /// The partition table could not be read.
    PartitionTable(partitions::Error),
    /// The flash driver failed.
    Flash(esp_storage::FlashStorageError),
}

impl OtaFlash {
    /// Opens the partition table and locates the update target.
    pub fn new() -> Result<Self, OtaFlashError> {
        let mut flash = FlashStorage::new();
        let mut table = [0; partitions::PARTITION_TABLE_MAX_LEN];
        let (running_sub_type, target_sub_type, target_slot) = {
            let parsed = partitions::read_partition_table(&mut flash, &mut table)
                .map_err(OtaFlashError::PartitionTable)?;
            let mut ota = Ota::new(&mut flash, &parsed).map_err(OtaFlashError::PartitionTable)?;

            match ota.current_slot().map_err(OtaFlashError::PartitionTable)? {
                Slot::None | Slot::Slot1 => (
                    AppPartitionSubType::Ota1,
                    AppPartitionSubType::Ota0,
                    Slot::Slot0,
                ),
                Slot::Slot0 => (
                    AppPartitionSubType::Ota0,
                    AppPartitionSubType::Ota1,
                    Slot::Slot1,
                ),
            }
        };
        let (running_offset, target_offset, target_len) = {
            let parsed = partitions::read_partition_table(&mut flash, &mut table)
                .map_err(OtaFlashError::PartitionTable)?;
            let running = parsed
                .find_partition(PartitionType::App(running_sub_type))
                .map_err(OtaFlashError::PartitionTable)?;
            let target = parsed
                .find_partition(PartitionType::App(target_sub_type))
                .map_err(OtaFlashError::PartitionTable)?
                .ok_or(OtaFlashError::NoTargetPartition)?;

            (
                running.map(|partition| partition.offset()),
                target.offset(),
                target.len(),
            )
        };
        let running = running_offset.and_then(|offset| read_descriptor(&mut flash, offset));

        info!("firmware updates target the partition at {target_offset:#x}");

        Ok(Self {
            flash,
            table,
            target_offset,
            target_len,
            target_slot,
            running,
            written: 0,
        })
    }
}

/// Reads the application descriptor of the image in the partition at
/// `offset`, if one is present.
fn read_descriptor(flash: &mut FlashStorage, offset: u32) -> Option<AppDescriptor> {
    let mut bytes = [0; APP_DESC_LEN];

    flash.read(offset + APP_DESC_OFFSET as u32, &mut bytes).ok()?;

    // An erased partition reads back as all ones.
    if bytes.iter().all(|&byte| byte == 0xff) {
        return None;
    }

    Some(AppDescriptor::from(bytes))
}

impl Updater for OtaFlash {
    type Error = OtaFlashError;

    fn running_descriptor(&self) -> Option<AppDescriptor> {
        self.running.clone()
    }

    fn last_invalid_descriptor(&self) -> Option<AppDescriptor> {
        // The otadata format used here does not record which image a
        // rollback came from, so there is nothing to refuse.
        None
    }

    async fn begin(&mut self) -> Result<(), OtaFlashError> {
        self.written = 0;

        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), OtaFlashError> {
        if self.written + chunk.len() as u32 > self.target_len {
            return Err(OtaFlashError::ImageTooLarge);
        }

        self.flash
            .write(self.target_offset + self.written, chunk)
            .map_err(OtaFlashError::Flash)?;
        self.written += chunk.len() as u32;

        Ok(())
    }

    async fn finish(&mut self) -> Result<(), FinishError<OtaFlashError>> {
        let mut magic = [0];

        self.flash
            .read(self.target_offset, &mut magic)
            .map_err(|err| FinishError::Other(OtaFlashError::Flash(err)))?;

        // Application images start with the 0xe9 image magic byte.
        if self.written == 0 || magic[0] != 0xe9 {
            return Err(FinishError::ValidationFailed);
        }

        Ok(())
    }

    async fn set_boot_target(&mut self) -> Result<(), OtaFlashError> {
        let slot = self.target_slot;
        let parsed = partitions::read_partition_table(&mut self.flash, &mut self.table)
            .map_err(OtaFlashError::PartitionTable)?;
        let mut ota = Ota::new(&mut self.flash, &parsed).map_err(OtaFlashError::PartitionTable)?;

        ota.set_current_slot(slot)
            .map_err(OtaFlashError::PartitionTable)
    }

    async fn abort(&mut self) {
        if self.written > 0 {
            warn!("discarding {} partially written bytes", self.written);
        }

        self.written = 0;
    }

    fn restart(&self) -> ! {
        esp_hal::system::software_reset()
    }
}

/// System timer behind the [`Clock`] contract.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        Instant::now().as_micros()
    }

    async fn sleep(&self, duration: Duration) {
        Timer::after(embassy_duration(duration)).await;
    }
}
