#![no_std]
#![no_main]

use blucan::dispatch::Dispatcher;
use blucan::engine::Engine;
use blucan::pump::{self, PumpFlags};
use blucan_firmware::{ConfigFlash, OtaFlash, RadioPort, SystemClock, TwaiBus};
use embassy_executor::Spawner;
use esp_backtrace as _;
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use esp_println::logger;
use static_cell::StaticCell;

esp_bootloader_esp_idf::esp_app_desc!();

#[embassy_executor::task]
async fn dispatcher_task(
    dispatcher: Dispatcher<
        'static,
        TwaiBus<'static>,
        RadioPort<'static>,
        ConfigFlash,
        SystemClock,
        OtaFlash,
    >,
) -> ! {
    dispatcher.run().await
}

#[embassy_executor::task]
async fn pump_task(
    driver: &'static TwaiBus<'static>,
    link: &'static RadioPort<'static>,
    clock: &'static SystemClock,
    flags: &'static PumpFlags,
) -> ! {
    pump::run(driver, link, clock, flags).await
}

#[esp_rtos::main]
async fn main(spawner: Spawner) {
    logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);

    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    static LINK: StaticCell<RadioPort<'static>> = StaticCell::new();
    static DRIVER: StaticCell<TwaiBus<'static>> = StaticCell::new();
    static STORAGE: StaticCell<ConfigFlash> = StaticCell::new();
    static CLOCK: StaticCell<SystemClock> = StaticCell::new();
    static FLAGS: StaticCell<PumpFlags> = StaticCell::new();

    let link = LINK.init(blucan_firmware::new_radio_port(peripherals.UART1).unwrap());
    let driver = DRIVER.init(blucan_firmware::new_can_bus(peripherals.TWAI0));
    let storage = STORAGE.init(ConfigFlash::new());
    let clock = CLOCK.init(SystemClock);
    let flags = FLAGS.init(PumpFlags::new());
    let updater = OtaFlash::new().unwrap();

    let mut engine = Engine::new(link, driver, storage, clock, flags);

    engine.startup().await;

    spawner
        .spawn(dispatcher_task(Dispatcher::new(engine, updater)))
        .unwrap();
    spawner.spawn(pump_task(driver, link, clock, flags)).unwrap();
}
