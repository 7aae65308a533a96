//! quadlink-hw-interface
//!
//! RP2040 firmware that turns a quadrature rotary encoder and up to twelve
//! push buttons into line-delimited JSON on a USB CDC-ACM serial port.
//!
//! Two execution contexts share one piece of state:
//!
//! ```text
//!   SWI_IRQ_1 (high priority)              thread mode (main loop, 1 ms)
//!  ┌───────────────────────────┐         ┌─────────────────────────────────┐
//!  │ decoder_task              │         │ Device::step                    │
//!  │   wait A/B edge           │         │   flash expiry, encoder drain,  │
//!  │   ENCODER.on_edge(a, b) ──┼──► ENCODER ◄── heartbeat, buttons,       │
//!  └───────────────────────────┘         │   commands                      │
//!                                        │ indicator.show / USB writes     │
//!                                        └─────────────────────────────────┘
//! ```
//!
//! `ENCODER` is a critical-section guarded value; everything else is owned
//! by the main loop. USB housekeeping runs in its own thread-mode task.

#![no_std]
#![no_main]

use core::convert::Infallible;

use defmt::*;
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_futures::select::{select, select3, Either};
use embassy_rp::bind_interrupts;
use embassy_rp::gpio::{AnyPin, Input, Level, Output, Pull};
use embassy_rp::interrupt;
use embassy_rp::interrupt::{InterruptExt, Priority};
use embassy_rp::peripherals::{PIO0, USB};
use embassy_rp::pio::{self, Pio};
use embassy_rp::pio_programs::ws2812::{Grb, PioWs2812, PioWs2812Program};
use embassy_rp::usb::{self, Driver};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use embassy_usb::class::cdc_acm::{CdcAcmClass, State};
use embassy_usb::{Builder, UsbDevice};
use heapless::Vec;
use smart_leds::RGB8;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use quadlink::{Board, Color, Device, DeviceConfig, DeviceIo, Polarity, SharedEncoder, MAX_BUTTONS};
use quadlink_indicator_rs::{Indicator, IndicatorError, PixelLed, PixelWrite, RgbLed, SingleLed};

// ---------------------------------------------------------------------------
// Build configuration
// ---------------------------------------------------------------------------

/// Board this image is built for.
const BOARD: Board = Board::Pico;

const USB_VID: u16 = 0xc0de;
const USB_PID: u16 = 0xcafe;
const MAX_PACKET: usize = 64;

/// Main loop cadence.
const LOOP_PERIOD: Duration = Duration::from_millis(1);
/// Longest the decoder goes without re-reading the encoder channels.
const RESYNC_PERIOD: Duration = Duration::from_millis(1);
/// Colour steps of the power-on blink.
const STARTUP_STEP: Duration = Duration::from_millis(200);
/// How long to wait for the host to open the port before carrying on.
const SERIAL_WAIT: Duration = Duration::from_secs(5);
const SERIAL_SETTLE: Duration = Duration::from_millis(500);
/// Give up on a USB packet the host is not reading.
const WRITE_TIMEOUT: Duration = Duration::from_millis(20);

/// Outbound bytes queued by one loop iteration.
const OUTBOX_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Interrupt binding and static storage
// ---------------------------------------------------------------------------

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => usb::InterruptHandler<USB>;
    PIO0_IRQ_0 => pio::InterruptHandler<PIO0>;
});

/// Decoder state, written from SWI_IRQ_1 and drained by the main loop.
static ENCODER: SharedEncoder = SharedEncoder::new(Polarity::Inverted);

static EXECUTOR_HIGH: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn SWI_IRQ_1() {
    EXECUTOR_HIGH.on_interrupt()
}

static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static CONTROL_BUF: StaticCell<[u8; 64]> = StaticCell::new();
static CDC_STATE: StaticCell<State> = StaticCell::new();

// ---------------------------------------------------------------------------
// Type aliases
// ---------------------------------------------------------------------------

type UsbDriver = Driver<'static, USB>;
type Serial = CdcAcmClass<'static, UsbDriver>;
type Ws2812 = PioWs2812<'static, PIO0, 0, 1, Grb>;

// ---------------------------------------------------------------------------
// Indicator selection
// ---------------------------------------------------------------------------

/// Adapts the PIO WS2812 driver to [`PixelWrite`].
struct Ws2812Bus(Ws2812);

impl PixelWrite for Ws2812Bus {
    type Error = Infallible;

    async fn write(&mut self, pixel: RGB8) -> Result<(), Infallible> {
        self.0.write(&[pixel]).await;
        Ok(())
    }
}

/// The indicator fitted to [`BOARD`].
enum BoardIndicator {
    Single(SingleLed<Output<'static>>),
    Rgb(RgbLed<Output<'static>>),
    Pixel(PixelLed<Ws2812Bus>),
}

impl Indicator for BoardIndicator {
    type Error = Infallible;

    async fn show(&mut self, color: Color) -> Result<(), IndicatorError<Infallible>> {
        match self {
            BoardIndicator::Single(led) => led.show(color).await,
            BoardIndicator::Rgb(led) => led.show(color).await,
            BoardIndicator::Pixel(led) => led.show(color).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Main-loop I/O
// ---------------------------------------------------------------------------

/// Hardware behind [`Device`]: button inputs, queued output and the
/// colour waiting to be shown.
struct BridgeIo {
    buttons: Vec<(u8, Input<'static>), MAX_BUTTONS>,
    outbox: Vec<u8, OUTBOX_CAPACITY>,
    color: Option<Color>,
}

impl BridgeIo {
    const fn new() -> Self {
        Self {
            buttons: Vec::new(),
            outbox: Vec::new(),
            color: None,
        }
    }
}

impl DeviceIo for BridgeIo {
    fn encoder_levels(&mut self) -> (bool, bool) {
        // Refreshed by decoder_task at least every RESYNC_PERIOD.
        let code = ENCODER.snapshot().last_code();
        (code & 0b10 != 0, code & 0b01 != 0)
    }

    fn button_pressed(&mut self, pin: u8) -> bool {
        // Buttons pull to ground.
        self.buttons
            .iter()
            .find(|(gpio, _)| *gpio == pin)
            .is_some_and(|(_, input)| input.is_low())
    }

    fn buttons_changed(&mut self, pins: &[u8]) {
        // Dropping an Input returns its pad to the disabled state.
        self.buttons.clear();
        for &pin in pins {
            // SAFETY: pins reach here only after the bank rejected the
            // encoder, indicator and board-internal GPIOs, which are the
            // only pins owned elsewhere, and the previous claims were
            // dropped above.
            let input = Input::new(unsafe { AnyPin::steal(pin) }, Pull::Up);
            if self.buttons.push((pin, input)).is_err() {
                warn!("no room for button on GP{}", pin);
            }
        }
        debug!("button inputs: {}", pins);
    }

    fn set_color(&mut self, color: Color) {
        self.color = Some(color);
    }

    fn send_line(&mut self, line: &str) {
        if self.outbox.len() + line.len() + 2 > OUTBOX_CAPACITY {
            warn!("outbox full, dropping {} byte line", line.len());
            return;
        }
        // Capacity checked above.
        let _ = self.outbox.extend_from_slice(line.as_bytes());
        let _ = self.outbox.extend_from_slice(b"\r\n");
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Quadrature decoding on the high-priority executor.
///
/// Wakes on any edge of either channel, and at least every
/// [`RESYNC_PERIOD`], and feeds both levels to the shared decoder. An edge
/// landing between the level read and re-arming the edge wait raises no
/// wakeup; the periodic read picks it up, and keeps the stored levels that
/// heartbeat and status report current while the encoder rests. A read
/// with unchanged levels counts nothing. Each wakeup is one short critical
/// section.
#[embassy_executor::task]
async fn decoder_task(mut a: Input<'static>, mut b: Input<'static>) {
    ENCODER.prime(a.is_high(), b.is_high());
    info!("decoder running");

    loop {
        select3(
            a.wait_for_any_edge(),
            b.wait_for_any_edge(),
            Timer::after(RESYNC_PERIOD),
        )
        .await;
        ENCODER.on_edge(a.is_high(), b.is_high());
    }
}

#[embassy_executor::task]
async fn usb_task(mut usb: UsbDevice<'static, UsbDriver>) -> ! {
    usb.run().await
}

// ---------------------------------------------------------------------------
// Serial helpers
// ---------------------------------------------------------------------------

/// Write everything queued in `outbox`, then empty it.
///
/// Nothing is written while the host has the port closed; queued lines are
/// dropped instead of piling up.
async fn flush(serial: &mut Serial, outbox: &mut Vec<u8, OUTBOX_CAPACITY>) {
    if outbox.is_empty() {
        return;
    }
    if serial.dtr() {
        for chunk in outbox.chunks(MAX_PACKET) {
            if !write_packet(serial, chunk).await {
                break;
            }
        }
        // A full final packet needs a zero-length packet to end the transfer.
        if outbox.len() % MAX_PACKET == 0 {
            write_packet(serial, &[]).await;
        }
    }
    outbox.clear();
}

async fn write_packet(serial: &mut Serial, data: &[u8]) -> bool {
    match with_timeout(WRITE_TIMEOUT, serial.write_packet(data)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("usb write failed: {}", e);
            false
        }
        Err(_) => {
            debug!("usb write timed out");
            false
        }
    }
}

async fn show(indicator: &mut BoardIndicator, color: Color) {
    if indicator.show(color).await.is_err() {
        warn!("indicator update failed");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    info!("quadlink-hw-interface starting on {}", BOARD);

    // —— Pin assignments ————————————————————————————————————————————————————
    // ENC_A   → GP0   pull-up
    // ENC_B   → GP1   pull-up
    // LED     → GP25 (Pico), GP16 WS2812 (RP2040-Zero), GP18/19/20 (Tiny 2040)
    // Buttons → claimed on demand, pull-up, active-low
    // ———————————————————————————————————————————————————————————————————————

    let mut indicator = match BOARD {
        Board::Pico => BoardIndicator::Single(SingleLed::new(Output::new(p.PIN_25, Level::Low))),
        Board::Tiny2040 => BoardIndicator::Rgb(RgbLed::new(
            Output::new(p.PIN_18, Level::High),
            Output::new(p.PIN_19, Level::High),
            Output::new(p.PIN_20, Level::High),
        )),
        Board::Rp2040Zero => {
            let Pio { mut common, sm0, .. } = Pio::new(p.PIO0, Irqs);
            let program = PioWs2812Program::new(&mut common);
            let ws2812 = PioWs2812::new(&mut common, sm0, p.DMA_CH0, p.PIN_16, &program);
            BoardIndicator::Pixel(PixelLed::new(Ws2812Bus(ws2812)))
        }
    };

    // —— Decoder on the high-priority executor ——————————————————————————————
    let enc_a = Input::new(p.PIN_0, Pull::Up);
    let enc_b = Input::new(p.PIN_1, Pull::Up);

    interrupt::SWI_IRQ_1.set_priority(Priority::P2);
    let high = EXECUTOR_HIGH.start(interrupt::SWI_IRQ_1);
    high.spawn(unwrap!(decoder_task(enc_a, enc_b)));

    // —— USB CDC-ACM ————————————————————————————————————————————————————————
    let driver = Driver::new(p.USB, Irqs);

    let mut usb_config = embassy_usb::Config::new(USB_VID, USB_PID);
    usb_config.manufacturer = Some("quadlink");
    usb_config.product = Some("quadlink encoder bridge");
    usb_config.serial_number = Some("00000001");
    usb_config.max_power = 100;
    usb_config.max_packet_size_0 = MAX_PACKET as u8;

    let mut builder = Builder::new(
        driver,
        usb_config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [],
        CONTROL_BUF.init([0; 64]),
    );
    let mut serial = CdcAcmClass::new(&mut builder, CDC_STATE.init(State::new()), MAX_PACKET as u16);
    let usb = builder.build();
    spawner.spawn(unwrap!(usb_task(usb)));

    // —— Startup ————————————————————————————————————————————————————————————
    for color in [Color::RED, Color::GREEN, Color::BLUE, Color::OFF] {
        show(&mut indicator, color).await;
        Timer::after(STARTUP_STEP).await;
    }

    let waiting_since = Instant::now();
    while !serial.dtr() && waiting_since.elapsed() < SERIAL_WAIT {
        Timer::after_millis(10).await;
    }
    if !serial.dtr() {
        info!("no host after {} ms, continuing", SERIAL_WAIT.as_millis());
    }
    Timer::after(SERIAL_SETTLE).await;

    let mut io = BridgeIo::new();
    let mut device = Device::new(DeviceConfig::for_board(BOARD), &ENCODER, Instant::now());
    device.announce(&mut io);
    flush(&mut serial, &mut io.outbox).await;
    info!("ready");

    // —— Main loop ——————————————————————————————————————————————————————————
    let mut packet = [0u8; MAX_PACKET];
    let mut host_open = serial.dtr();
    loop {
        if serial.dtr() != host_open {
            host_open = !host_open;
            info!("host {}", if host_open { "connected" } else { "disconnected" });
        }

        let received = match select(serial.read_packet(&mut packet), Timer::after(LOOP_PERIOD)).await {
            Either::First(Ok(n)) => n,
            Either::First(Err(_)) => {
                // Port disabled; keep the cadence instead of spinning.
                Timer::after(LOOP_PERIOD).await;
                0
            }
            Either::Second(()) => 0,
        };

        device.step(Instant::now(), &packet[..received], &mut io);

        if let Some(color) = io.color.take() {
            show(&mut indicator, color).await;
        }
        flush(&mut serial, &mut io.outbox).await;
    }
}
