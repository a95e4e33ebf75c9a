use std::thread;
use std::time::Duration;

use esp_idf_hal::gpio::OutputPin;
use esp_idf_hal::rmt::{config::TransmitConfig, FixedLengthSignal, PinState, Pulse, TxRmtDriver};
use esp_idf_hal::sys::EspError;
use esp_idf_hal::{peripheral::Peripheral, rmt::RmtChannel};
use smart_leds::{SmartLedsWrite, RGB8};

use rc_vehicle::model::VehicleStatus;
use rc_vehicle::pipeline::ControlHandle;

// 亮度缩放（约 30%）。
const BRIGHTNESS_SCALE: u8 = 77;
const POLL_INTERVAL: Duration = Duration::from_millis(125);
const STATUS_TIMEOUT: Duration = Duration::from_millis(100);

/// WS2812 单颗状态灯（RMT 发送，GRB 顺序）。
pub struct StatusLed<'d> {
    tx: TxRmtDriver<'d>,
    bit0: (Pulse, Pulse),
    bit1: (Pulse, Pulse),
}

impl<'d> StatusLed<'d> {
    pub fn new<C, P, Ch, Pin>(channel: C, pin: P) -> Result<Self, EspError>
    where
        C: Peripheral<P = Ch> + 'd,
        P: Peripheral<P = Pin> + 'd,
        Ch: RmtChannel,
        Pin: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx = TxRmtDriver::new(channel, pin, &config)?;
        let ticks_hz = tx.counter_clock()?;
        let pulse = |state, ns| Pulse::new_with_duration(ticks_hz, state, &Duration::from_nanos(ns));
        let bit0 = (pulse(PinState::High, 350)?, pulse(PinState::Low, 800)?);
        let bit1 = (pulse(PinState::High, 700)?, pulse(PinState::Low, 600)?);
        Ok(Self { tx, bit0, bit1 })
    }

    pub fn show(&mut self, color: RGB8) -> Result<(), EspError> {
        self.write([color].into_iter())
    }

    fn scale(color: RGB8) -> RGB8 {
        let apply = |v: u8| ((v as u16 * BRIGHTNESS_SCALE as u16) / 255) as u8;
        RGB8 {
            r: apply(color.r),
            g: apply(color.g),
            b: apply(color.b),
        }
    }
}

impl SmartLedsWrite for StatusLed<'_> {
    type Color = RGB8;
    type Error = EspError;

    fn write<T, I>(&mut self, iterator: T) -> Result<(), Self::Error>
    where
        T: IntoIterator<Item = I>,
        I: Into<Self::Color>,
    {
        let color = iterator
            .into_iter()
            .next()
            .map(Into::into)
            .map(Self::scale)
            .unwrap_or_default();
        let grb = [color.g, color.r, color.b];
        let mut signal = FixedLengthSignal::<24>::new();
        for (index, bit) in grb
            .iter()
            .flat_map(|byte| (0..8).rev().map(move |i| byte & (1 << i) != 0))
            .enumerate()
        {
            let pulses = if bit { &self.bit1 } else { &self.bit0 };
            signal.set(index, pulses)?;
        }
        self.tx.start_blocking(&signal)?;
        Ok(())
    }
}

/// 需要闪烁提示的状态。
fn blinks(status: VehicleStatus) -> bool {
    matches!(status, VehicleStatus::Failsafe | VehicleStatus::Calibrating)
}

/// 状态灯任务：轮询控制环状态并显示对应颜色。
pub fn spawn_led_task<C, P, Ch, Pin>(channel: C, pin: P, handle: ControlHandle)
where
    C: Peripheral<P = Ch> + Send + 'static,
    P: Peripheral<P = Pin> + Send + 'static,
    Ch: RmtChannel + Send + 'static,
    Pin: OutputPin + Send + 'static,
{
    thread::spawn(move || {
        let mut led = match StatusLed::new(channel, pin) {
            Ok(led) => led,
            Err(err) => {
                log::warn!("Status LED init failed: {:?}", err);
                return;
            }
        };
        let _ = led.show(RGB8::default());
        let mut last_status: Option<VehicleStatus> = None;
        let mut phase_on = true;
        loop {
            let status = handle
                .query_status()
                .ok()
                .and_then(|rx| rx.recv_timeout(STATUS_TIMEOUT).ok())
                .map(|status| status.vehicle_status());
            if let Some(status) = status {
                let changed = last_status != Some(status);
                if changed || blinks(status) {
                    phase_on = changed || !phase_on;
                    let color = if phase_on { status.color() } else { RGB8::default() };
                    if let Err(err) = led.show(color) {
                        log::warn!("Status LED update failed: {:?}", err);
                    }
                }
                last_status = Some(status);
            }
            thread::sleep(POLL_INTERVAL);
        }
    });
}
