use std::sync::atomic::{AtomicU32, Ordering};

/// 超过该时间未收到有效脉冲视为信号丢失。
pub const RC_TIMEOUT_MS: u32 = 250;
pub const RC_PULSE_MIN_US: u32 = 800;
pub const RC_PULSE_MAX_US: u32 = 2200;

/// 单路接收机脉宽测量，由双边沿中断驱动。
///
/// 只用原子量，可在中断上下文中更新、在控制环中读取。时间戳取自
/// 64 位微秒计时器：脉宽用 32 位回绕差值，最后有效时间按毫秒换算后再截断，
/// 与 `VehiclePlatform::now_ms` 保持同一时基。
pub struct PulseChannel {
    gpio: AtomicU32,
    rise_us: AtomicU32,
    width_us: AtomicU32,
    last_ms: AtomicU32,
}

impl PulseChannel {
    pub const fn new() -> Self {
        Self {
            gpio: AtomicU32::new(0),
            rise_us: AtomicU32::new(0),
            width_us: AtomicU32::new(0),
            last_ms: AtomicU32::new(0),
        }
    }

    pub fn set_gpio(&self, gpio: u32) {
        self.gpio.store(gpio, Ordering::Relaxed);
    }

    pub fn gpio(&self) -> u32 {
        self.gpio.load(Ordering::Relaxed)
    }

    /// 记录一次边沿。`timer_us` 为开机以来的微秒数。
    pub fn on_edge(&self, level_high: bool, timer_us: u64) {
        let now_us = timer_us as u32;
        if level_high {
            self.rise_us.store(now_us, Ordering::Relaxed);
            return;
        }
        let width = now_us.wrapping_sub(self.rise_us.load(Ordering::Relaxed));
        if (RC_PULSE_MIN_US..=RC_PULSE_MAX_US).contains(&width) {
            self.width_us.store(width, Ordering::Release);
            self.last_ms.store((timer_us / 1000) as u32, Ordering::Release);
        }
    }

    /// 最近一次有效脉宽（µs）；超时或从未收到返回 `None`。
    pub fn pulse_at(&self, now_ms: u32) -> Option<u16> {
        let last = self.last_ms.load(Ordering::Acquire);
        let width = self.width_us.load(Ordering::Acquire);
        if width == 0 || now_ms.wrapping_sub(last) > RC_TIMEOUT_MS {
            return None;
        }
        Some(width as u16)
    }
}

impl Default for PulseChannel {
    fn default() -> Self {
        Self::new()
    }
}
