use std::fmt;

use serde::{Deserialize, Serialize};
use smart_leds::RGB8;

/// 舵机脉宽范围（微秒）。
pub const PULSE_MIN_US: u16 = 1000;
pub const PULSE_NEUTRAL_US: u16 = 1500;
pub const PULSE_MAX_US: u16 = 2000;

/// 钳位到 [-1, 1]，NaN 视为 0。
pub fn clamp_normalized(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(-1.0, 1.0)
}

/// 归一化值 → 舵机脉宽。
pub fn normalized_to_pulse_us(value: f32) -> u16 {
    let value = clamp_normalized(value);
    let half_span = (PULSE_MAX_US - PULSE_NEUTRAL_US) as f32;
    (PULSE_NEUTRAL_US as f32 + value * half_span).round() as u16
}

/// 舵机脉宽 → 归一化值（超出范围的脉宽被钳位）。
pub fn pulse_us_to_normalized(pulse_us: u16) -> f32 {
    let half_span = (PULSE_MAX_US - PULSE_NEUTRAL_US) as f32;
    clamp_normalized((pulse_us as f32 - PULSE_NEUTRAL_US as f32) / half_span)
}

/// 限制输出变化率：每秒最多变化 `max_per_sec`。
pub fn apply_slew_rate(target: f32, current: f32, max_per_sec: f32, dt_ms: u32) -> f32 {
    let max_change = max_per_sec * dt_ms as f32 / 1000.0;
    let diff = target - current;
    if diff > max_change {
        current + max_change
    } else if diff < -max_change {
        current - max_change
    } else {
        target
    }
}

/// 油门/转向指令，构造与修改时始终钳位到 [-1, 1]。
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RcCommand {
    throttle: f32,
    steering: f32,
}

impl RcCommand {
    pub fn new(throttle: f32, steering: f32) -> Self {
        Self {
            throttle: clamp_normalized(throttle),
            steering: clamp_normalized(steering),
        }
    }

    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn throttle(&self) -> f32 {
        self.throttle
    }

    pub fn steering(&self) -> f32 {
        self.steering
    }

    pub fn set_throttle(&mut self, value: f32) {
        self.throttle = clamp_normalized(value);
    }

    pub fn set_steering(&mut self, value: f32) {
        self.steering = clamp_normalized(value);
    }

    /// 两个通道都在死区内。
    pub fn is_neutral(&self, eps: f32) -> bool {
        self.throttle.abs() <= eps && self.steering.abs() <= eps
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(self.throttle * factor, self.steering * factor)
    }

    pub fn inverted_throttle(&self) -> Self {
        Self::new(-self.throttle, self.steering)
    }

    pub fn inverted_steering(&self) -> Self {
        Self::new(self.throttle, -self.steering)
    }

    pub fn max_abs(&self) -> f32 {
        self.throttle.abs().max(self.steering.abs())
    }
}

impl fmt::Display for RcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thr={:.3} steer={:.3}", self.throttle, self.steering)
    }
}

/// IMU 原始数据：加速度（g），角速度（deg/s）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ImuData {
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
}

impl ImuData {
    pub fn accel(&self) -> [f32; 3] {
        [self.ax, self.ay, self.az]
    }

    pub fn gyro(&self) -> [f32; 3] {
        [self.gx, self.gy, self.gz]
    }
}

/// 整车状态（用于状态灯与诊断日志）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VehicleStatus {
    Idle,
    Driving,
    Calibrating,
    Failsafe,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Idle => "idle",
            VehicleStatus::Driving => "driving",
            VehicleStatus::Calibrating => "calibrating",
            VehicleStatus::Failsafe => "failsafe",
        }
    }

    /// 状态灯颜色。
    pub fn color(&self) -> RGB8 {
        match self {
            VehicleStatus::Idle => RGB8 { r: 40, g: 40, b: 40 },
            VehicleStatus::Driving => RGB8 { r: 0, g: 255, b: 0 },
            VehicleStatus::Calibrating => RGB8 { r: 0, g: 0, b: 255 },
            VehicleStatus::Failsafe => RGB8 { r: 255, g: 0, b: 0 },
        }
    }
}

/// 控制环运行参数（周期、子速率、超时、限速）。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub control_period_ms: u32,
    pub rc_poll_interval_ms: u32,
    pub imu_read_interval_ms: u32,
    pub telem_interval_ms: u32,
    pub pwm_update_interval_ms: u32,
    pub failsafe_timeout_ms: u32,
    pub wifi_cmd_timeout_ms: u32,
    pub slew_throttle_per_sec: f32,
    pub slew_steering_per_sec: f32,
    pub diag_interval_ms: u32,
    pub boot_calib_samples: u32,
    pub gyro_calib_samples: u32,
    pub full_calib_samples: u32,
    pub forward_calib_samples: u32,
}

impl ControlSettings {
    /// 以指定控制周期构建默认参数。
    pub fn with_control_period(period_ms: u32) -> Self {
        Self {
            control_period_ms: period_ms.max(1),
            rc_poll_interval_ms: 20,
            imu_read_interval_ms: 2,
            telem_interval_ms: 50,
            pwm_update_interval_ms: 20,
            failsafe_timeout_ms: 250,
            wifi_cmd_timeout_ms: 500,
            slew_throttle_per_sec: 0.5,
            slew_steering_per_sec: 1.0,
            diag_interval_ms: 5000,
            boot_calib_samples: 1000,
            gyro_calib_samples: 1000,
            full_calib_samples: 2000,
            forward_calib_samples: 2000,
        }
    }

    /// 控制环频率（Hz）。
    pub fn loop_hz(&self) -> u32 {
        1000 / self.control_period_ms.max(1)
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::with_control_period(2)
    }
}
