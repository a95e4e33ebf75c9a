use std::fmt;

use crate::imu_calibration::ImuCalibData;
use crate::model::{ImuData, RcCommand};
use crate::serial::TelemetryData;
use crate::stabilization::StabilizationConfig;

/// 平台层错误。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformError {
    PwmInit(String),
    RcInit(String),
    ImuInit(String),
    FailsafeInit(String),
    Storage(String),
    Task(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::PwmInit(msg) => write!(f, "PWM init failed: {}", msg),
            PlatformError::RcInit(msg) => write!(f, "RC input init failed: {}", msg),
            PlatformError::ImuInit(msg) => write!(f, "IMU init failed: {}", msg),
            PlatformError::FailsafeInit(msg) => write!(f, "failsafe init failed: {}", msg),
            PlatformError::Storage(msg) => write!(f, "storage error: {}", msg),
            PlatformError::Task(msg) => write!(f, "task error: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}

/// 硬件抽象层：每个目标平台一个实现，由控制环独占持有。
///
/// 除 `wait_next_tick` 外所有方法都必须立即返回（读不到数据返回 `None`）。
pub trait VehiclePlatform {
    fn init_pwm(&mut self) -> Result<(), PlatformError>;
    fn init_rc(&mut self) -> Result<(), PlatformError>;
    fn init_imu(&mut self) -> Result<(), PlatformError>;
    fn init_failsafe(&mut self) -> Result<(), PlatformError>;

    /// 单调时钟（毫秒，允许回绕）。
    fn now_ms(&self) -> u32;
    fn now_us(&self) -> u64;

    fn read_imu(&mut self) -> Option<ImuData>;
    /// 最近一次读取到的 WHO_AM_I（诊断用）。
    fn imu_who_am_i(&self) -> Option<u8> {
        None
    }

    fn load_calib(&mut self) -> Option<ImuCalibData>;
    fn save_calib(&mut self, data: &ImuCalibData) -> Result<(), PlatformError>;
    fn load_stab_config(&mut self) -> Option<StabilizationConfig>;
    fn save_stab_config(&mut self, config: &StabilizationConfig) -> Result<(), PlatformError>;

    fn read_rc(&mut self) -> Option<RcCommand>;
    fn set_pwm(&mut self, throttle: f32, steering: f32);
    fn set_pwm_neutral(&mut self);

    /// 失控保护状态变化通知（指示灯、硬件看门狗等）。
    fn on_failsafe_changed(&mut self, _active: bool) {}

    /// 已连接的遥测客户端数量。
    fn client_count(&self) -> usize;
    fn send_telem(&mut self, json: &str);
    /// 向伴随处理器发送二进制遥测帧（无串口链路时忽略）。
    fn send_link_telem(&mut self, _data: &TelemetryData) {}

    /// 非阻塞读取无线指令。
    fn try_receive_wifi_command(&mut self) -> Option<RcCommand>;

    /// 等待到下一个控制周期（按绝对节拍对齐，不累积漂移）。
    fn wait_next_tick(&mut self, period_ms: u32);
}
