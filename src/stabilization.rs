use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pid::PidGains;

/// 配置有效性标记（"STAB"）。
pub const STAB_CONFIG_MAGIC: u32 = 0x5354_4142;

/// 驾驶模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveMode {
    Normal,
    Sport,
    Drift,
}

impl DriveMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DriveMode::Normal),
            1 => Some(DriveMode::Sport),
            2 => Some(DriveMode::Drift),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            DriveMode::Normal => 0,
            DriveMode::Sport => 1,
            DriveMode::Drift => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DriveMode::Normal => "normal",
            DriveMode::Sport => "sport",
            DriveMode::Drift => "drift",
        }
    }
}

/// 配置校验/保存错误。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid,
    Persist(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid => f.write_str("invalid stabilization config"),
            ConfigError::Persist(msg) => write!(f, "persist failed: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// 稳定系统配置（Madgwick、LPF、偏航 PID、俯仰补偿）。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub enabled: bool,
    pub madgwick_beta: f32,
    pub lpf_cutoff_hz: f32,
    pub imu_sample_rate_hz: f32,
    pub mode: u8,
    pub pid_kp: f32,
    pub pid_ki: f32,
    pub pid_kd: f32,
    pub pid_max_integral: f32,
    pub pid_max_correction: f32,
    pub steer_to_yaw_rate_dps: f32,
    pub fade_ms: u32,
    pub pitch_comp_enabled: bool,
    pub pitch_comp_gain: f32,
    pub pitch_comp_max_correction: f32,
    #[serde(skip)]
    pub magic: u32,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            madgwick_beta: 0.1,
            lpf_cutoff_hz: 30.0,
            imu_sample_rate_hz: 500.0,
            mode: DriveMode::Normal.as_u8(),
            pid_kp: 0.1,
            pid_ki: 0.0,
            pid_kd: 0.005,
            pid_max_integral: 0.5,
            pid_max_correction: 0.3,
            steer_to_yaw_rate_dps: 90.0,
            fade_ms: 500,
            pitch_comp_enabled: false,
            pitch_comp_gain: 0.01,
            pitch_comp_max_correction: 0.25,
            magic: STAB_CONFIG_MAGIC,
        }
    }
}

impl StabilizationConfig {
    /// 校验字段范围（不修改）。
    pub fn is_valid(&self) -> bool {
        self.magic == STAB_CONFIG_MAGIC
            && self.madgwick_beta > 0.0
            && self.madgwick_beta <= 1.0
            && self.lpf_cutoff_hz >= 5.0
            && self.lpf_cutoff_hz <= 100.0
            && self.imu_sample_rate_hz > 0.0
            && self.pid_kp >= 0.0
            && self.pid_ki >= 0.0
            && self.pid_kd >= 0.0
            && self.pid_max_correction > 0.0
            && self.steer_to_yaw_rate_dps > 0.0
    }

    /// 钳位到允许范围（幂等）。NaN 回落到默认值。
    pub fn clamp(&mut self) {
        let d = Self::default();
        self.madgwick_beta = clamp_or(self.madgwick_beta, 0.01, 1.0, d.madgwick_beta);
        self.lpf_cutoff_hz = clamp_or(self.lpf_cutoff_hz, 5.0, 100.0, d.lpf_cutoff_hz);
        self.imu_sample_rate_hz = clamp_or(self.imu_sample_rate_hz, 100.0, f32::MAX, d.imu_sample_rate_hz);
        if DriveMode::from_u8(self.mode).is_none() {
            self.mode = DriveMode::Normal.as_u8();
        }
        self.pid_kp = clamp_or(self.pid_kp, 0.0, f32::MAX, d.pid_kp);
        self.pid_ki = clamp_or(self.pid_ki, 0.0, f32::MAX, d.pid_ki);
        self.pid_kd = clamp_or(self.pid_kd, 0.0, f32::MAX, d.pid_kd);
        self.pid_max_integral = clamp_or(self.pid_max_integral, 0.0, 1.0, d.pid_max_integral);
        self.pid_max_correction = clamp_or(self.pid_max_correction, 0.0, 1.0, d.pid_max_correction);
        self.steer_to_yaw_rate_dps = clamp_or(self.steer_to_yaw_rate_dps, 10.0, 360.0, d.steer_to_yaw_rate_dps);
        self.fade_ms = self.fade_ms.min(5000);
        self.pitch_comp_gain = clamp_or(self.pitch_comp_gain, 0.0, 0.05, d.pitch_comp_gain);
        self.pitch_comp_max_correction = clamp_or(self.pitch_comp_max_correction, 0.0, 0.5, d.pitch_comp_max_correction);
    }

    /// 恢复默认值。
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn drive_mode(&self) -> DriveMode {
        DriveMode::from_u8(self.mode).unwrap_or(DriveMode::Normal)
    }

    /// 按模式写入 PID、转向比例与俯仰补偿预设，其余字段保持不变。
    pub fn apply_mode_defaults(&mut self, mode: u8) {
        let mode = DriveMode::from_u8(mode).unwrap_or(DriveMode::Normal);
        self.mode = mode.as_u8();
        let (kp, ki, kd, max_corr, steer, pitch_gain, pitch_max) = match mode {
            DriveMode::Normal => (0.10, 0.0, 0.005, 0.30, 90.0, 0.01, 0.25),
            DriveMode::Sport => (0.20, 0.01, 0.010, 0.40, 120.0, 0.02, 0.30),
            DriveMode::Drift => (0.05, 0.0, 0.002, 0.20, 60.0, 0.005, 0.15),
        };
        self.pid_kp = kp;
        self.pid_ki = ki;
        self.pid_kd = kd;
        self.pid_max_correction = max_corr;
        self.steer_to_yaw_rate_dps = steer;
        self.pitch_comp_gain = pitch_gain;
        self.pitch_comp_max_correction = pitch_max;
    }

    /// 偏航 PID 参数（输出上限即最大转向修正量）。
    pub fn pid_gains(&self) -> PidGains {
        PidGains {
            kp: self.pid_kp,
            ki: self.pid_ki,
            kd: self.pid_kd,
            max_integral: self.pid_max_integral,
            max_output: self.pid_max_correction,
        }
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        return fallback;
    }
    value.clamp(min, max)
}
