use std::fmt;

use serde::Serialize;

use crate::model::ImuData;

/// 静止判定阈值：陀螺方差（dps²）与加速度方差（g²）。
pub const GYRO_VARIANCE_THRESHOLD: f64 = 0.5;
pub const ACCEL_VARIANCE_THRESHOLD: f64 = 0.01;
/// 加载数据时的偏置上限。
pub const MAX_GYRO_BIAS_DPS: f32 = 20.0;
pub const MAX_ACCEL_BIAS_G: f32 = 0.5;
/// 前向标定时线加速度的最小幅值（g），低于此值视为静止样本。
pub const LINEAR_ACCEL_THRESHOLD_G: f32 = 0.05;

pub const DEFAULT_STAGE1_SAMPLES: u32 = 1000;
pub const DEFAULT_FORWARD_SAMPLES: u32 = 2000;

const MIN_VECTOR_NORM2: f64 = 1e-6;
const MIN_FORWARD_SUM_NORM2: f64 = 1e-8;

/// 标定进度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibStatus {
    Idle,
    Collecting,
    Done,
    Failed,
}

impl CalibStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibStatus::Idle => "idle",
            CalibStatus::Collecting => "collecting",
            CalibStatus::Done => "done",
            CalibStatus::Failed => "failed",
        }
    }
}

/// 标定模式：阶段 1（GyroOnly / Full），阶段 2（Forward）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibMode {
    GyroOnly,
    Full,
    Forward,
}

impl CalibMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibMode::GyroOnly => "gyro",
            CalibMode::Full => "full",
            CalibMode::Forward => "forward",
        }
    }
}

/// 标定加载失败原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibError {
    BiasOutOfRange,
    NotFinite,
    NoGravity,
    Busy,
}

impl fmt::Display for CalibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CalibError::BiasOutOfRange => "bias out of range",
            CalibError::NotFinite => "non-finite value",
            CalibError::NoGravity => "no valid gravity vector",
            CalibError::Busy => "calibration in progress",
        };
        f.write_str(text)
    }
}

impl std::error::Error for CalibError {}

/// 标定结果（传感器坐标系）。
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ImuCalibData {
    pub gyro_bias: [f32; 3],
    pub accel_bias: [f32; 3],
    pub gravity_vec: [f32; 3],
    pub forward_vec: [f32; 3],
    pub valid: bool,
}

impl Default for ImuCalibData {
    fn default() -> Self {
        Self {
            gyro_bias: [0.0; 3],
            accel_bias: [0.0; 3],
            gravity_vec: [0.0, 0.0, 1.0],
            forward_vec: [1.0, 0.0, 0.0],
            valid: false,
        }
    }
}

/// Welford 在线均值/方差。
#[derive(Clone, Copy, Debug, Default)]
struct RunningStats {
    count: u32,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// 总体方差。
    fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }
}

/// IMU 标定状态机：Idle → Collecting → Done | Failed。
#[derive(Clone, Debug)]
pub struct ImuCalibration {
    data: ImuCalibData,
    status: CalibStatus,
    mode: CalibMode,
    target_samples: u32,
    collected: u32,
    // gx gy gz ax ay az
    stats: [RunningStats; 6],
    linear_sum: [f64; 3],
    first_linear: Option<[f32; 3]>,
}

impl ImuCalibration {
    pub fn new() -> Self {
        Self {
            data: ImuCalibData::default(),
            status: CalibStatus::Idle,
            mode: CalibMode::GyroOnly,
            target_samples: DEFAULT_STAGE1_SAMPLES,
            collected: 0,
            stats: [RunningStats::default(); 6],
            linear_sum: [0.0; 3],
            first_linear: None,
        }
    }

    /// 启动阶段 1；`samples == 0` 时使用默认数量。传入 Forward 等同于启动阶段 2。
    pub fn start_calibration(&mut self, mode: CalibMode, samples: u32) -> Result<(), CalibError> {
        if mode == CalibMode::Forward {
            return self.start_forward_calibration(samples);
        }
        self.mode = mode;
        self.target_samples = if samples > 0 { samples } else { DEFAULT_STAGE1_SAMPLES };
        self.status = CalibStatus::Collecting;
        self.collected = 0;
        self.stats = [RunningStats::default(); 6];
        Ok(())
    }

    /// 启动阶段 2，需要阶段 1 已给出有效重力方向。
    pub fn start_forward_calibration(&mut self, samples: u32) -> Result<(), CalibError> {
        if !self.data.valid || norm2(self.data.gravity_vec) < MIN_VECTOR_NORM2 {
            return Err(CalibError::NoGravity);
        }
        self.mode = CalibMode::Forward;
        self.target_samples = if samples > 0 { samples } else { DEFAULT_FORWARD_SAMPLES };
        self.status = CalibStatus::Collecting;
        self.collected = 0;
        self.linear_sum = [0.0; 3];
        self.first_linear = None;
        Ok(())
    }

    /// 每次读取 IMU 时调用（仅 Collecting 时生效）。
    pub fn feed_sample(&mut self, raw: &ImuData) {
        if self.status != CalibStatus::Collecting {
            return;
        }
        if self.mode == CalibMode::Forward {
            self.feed_forward(raw);
        } else {
            self.feed_stationary(raw);
        }
    }

    fn feed_stationary(&mut self, raw: &ImuData) {
        let values = [raw.gx, raw.gy, raw.gz, raw.ax, raw.ay, raw.az];
        let axes = if self.mode == CalibMode::Full { 6 } else { 3 };
        for (stats, value) in self.stats.iter_mut().zip(values.iter()).take(axes) {
            stats.push(*value as f64);
        }
        self.collected += 1;
        if self.collected >= self.target_samples {
            self.status = if self.finalize_stationary() {
                CalibStatus::Done
            } else {
                CalibStatus::Failed
            };
        }
    }

    fn feed_forward(&mut self, raw: &ImuData) {
        let g = self.data.gravity_vec;
        let b = self.data.accel_bias;
        let linear = [
            raw.ax - b[0] - g[0],
            raw.ay - b[1] - g[1],
            raw.az - b[2] - g[2],
        ];
        if norm2(linear) >= (LINEAR_ACCEL_THRESHOLD_G * LINEAR_ACCEL_THRESHOLD_G) as f64 {
            if self.first_linear.is_none() {
                self.first_linear = Some(linear);
            }
            for (sum, value) in self.linear_sum.iter_mut().zip(linear.iter()) {
                *sum += *value as f64;
            }
        }
        self.collected += 1;
        if self.collected >= self.target_samples {
            self.status = if self.finalize_forward() {
                CalibStatus::Done
            } else {
                CalibStatus::Failed
            };
        }
    }

    fn finalize_stationary(&mut self) -> bool {
        if self.collected == 0 {
            return false;
        }
        // 设备在采集期间移动过
        if self.stats[..3]
            .iter()
            .any(|s| s.variance() > GYRO_VARIANCE_THRESHOLD)
        {
            return false;
        }
        let full = self.mode == CalibMode::Full;
        if full
            && self.stats[3..]
                .iter()
                .any(|s| s.variance() > ACCEL_VARIANCE_THRESHOLD)
        {
            return false;
        }

        for axis in 0..3 {
            self.data.gyro_bias[axis] = self.stats[axis].mean as f32;
        }
        if full {
            let mean = [self.stats[3].mean, self.stats[4].mean, self.stats[5].mean];
            // 假定 Z 轴近似竖直，按均值符号取 ±1 g
            let expected_z = if mean[2] >= 0.0 { 1.0 } else { -1.0 };
            self.data.accel_bias = [mean[0] as f32, mean[1] as f32, (mean[2] - expected_z) as f32];
            let g2 = mean.iter().map(|v| v * v).sum::<f64>();
            if g2 >= MIN_VECTOR_NORM2 {
                let g = g2.sqrt();
                self.data.gravity_vec = [(mean[0] / g) as f32, (mean[1] / g) as f32, (mean[2] / g) as f32];
            }
        }
        self.data.valid = true;
        true
    }

    fn finalize_forward(&mut self) -> bool {
        let n2 = self.linear_sum.iter().map(|v| v * v).sum::<f64>();
        if n2 < MIN_FORWARD_SUM_NORM2 {
            return false;
        }
        let n = n2.sqrt();
        let mut forward = [
            (self.linear_sum[0] / n) as f32,
            (self.linear_sum[1] / n) as f32,
            (self.linear_sum[2] / n) as f32,
        ];
        // 以第一次显著加速度为“前进”方向
        if let Some(first) = self.first_linear {
            if dot(forward, first) < 0.0 {
                forward = forward.map(|v| -v);
            }
        }
        self.data.forward_vec = forward;
        true
    }

    /// 从原始数据中扣除偏置；未标定时不做处理。
    pub fn apply(&self, data: &mut ImuData) {
        if !self.data.valid {
            return;
        }
        data.gx -= self.data.gyro_bias[0];
        data.gy -= self.data.gyro_bias[1];
        data.gz -= self.data.gyro_bias[2];
        data.ax -= self.data.accel_bias[0];
        data.ay -= self.data.accel_bias[1];
        data.az -= self.data.accel_bias[2];
    }

    pub fn status(&self) -> CalibStatus {
        self.status
    }

    pub fn mode(&self) -> CalibMode {
        self.mode
    }

    /// 0 = 未采集，1 = 阶段 1，2 = 前向标定。
    pub fn stage(&self) -> u8 {
        match (self.status, self.mode) {
            (CalibStatus::Collecting, CalibMode::Forward) => 2,
            (CalibStatus::Collecting, _) => 1,
            _ => 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.valid
    }

    pub fn data(&self) -> &ImuCalibData {
        &self.data
    }

    /// 采集进度（已采 / 目标）。
    pub fn progress(&self) -> (u32, u32) {
        (self.collected, self.target_samples)
    }

    /// 加载外部（持久化）数据：偏置越界或非有限值时标记无效，向量重新归一化。
    pub fn set_data(&mut self, data: &ImuCalibData) -> Result<(), CalibError> {
        let mut all = data
            .gyro_bias
            .iter()
            .chain(data.accel_bias.iter())
            .chain(data.gravity_vec.iter())
            .chain(data.forward_vec.iter());
        if all.any(|v| !v.is_finite()) {
            self.data.valid = false;
            return Err(CalibError::NotFinite);
        }
        let gyro_ok = data.gyro_bias.iter().all(|v| v.abs() <= MAX_GYRO_BIAS_DPS);
        let accel_ok = data.accel_bias.iter().all(|v| v.abs() <= MAX_ACCEL_BIAS_G);
        if !gyro_ok || !accel_ok {
            self.data.valid = false;
            return Err(CalibError::BiasOutOfRange);
        }
        self.data = *data;
        self.data.forward_vec = normalize_or(data.forward_vec, [1.0, 0.0, 0.0]);
        self.data.gravity_vec = normalize_or(data.gravity_vec, [0.0, 0.0, 1.0]);
        Ok(())
    }

    /// 手动设置前进方向；退化向量回落到 +X。
    pub fn set_forward_direction(&mut self, forward: [f32; 3]) {
        let forward = if forward.iter().all(|v| v.is_finite()) {
            forward
        } else {
            [1.0, 0.0, 0.0]
        };
        self.data.forward_vec = normalize_or(forward, [1.0, 0.0, 0.0]);
    }

    /// 沿车辆前进方向的加速度分量（g）。
    pub fn forward_accel(&self, data: &ImuData) -> f32 {
        dot(data.accel(), self.data.forward_vec)
    }
}

impl Default for ImuCalibration {
    fn default() -> Self {
        Self::new()
    }
}

fn norm2(v: [f32; 3]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum()
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize_or(v: [f32; 3], fallback: [f32; 3]) -> [f32; 3] {
    let n2 = norm2(v);
    if n2 < MIN_VECTOR_NORM2 {
        return fallback;
    }
    let n = n2.sqrt();
    v.map(|x| (x as f64 / n) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(gx: f32, gy: f32, gz: f32, ax: f32, ay: f32, az: f32) -> ImuData {
        ImuData {
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
        }
    }

    fn run_full_at_rest(calib: &mut ImuCalibration) {
        calib.start_calibration(CalibMode::Full, 200).unwrap();
        for i in 0..200 {
            let jitter = if i % 2 == 0 { 0.01 } else { -0.01 };
            calib.feed_sample(&sample(0.5 + jitter, -0.3, 0.2, 0.02, -0.01, 1.03 + jitter));
        }
    }

    #[test]
    fn test_gyro_only_done_with_mean_bias() {
        let mut calib = ImuCalibration::new();
        calib.start_calibration(CalibMode::GyroOnly, 100).unwrap();
        assert_eq!(calib.stage(), 1);
        for i in 0..100 {
            let jitter = if i % 2 == 0 { 0.05 } else { -0.05 };
            calib.feed_sample(&sample(1.0 + jitter, -2.0, 0.5 - jitter, 0.3, 0.0, 0.7));
        }
        assert_eq!(calib.status(), CalibStatus::Done);
        assert_eq!(calib.stage(), 0);
        let bias = calib.data().gyro_bias;
        assert!((bias[0] - 1.0).abs() < 1e-4);
        assert!((bias[1] + 2.0).abs() < 1e-4);
        assert!((bias[2] - 0.5).abs() < 1e-4);
        // GyroOnly 不修改加速度偏置
        assert_eq!(calib.data().accel_bias, [0.0; 3]);
        assert!(calib.is_valid());
    }

    #[test]
    fn test_motion_during_collection_fails() {
        let mut calib = ImuCalibration::new();
        calib.start_calibration(CalibMode::GyroOnly, 100).unwrap();
        for i in 0..100 {
            let swing = if i % 2 == 0 { 5.0 } else { -5.0 };
            calib.feed_sample(&sample(swing, 0.0, 0.0, 0.0, 0.0, 1.0));
        }
        assert_eq!(calib.status(), CalibStatus::Failed);
        assert!(!calib.is_valid());
    }

    #[test]
    fn test_full_rejects_accel_motion() {
        let mut calib = ImuCalibration::new();
        calib.start_calibration(CalibMode::Full, 50).unwrap();
        for i in 0..50 {
            let swing = if i % 2 == 0 { 0.5 } else { -0.5 };
            calib.feed_sample(&sample(0.0, 0.0, 0.0, swing, 0.0, 1.0));
        }
        assert_eq!(calib.status(), CalibStatus::Failed);
    }

    #[test]
    fn test_full_estimates_accel_bias_and_gravity() {
        let mut calib = ImuCalibration::new();
        run_full_at_rest(&mut calib);
        assert_eq!(calib.status(), CalibStatus::Done);
        let data = calib.data();
        assert!((data.accel_bias[0] - 0.02).abs() < 1e-4);
        assert!((data.accel_bias[2] - 0.03).abs() < 1e-4);
        let g = data.gravity_vec;
        let n = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();
        assert!((n - 1.0).abs() < 1e-5);
        assert!(g[2] > 0.99);
    }

    #[test]
    fn test_full_upside_down_expects_negative_g() {
        let mut calib = ImuCalibration::new();
        calib.start_calibration(CalibMode::Full, 10).unwrap();
        for _ in 0..10 {
            calib.feed_sample(&sample(0.0, 0.0, 0.0, 0.0, 0.0, -0.98));
        }
        assert_eq!(calib.status(), CalibStatus::Done);
        assert!((calib.data().accel_bias[2] - 0.02).abs() < 1e-4);
        assert!(calib.data().gravity_vec[2] < -0.99);
    }

    #[test]
    fn test_zero_samples_uses_default() {
        let mut calib = ImuCalibration::new();
        calib.start_calibration(CalibMode::GyroOnly, 0).unwrap();
        assert_eq!(calib.progress(), (0, DEFAULT_STAGE1_SAMPLES));
    }

    #[test]
    fn test_forward_requires_stage_one() {
        let mut calib = ImuCalibration::new();
        assert_eq!(calib.start_forward_calibration(100), Err(CalibError::NoGravity));
        assert_eq!(calib.status(), CalibStatus::Idle);
    }

    #[test]
    fn test_forward_direction_from_linear_accel() {
        let mut calib = ImuCalibration::new();
        run_full_at_rest(&mut calib);
        calib.start_forward_calibration(100).unwrap();
        assert_eq!(calib.stage(), 2);
        let bias = calib.data().accel_bias;
        let g = calib.data().gravity_vec;
        for i in 0..100 {
            // 前 10 个样本静止，之后沿 -Y 加速
            let push = if i < 10 { 0.0 } else { 0.3 };
            calib.feed_sample(&sample(
                0.0,
                0.0,
                0.0,
                bias[0] + g[0],
                bias[1] + g[1] - push,
                bias[2] + g[2],
            ));
        }
        assert_eq!(calib.status(), CalibStatus::Done);
        let f = calib.data().forward_vec;
        assert!(f[1] < -0.99, "forward {:?}", f);
    }

    #[test]
    fn test_forward_without_motion_fails() {
        let mut calib = ImuCalibration::new();
        run_full_at_rest(&mut calib);
        calib.start_forward_calibration(20).unwrap();
        let bias = calib.data().accel_bias;
        let g = calib.data().gravity_vec;
        for _ in 0..20 {
            calib.feed_sample(&sample(0.0, 0.0, 0.0, bias[0] + g[0], bias[1] + g[1], bias[2] + g[2]));
        }
        assert_eq!(calib.status(), CalibStatus::Failed);
        assert_eq!(calib.data().forward_vec, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_apply_noop_until_valid() {
        let mut calib = ImuCalibration::new();
        let mut data = sample(1.0, 1.0, 1.0, 0.0, 0.0, 1.0);
        calib.apply(&mut data);
        assert_eq!(data, sample(1.0, 1.0, 1.0, 0.0, 0.0, 1.0));

        let stored = ImuCalibData {
            gyro_bias: [1.0, 0.5, -0.5],
            accel_bias: [0.0, 0.0, 0.1],
            valid: true,
            ..Default::default()
        };
        calib.set_data(&stored).unwrap();
        calib.apply(&mut data);
        let expected = sample(0.0, 0.5, 1.5, 0.0, 0.0, 0.9);
        for (got, want) in data.gyro().iter().chain(data.accel().iter()).zip(
            expected.gyro().iter().chain(expected.accel().iter()),
        ) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_set_data_rejects_out_of_range_bias() {
        let mut calib = ImuCalibration::new();
        let stored = ImuCalibData {
            gyro_bias: [25.0, 0.0, 0.0],
            valid: true,
            ..Default::default()
        };
        assert_eq!(calib.set_data(&stored), Err(CalibError::BiasOutOfRange));
        assert!(!calib.is_valid());
        let stored = ImuCalibData {
            accel_bias: [f32::NAN, 0.0, 0.0],
            valid: true,
            ..Default::default()
        };
        assert_eq!(calib.set_data(&stored), Err(CalibError::NotFinite));
    }

    #[test]
    fn test_set_data_normalizes_vectors() {
        let mut calib = ImuCalibration::new();
        let stored = ImuCalibData {
            gravity_vec: [0.0, 0.0, 0.0],
            forward_vec: [0.0, 3.0, 4.0],
            valid: true,
            ..Default::default()
        };
        calib.set_data(&stored).unwrap();
        assert_eq!(calib.data().gravity_vec, [0.0, 0.0, 1.0]);
        let f = calib.data().forward_vec;
        assert!((f[1] - 0.6).abs() < 1e-6 && (f[2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_forward_direction_and_projection() {
        let mut calib = ImuCalibration::new();
        calib.set_forward_direction([0.0, 0.0, 0.0]);
        assert_eq!(calib.data().forward_vec, [1.0, 0.0, 0.0]);
        calib.set_forward_direction([0.0, 2.0, 0.0]);
        let data = sample(0.0, 0.0, 0.0, 0.1, 0.4, 1.0);
        assert!((calib.forward_accel(&data) - 0.4).abs() < 1e-6);
    }
}
