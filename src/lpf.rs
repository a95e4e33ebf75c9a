use std::f32::consts::{PI, SQRT_2};

/// 二阶 Butterworth 低通（双线性变换，Q = 1/√2）。
///
/// 未配置时为直通：输出等于输入，同时记录为输出状态。
#[derive(Clone, Debug, Default)]
pub struct LpfButterworth2 {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
    cutoff_hz: f32,
    sample_rate_hz: f32,
    configured: bool,
}

impl LpfButterworth2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按截止频率与采样率构建已配置的滤波器。
    pub fn with_params(cutoff_hz: f32, sample_rate_hz: f32) -> Self {
        let mut lpf = Self::new();
        lpf.set_params(cutoff_hz, sample_rate_hz);
        lpf
    }

    /// 计算系数；参数非法（≤ 0 或不低于 Nyquist）时退化为直通，返回是否生效。
    pub fn set_params(&mut self, cutoff_hz: f32, sample_rate_hz: f32) -> bool {
        let valid = cutoff_hz.is_finite()
            && sample_rate_hz.is_finite()
            && cutoff_hz > 0.0
            && sample_rate_hz > 0.0
            && cutoff_hz < sample_rate_hz * 0.5;
        if !valid {
            self.configured = false;
            return false;
        }

        let k = (PI * cutoff_hz / sample_rate_hz).tan();
        let k2 = k * k;
        let norm = 1.0 / (1.0 + SQRT_2 * k + k2);
        self.b0 = k2 * norm;
        self.b1 = 2.0 * self.b0;
        self.b2 = self.b0;
        self.a1 = 2.0 * (k2 - 1.0) * norm;
        self.a2 = (1.0 - SQRT_2 * k + k2) * norm;
        self.cutoff_hz = cutoff_hz;
        self.sample_rate_hz = sample_rate_hz;
        self.configured = true;
        self.reset();
        true
    }

    pub fn step(&mut self, x: f32) -> f32 {
        if !self.configured {
            self.y1 = x;
            return x;
        }
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    /// 清零历史，保留系数。
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn cutoff_hz(&self) -> f32 {
        self.cutoff_hz
    }

    pub fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }

    /// 最近一次输出。
    pub fn last_output(&self) -> f32 {
        self.y1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_is_passthrough() {
        let mut lpf = LpfButterworth2::new();
        for &x in &[0.0, 1.5, -3.25, 1e6, -1e-6] {
            assert_eq!(lpf.step(x), x);
            assert_eq!(lpf.last_output(), x);
        }
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut lpf = LpfButterworth2::with_params(20.0, 500.0);
        assert!(lpf.is_configured());
        assert!(!lpf.set_params(0.0, 500.0));
        assert!(!lpf.is_configured());
        assert!(!lpf.set_params(20.0, 0.0));
        assert!(!lpf.set_params(250.0, 500.0));
        assert!(!lpf.set_params(-5.0, 500.0));
        assert_eq!(lpf.step(0.75), 0.75);
    }

    #[test]
    fn test_unity_dc_gain() {
        let mut lpf = LpfButterworth2::with_params(30.0, 500.0);
        let mut y = 0.0;
        for _ in 0..2000 {
            y = lpf.step(1.0);
        }
        assert!((y - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_attenuates_above_cutoff() {
        let mut lpf = LpfButterworth2::with_params(20.0, 500.0);
        let fs = 500.0f32;
        let mut peak = 0.0f32;
        for n in 0..1000 {
            let t = n as f32 / fs;
            let y = lpf.step((2.0 * PI * 200.0 * t).sin());
            // 跳过起始瞬态
            if n > 100 {
                peak = peak.max(y.abs());
            }
        }
        assert!(peak < 0.5, "peak {}", peak);
    }

    #[test]
    fn test_reset_keeps_coefficients() {
        let mut lpf = LpfButterworth2::with_params(30.0, 500.0);
        let first = lpf.step(1.0);
        lpf.step(1.0);
        lpf.reset();
        assert_eq!(lpf.step(1.0), first);
        assert_eq!(lpf.cutoff_hz(), 30.0);
    }
}
