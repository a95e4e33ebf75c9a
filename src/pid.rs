/// PID 参数与限幅。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub max_integral: f32,
    pub max_output: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            max_integral: 1.0,
            max_output: 1.0,
        }
    }
}

/// 离散 PID（积分限幅抗饱和，首步微分为 0）。
#[derive(Clone, Debug)]
pub struct PidController {
    gains: PidGains,
    integral: f32,
    prev_error: f32,
    first_step: bool,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            prev_error: 0.0,
            first_step: true,
        }
    }

    /// `dt_sec <= 0` 时返回 0 且不改变状态。
    pub fn step(&mut self, error: f32, dt_sec: f32) -> f32 {
        if dt_sec.is_nan() || dt_sec <= 0.0 {
            return 0.0;
        }
        let g = self.gains;

        let max_integral = limit(g.max_integral);
        self.integral = (self.integral + error * dt_sec).clamp(-max_integral, max_integral);

        let derivative = if self.first_step {
            self.first_step = false;
            0.0
        } else {
            (error - self.prev_error) / dt_sec
        };
        self.prev_error = error;

        let max_output = limit(g.max_output);
        let output = g.kp * error + g.ki * self.integral + g.kd * derivative;
        output.clamp(-max_output, max_output)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.first_step = true;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }
}

/// 对称限幅的边界，NaN 视为 0。
pub(crate) fn limit(bound: f32) -> f32 {
    if bound.is_nan() {
        0.0
    } else {
        bound.abs()
    }
}

impl Default for PidController {
    fn default() -> Self {
        Self::new(PidGains::default())
    }
}
