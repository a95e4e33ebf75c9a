use serde::Serialize;

use crate::model::ImuData;

/// 默认梯度步长。
pub const DEFAULT_BETA: f32 = 0.1;

const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;
const MIN_ACCEL_NORM2: f32 = 1e-12;
const MIN_FORWARD_NORM2: f32 = 1e-12;

/// 四元数（w, x, y, z）。
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn norm(&self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// 归一化；模长为 0 或非有限值时返回 `None`。
    pub fn normalized(&self) -> Option<Quaternion> {
        let n = self.norm();
        if !n.is_finite() || n <= f32::MIN_POSITIVE {
            return None;
        }
        let q = Quaternion {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        };
        if q.w.is_finite() && q.x.is_finite() && q.y.is_finite() && q.z.is_finite() {
            Some(q)
        } else {
            None
        }
    }

    /// Hamilton 乘积 self ⊗ rhs。
    pub fn mul(&self, rhs: &Quaternion) -> Quaternion {
        let (a, b) = (self, rhs);
        Quaternion {
            w: a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
            x: a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            y: a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            z: a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        }
    }

    /// 旋转矩阵（列向量为目标系坐标轴）转四元数。
    fn from_rotation(r: [[f32; 3]; 3]) -> Quaternion {
        let tr = r[0][0] + r[1][1] + r[2][2];
        if tr > 0.0 {
            let s = 0.5 / (tr + 1.0).sqrt();
            Quaternion {
                w: 0.25 / s,
                x: (r[2][1] - r[1][2]) * s,
                y: (r[0][2] - r[2][0]) * s,
                z: (r[1][0] - r[0][1]) * s,
            }
        } else if r[0][0] >= r[1][1] && r[0][0] >= r[2][2] {
            let s = 2.0 * (1.0 + r[0][0] - r[1][1] - r[2][2]).sqrt();
            Quaternion {
                w: (r[2][1] - r[1][2]) / s,
                x: 0.25 * s,
                y: (r[0][1] + r[1][0]) / s,
                z: (r[0][2] + r[2][0]) / s,
            }
        } else if r[1][1] >= r[2][2] {
            let s = 2.0 * (1.0 + r[1][1] - r[0][0] - r[2][2]).sqrt();
            Quaternion {
                w: (r[0][2] - r[2][0]) / s,
                x: (r[0][1] + r[1][0]) / s,
                y: 0.25 * s,
                z: (r[1][2] + r[2][1]) / s,
            }
        } else {
            let s = 2.0 * (1.0 + r[2][2] - r[0][0] - r[1][1]).sqrt();
            Quaternion {
                w: (r[1][0] - r[0][1]) / s,
                x: (r[0][2] + r[2][0]) / s,
                y: (r[1][2] + r[2][1]) / s,
                z: 0.25 * s,
            }
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}

/// 欧拉角（roll 绕 X，pitch 绕 Y，yaw 绕 Z）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct EulerAngles {
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
}

/// Madgwick 姿态滤波（陀螺 + 加速度计，无磁力计，航向会缓慢漂移）。
#[derive(Clone, Debug)]
pub struct MadgwickFilter {
    q: Quaternion,
    beta: f32,
    vehicle_frame: Option<Quaternion>,
}

impl MadgwickFilter {
    pub fn new() -> Self {
        Self::with_beta(DEFAULT_BETA)
    }

    pub fn with_beta(beta: f32) -> Self {
        Self {
            q: Quaternion::IDENTITY,
            beta,
            vehicle_frame: None,
        }
    }

    pub fn set_beta(&mut self, beta: f32) {
        self.beta = beta;
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    /// 恢复单位四元数（车辆坐标系设置保留）。
    pub fn reset(&mut self) {
        self.q = Quaternion::IDENTITY;
    }

    /// 加速度单位 g，角速度单位 deg/s；`dt_sec <= 0` 时不做任何处理。
    pub fn update(&mut self, ax: f32, ay: f32, az: f32, gx: f32, gy: f32, gz: f32, dt_sec: f32) {
        if dt_sec.is_nan() || dt_sec <= 0.0 {
            return;
        }
        let Quaternion {
            w: q0,
            x: q1,
            y: q2,
            z: q3,
        } = self.q;
        let (gx, gy, gz) = (gx * DEG_TO_RAD, gy * DEG_TO_RAD, gz * DEG_TO_RAD);

        let mut dot0 = 0.5 * (-q1 * gx - q2 * gy - q3 * gz);
        let mut dot1 = 0.5 * (q0 * gx + q2 * gz - q3 * gy);
        let mut dot2 = 0.5 * (q0 * gy - q1 * gz + q3 * gx);
        let mut dot3 = 0.5 * (q0 * gz + q1 * gy - q2 * gx);

        // 加速度为零时本步跳过重力校正
        let a_norm2 = ax * ax + ay * ay + az * az;
        if a_norm2.is_finite() && a_norm2 > MIN_ACCEL_NORM2 {
            let inv = 1.0 / a_norm2.sqrt();
            let (ax, ay, az) = (ax * inv, ay * inv, az * inv);

            let (_2q0, _2q1, _2q2, _2q3) = (2.0 * q0, 2.0 * q1, 2.0 * q2, 2.0 * q3);
            let (_4q0, _4q1, _4q2) = (4.0 * q0, 4.0 * q1, 4.0 * q2);
            let (_8q1, _8q2) = (8.0 * q1, 8.0 * q2);
            let (q0q0, q1q1, q2q2, q3q3) = (q0 * q0, q1 * q1, q2 * q2, q3 * q3);

            let s0 = _4q0 * q2q2 + _2q2 * ax + _4q0 * q1q1 - _2q1 * ay;
            let s1 = _4q1 * q3q3 - _2q3 * ax + 4.0 * q0q0 * q1 - _2q0 * ay - _4q1
                + _8q1 * q1q1
                + _8q1 * q2q2
                + _4q1 * az;
            let s2 = 4.0 * q0q0 * q2 + _2q0 * ax + _4q2 * q3q3 - _2q3 * ay - _4q2
                + _8q2 * q1q1
                + _8q2 * q2q2
                + _4q2 * az;
            let s3 = 4.0 * q1q1 * q3 - _2q1 * ax + 4.0 * q2q2 * q3 - _2q2 * ay;

            let s_norm = (s0 * s0 + s1 * s1 + s2 * s2 + s3 * s3).sqrt();
            if s_norm > 0.0 && s_norm.is_finite() {
                dot0 -= self.beta * s0 / s_norm;
                dot1 -= self.beta * s1 / s_norm;
                dot2 -= self.beta * s2 / s_norm;
                dot3 -= self.beta * s3 / s_norm;
            }
        }

        let integrated = Quaternion {
            w: q0 + dot0 * dt_sec,
            x: q1 + dot1 * dt_sec,
            y: q2 + dot2 * dt_sec,
            z: q3 + dot3 * dt_sec,
        };
        // 积分结果退化时保留上一步姿态，保证输出始终为单位四元数
        if let Some(q) = integrated.normalized() {
            self.q = q;
        }
    }

    pub fn update_imu(&mut self, imu: &ImuData, dt_sec: f32) {
        self.update(imu.ax, imu.ay, imu.az, imu.gx, imu.gy, imu.gz, dt_sec);
    }

    /// 设置车辆坐标系：X 为前进方向在水平面的投影，Z 向下，Y 补全右手系。
    ///
    /// 无效或前进方向退化时回到滤波器自身坐标系。
    pub fn set_vehicle_frame(&mut self, _gravity: [f32; 3], forward: [f32; 3], valid: bool) {
        self.vehicle_frame = None;
        if !valid {
            return;
        }
        let (fx, fy) = (forward[0], forward[1]);
        let n2 = fx * fx + fy * fy;
        if !n2.is_finite() || n2 < MIN_FORWARD_NORM2 {
            return;
        }
        let n = n2.sqrt();
        let (fx, fy) = (fx / n, fy / n);
        // 列：X = (fx, fy, 0)，Y = Z × X = (-fy, fx, 0)，Z = (0, 0, 1)
        let r = [[fx, -fy, 0.0], [fy, fx, 0.0], [0.0, 0.0, 1.0]];
        self.vehicle_frame = Quaternion::from_rotation(r).normalized();
    }

    pub fn uses_vehicle_frame(&self) -> bool {
        self.vehicle_frame.is_some()
    }

    /// 滤波器自身坐标系下的姿态。
    pub fn quaternion_raw(&self) -> Quaternion {
        self.q
    }

    /// 对外姿态：启用车辆坐标系时为 q ⊗ q_vehicle。
    pub fn quaternion(&self) -> Quaternion {
        match &self.vehicle_frame {
            Some(frame) => self.q.mul(frame),
            None => self.q,
        }
    }

    pub fn euler_rad(&self) -> EulerAngles {
        let Quaternion { w, x, y, z } = self.quaternion();
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        // 未做万向锁保护，仅钳位 asin 参数
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        EulerAngles { pitch, roll, yaw }
    }

    pub fn euler_deg(&self) -> EulerAngles {
        let rad = self.euler_rad();
        EulerAngles {
            pitch: rad.pitch * RAD_TO_DEG,
            roll: rad.roll * RAD_TO_DEG,
            yaw: rad.yaw * RAD_TO_DEG,
        }
    }
}

impl Default for MadgwickFilter {
    fn default() -> Self {
        Self::new()
    }
}
