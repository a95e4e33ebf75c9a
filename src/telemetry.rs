use serde::Serialize;

use crate::components::ImuHandler;
use crate::madgwick::EulerAngles;

/// 推送给 WebSocket 客户端的遥测快照（`{"type":"telem", ...}`）。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// 控制器存活标记（沿用旧版前端字段名）。
    pub mcu_pong_ok: bool,
    pub link: LinkSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imu: Option<ImuSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calib: Option<CalibSnapshot>,
    pub act: ActuatorSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LinkSnapshot {
    pub rc_ok: bool,
    pub wifi_ok: bool,
    pub failsafe: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ImuSnapshot {
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
    pub gyro_z_filtered: f32,
    pub forward_accel: f32,
    pub orientation: EulerAngles,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibSnapshot {
    pub status: &'static str,
    pub stage: u8,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<BiasSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gravity_vec: Option<[f32; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_vec: Option<[f32; 3]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BiasSnapshot {
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ActuatorSnapshot {
    pub throttle: f32,
    pub steering: f32,
}

impl TelemetrySnapshot {
    /// IMU 未启用时省略 `imu` 与 `calib`；标定无效时省略偏置与方向向量。
    pub fn collect(
        rc_ok: bool,
        wifi_ok: bool,
        failsafe: bool,
        imu: &ImuHandler,
        applied: (f32, f32),
    ) -> Self {
        let (imu_part, calib_part) = if imu.is_enabled() {
            let data = imu.data();
            let calibration = imu.calibration();
            let cd = calibration.data();
            let valid = calibration.is_valid();
            let imu_part = ImuSnapshot {
                ax: data.ax,
                ay: data.ay,
                az: data.az,
                gx: data.gx,
                gy: data.gy,
                gz: data.gz,
                gyro_z_filtered: imu.filtered_gyro_z(),
                forward_accel: imu.forward_accel(),
                orientation: imu.euler_deg(),
            };
            let calib_part = CalibSnapshot {
                status: calibration.status().as_str(),
                stage: calibration.stage(),
                valid,
                bias: valid.then(|| BiasSnapshot {
                    gx: cd.gyro_bias[0],
                    gy: cd.gyro_bias[1],
                    gz: cd.gyro_bias[2],
                    ax: cd.accel_bias[0],
                    ay: cd.accel_bias[1],
                    az: cd.accel_bias[2],
                }),
                gravity_vec: valid.then_some(cd.gravity_vec),
                forward_vec: valid.then_some(cd.forward_vec),
            };
            (Some(imu_part), Some(calib_part))
        } else {
            (None, None)
        };

        Self {
            kind: "telem",
            mcu_pong_ok: true,
            link: LinkSnapshot {
                rc_ok,
                wifi_ok,
                failsafe,
            },
            imu: imu_part,
            calib: calib_part,
            act: ActuatorSnapshot {
                throttle: applied.0,
                steering: applied.1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu_calibration::ImuCalibData;

    #[test]
    fn test_snapshot_with_imu_and_valid_calibration() {
        let mut imu = ImuHandler::new(2);
        imu.set_enabled(true);
        imu.calibration_mut()
            .set_data(&ImuCalibData {
                gyro_bias: [0.5, 0.0, -0.5],
                valid: true,
                ..Default::default()
            })
            .unwrap();

        let snapshot = TelemetrySnapshot::collect(true, false, false, &imu, (0.1, 0.2));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["type"], "telem");
        assert_eq!(value["mcu_pong_ok"], true);
        assert_eq!(value["link"]["rc_ok"], true);
        assert_eq!(value["link"]["wifi_ok"], false);
        assert!(value["imu"]["orientation"]["yaw"].is_number());
        assert_eq!(value["calib"]["status"], "idle");
        assert_eq!(value["calib"]["stage"], 0);
        assert_eq!(value["calib"]["valid"], true);
        assert_eq!(value["calib"]["bias"]["gx"], 0.5);
        assert_eq!(value["calib"]["gravity_vec"][2], 1.0);
        assert_eq!(value["calib"]["forward_vec"][0], 1.0);
    }

    #[test]
    fn test_snapshot_hides_vectors_until_calibrated() {
        let mut imu = ImuHandler::new(2);
        imu.set_enabled(true);
        let snapshot = TelemetrySnapshot::collect(false, true, true, &imu, (0.0, 0.0));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["calib"]["valid"], false);
        assert!(value["calib"].get("bias").is_none());
        assert!(value["calib"].get("gravity_vec").is_none());
        assert_eq!(value["link"]["failsafe"], true);
    }
}
