use crate::imu_calibration::ImuCalibration;
use crate::lpf::LpfButterworth2;
use crate::madgwick::{EulerAngles, MadgwickFilter};
use crate::model::{ImuData, RcCommand};
use crate::platform::VehiclePlatform;
use crate::serial::{LinkStatus, TelemetryData};
use crate::telemetry::TelemetrySnapshot;

/// 子速率节拍：控制环每个周期调用，到期时返回距上次触发的毫秒数。
#[derive(Clone, Copy, Debug)]
pub struct SubRate {
    interval_ms: u32,
    last_ms: Option<u32>,
}

impl SubRate {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    /// 首次调用立即到期，返回名义间隔。
    pub fn poll(&mut self, now_ms: u32) -> Option<u32> {
        match self.last_ms {
            None => {
                self.last_ms = Some(now_ms);
                Some(self.interval_ms)
            }
            Some(last) => {
                let elapsed = now_ms.wrapping_sub(last);
                if elapsed < self.interval_ms {
                    return None;
                }
                self.last_ms = Some(now_ms);
                Some(elapsed)
            }
        }
    }

    /// 以 `now_ms` 作为上次触发时间（下一次在一个间隔后到期）。
    pub fn restart_at(&mut self, now_ms: u32) {
        self.last_ms = Some(now_ms);
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }
}

/// 遥控接收机输入。
#[derive(Clone, Debug)]
pub struct RcInputHandler {
    rate: SubRate,
    enabled: bool,
    last_command: Option<RcCommand>,
}

impl RcInputHandler {
    pub fn new(poll_interval_ms: u32) -> Self {
        Self {
            rate: SubRate::new(poll_interval_ms),
            enabled: false,
            last_command: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.last_command = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn update<P: VehiclePlatform>(&mut self, platform: &mut P, now_ms: u32) {
        if !self.enabled || self.rate.poll(now_ms).is_none() {
            return;
        }
        self.last_command = platform.read_rc();
    }

    /// 最近一次轮询拿到了有效指令。
    pub fn is_active(&self) -> bool {
        self.last_command.is_some()
    }

    pub fn command(&self) -> Option<RcCommand> {
        self.last_command
    }
}

/// 无线（WebSocket / 串口链路）指令。
#[derive(Clone, Debug)]
pub struct WifiCommandHandler {
    timeout_ms: u32,
    last_cmd_ms: Option<u32>,
    last_command: Option<RcCommand>,
    now_ms: u32,
}

impl WifiCommandHandler {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            timeout_ms,
            last_cmd_ms: None,
            last_command: None,
            now_ms: 0,
        }
    }

    pub fn update<P: VehiclePlatform>(&mut self, platform: &mut P, now_ms: u32) {
        self.now_ms = now_ms;
        if let Some(cmd) = platform.try_receive_wifi_command() {
            self.last_command = Some(cmd);
            self.last_cmd_ms = Some(now_ms);
        }
    }

    /// 以本周期时间判断指令是否仍在有效期内。
    pub fn is_active(&self) -> bool {
        self.is_active_at(self.now_ms)
    }

    pub fn is_active_at(&self, now_ms: u32) -> bool {
        match self.last_cmd_ms {
            Some(at) => now_ms.wrapping_sub(at) < self.timeout_ms,
            None => false,
        }
    }

    pub fn command(&self) -> Option<RcCommand> {
        if self.is_active() {
            self.last_command
        } else {
            None
        }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }
}

/// IMU 读取、标定、偏航角速度滤波与姿态解算。
#[derive(Clone, Debug)]
pub struct ImuHandler {
    rate: SubRate,
    enabled: bool,
    data: ImuData,
    filtered_gz: f32,
    last_dt_sec: f32,
    calibration: ImuCalibration,
    filter: MadgwickFilter,
    lpf_gyro_z: LpfButterworth2,
}

impl ImuHandler {
    pub fn new(read_interval_ms: u32) -> Self {
        Self {
            rate: SubRate::new(read_interval_ms),
            enabled: false,
            data: ImuData::default(),
            filtered_gz: 0.0,
            last_dt_sec: 0.0,
            calibration: ImuCalibration::new(),
            filter: MadgwickFilter::new(),
            lpf_gyro_z: LpfButterworth2::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn update<P: VehiclePlatform>(&mut self, platform: &mut P, now_ms: u32) {
        if !self.enabled {
            return;
        }
        let Some(elapsed_ms) = self.rate.poll(now_ms) else {
            return;
        };
        let Some(raw) = platform.read_imu() else {
            return;
        };

        self.calibration.feed_sample(&raw);
        let mut data = raw;
        self.calibration.apply(&mut data);
        self.data = data;
        self.filtered_gz = self.lpf_gyro_z.step(data.gz);

        // 首次读取时 elapsed 即名义间隔
        self.last_dt_sec = elapsed_ms as f32 / 1000.0;
        self.filter.update_imu(&data, self.last_dt_sec);
    }

    /// 配置偏航角速度低通；参数非法时滤波器退化为直通。
    pub fn set_lpf(&mut self, cutoff_hz: f32, sample_rate_hz: f32) -> bool {
        let ok = self.lpf_gyro_z.set_params(cutoff_hz, sample_rate_hz);
        if !ok {
            log::warn!(
                "LPF params rejected (cutoff {} Hz, rate {} Hz), passthrough",
                cutoff_hz,
                sample_rate_hz
            );
        }
        ok
    }

    /// 按当前标定数据设置姿态输出的车辆坐标系。
    pub fn refresh_vehicle_frame(&mut self) {
        let data = *self.calibration.data();
        self.filter
            .set_vehicle_frame(data.gravity_vec, data.forward_vec, data.valid);
    }

    /// 已扣除偏置的最新样本。
    pub fn data(&self) -> &ImuData {
        &self.data
    }

    pub fn filtered_gyro_z(&self) -> f32 {
        self.filtered_gz
    }

    pub fn last_dt_sec(&self) -> f32 {
        self.last_dt_sec
    }

    pub fn forward_accel(&self) -> f32 {
        self.calibration.forward_accel(&self.data)
    }

    pub fn euler_deg(&self) -> EulerAngles {
        self.filter.euler_deg()
    }

    pub fn calibration(&self) -> &ImuCalibration {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut ImuCalibration {
        &mut self.calibration
    }

    pub fn filter(&self) -> &MadgwickFilter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut MadgwickFilter {
        &mut self.filter
    }
}

/// 遥测汇总：只读取其他组件状态，按子速率发送。
#[derive(Clone, Debug)]
pub struct TelemetryHandler {
    rate: SubRate,
    applied_throttle: f32,
    applied_steering: f32,
    link_seq: u16,
}

impl TelemetryHandler {
    pub fn new(send_interval_ms: u32) -> Self {
        Self {
            rate: SubRate::new(send_interval_ms),
            applied_throttle: 0.0,
            applied_steering: 0.0,
            link_seq: 0,
        }
    }

    pub fn set_actuator_values(&mut self, throttle: f32, steering: f32) {
        self.applied_throttle = throttle;
        self.applied_steering = steering;
    }

    pub fn update<P: VehiclePlatform>(
        &mut self,
        platform: &mut P,
        now_ms: u32,
        rc: &RcInputHandler,
        wifi: &WifiCommandHandler,
        imu: &ImuHandler,
        failsafe_active: bool,
    ) {
        if self.rate.poll(now_ms).is_none() {
            return;
        }

        let status = LinkStatus {
            rc_ok: rc.is_active(),
            wifi_ok: wifi.is_active(),
            failsafe_active,
        };
        let frame = TelemetryData::from_imu(self.link_seq, status, imu.data());
        self.link_seq = self.link_seq.wrapping_add(1);
        platform.send_link_telem(&frame);

        if platform.client_count() == 0 {
            return;
        }
        let snapshot = self.snapshot(rc, wifi, imu, failsafe_active);
        match serde_json::to_string(&snapshot) {
            Ok(json) => platform.send_telem(&json),
            Err(err) => log::warn!("Telemetry encode failed: {}", err),
        }
    }

    pub fn snapshot(
        &self,
        rc: &RcInputHandler,
        wifi: &WifiCommandHandler,
        imu: &ImuHandler,
        failsafe_active: bool,
    ) -> TelemetrySnapshot {
        TelemetrySnapshot::collect(
            rc.is_active(),
            wifi.is_active(),
            failsafe_active,
            imu,
            (self.applied_throttle, self.applied_steering),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu_calibration::CalibMode;
    use crate::sim::SimPlatform;

    #[test]
    fn test_sub_rate_first_poll_is_due() {
        let mut rate = SubRate::new(20);
        assert_eq!(rate.poll(1000), Some(20));
        assert_eq!(rate.poll(1010), None);
        assert_eq!(rate.poll(1025), Some(25));
        rate.restart_at(2000);
        assert_eq!(rate.poll(2019), None);
        assert_eq!(rate.poll(2020), Some(20));
    }

    #[test]
    fn test_sub_rate_wraparound() {
        let mut rate = SubRate::new(10);
        rate.restart_at(u32::MAX - 4);
        assert_eq!(rate.poll(3), None);
        assert_eq!(rate.poll(5), Some(10));
    }

    #[test]
    fn test_rc_handler_polls_at_sub_rate() {
        let mut platform = SimPlatform::new(0);
        let mut rc = RcInputHandler::new(20);
        platform.set_rc(Some(RcCommand::new(0.5, 0.0)));

        // 未启用时不读取
        rc.update(&mut platform, 0);
        assert!(!rc.is_active());

        rc.set_enabled(true);
        rc.update(&mut platform, 0);
        assert!(rc.is_active());
        assert_eq!(rc.command(), Some(RcCommand::new(0.5, 0.0)));

        platform.set_rc(None);
        rc.update(&mut platform, 10);
        assert!(rc.is_active(), "poll not due yet");
        rc.update(&mut platform, 20);
        assert!(!rc.is_active());
        assert_eq!(rc.command(), None);
    }

    #[test]
    fn test_wifi_handler_goes_stale() {
        let mut platform = SimPlatform::new(0);
        let mut wifi = WifiCommandHandler::new(500);
        wifi.update(&mut platform, 100);
        assert!(!wifi.is_active());

        platform.push_wifi_command(RcCommand::new(0.3, -0.2));
        wifi.update(&mut platform, 200);
        assert!(wifi.is_active());
        assert_eq!(wifi.command(), Some(RcCommand::new(0.3, -0.2)));

        wifi.update(&mut platform, 699);
        assert!(wifi.is_active());
        wifi.update(&mut platform, 700);
        assert!(!wifi.is_active());
        assert_eq!(wifi.command(), None);
        assert!(wifi.is_active_at(650));
    }

    #[test]
    fn test_imu_handler_applies_bias_and_filters() {
        let mut platform = SimPlatform::new(0);
        let mut imu = ImuHandler::new(2);
        imu.set_enabled(true);
        imu.set_lpf(30.0, 500.0);
        imu.calibration_mut()
            .start_calibration(CalibMode::GyroOnly, 50)
            .unwrap();

        let sample = ImuData {
            ax: 0.0,
            ay: 0.0,
            az: 1.0,
            gx: 1.0,
            gy: -2.0,
            gz: 3.0,
        };
        platform.set_imu(Some(sample));
        let mut now = 0;
        for _ in 0..50 {
            imu.update(&mut platform, now);
            now += 2;
        }
        assert!(imu.calibration().is_valid());

        imu.update(&mut platform, now);
        assert!(imu.data().gz.abs() < 1e-4);
        assert!(imu.data().gx.abs() < 1e-4);
        assert!((imu.last_dt_sec() - 0.002).abs() < 1e-6);
        let q = imu.filter().quaternion();
        assert!((q.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_imu_handler_disabled_never_reads() {
        let mut platform = SimPlatform::new(0);
        platform.set_imu(Some(ImuData {
            az: 1.0,
            gz: 50.0,
            ..Default::default()
        }));
        let mut imu = ImuHandler::new(2);
        imu.update(&mut platform, 0);
        assert_eq!(imu.data(), &ImuData::default());
        assert_eq!(platform.imu_reads(), 0);
    }

    #[test]
    fn test_telemetry_skipped_without_clients() {
        let mut platform = SimPlatform::new(0);
        let rc = RcInputHandler::new(20);
        let wifi = WifiCommandHandler::new(500);
        let imu = ImuHandler::new(2);
        let mut telem = TelemetryHandler::new(50);

        telem.update(&mut platform, 0, &rc, &wifi, &imu, false);
        assert!(platform.telemetry().is_empty());
        assert_eq!(platform.link_frames().len(), 1);

        platform.set_client_count(1);
        telem.set_actuator_values(0.25, -0.5);
        telem.update(&mut platform, 20, &rc, &wifi, &imu, true);
        assert!(platform.telemetry().is_empty(), "interval not elapsed");
        telem.update(&mut platform, 50, &rc, &wifi, &imu, true);
        assert_eq!(platform.telemetry().len(), 1);

        let value: serde_json::Value = serde_json::from_str(&platform.telemetry()[0]).unwrap();
        assert_eq!(value["type"], "telem");
        assert_eq!(value["link"]["failsafe"], true);
        assert_eq!(value["act"]["throttle"], 0.25);
        assert_eq!(value["act"]["steering"], -0.5);
        assert!(value.get("imu").is_none());

        let frames = platform.link_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].seq, 1);
        assert!(frames[1].status.failsafe_active);
    }
}
