use std::fmt;
use std::thread;

use crate::components::{ImuHandler, RcInputHandler, SubRate, TelemetryHandler, WifiCommandHandler};
use crate::failsafe::{Failsafe, FailsafeState};
use crate::imu_calibration::{CalibError, CalibMode, CalibStatus, ImuCalibration};
use crate::model::{apply_slew_rate, clamp_normalized, ControlSettings, RcCommand, VehicleStatus};
use crate::pid::{self, PidController};
use crate::pipeline::{CalibRequest, ControlHandle, ControlInbox, ControlRequest, ControlStatus};
use crate::platform::{PlatformError, VehiclePlatform};
use crate::stabilization::{ConfigError, StabilizationConfig};

const CONTROL_TASK_STACK_SIZE: usize = 8192;

/// 初始化失败（PWM 或失控保护不可用）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    Platform(PlatformError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Platform(err) => write!(f, "vehicle control init failed: {}", err),
        }
    }
}

impl std::error::Error for InitError {}

impl From<PlatformError> for InitError {
    fn from(err: PlatformError) -> Self {
        InitError::Platform(err)
    }
}

/// 控制环耗时统计（周期性输出诊断日志）。
#[derive(Clone, Copy, Debug, Default)]
struct LoopDiagnostics {
    start_ms: u32,
    loops: u32,
    busy_us_total: u64,
    busy_us_max: u64,
}

/// 整车控制：拥有平台、各输入处理器、失控保护与稳定系统，按固定周期运行。
pub struct VehicleControl<P: VehiclePlatform> {
    platform: P,
    settings: ControlSettings,
    rc: RcInputHandler,
    wifi: WifiCommandHandler,
    imu: ImuHandler,
    telem: TelemetryHandler,
    failsafe: Failsafe,
    failsafe_state: FailsafeState,
    stab_config: StabilizationConfig,
    yaw_pid: PidController,
    stab_weight: f32,
    commanded: RcCommand,
    applied_throttle: f32,
    applied_steering: f32,
    pwm_rate: SubRate,
    last_loop_ms: Option<u32>,
    last_calib_status: CalibStatus,
    inbox: ControlInbox,
    handle: ControlHandle,
    diag: LoopDiagnostics,
    inited: bool,
}

impl<P: VehiclePlatform> VehicleControl<P> {
    pub fn new(platform: P, settings: ControlSettings, handle: ControlHandle, inbox: ControlInbox) -> Self {
        let stab_config = StabilizationConfig::default();
        Self {
            rc: RcInputHandler::new(settings.rc_poll_interval_ms),
            wifi: WifiCommandHandler::new(settings.wifi_cmd_timeout_ms),
            imu: ImuHandler::new(settings.imu_read_interval_ms),
            telem: TelemetryHandler::new(settings.telem_interval_ms),
            failsafe: Failsafe::new(settings.failsafe_timeout_ms),
            failsafe_state: FailsafeState::Inactive,
            yaw_pid: PidController::new(stab_config.pid_gains()),
            stab_config,
            stab_weight: 0.0,
            commanded: RcCommand::neutral(),
            applied_throttle: 0.0,
            applied_steering: 0.0,
            pwm_rate: SubRate::new(settings.pwm_update_interval_ms),
            last_loop_ms: None,
            last_calib_status: CalibStatus::Idle,
            inbox,
            handle,
            diag: LoopDiagnostics::default(),
            inited: false,
            platform,
            settings,
        }
    }

    /// 初始化各子系统。PWM 与失控保护失败为致命错误；遥控与 IMU 失败则降级运行。
    pub fn init(&mut self) -> Result<(), InitError> {
        if self.inited {
            return Ok(());
        }

        if let Err(err) = self.platform.init_pwm() {
            log::error!("Failed to initialize PWM: {}", err);
            return Err(err.into());
        }
        if let Err(err) = self.platform.init_failsafe() {
            log::error!("Failed to initialize failsafe: {}", err);
            return Err(err.into());
        }

        match self.platform.init_rc() {
            Ok(()) => self.rc.set_enabled(true),
            Err(err) => log::warn!("RC input init failed ({}), continuing without RC-in", err),
        }

        match self.platform.init_imu() {
            Ok(()) => {
                self.imu.set_enabled(true);
                self.load_calibration();
            }
            Err(err) => match self.platform.imu_who_am_i() {
                Some(who) => log::warn!(
                    "IMU init failed ({}, WHO_AM_I=0x{:02X}), continuing without IMU",
                    err,
                    who
                ),
                None => log::warn!("IMU init failed ({}), continuing without IMU", err),
            },
        }

        // 存储中的配置同样按外部输入处理：先钳位再校验
        let stored = self.platform.load_stab_config().map(|mut cfg| {
            cfg.clamp();
            cfg
        });
        let stab_config = match stored {
            Some(cfg) if cfg.is_valid() => {
                log::info!("Stabilization config loaded (mode {})", cfg.drive_mode().as_str());
                cfg
            }
            Some(_) => {
                log::warn!("Stored stabilization config invalid, using defaults");
                StabilizationConfig::default()
            }
            None => {
                log::info!("Using default stabilization config");
                StabilizationConfig::default()
            }
        };
        self.apply_stab_config(stab_config);

        if self.imu.is_enabled() {
            let samples = self.settings.boot_calib_samples;
            if self
                .imu
                .calibration_mut()
                .start_calibration(CalibMode::Full, samples)
                .is_ok()
            {
                log::info!("IMU auto-calibration started (full, {} samples)", samples);
            }
        }
        self.last_calib_status = self.imu.calibration().status();

        let now = self.platform.now_ms();
        self.pwm_rate.restart_at(now);
        self.diag = LoopDiagnostics {
            start_ms: now,
            ..Default::default()
        };
        self.platform.set_pwm_neutral();

        self.inited = true;
        log::info!(
            "Vehicle control ready ({} Hz loop, rc={}, imu={})",
            self.settings.loop_hz(),
            self.rc.is_enabled(),
            self.imu.is_enabled()
        );
        Ok(())
    }

    fn load_calibration(&mut self) {
        let Some(data) = self.platform.load_calib() else {
            log::info!("No saved IMU calibration, will auto-calibrate at start");
            return;
        };
        match self.imu.calibration_mut().set_data(&data) {
            Ok(()) => {
                self.imu.refresh_vehicle_frame();
                log::info!("IMU calibration loaded (valid={})", data.valid);
            }
            Err(err) => log::warn!("Stored IMU calibration rejected: {}", err),
        }
    }

    /// 等待下一个周期并执行一次控制迭代。
    pub fn run_once(&mut self) {
        self.platform.wait_next_tick(self.settings.control_period_ms);
        let now = self.platform.now_ms();
        self.tick(now);
    }

    /// 一次控制迭代：输入 → 标定 → 仲裁 → 稳定 → 失控保护 → PWM → 遥测。
    pub fn tick(&mut self, now: u32) {
        let started_us = self.platform.now_us();
        let dt_ms = match self.last_loop_ms {
            Some(last) => now.wrapping_sub(last),
            None => self.settings.control_period_ms,
        };
        self.last_loop_ms = Some(now);

        self.rc.update(&mut self.platform, now);
        self.wifi.update(&mut self.platform, now);
        self.imu.update(&mut self.platform, now);

        self.process_requests();
        self.process_calibration_completion();

        self.select_control_source();
        let mut target = self.stabilize(self.commanded, dt_ms);

        let state = self
            .failsafe
            .update(now, self.rc.is_active(), self.wifi.is_active());
        self.on_failsafe_state(state);
        if state == FailsafeState::Active {
            self.commanded = RcCommand::neutral();
            target = RcCommand::neutral();
            self.applied_throttle = 0.0;
            self.applied_steering = 0.0;
            self.platform.set_pwm_neutral();
        }

        self.update_pwm(now, target);

        self.telem
            .set_actuator_values(self.applied_throttle, self.applied_steering);
        self.telem.update(
            &mut self.platform,
            now,
            &self.rc,
            &self.wifi,
            &self.imu,
            self.failsafe.is_active(),
        );

        let busy_us = self.platform.now_us().saturating_sub(started_us);
        self.record_diagnostics(now, busy_us);
    }

    /// 遥控优先；两者都不活跃时保持上一条指令（超时由失控保护处理）。
    fn select_control_source(&mut self) {
        if let Some(cmd) = self.rc.command() {
            self.commanded = cmd;
        } else if let Some(cmd) = self.wifi.command() {
            self.commanded = cmd;
        }
    }

    /// 偏航角速度闭环与俯仰补偿，启停时按 fade_ms 渐变。
    fn stabilize(&mut self, cmd: RcCommand, dt_ms: u32) -> RcCommand {
        let cfg = &self.stab_config;
        let active = cfg.enabled && self.imu.is_enabled() && self.imu.calibration().is_valid();
        let step = if cfg.fade_ms == 0 {
            1.0
        } else {
            dt_ms as f32 / cfg.fade_ms as f32
        };
        self.stab_weight = if active {
            (self.stab_weight + step).min(1.0)
        } else {
            (self.stab_weight - step).max(0.0)
        };
        if self.stab_weight <= 0.0 {
            self.yaw_pid.reset();
            return cmd;
        }

        let weight = self.stab_weight;
        let desired_rate = cmd.steering() * cfg.steer_to_yaw_rate_dps;
        let error = desired_rate - self.imu.filtered_gyro_z();
        let correction = self.yaw_pid.step(error, dt_ms as f32 / 1000.0);
        let steering = cmd.steering() + weight * correction;

        let mut throttle = cmd.throttle();
        if cfg.pitch_comp_enabled {
            let pitch = self.imu.euler_deg().pitch;
            let limit = pid::limit(cfg.pitch_comp_max_correction);
            throttle += weight * (pitch * cfg.pitch_comp_gain).clamp(-limit, limit);
        }
        RcCommand::new(clamp_normalized(throttle), clamp_normalized(steering))
    }

    fn on_failsafe_state(&mut self, state: FailsafeState) {
        if state == self.failsafe_state {
            return;
        }
        let was_active = self.failsafe_state == FailsafeState::Active;
        self.failsafe_state = state;
        match state {
            FailsafeState::Active => log::warn!("Failsafe ACTIVE, outputs forced to neutral"),
            FailsafeState::Recovering => log::info!("Failsafe recovering"),
            FailsafeState::Inactive => log::info!("Failsafe cleared"),
        }
        let is_active = state == FailsafeState::Active;
        if was_active != is_active {
            self.platform.on_failsafe_changed(is_active);
        }
    }

    fn update_pwm(&mut self, now: u32, target: RcCommand) {
        let Some(pwm_dt_ms) = self.pwm_rate.poll(now) else {
            return;
        };
        self.applied_throttle = apply_slew_rate(
            target.throttle(),
            self.applied_throttle,
            self.settings.slew_throttle_per_sec,
            pwm_dt_ms,
        );
        self.applied_steering = apply_slew_rate(
            target.steering(),
            self.applied_steering,
            self.settings.slew_steering_per_sec,
            pwm_dt_ms,
        );
        self.platform
            .set_pwm(self.applied_throttle, self.applied_steering);
    }

    fn process_requests(&mut self) {
        while let Some(request) = self.inbox.try_next() {
            match request {
                ControlRequest::Calibrate(kind) => self.start_stage1(kind),
                ControlRequest::StartForwardCalibration { reply } => {
                    let result = self.start_forward_calibration();
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                ControlRequest::SetForwardDirection { vec, reply } => {
                    let saved = self.set_forward_direction(vec);
                    if let Some(reply) = reply {
                        let _ = reply.send(saved);
                    }
                }
                ControlRequest::SetStabilizationConfig {
                    config,
                    persist,
                    reply,
                } => {
                    let result = self.set_stabilization_config(config, persist);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                ControlRequest::QueryStatus(reply) => {
                    let _ = reply.send(self.status());
                }
            }
        }
    }

    fn start_stage1(&mut self, kind: CalibRequest) {
        if !self.imu.is_enabled() {
            log::warn!("Calibration request ignored, IMU unavailable");
            return;
        }
        let (mode, samples) = match kind {
            CalibRequest::GyroOnly => (CalibMode::GyroOnly, self.settings.gyro_calib_samples),
            CalibRequest::Full => (CalibMode::Full, self.settings.full_calib_samples),
        };
        if self
            .imu
            .calibration_mut()
            .start_calibration(mode, samples)
            .is_ok()
        {
            log::info!("Calibration stage 1 started ({}, {} samples)", mode.as_str(), samples);
        }
    }

    /// 启动前进方向标定（阶段 2）；采集中拒绝。
    pub fn start_forward_calibration(&mut self) -> Result<(), CalibError> {
        let calibration = self.imu.calibration_mut();
        if calibration.status() == CalibStatus::Collecting {
            return Err(CalibError::Busy);
        }
        let samples = self.settings.forward_calib_samples;
        match calibration.start_forward_calibration(samples) {
            Ok(()) => {
                log::info!("Forward calibration started ({} samples)", samples);
                Ok(())
            }
            Err(err) => {
                log::warn!("Forward calibration rejected: {}", err);
                Err(err)
            }
        }
    }

    /// 手动设置前进方向并保存；返回是否保存成功。
    pub fn set_forward_direction(&mut self, vec: [f32; 3]) -> bool {
        self.imu.calibration_mut().set_forward_direction(vec);
        self.imu.refresh_vehicle_frame();
        match self.platform.save_calib(self.imu.calibration().data()) {
            Ok(()) => {
                log::info!("Forward direction set and saved");
                true
            }
            Err(err) => {
                log::warn!("Forward direction set but not saved: {}", err);
                false
            }
        }
    }

    /// 阶段完成沿：Done 时保存并刷新车辆坐标系，Failed 时告警一次。
    fn process_calibration_completion(&mut self) {
        let status = self.imu.calibration().status();
        if status == self.last_calib_status {
            return;
        }
        self.last_calib_status = status;
        match status {
            CalibStatus::Done => {
                let mode = self.imu.calibration().mode();
                log::info!("IMU calibration done ({})", mode.as_str());
                self.imu.refresh_vehicle_frame();
                match self.platform.save_calib(self.imu.calibration().data()) {
                    Ok(()) => log::info!("Calibration saved"),
                    Err(err) => log::warn!("Calibration save failed: {}", err),
                }
            }
            CalibStatus::Failed => log::warn!("IMU calibration FAILED (device moved?)"),
            CalibStatus::Idle | CalibStatus::Collecting => {}
        }
    }

    /// 校验、钳位并应用稳定配置；`persist` 时写入存储。
    pub fn set_stabilization_config(
        &mut self,
        config: StabilizationConfig,
        persist: bool,
    ) -> Result<StabilizationConfig, ConfigError> {
        let mut config = config;
        config.clamp();
        if !config.is_valid() {
            log::error!("Invalid stabilization config");
            return Err(ConfigError::Invalid);
        }
        self.apply_stab_config(config.clone());

        if persist {
            if let Err(err) = self.platform.save_stab_config(&config) {
                log::warn!("Failed to save stabilization config: {}", err);
                return Err(ConfigError::Persist(err.to_string()));
            }
            log::info!("Stabilization config saved");
        }
        Ok(config)
    }

    fn apply_stab_config(&mut self, config: StabilizationConfig) {
        self.imu.filter_mut().set_beta(config.madgwick_beta);
        self.imu
            .set_lpf(config.lpf_cutoff_hz, config.imu_sample_rate_hz);
        self.yaw_pid.set_gains(config.pid_gains());
        self.stab_config = config;
    }

    fn record_diagnostics(&mut self, now: u32, busy_us: u64) {
        self.diag.loops += 1;
        self.diag.busy_us_total += busy_us;
        self.diag.busy_us_max = self.diag.busy_us_max.max(busy_us);

        let elapsed = now.wrapping_sub(self.diag.start_ms);
        if elapsed < self.settings.diag_interval_ms || elapsed == 0 {
            return;
        }
        let loops = self.diag.loops.max(1);
        let loop_hz = self.diag.loops as u64 * 1000 / elapsed as u64;
        log::info!(
            "DIAG: loop {} Hz, avg {} us, max {} us, failsafe {}, calib {}",
            loop_hz,
            self.diag.busy_us_total / loops as u64,
            self.diag.busy_us_max,
            self.failsafe.state().as_str(),
            self.imu.calibration().status().as_str()
        );
        if self.imu.is_enabled() {
            let e = self.imu.euler_deg();
            log::info!(
                "DIAG: pitch {:.1} roll {:.1} yaw {:.1} deg",
                e.pitch,
                e.roll,
                e.yaw
            );
        }
        self.diag = LoopDiagnostics {
            start_ms: now,
            ..Default::default()
        };
    }

    /// 当前状态快照。
    pub fn status(&self) -> ControlStatus {
        let calibration = self.imu.calibration();
        ControlStatus {
            calib_status: calibration.status(),
            calib_stage: calibration.stage(),
            calib: *calibration.data(),
            failsafe: self.failsafe.state(),
            stab_config: self.stab_config.clone(),
            applied_throttle: self.applied_throttle,
            applied_steering: self.applied_steering,
        }
    }

    pub fn vehicle_status(&self) -> VehicleStatus {
        self.status().vehicle_status()
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn failsafe_state(&self) -> FailsafeState {
        self.failsafe.state()
    }

    pub fn calibration(&self) -> &ImuCalibration {
        self.imu.calibration()
    }

    pub fn imu(&self) -> &ImuHandler {
        &self.imu
    }

    pub fn stabilization_config(&self) -> &StabilizationConfig {
        &self.stab_config
    }

    /// 稳定系统当前权重（0..1）。
    pub fn stabilization_weight(&self) -> f32 {
        self.stab_weight
    }

    /// 仲裁后的指令（未经稳定与限速）。
    pub fn commanded(&self) -> RcCommand {
        self.commanded
    }

    /// 最近一次写入 PWM 的油门与转向。
    pub fn applied(&self) -> (f32, f32) {
        (self.applied_throttle, self.applied_steering)
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    /// 控制环主循环（不返回）。
    pub fn run(mut self) -> ! {
        loop {
            self.run_once();
        }
    }
}

impl<P: VehiclePlatform + Send + 'static> VehicleControl<P> {
    /// 初始化后在独立线程中运行控制环，返回控制句柄。
    pub fn spawn(mut self) -> Result<(ControlHandle, thread::JoinHandle<()>), InitError> {
        self.init()?;
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("vehicle_ctrl".to_string())
            .stack_size(CONTROL_TASK_STACK_SIZE)
            .spawn(move || self.run())
            .map_err(|err| InitError::Platform(PlatformError::Task(err.to_string())))?;
        Ok((handle, join))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu_calibration::ImuCalibData;
    use crate::model::ImuData;
    use crate::pipeline::{CommandSlot, ControlChannels};
    use crate::sim::SimPlatform;

    fn level_imu() -> ImuData {
        ImuData {
            az: 1.0,
            ..Default::default()
        }
    }

    fn build(settings: ControlSettings) -> VehicleControl<SimPlatform> {
        let commands = CommandSlot::new();
        let ControlChannels { handle, inbox } = ControlChannels::new(commands.clone());
        let platform = SimPlatform::new(1000).with_command_slot(commands);
        VehicleControl::new(platform, settings, handle, inbox)
    }

    fn calibrated_data() -> ImuCalibData {
        ImuCalibData {
            valid: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_init_fails_without_pwm() {
        let mut control = build(ControlSettings::default());
        control.platform_mut().fail_pwm_init(true);
        assert!(matches!(
            control.init(),
            Err(InitError::Platform(PlatformError::PwmInit(_)))
        ));
        assert!(!control.is_inited());
    }

    #[test]
    fn test_init_degrades_without_imu() {
        let mut control = build(ControlSettings::default());
        control.platform_mut().fail_imu_init(true);
        control.init().unwrap();
        assert!(control.is_inited());
        assert!(!control.imu().is_enabled());
        assert_eq!(control.calibration().status(), CalibStatus::Idle);
        assert_eq!(control.platform().neutral_count(), 1);
    }

    #[test]
    fn test_init_starts_boot_calibration_and_loads_store() {
        let mut control = build(ControlSettings::default());
        let mut stored = StabilizationConfig::default();
        stored.apply_mode_defaults(1);
        control.platform_mut().set_stored_stab_config(Some(stored.clone()));
        control.platform_mut().set_stored_calib(Some(ImuCalibData {
            gyro_bias: [1.0, 0.0, 0.0],
            valid: true,
            ..Default::default()
        }));
        control.init().unwrap();
        assert_eq!(control.stabilization_config(), &stored);
        assert_eq!(control.calibration().status(), CalibStatus::Collecting);
        assert_eq!(control.calibration().mode(), CalibMode::Full);
        // 启动标定期间沿用已保存的偏置
        assert!(control.calibration().is_valid());
        assert_eq!(control.calibration().data().gyro_bias[0], 1.0);
    }

    #[test]
    fn test_invalid_stored_config_falls_back_to_defaults() {
        let mut control = build(ControlSettings::default());
        let mut stored = StabilizationConfig::default();
        stored.magic = 0;
        control.platform_mut().set_stored_stab_config(Some(stored));
        control.init().unwrap();
        assert_eq!(control.stabilization_config(), &StabilizationConfig::default());
    }

    #[test]
    fn test_stored_config_clamped_on_load() {
        let mut settings = ControlSettings::with_control_period(20);
        settings.imu_read_interval_ms = 20;
        let mut control = build(settings);
        let mut stored = StabilizationConfig::default();
        stored.enabled = true;
        stored.mode = 9;
        stored.fade_ms = 60_000;
        stored.pid_max_integral = 50.0;
        stored.pitch_comp_enabled = true;
        stored.pitch_comp_gain = f32::NAN;
        stored.pitch_comp_max_correction = -0.1;
        control.platform_mut().set_stored_stab_config(Some(stored));
        control.platform_mut().set_stored_calib(Some(calibrated_data()));
        control.init().unwrap();

        let live = control.stabilization_config().clone();
        assert!(live.enabled);
        assert_eq!(live.mode, 0);
        assert_eq!(live.fade_ms, 5000);
        assert_eq!(live.pid_max_integral, 1.0);
        assert_eq!(live.pitch_comp_gain, StabilizationConfig::default().pitch_comp_gain);
        assert_eq!(live.pitch_comp_max_correction, 0.0);

        // 车头抬起，俯仰补偿参与计算
        control.platform_mut().set_imu(Some(ImuData {
            ax: -0.5,
            az: 0.87,
            ..Default::default()
        }));
        control.platform_mut().set_rc(Some(RcCommand::new(0.5, 0.0)));
        for _ in 0..10 {
            control.run_once();
        }
        assert!(control.stabilization_weight() > 0.0);
        let (throttle, _) = control.applied();
        assert!(throttle > 0.0 && throttle <= 1.0);
    }

    #[test]
    fn test_boot_calibration_completes_and_persists() {
        let mut settings = ControlSettings::default();
        settings.boot_calib_samples = 20;
        let mut control = build(settings);
        control.platform_mut().set_imu(Some(level_imu()));
        control.init().unwrap();
        for _ in 0..25 {
            control.run_once();
        }
        assert_eq!(control.calibration().status(), CalibStatus::Done);
        let stored = control.platform().stored_calib().copied().unwrap();
        assert!(stored.valid);
        assert!((stored.gravity_vec[2] - 1.0).abs() < 1e-6);
        assert!(control.imu().filter().uses_vehicle_frame());
    }

    #[test]
    fn test_rc_preferred_over_wifi() {
        let mut settings = ControlSettings::with_control_period(20);
        settings.slew_throttle_per_sec = 100.0;
        settings.slew_steering_per_sec = 100.0;
        let mut control = build(settings);
        control.platform_mut().fail_imu_init(true);
        control.init().unwrap();

        control.platform_mut().set_rc(Some(RcCommand::new(0.4, 0.1)));
        control.platform_mut().push_wifi_command(RcCommand::new(-0.8, -0.8));
        control.run_once();
        assert_eq!(control.commanded(), RcCommand::new(0.4, 0.1));

        control.platform_mut().set_rc(None);
        control.platform_mut().push_wifi_command(RcCommand::new(-0.8, -0.8));
        control.run_once();
        assert_eq!(control.commanded(), RcCommand::new(-0.8, -0.8));
        let last = control.platform().last_pwm().unwrap();
        assert!((last.throttle + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_slew_rate_limits_pwm() {
        let settings = ControlSettings::with_control_period(20);
        let mut control = build(settings);
        control.platform_mut().fail_imu_init(true);
        control.init().unwrap();
        control.platform_mut().set_rc(Some(RcCommand::new(1.0, 1.0)));
        control.run_once();
        // 20 ms × 0.5/s = 0.01；转向 20 ms × 1.0/s = 0.02
        let (throttle, steering) = control.applied();
        assert!((throttle - 0.01).abs() < 1e-6);
        assert!((steering - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_failsafe_without_any_source() {
        let settings = ControlSettings::with_control_period(20);
        let mut control = build(settings);
        control.platform_mut().fail_imu_init(true);
        control.init().unwrap();
        control.run_once();
        assert_eq!(control.failsafe_state(), FailsafeState::Active);
        assert_eq!(control.platform().failsafe_events(), &[true]);
        assert_eq!(control.vehicle_status(), VehicleStatus::Failsafe);

        control.platform_mut().set_rc(Some(RcCommand::new(0.2, 0.0)));
        control.run_once();
        assert_eq!(control.failsafe_state(), FailsafeState::Recovering);
        control.run_once();
        assert_eq!(control.failsafe_state(), FailsafeState::Inactive);
        assert_eq!(control.platform().failsafe_events(), &[true, false]);
    }

    #[test]
    fn test_set_stabilization_config_applies_and_persists() {
        let mut control = build(ControlSettings::default());
        control.init().unwrap();
        let mut cfg = StabilizationConfig::default();
        cfg.madgwick_beta = 5.0;
        cfg.lpf_cutoff_hz = 40.0;
        cfg.enabled = true;
        let applied = control.set_stabilization_config(cfg, true).unwrap();
        assert_eq!(applied.madgwick_beta, 1.0);
        assert_eq!(control.imu().filter().beta(), 1.0);
        assert_eq!(control.platform().stored_stab_config(), Some(&applied));

        control.platform_mut().fail_storage(true);
        let result = control.set_stabilization_config(StabilizationConfig::default(), true);
        assert!(matches!(result, Err(ConfigError::Persist(_))));
        // 保存失败时配置仍已生效
        assert!(!control.stabilization_config().enabled);
    }

    #[test]
    fn test_set_stabilization_config_rejects_bad_magic() {
        let mut control = build(ControlSettings::default());
        control.init().unwrap();
        let mut cfg = StabilizationConfig::default();
        cfg.magic = 1;
        assert_eq!(
            control.set_stabilization_config(cfg, false),
            Err(ConfigError::Invalid)
        );
    }

    #[test]
    fn test_stabilization_fades_in_and_corrects_yaw() {
        let mut settings = ControlSettings::with_control_period(20);
        settings.imu_read_interval_ms = 20;
        settings.slew_steering_per_sec = 100.0;
        let mut control = build(settings);
        control.platform_mut().set_stored_calib(Some(calibrated_data()));
        control.init().unwrap();
        // 车辆在原地以 30 dps 偏航，摇杆居中
        control.platform_mut().set_imu(Some(ImuData {
            az: 1.0,
            gz: 30.0,
            ..Default::default()
        }));
        control.platform_mut().set_rc(Some(RcCommand::neutral()));

        let mut cfg = StabilizationConfig::default();
        cfg.enabled = true;
        cfg.fade_ms = 100;
        cfg.imu_sample_rate_hz = 100.0;
        cfg.lpf_cutoff_hz = 20.0;
        control.set_stabilization_config(cfg, false).unwrap();

        control.run_once();
        assert!((control.stabilization_weight() - 0.2).abs() < 1e-6);
        for _ in 0..10 {
            control.run_once();
        }
        assert_eq!(control.stabilization_weight(), 1.0);
        let (_, steering) = control.applied();
        assert!(steering < 0.0, "correction opposes yaw, got {}", steering);
        assert!(steering >= -0.3 - 1e-6);

        let mut cfg = control.stabilization_config().clone();
        cfg.enabled = false;
        control.set_stabilization_config(cfg, false).unwrap();
        for _ in 0..6 {
            control.run_once();
        }
        assert_eq!(control.stabilization_weight(), 0.0);
    }
}
