use crate::imu_calibration::ImuCalibData;
use crate::model::{ImuData, RcCommand};
use crate::pipeline::CommandSlot;
use crate::platform::{PlatformError, VehiclePlatform};
use crate::serial::TelemetryData;
use crate::stabilization::StabilizationConfig;

/// 一次 PWM 输出记录。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PwmRecord {
    pub at_ms: u32,
    pub throttle: f32,
    pub steering: f32,
}

/// 主机侧仿真平台：虚拟时钟、脚本化输入、内存存储，记录全部输出。
#[derive(Debug)]
pub struct SimPlatform {
    now_ms: u32,
    rc: Option<RcCommand>,
    imu: Option<ImuData>,
    imu_reads: u32,
    commands: CommandSlot,
    pwm: Vec<PwmRecord>,
    neutral_count: u32,
    failsafe_events: Vec<bool>,
    clients: usize,
    telemetry: Vec<String>,
    link_frames: Vec<TelemetryData>,
    calib_store: Option<ImuCalibData>,
    stab_store: Option<StabilizationConfig>,
    fail_pwm_init: bool,
    fail_imu_init: bool,
    fail_storage: bool,
}

impl SimPlatform {
    pub fn new(start_ms: u32) -> Self {
        Self {
            now_ms: start_ms,
            rc: None,
            imu: None,
            imu_reads: 0,
            commands: CommandSlot::new(),
            pwm: Vec::new(),
            neutral_count: 0,
            failsafe_events: Vec::new(),
            clients: 0,
            telemetry: Vec::new(),
            link_frames: Vec::new(),
            calib_store: None,
            stab_store: None,
            fail_pwm_init: false,
            fail_imu_init: false,
            fail_storage: false,
        }
    }

    /// 使用外部共享的无线指令槽。
    pub fn with_command_slot(mut self, commands: CommandSlot) -> Self {
        self.commands = commands;
        self
    }

    pub fn set_time(&mut self, now_ms: u32) {
        self.now_ms = now_ms;
    }

    pub fn set_rc(&mut self, rc: Option<RcCommand>) {
        self.rc = rc;
    }

    pub fn set_imu(&mut self, imu: Option<ImuData>) {
        self.imu = imu;
    }

    pub fn push_wifi_command(&mut self, cmd: RcCommand) {
        self.commands.send(cmd.throttle(), cmd.steering());
    }

    pub fn command_slot(&self) -> CommandSlot {
        self.commands.clone()
    }

    pub fn set_client_count(&mut self, clients: usize) {
        self.clients = clients;
    }

    pub fn set_stored_calib(&mut self, data: Option<ImuCalibData>) {
        self.calib_store = data;
    }

    pub fn stored_calib(&self) -> Option<&ImuCalibData> {
        self.calib_store.as_ref()
    }

    pub fn set_stored_stab_config(&mut self, config: Option<StabilizationConfig>) {
        self.stab_store = config;
    }

    pub fn stored_stab_config(&self) -> Option<&StabilizationConfig> {
        self.stab_store.as_ref()
    }

    pub fn fail_pwm_init(&mut self, fail: bool) {
        self.fail_pwm_init = fail;
    }

    pub fn fail_imu_init(&mut self, fail: bool) {
        self.fail_imu_init = fail;
    }

    pub fn fail_storage(&mut self, fail: bool) {
        self.fail_storage = fail;
    }

    pub fn imu_reads(&self) -> u32 {
        self.imu_reads
    }

    pub fn pwm_outputs(&self) -> &[PwmRecord] {
        &self.pwm
    }

    pub fn last_pwm(&self) -> Option<PwmRecord> {
        self.pwm.last().copied()
    }

    pub fn neutral_count(&self) -> u32 {
        self.neutral_count
    }

    pub fn failsafe_events(&self) -> &[bool] {
        &self.failsafe_events
    }

    pub fn telemetry(&self) -> &[String] {
        &self.telemetry
    }

    pub fn take_telemetry(&mut self) -> Vec<String> {
        std::mem::take(&mut self.telemetry)
    }

    pub fn link_frames(&self) -> &[TelemetryData] {
        &self.link_frames
    }

    fn storage_check(&self) -> Result<(), PlatformError> {
        if self.fail_storage {
            return Err(PlatformError::Storage("simulated write failure".to_string()));
        }
        Ok(())
    }
}

impl VehiclePlatform for SimPlatform {
    fn init_pwm(&mut self) -> Result<(), PlatformError> {
        if self.fail_pwm_init {
            return Err(PlatformError::PwmInit("LEDC timer unavailable".to_string()));
        }
        Ok(())
    }

    fn init_rc(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn init_imu(&mut self) -> Result<(), PlatformError> {
        if self.fail_imu_init {
            return Err(PlatformError::ImuInit("no response".to_string()));
        }
        Ok(())
    }

    fn init_failsafe(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn now_ms(&self) -> u32 {
        self.now_ms
    }

    fn now_us(&self) -> u64 {
        self.now_ms as u64 * 1000
    }

    fn read_imu(&mut self) -> Option<ImuData> {
        self.imu_reads += 1;
        self.imu
    }

    fn imu_who_am_i(&self) -> Option<u8> {
        if self.fail_imu_init {
            None
        } else {
            Some(0x68)
        }
    }

    fn load_calib(&mut self) -> Option<ImuCalibData> {
        self.calib_store
    }

    fn save_calib(&mut self, data: &ImuCalibData) -> Result<(), PlatformError> {
        self.storage_check()?;
        self.calib_store = Some(*data);
        Ok(())
    }

    fn load_stab_config(&mut self) -> Option<StabilizationConfig> {
        self.stab_store.clone()
    }

    fn save_stab_config(&mut self, config: &StabilizationConfig) -> Result<(), PlatformError> {
        self.storage_check()?;
        self.stab_store = Some(config.clone());
        Ok(())
    }

    fn read_rc(&mut self) -> Option<RcCommand> {
        self.rc
    }

    fn set_pwm(&mut self, throttle: f32, steering: f32) {
        self.pwm.push(PwmRecord {
            at_ms: self.now_ms,
            throttle,
            steering,
        });
    }

    fn set_pwm_neutral(&mut self) {
        self.neutral_count += 1;
    }

    fn on_failsafe_changed(&mut self, active: bool) {
        self.failsafe_events.push(active);
    }

    fn client_count(&self) -> usize {
        self.clients
    }

    fn send_telem(&mut self, json: &str) {
        self.telemetry.push(json.to_string());
    }

    fn send_link_telem(&mut self, data: &TelemetryData) {
        self.link_frames.push(*data);
    }

    fn try_receive_wifi_command(&mut self) -> Option<RcCommand> {
        self.commands.try_take()
    }

    fn wait_next_tick(&mut self, period_ms: u32) {
        self.now_ms = self.now_ms.wrapping_add(period_ms);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_advances_per_tick() {
        let mut sim = SimPlatform::new(1000);
        sim.wait_next_tick(20);
        sim.wait_next_tick(20);
        assert_eq!(sim.now_ms(), 1040);
        assert_eq!(sim.now_us(), 1_040_000);
        sim.set_time(u32::MAX - 5);
        sim.wait_next_tick(10);
        assert_eq!(sim.now_ms(), 4);
    }

    #[test]
    fn test_store_round_trip_and_write_failure() {
        let mut sim = SimPlatform::new(0);
        assert_eq!(sim.load_calib(), None);
        let data = ImuCalibData {
            gyro_bias: [0.5, -0.25, 0.0],
            valid: true,
            ..Default::default()
        };
        sim.save_calib(&data).unwrap();
        assert_eq!(sim.load_calib(), Some(data));

        let mut cfg = StabilizationConfig::default();
        cfg.enabled = true;
        sim.save_stab_config(&cfg).unwrap();
        assert_eq!(sim.load_stab_config(), Some(cfg.clone()));

        // 写入失败时保留原有内容
        sim.fail_storage(true);
        assert!(matches!(
            sim.save_calib(&ImuCalibData::default()),
            Err(PlatformError::Storage(_))
        ));
        assert!(matches!(
            sim.save_stab_config(&StabilizationConfig::default()),
            Err(PlatformError::Storage(_))
        ));
        assert_eq!(sim.stored_calib(), Some(&data));
        assert_eq!(sim.stored_stab_config(), Some(&cfg));
    }

    #[test]
    fn test_init_failure_injection() {
        let mut sim = SimPlatform::new(0);
        assert!(sim.init_pwm().is_ok());
        assert!(sim.init_imu().is_ok());
        assert_eq!(sim.imu_who_am_i(), Some(0x68));

        sim.fail_pwm_init(true);
        sim.fail_imu_init(true);
        assert!(matches!(sim.init_pwm(), Err(PlatformError::PwmInit(_))));
        assert!(matches!(sim.init_imu(), Err(PlatformError::ImuInit(_))));
        assert_eq!(sim.imu_who_am_i(), None);
    }

    #[test]
    fn test_command_slot_shared_and_latest_wins() {
        let slot = CommandSlot::new();
        let mut sim = SimPlatform::new(0).with_command_slot(slot.clone());
        assert_eq!(sim.try_receive_wifi_command(), None);

        slot.send(0.2, 0.1);
        sim.push_wifi_command(RcCommand::new(-0.3, 0.4));
        assert_eq!(
            sim.try_receive_wifi_command(),
            Some(RcCommand::new(-0.3, 0.4))
        );
        assert_eq!(sim.try_receive_wifi_command(), None);

        // 发送端钳位
        sim.command_slot().send(3.0, -2.0);
        assert_eq!(
            sim.try_receive_wifi_command(),
            Some(RcCommand::new(1.0, -1.0))
        );
    }

    #[test]
    fn test_outputs_recorded() {
        let mut sim = SimPlatform::new(500);
        sim.set_imu(Some(ImuData {
            az: 1.0,
            ..Default::default()
        }));
        assert!(sim.read_imu().is_some());
        assert_eq!(sim.imu_reads(), 1);

        sim.set_pwm(0.25, -0.5);
        sim.set_pwm_neutral();
        sim.on_failsafe_changed(true);
        assert_eq!(
            sim.last_pwm(),
            Some(PwmRecord {
                at_ms: 500,
                throttle: 0.25,
                steering: -0.5,
            })
        );
        assert_eq!(sim.neutral_count(), 1);
        assert_eq!(sim.failsafe_events(), &[true]);

        sim.send_telem("{\"type\":\"telem\"}");
        assert_eq!(sim.take_telemetry().len(), 1);
        assert!(sim.telemetry().is_empty());
    }
}
