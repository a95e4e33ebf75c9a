use std::ffi::c_void;
use std::sync::mpsc::{SyncSender, TrySendError};

use esp_idf_hal::gpio::{AnyIOPin, Input, InputPin, OutputPin, PinDriver};
use esp_idf_hal::ledc::{config::TimerConfig, LedcChannel, LedcDriver, LedcTimer, LedcTimerDriver, Resolution};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::prelude::*;
use esp_idf_hal::spi::config::{Config as SpiConfig, DriverConfig, MODE_3};
use esp_idf_hal::spi::{SpiAnyPins, SpiDeviceDriver, SpiDriver};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::{self, EspError};

use rc_vehicle::imu_calibration::ImuCalibData;
use rc_vehicle::model::{normalized_to_pulse_us, pulse_us_to_normalized, ImuData, RcCommand};
use rc_vehicle::pipeline::CommandSlot;
use rc_vehicle::platform::{PlatformError, VehiclePlatform};
use rc_vehicle::rc_pulse::PulseChannel;
use rc_vehicle::serial::TelemetryData;
use rc_vehicle::stabilization::StabilizationConfig;
use rc_vehicle::storage::{
    calib_from_bytes, calib_to_bytes, stab_from_bytes, stab_to_bytes, BLOB_KEY, CALIB_BLOB_LEN,
    CALIB_NAMESPACE, STAB_BLOB_LEN, STAB_NAMESPACE,
};

use crate::web_server::WsClients;

const PWM_FREQUENCY_HZ: u32 = 50;
const PWM_PERIOD_US: u32 = 1_000_000 / PWM_FREQUENCY_HZ;
const PWM_NEUTRAL_US: u16 = 1500;

const IMU_SPI_BAUD_KHZ: u32 = 500;

// MPU-6050/6500 寄存器
const REG_SMPLRT_DIV: u8 = 0x19;
const REG_CONFIG: u8 = 0x1A;
const REG_GYRO_CONFIG: u8 = 0x1B;
const REG_ACCEL_CONFIG: u8 = 0x1C;
const REG_ACCEL_XOUT_H: u8 = 0x3B;
const REG_USER_CTRL: u8 = 0x6A;
const REG_PWR_MGMT_1: u8 = 0x6B;
const REG_WHO_AM_I: u8 = 0x75;
const SPI_READ: u8 = 0x80;

/// ±4 g
const ACCEL_LSB_PER_G: f32 = 8192.0;
/// ±500 °/s
const GYRO_LSB_PER_DPS: f32 = 65.5;

/// 舵机/电调 PWM 输出（LEDC，50 Hz，14 bit）。
pub struct ServoPwm {
    throttle: LedcDriver<'static>,
    steering: LedcDriver<'static>,
}

impl ServoPwm {
    pub fn new<T, C0, C1>(
        timer: impl Peripheral<P = T> + 'static,
        throttle_channel: impl Peripheral<P = C0> + 'static,
        steering_channel: impl Peripheral<P = C1> + 'static,
        throttle_pin: impl Peripheral<P = impl OutputPin> + 'static,
        steering_pin: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> Result<Self, EspError>
    where
        T: LedcTimer + 'static,
        C0: LedcChannel<SpeedMode = T::SpeedMode>,
        C1: LedcChannel<SpeedMode = T::SpeedMode>,
    {
        let config = TimerConfig::new()
            .frequency(PWM_FREQUENCY_HZ.Hz().into())
            .resolution(Resolution::Bits14);
        // 定时器驱动常驻，两路通道共用
        let timer: &'static _ = Box::leak(Box::new(LedcTimerDriver::new(timer, &config)?));
        let throttle = LedcDriver::new(throttle_channel, timer, throttle_pin)?;
        let steering = LedcDriver::new(steering_channel, timer, steering_pin)?;
        Ok(Self { throttle, steering })
    }

    fn duty_for(driver: &LedcDriver<'static>, pulse_us: u16) -> u32 {
        driver.get_max_duty() * pulse_us as u32 / PWM_PERIOD_US
    }

    fn write_pulses(&mut self, throttle_us: u16, steering_us: u16) -> Result<(), EspError> {
        let duty = Self::duty_for(&self.throttle, throttle_us);
        self.throttle.set_duty(duty)?;
        let duty = Self::duty_for(&self.steering, steering_us);
        self.steering.set_duty(duty)?;
        Ok(())
    }
}

/// SPI 接口的 MPU-6050/6500。
pub struct Mpu6050 {
    spi: SpiDeviceDriver<'static, SpiDriver<'static>>,
    who_am_i: Option<u8>,
}

impl Mpu6050 {
    pub fn new<S: SpiAnyPins>(
        spi: impl Peripheral<P = S> + 'static,
        sclk: impl Peripheral<P = impl OutputPin> + 'static,
        mosi: impl Peripheral<P = impl OutputPin> + 'static,
        miso: impl Peripheral<P = impl InputPin> + 'static,
        cs: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> Result<Self, EspError> {
        let driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &DriverConfig::new())?;
        let config = SpiConfig::new()
            .baudrate(IMU_SPI_BAUD_KHZ.kHz().into())
            .data_mode(MODE_3);
        let spi = SpiDeviceDriver::new(driver, Some(cs), &config)?;
        Ok(Self { spi, who_am_i: None })
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), EspError> {
        self.spi.write(&[reg & !SPI_READ, value])
    }

    fn read_regs(&mut self, reg: u8, out: &mut [u8]) -> Result<(), EspError> {
        let mut buf = [0u8; 15];
        let len = out.len().min(buf.len() - 1);
        buf[0] = reg | SPI_READ;
        self.spi.transfer_in_place(&mut buf[..=len])?;
        out[..len].copy_from_slice(&buf[1..=len]);
        Ok(())
    }

    /// 复位并配置量程；WHO_AM_I 不匹配返回 `false`。
    fn configure(&mut self) -> Result<bool, EspError> {
        self.write_reg(REG_PWR_MGMT_1, 0x80)?;
        esp_idf_hal::delay::FreeRtos::delay_ms(100);
        // 唤醒并选用陀螺 X 轴时钟，关闭 I2C 接口
        self.write_reg(REG_PWR_MGMT_1, 0x01)?;
        self.write_reg(REG_USER_CTRL, 0x10)?;
        let mut who = [0u8; 1];
        self.read_regs(REG_WHO_AM_I, &mut who)?;
        self.who_am_i = Some(who[0]);
        if !matches!(who[0], 0x68 | 0x70 | 0x71) {
            return Ok(false);
        }
        self.write_reg(REG_CONFIG, 0x01)?;
        self.write_reg(REG_SMPLRT_DIV, 0x01)?;
        self.write_reg(REG_GYRO_CONFIG, 0x08)?;
        self.write_reg(REG_ACCEL_CONFIG, 0x08)?;
        Ok(true)
    }

    fn read(&mut self) -> Result<ImuData, EspError> {
        let mut raw = [0u8; 14];
        self.read_regs(REG_ACCEL_XOUT_H, &mut raw)?;
        let word = |i: usize| i16::from_be_bytes([raw[i], raw[i + 1]]) as f32;
        Ok(ImuData {
            ax: word(0) / ACCEL_LSB_PER_G,
            ay: word(2) / ACCEL_LSB_PER_G,
            az: word(4) / ACCEL_LSB_PER_G,
            gx: word(8) / GYRO_LSB_PER_DPS,
            gy: word(10) / GYRO_LSB_PER_DPS,
            gz: word(12) / GYRO_LSB_PER_DPS,
        })
    }
}

static RC_CHANNELS: [PulseChannel; 2] = [PulseChannel::new(), PulseChannel::new()];

unsafe extern "C" fn on_rc_edge(arg: *mut c_void) {
    let channel = &*(arg as *const PulseChannel);
    let level_high = sys::gpio_get_level(channel.gpio() as i32) != 0;
    channel.on_edge(level_high, sys::esp_timer_get_time() as u64);
}

/// RC 接收机输入（CH1 油门，CH2 转向）。
pub struct RcPulseInput {
    pins: [PinDriver<'static, AnyIOPin, Input>; 2],
}

impl RcPulseInput {
    pub fn new(throttle_pin: AnyIOPin, steering_pin: AnyIOPin) -> Result<Self, EspError> {
        let pins = [PinDriver::input(throttle_pin)?, PinDriver::input(steering_pin)?];
        Ok(Self { pins })
    }

    fn start(&mut self) -> Result<(), EspError> {
        let err = unsafe { sys::gpio_install_isr_service(0) };
        if err != sys::ESP_ERR_INVALID_STATE as i32 {
            EspError::convert(err)?;
        }
        for (pin, channel) in self.pins.iter().zip(RC_CHANNELS.iter()) {
            let gpio = pin.pin();
            channel.set_gpio(gpio as u32);
            unsafe {
                EspError::convert(sys::gpio_set_intr_type(
                    gpio,
                    sys::gpio_int_type_t_GPIO_INTR_ANYEDGE,
                ))?;
                EspError::convert(sys::gpio_isr_handler_add(
                    gpio,
                    Some(on_rc_edge),
                    channel as *const PulseChannel as *mut c_void,
                ))?;
                EspError::convert(sys::gpio_intr_enable(gpio))?;
            }
        }
        Ok(())
    }

    fn read(&self, now_ms: u32) -> Option<RcCommand> {
        let throttle = RC_CHANNELS[0].pulse_at(now_ms)?;
        let steering = RC_CHANNELS[1].pulse_at(now_ms)?;
        Some(RcCommand::new(
            pulse_us_to_normalized(throttle),
            pulse_us_to_normalized(steering),
        ))
    }
}

/// ESP32-S3 平台实现。
pub struct EspPlatform {
    pwm: Result<ServoPwm, EspError>,
    pwm_ready: bool,
    rc: Result<RcPulseInput, EspError>,
    rc_ready: bool,
    imu: Result<Mpu6050, EspError>,
    imu_ready: bool,
    nvs: Option<EspDefaultNvsPartition>,
    commands: CommandSlot,
    clients: WsClients,
    telem_tx: SyncSender<String>,
    link_tx: Option<SyncSender<TelemetryData>>,
    last_wake: Option<sys::TickType_t>,
}

impl EspPlatform {
    pub fn new(
        pwm: Result<ServoPwm, EspError>,
        rc: Result<RcPulseInput, EspError>,
        imu: Result<Mpu6050, EspError>,
        nvs: Option<EspDefaultNvsPartition>,
        commands: CommandSlot,
        clients: WsClients,
        telem_tx: SyncSender<String>,
    ) -> Self {
        Self {
            pwm,
            pwm_ready: false,
            rc,
            rc_ready: false,
            imu,
            imu_ready: false,
            nvs,
            commands,
            clients,
            telem_tx,
            link_tx: None,
            last_wake: None,
        }
    }

    /// 附加伴随处理器的串口遥测通道。
    pub fn with_link(mut self, link_tx: SyncSender<TelemetryData>) -> Self {
        self.link_tx = Some(link_tx);
        self
    }

    fn open_nvs(&self, namespace: &str) -> Result<EspNvs<NvsDefault>, PlatformError> {
        let partition = self
            .nvs
            .clone()
            .ok_or_else(|| PlatformError::Storage("NVS partition unavailable".to_string()))?;
        EspNvs::new(partition, namespace, true).map_err(|err| PlatformError::Storage(err.to_string()))
    }

    fn write_pulses(&mut self, throttle_us: u16, steering_us: u16) {
        if !self.pwm_ready {
            return;
        }
        if let Ok(pwm) = self.pwm.as_mut() {
            if let Err(err) = pwm.write_pulses(throttle_us, steering_us) {
                log::warn!("PWM update failed: {:?}", err);
            }
        }
    }
}

impl VehiclePlatform for EspPlatform {
    fn init_pwm(&mut self) -> Result<(), PlatformError> {
        let pwm = self
            .pwm
            .as_mut()
            .map_err(|err| PlatformError::PwmInit(err.to_string()))?;
        pwm.write_pulses(PWM_NEUTRAL_US, PWM_NEUTRAL_US)
            .map_err(|err| PlatformError::PwmInit(err.to_string()))?;
        self.pwm_ready = true;
        Ok(())
    }

    fn init_rc(&mut self) -> Result<(), PlatformError> {
        let rc = self
            .rc
            .as_mut()
            .map_err(|err| PlatformError::RcInit(err.to_string()))?;
        rc.start().map_err(|err| PlatformError::RcInit(err.to_string()))?;
        self.rc_ready = true;
        Ok(())
    }

    fn init_imu(&mut self) -> Result<(), PlatformError> {
        let imu = self
            .imu
            .as_mut()
            .map_err(|err| PlatformError::ImuInit(err.to_string()))?;
        match imu.configure() {
            Ok(true) => {
                self.imu_ready = true;
                Ok(())
            }
            Ok(false) => Err(PlatformError::ImuInit("unexpected WHO_AM_I".to_string())),
            Err(err) => Err(PlatformError::ImuInit(err.to_string())),
        }
    }

    fn init_failsafe(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn now_ms(&self) -> u32 {
        (self.now_us() / 1000) as u32
    }

    fn now_us(&self) -> u64 {
        unsafe { sys::esp_timer_get_time() as u64 }
    }

    fn read_imu(&mut self) -> Option<ImuData> {
        if !self.imu_ready {
            return None;
        }
        self.imu.as_mut().ok()?.read().ok()
    }

    fn imu_who_am_i(&self) -> Option<u8> {
        self.imu.as_ref().ok().and_then(|imu| imu.who_am_i)
    }

    fn load_calib(&mut self) -> Option<ImuCalibData> {
        let nvs = self.open_nvs(CALIB_NAMESPACE).ok()?;
        let mut buf = [0u8; CALIB_BLOB_LEN];
        let blob = nvs.get_blob(BLOB_KEY, &mut buf).ok()??;
        match calib_from_bytes(blob) {
            Ok(data) if data.valid => Some(data),
            Ok(_) => None,
            Err(err) => {
                log::warn!("Stored calibration rejected: {}", err);
                None
            }
        }
    }

    fn save_calib(&mut self, data: &ImuCalibData) -> Result<(), PlatformError> {
        let mut nvs = self.open_nvs(CALIB_NAMESPACE)?;
        nvs.set_blob(BLOB_KEY, &calib_to_bytes(data))
            .map_err(|err| PlatformError::Storage(err.to_string()))
    }

    fn load_stab_config(&mut self) -> Option<StabilizationConfig> {
        let nvs = self.open_nvs(STAB_NAMESPACE).ok()?;
        let mut buf = [0u8; STAB_BLOB_LEN];
        let blob = nvs.get_blob(BLOB_KEY, &mut buf).ok()??;
        match stab_from_bytes(blob) {
            Ok(config) => Some(config),
            Err(err) => {
                log::warn!("Stored stabilization config rejected: {}", err);
                None
            }
        }
    }

    fn save_stab_config(&mut self, config: &StabilizationConfig) -> Result<(), PlatformError> {
        let mut nvs = self.open_nvs(STAB_NAMESPACE)?;
        nvs.set_blob(BLOB_KEY, &stab_to_bytes(config))
            .map_err(|err| PlatformError::Storage(err.to_string()))
    }

    fn read_rc(&mut self) -> Option<RcCommand> {
        if !self.rc_ready {
            return None;
        }
        let now_ms = self.now_ms();
        self.rc.as_ref().ok()?.read(now_ms)
    }

    fn set_pwm(&mut self, throttle: f32, steering: f32) {
        self.write_pulses(normalized_to_pulse_us(throttle), normalized_to_pulse_us(steering));
    }

    fn set_pwm_neutral(&mut self) {
        self.write_pulses(PWM_NEUTRAL_US, PWM_NEUTRAL_US);
    }

    fn on_failsafe_changed(&mut self, active: bool) {
        if active {
            log::warn!("Outputs forced to neutral");
        }
    }

    fn client_count(&self) -> usize {
        self.clients.count()
    }

    fn send_telem(&mut self, json: &str) {
        // 广播线程繁忙时丢弃本帧
        if let Err(TrySendError::Disconnected(_)) = self.telem_tx.try_send(json.to_string()) {
            log::warn!("Telemetry broadcaster stopped");
        }
    }

    fn send_link_telem(&mut self, data: &TelemetryData) {
        if let Some(tx) = &self.link_tx {
            let _ = tx.try_send(*data);
        }
    }

    fn try_receive_wifi_command(&mut self) -> Option<RcCommand> {
        self.commands.try_take()
    }

    fn wait_next_tick(&mut self, period_ms: u32) {
        let ticks = (period_ms * sys::configTICK_RATE_HZ / 1000).max(1);
        let mut last_wake = match self.last_wake {
            Some(tick) => tick,
            None => unsafe { sys::xTaskGetTickCount() },
        };
        unsafe {
            sys::xTaskDelayUntil(&mut last_wake, ticks);
        }
        self.last_wake = Some(last_wake);
    }
}
