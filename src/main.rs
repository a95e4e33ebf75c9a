// 固件入口：ESP-IDF 目标接入真实外设，主机上运行虚拟时钟仿真
#[cfg(target_os = "espidf")]
mod esp_platform;
#[cfg(target_os = "espidf")]
mod net;
#[cfg(target_os = "espidf")]
mod smart_led;
#[cfg(target_os = "espidf")]
mod uart_link;
#[cfg(target_os = "espidf")]
mod web_server;

#[cfg(target_os = "espidf")]
fn main() {
    use std::sync::mpsc;

    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, IOPin};
    use esp_idf_hal::prelude::*;
    use esp_idf_hal::uart;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use rc_vehicle::control::VehicleControl;
    use rc_vehicle::model::ControlSettings;
    use rc_vehicle::pipeline::{CommandSlot, ControlChannels};

    use esp_platform::{EspPlatform, Mpu6050, RcPulseInput, ServoPwm};
    use web_server::WsClients;

    /// 待广播遥测深度（超出即丢帧）。
    const TELEM_QUEUE_DEPTH: usize = 4;

    // ESP-IDF 运行时初始化（链接补丁 & 日志）
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("RC vehicle booting (ESP-IDF)...");

    let peripherals = match Peripherals::take() {
        Ok(peripherals) => peripherals,
        Err(err) => {
            log::error!("Peripherals unavailable: {:?}", err);
            return;
        }
    };
    let pins = peripherals.pins;
    let nvs = match EspDefaultNvsPartition::take() {
        Ok(nvs) => Some(nvs),
        Err(err) => {
            log::warn!("NVS unavailable, settings will not persist: {:?}", err);
            None
        }
    };

    // 外设：LEDC PWM（ESC GPIO14，舵机 GPIO21）、RC 输入（GPIO16/17）、SPI IMU
    let pwm = ServoPwm::new(
        peripherals.ledc.timer0,
        peripherals.ledc.channel0,
        peripherals.ledc.channel1,
        pins.gpio14,
        pins.gpio21,
    );
    let rc = RcPulseInput::new(pins.gpio16.downgrade(), pins.gpio17.downgrade());
    let imu = Mpu6050::new(peripherals.spi2, pins.gpio12, pins.gpio11, pins.gpio13, pins.gpio10);

    let commands = CommandSlot::new();
    let clients = WsClients::new();
    let (telem_tx, telem_rx) = mpsc::sync_channel(TELEM_QUEUE_DEPTH);
    let mut platform = EspPlatform::new(
        pwm,
        rc,
        imu,
        nvs.clone(),
        commands.clone(),
        clients.clone(),
        telem_tx,
    );

    // 可选：伴随处理器串口链路（编译期 RC_UART_LINK=1 开启）
    if option_env!("RC_UART_LINK") == Some("1") {
        let uart_config = uart::config::Config::new().baudrate(Hertz(115_200));
        match uart::UartDriver::new(
            peripherals.uart1,
            pins.gpio4,
            pins.gpio5,
            AnyInputPin::none(),
            AnyOutputPin::none(),
            &uart_config,
        ) {
            Ok(uart) => {
                let (link_tx, link_rx) = mpsc::sync_channel(2);
                platform = platform.with_link(link_tx);
                let _link_handle = uart_link::spawn_link_task(uart, link_rx, commands.clone());
                log::info!("UART link enabled");
            }
            Err(err) => log::warn!("UART link init failed: {:?}", err),
        }
    }

    // 控制环：独立线程，固定周期
    let ControlChannels { handle, inbox } = ControlChannels::new(commands);
    let control = VehicleControl::new(platform, ControlSettings::default(), handle, inbox);
    let (handle, _control_handle) = match control.spawn() {
        Ok(spawned) => spawned,
        Err(err) => {
            log::error!("Vehicle control failed to start: {}", err);
            loop {
                FreeRtos::delay_ms(1000);
            }
        }
    };

    // 状态灯任务
    smart_led::spawn_led_task(peripherals.rmt.channel0, pins.gpio48, handle.clone());

    // 软 AP（失败不影响 RC 遥控）
    let _wifi = match net::start_access_point(peripherals.modem, nvs) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            log::warn!("Wi-Fi AP start failed: {}", err);
            None
        }
    };

    // 控制页与 WebSocket
    let _telem_handle = web_server::spawn_telem_broadcaster(clients.clone(), telem_rx);
    let _server = match web_server::start_server(handle, clients) {
        Ok(server) => Some(server),
        Err(err) => {
            log::warn!("Web server start failed: {:?}", err);
            None
        }
    };

    // 主循环保持任务存活
    loop {
        FreeRtos::delay_ms(1000);
    }
}

/// 主机仿真：开机标定、RC 驾驶、信号丢失触发失控保护，逐行输出遥测 JSON。
#[cfg(not(target_os = "espidf"))]
fn main() {
    use rc_vehicle::control::VehicleControl;
    use rc_vehicle::model::{ControlSettings, ImuData, RcCommand};
    use rc_vehicle::pipeline::{CommandSlot, ControlChannels};
    use rc_vehicle::platform::VehiclePlatform;
    use rc_vehicle::sim::SimPlatform;

    const START_MS: u32 = 1000;
    const DRIVE_FROM_MS: u32 = 3500;
    const SIGNAL_LOST_MS: u32 = 5500;
    const END_MS: u32 = 6200;

    let settings = ControlSettings::default();
    let commands = CommandSlot::new();
    let ControlChannels { handle, inbox } = ControlChannels::new(commands.clone());
    let mut platform = SimPlatform::new(START_MS).with_command_slot(commands);
    platform.set_client_count(1);
    let mut control = VehicleControl::new(platform, settings, handle, inbox);

    if let Err(err) = control.init() {
        eprintln!("init failed: {}", err);
        std::process::exit(1);
    }

    loop {
        let now = control.platform().now_ms();
        if now >= END_MS {
            break;
        }
        let (_, steering) = control.applied();
        let rc = (DRIVE_FROM_MS..SIGNAL_LOST_MS)
            .contains(&now)
            .then(|| RcCommand::new(0.4, 0.25));
        let platform = control.platform_mut();
        // 静止时只有陀螺零偏；转向时附加与舵量成比例的偏航角速度
        platform.set_imu(Some(ImuData {
            ax: 0.01,
            ay: -0.02,
            az: 1.0,
            gx: 0.4,
            gy: -0.3,
            gz: 0.8 + steering * 60.0,
        }));
        platform.set_rc(rc);
        control.run_once();
        for line in control.platform_mut().take_telemetry() {
            println!("{}", line);
        }
    }
}
