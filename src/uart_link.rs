use std::sync::mpsc::Receiver;
use std::thread;

use esp_idf_hal::delay::{FreeRtos, NON_BLOCK};
use esp_idf_hal::uart::UartDriver;

use rc_vehicle::pipeline::CommandSlot;
use rc_vehicle::serial::{Message, TelemetryData};
use rc_vehicle::serial_io::{LinkError, SerialPort, UartBridge};

const LINK_POLL_MS: u32 = 5;

/// ESP-IDF UART 适配为非阻塞串口。
pub struct EspUartPort {
    uart: UartDriver<'static>,
}

impl EspUartPort {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self { uart }
    }
}

impl SerialPort for EspUartPort {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        self.uart
            .read(buf, NON_BLOCK)
            .map_err(|err| LinkError::Io(err.to_string()))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self
                .uart
                .write(&data[sent..])
                .map_err(|err| LinkError::Io(err.to_string()))?;
        }
        Ok(())
    }
}

/// 伴随处理器链路：转发遥测帧，应答 Ping，收到的控制指令写入指令槽。
pub fn spawn_link_task(
    uart: UartDriver<'static>,
    telem_rx: Receiver<TelemetryData>,
    commands: CommandSlot,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut bridge = UartBridge::new(EspUartPort::new(uart));
        loop {
            while let Some(message) = bridge.receive() {
                match message {
                    Message::Command(cmd) => commands.send(cmd.throttle, cmd.steering),
                    Message::Ping => {
                        if let Err(err) = bridge.send_pong() {
                            log::warn!("UART link pong failed: {}", err);
                        }
                    }
                    Message::Log(text) => log::info!("UART peer: {}", text),
                    other => log::debug!("UART link ignored {:?}", other.msg_type()),
                }
            }
            // 只转发最新一帧
            if let Some(frame) = telem_rx.try_iter().last() {
                if let Err(err) = bridge.send_telem(&frame) {
                    log::warn!("UART link telemetry failed: {}", err);
                }
            }
            FreeRtos::delay_ms(LINK_POLL_MS);
        }
    })
}
