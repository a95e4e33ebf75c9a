use std::fmt;

use crate::proto::{decode_header, find_frame_start, FrameError, FRAME_PREFIX};
use crate::serial::{
    build_command, build_log, build_ping, build_pong, build_telemetry, parse_message, CommandData,
    Message, TelemetryData,
};

/// 接收缓冲区容量。
pub const RX_BUFFER_SIZE: usize = 1024;
/// 单帧发送缓冲（日志帧最大 6 + 200 + 2）。
const TX_BUFFER_SIZE: usize = 256;

/// 串口读写错误。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkError {
    Io(String),
    Frame(FrameError),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Io(msg) => write!(f, "serial io: {}", msg),
            LinkError::Frame(err) => write!(f, "frame: {}", err),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        LinkError::Frame(err)
    }
}

/// 非阻塞串口抽象（每个目标平台各自实现）。
pub trait SerialPort {
    /// 读取当前可用字节，不等待；返回读取数量。
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError>;
}

/// 接收缓冲：对齐帧头、整帧消费、出错时只丢弃一个字节。
pub struct RxBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self::with_capacity(RX_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 追加字节，超出容量的部分被丢弃，返回实际写入数量。
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.free_space());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// 对齐到帧头。
    ///
    /// 找不到帧头时：缓冲已满则整体清空；否则只保留末尾可能是半个帧头的字节。
    /// 返回缓冲区开头是否为（可能不完整的）帧头。
    pub fn align(&mut self) -> bool {
        match find_frame_start(&self.data) {
            Some(0) => true,
            Some(offset) => {
                self.data.drain(..offset);
                true
            }
            None => {
                if self.is_full() {
                    self.data.clear();
                    return false;
                }
                // 末尾单个 0xAA 可能是下一帧的开始
                let keep = match self.data.last() {
                    Some(&byte) if byte == FRAME_PREFIX[0] => 1,
                    _ => 0,
                };
                let drop = self.data.len() - keep;
                self.data.drain(..drop);
                false
            }
        }
    }

    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    /// 丢弃一个字节，用于跳过伪帧头后重新同步。
    pub fn skip_one(&mut self) {
        self.consume(1);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// 尝试取出下一条完整消息。
    ///
    /// 数据不足时保留缓冲等待；校验失败（CRC、长度、类型）只跳过一个字节。
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if !self.align() || self.data.len() < 4 {
                return None;
            }
            match decode_header(&self.data) {
                Ok(header) if header.frame_len() > self.capacity => {
                    self.skip_one();
                    continue;
                }
                Ok(_) | Err(FrameError::InsufficientData) => {}
                Err(_) => {
                    self.skip_one();
                    continue;
                }
            }
            match parse_message(&self.data) {
                Ok((message, used)) => {
                    self.consume(used);
                    return Some(message);
                }
                Err(FrameError::InsufficientData) => return None,
                Err(_) => self.skip_one(),
            }
        }
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 双机串口桥：同一实现同时提供传感节点与通信节点两侧的收发接口。
pub struct UartBridge<S: SerialPort> {
    port: S,
    rx: RxBuffer,
    tx: [u8; TX_BUFFER_SIZE],
}

impl<S: SerialPort> UartBridge<S> {
    pub fn new(port: S) -> Self {
        Self {
            port,
            rx: RxBuffer::new(),
            tx: [0u8; TX_BUFFER_SIZE],
        }
    }

    pub fn port(&self) -> &S {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut S {
        &mut self.port
    }

    /// 从串口读入可用字节。
    pub fn pump(&mut self) -> Result<usize, LinkError> {
        let mut chunk = [0u8; 128];
        let mut total = 0;
        loop {
            let space = self.rx.free_space().min(chunk.len());
            if space == 0 {
                // 缓冲已满：先对齐（无帧头则清空）腾出空间
                self.rx.align();
                if self.rx.free_space() == 0 {
                    return Ok(total);
                }
                continue;
            }
            let count = self.port.read_available(&mut chunk[..space])?;
            if count == 0 {
                return Ok(total);
            }
            total += self.rx.extend(&chunk[..count]);
        }
    }

    /// 读取串口并取出下一条消息。
    pub fn receive(&mut self) -> Option<Message> {
        if let Err(err) = self.pump() {
            log::warn!("UART RX error: {}", err);
        }
        self.rx.next_message()
    }

    pub fn send_telem(&mut self, data: &TelemetryData) -> Result<(), LinkError> {
        let len = build_telemetry(&mut self.tx, data)?;
        self.port.write_all(&self.tx[..len])
    }

    pub fn send_command(&mut self, data: &CommandData) -> Result<(), LinkError> {
        let len = build_command(&mut self.tx, data)?;
        self.port.write_all(&self.tx[..len])
    }

    pub fn send_log(&mut self, msg: &str) -> Result<(), LinkError> {
        let len = build_log(&mut self.tx, msg)?;
        self.port.write_all(&self.tx[..len])
    }

    pub fn send_ping(&mut self) -> Result<(), LinkError> {
        let len = build_ping(&mut self.tx)?;
        self.port.write_all(&self.tx[..len])
    }

    pub fn send_pong(&mut self) -> Result<(), LinkError> {
        let len = build_pong(&mut self.tx)?;
        self.port.write_all(&self.tx[..len])
    }
}
