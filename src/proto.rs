use std::fmt;

/// 帧头与版本号。
pub const FRAME_PREFIX: [u8; 2] = [0xAA, 0x55];
pub const FRAME_VERSION: u8 = 0x01;

/// 帧结构：prefix(2) + version(1) + type(1) + len(2, LE) + payload + crc(2, LE)。
pub const HEADER_SIZE: usize = 6;
pub const CRC_SIZE: usize = 2;
/// 日志帧最大载荷，超出部分在构建时截断。
pub const LOG_MAX_PAYLOAD: usize = 200;

/// 消息类型定义。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Command,
    Telemetry,
    Ping,
    Pong,
    Log,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Command => 0x01,
            MessageType::Telemetry => 0x02,
            MessageType::Ping => 0x03,
            MessageType::Pong => 0x04,
            MessageType::Log => 0x05,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageType::Command),
            0x02 => Some(MessageType::Telemetry),
            0x03 => Some(MessageType::Ping),
            0x04 => Some(MessageType::Pong),
            0x05 => Some(MessageType::Log),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Telemetry => "telemetry",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Log => "log",
        }
    }
}

/// 编解码错误类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    InsufficientData,
    InvalidPrefix,
    InvalidVersion,
    InvalidType,
    InvalidPayloadLength,
    CrcMismatch,
    BufferTooSmall,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FrameError::InsufficientData => "insufficient data",
            FrameError::InvalidPrefix => "invalid prefix",
            FrameError::InvalidVersion => "invalid version",
            FrameError::InvalidType => "invalid message type",
            FrameError::InvalidPayloadLength => "invalid payload length",
            FrameError::CrcMismatch => "crc mismatch",
            FrameError::BufferTooSmall => "buffer too small",
        };
        f.write_str(text)
    }
}

impl std::error::Error for FrameError {}

/// 已校验过头部的帧视图。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u8,
    pub payload_len: usize,
}

impl FrameHeader {
    /// 整帧长度（含头部与 CRC）。
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len + CRC_SIZE
    }
}

/// CRC16（多项式 0xA001，初值 0xFFFF，反射）。
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// 查找第一个帧头位置。
pub fn find_frame_start(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_PREFIX.len())
        .position(|window| window == FRAME_PREFIX)
}

/// 写出完整帧，返回帧长度。
pub fn encode_frame(buf: &mut [u8], msg_type: MessageType, payload: &[u8]) -> Result<usize, FrameError> {
    let total = HEADER_SIZE + payload.len() + CRC_SIZE;
    if buf.len() < total || payload.len() > u16::MAX as usize {
        return Err(FrameError::BufferTooSmall);
    }
    buf[0..2].copy_from_slice(&FRAME_PREFIX);
    buf[2] = FRAME_VERSION;
    buf[3] = msg_type.as_u8();
    buf[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    // CRC 覆盖 version..payload，共 4 + len 字节
    let crc = crc16(&buf[2..HEADER_SIZE + payload.len()]);
    buf[HEADER_SIZE + payload.len()..total].copy_from_slice(&crc.to_le_bytes());
    Ok(total)
}

/// 校验帧头（prefix/version/type），不要求载荷已完整到达。
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::InsufficientData);
    }
    if buf[0..2] != FRAME_PREFIX {
        return Err(FrameError::InvalidPrefix);
    }
    if buf[2] != FRAME_VERSION {
        return Err(FrameError::InvalidVersion);
    }
    let msg_type = buf[3];
    if MessageType::from_u8(msg_type).is_none() {
        return Err(FrameError::InvalidType);
    }
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::InsufficientData);
    }
    let payload_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    Ok(FrameHeader {
        msg_type,
        payload_len,
    })
}

/// 按期望类型解码帧，返回载荷切片。
///
/// 逐级校验：头部 → 类型 → 长度约束 → 数据完整性 → CRC，任一步失败即返回，
/// 不会产出部分解码的数据。
pub fn decode_frame<'a>(
    buf: &'a [u8],
    expected: MessageType,
    length_ok: impl Fn(usize) -> bool,
) -> Result<&'a [u8], FrameError> {
    let header = decode_header(buf)?;
    if header.msg_type != expected.as_u8() {
        return Err(FrameError::InvalidType);
    }
    if !length_ok(header.payload_len) {
        return Err(FrameError::InvalidPayloadLength);
    }
    let total = header.frame_len();
    if buf.len() < total {
        return Err(FrameError::InsufficientData);
    }
    let crc_pos = HEADER_SIZE + header.payload_len;
    let received = u16::from_le_bytes([buf[crc_pos], buf[crc_pos + 1]]);
    if crc16(&buf[2..crc_pos]) != received {
        return Err(FrameError::CrcMismatch);
    }
    Ok(&buf[HEADER_SIZE..crc_pos])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // Modbus CRC16 参考值
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_encode_frame_layout() {
        let mut buf = [0u8; 16];
        let len = encode_frame(&mut buf, MessageType::Log, b"hi").unwrap();
        assert_eq!(len, HEADER_SIZE + 2 + CRC_SIZE);
        assert_eq!(&buf[0..6], &[0xAA, 0x55, 0x01, 0x05, 0x02, 0x00]);
        assert_eq!(&buf[6..8], b"hi");
        let crc = crc16(&buf[2..8]);
        assert_eq!(&buf[8..10], &crc.to_le_bytes());
    }

    #[test]
    fn test_encode_frame_buffer_too_small() {
        let mut buf = [0u8; 9];
        assert_eq!(
            encode_frame(&mut buf, MessageType::Log, b"hi"),
            Err(FrameError::BufferTooSmall)
        );
    }

    #[test]
    fn test_find_frame_start() {
        assert_eq!(find_frame_start(&[0x00, 0xAA, 0x00, 0xAA, 0x55]), Some(3));
        assert_eq!(find_frame_start(&[0xAA]), None);
        assert_eq!(find_frame_start(&[]), None);
    }

    #[test]
    fn test_decode_header_errors() {
        assert_eq!(decode_header(&[0xAA, 0x55, 0x01]), Err(FrameError::InsufficientData));
        assert_eq!(decode_header(&[0xAA, 0x56, 0x01, 0x01]), Err(FrameError::InvalidPrefix));
        assert_eq!(decode_header(&[0xAA, 0x55, 0x02, 0x01]), Err(FrameError::InvalidVersion));
        assert_eq!(decode_header(&[0xAA, 0x55, 0x01, 0x7F]), Err(FrameError::InvalidType));
        assert_eq!(decode_header(&[0xAA, 0x55, 0x01, 0x01, 0x07]), Err(FrameError::InsufficientData));
    }

    #[test]
    fn test_decode_frame_detects_truncation_and_crc() {
        let mut buf = [0u8; 16];
        let len = encode_frame(&mut buf, MessageType::Log, b"abc").unwrap();
        let any = |_: usize| true;
        assert_eq!(decode_frame(&buf[..len], MessageType::Log, any), Ok(&b"abc"[..]));
        assert_eq!(
            decode_frame(&buf[..len - 1], MessageType::Log, any),
            Err(FrameError::InsufficientData)
        );
        assert_eq!(
            decode_frame(&buf[..len], MessageType::Ping, any),
            Err(FrameError::InvalidType)
        );
        buf[7] ^= 0x01;
        assert_eq!(
            decode_frame(&buf[..len], MessageType::Log, any),
            Err(FrameError::CrcMismatch)
        );
    }
}
