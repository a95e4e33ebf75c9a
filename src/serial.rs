use crate::model::{clamp_normalized, ImuData};
use crate::proto::{
    decode_frame, decode_header, encode_frame, FrameError, MessageType, LOG_MAX_PAYLOAD,
};

/// 遥测载荷长度：seq(2) + status(1) + 6 × i16。
pub const TELEMETRY_PAYLOAD_LEN: usize = 15;
/// 控制指令载荷长度：seq(2) + throttle(2) + steering(2) + reserved(1)。
pub const COMMAND_PAYLOAD_LEN: usize = 7;

const STATUS_RC_OK: u8 = 0x01;
const STATUS_WIFI_OK: u8 = 0x02;
const STATUS_FAILSAFE: u8 = 0x04;

/// 链路状态位（仅在协议边界打包为 bit flags）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub rc_ok: bool,
    pub wifi_ok: bool,
    pub failsafe_active: bool,
}

impl LinkStatus {
    pub fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.rc_ok {
            bits |= STATUS_RC_OK;
        }
        if self.wifi_ok {
            bits |= STATUS_WIFI_OK;
        }
        if self.failsafe_active {
            bits |= STATUS_FAILSAFE;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            rc_ok: bits & STATUS_RC_OK != 0,
            wifi_ok: bits & STATUS_WIFI_OK != 0,
            failsafe_active: bits & STATUS_FAILSAFE != 0,
        }
    }
}

/// 传感/执行节点上报的遥测（加速度 mg，角速度 mdps）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetryData {
    pub seq: u16,
    pub status: LinkStatus,
    pub ax: i16,
    pub ay: i16,
    pub az: i16,
    pub gx: i16,
    pub gy: i16,
    pub gz: i16,
}

impl TelemetryData {
    /// 由 IMU 浮点数据换算（g → mg，dps → mdps，饱和到 i16）。
    pub fn from_imu(seq: u16, status: LinkStatus, imu: &ImuData) -> Self {
        let milli = |v: f32| (v * 1000.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        Self {
            seq,
            status,
            ax: milli(imu.ax),
            ay: milli(imu.ay),
            az: milli(imu.az),
            gx: milli(imu.gx),
            gy: milli(imu.gy),
            gz: milli(imu.gz),
        }
    }
}

/// 通信节点下发的控制指令（[-1, 1]）。
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CommandData {
    pub seq: u16,
    pub throttle: f32,
    pub steering: f32,
}

/// 链路上的任意一条消息。
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Command(CommandData),
    Telemetry(TelemetryData),
    Ping,
    Pong,
    Log(String),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Command(_) => MessageType::Command,
            Message::Telemetry(_) => MessageType::Telemetry,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
            Message::Log(_) => MessageType::Log,
        }
    }
}

/// 指令编码器：序号按实例自增，不做全局共享。
#[derive(Clone, Debug, Default)]
pub struct CommandEncoder {
    next_seq: u16,
}

impl CommandEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编码指令帧，成功后序号自增。
    pub fn build(&mut self, buf: &mut [u8], throttle: f32, steering: f32) -> Result<usize, FrameError> {
        let data = CommandData {
            seq: self.next_seq,
            throttle,
            steering,
        };
        let len = build_command(buf, &data)?;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(len)
    }

    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }
}

/// 编码遥测帧。
pub fn build_telemetry(buf: &mut [u8], data: &TelemetryData) -> Result<usize, FrameError> {
    let mut payload = [0u8; TELEMETRY_PAYLOAD_LEN];
    payload[0..2].copy_from_slice(&data.seq.to_le_bytes());
    payload[2] = data.status.to_bits();
    let axes = [data.ax, data.ay, data.az, data.gx, data.gy, data.gz];
    for (idx, value) in axes.iter().enumerate() {
        let pos = 3 + idx * 2;
        payload[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
    }
    encode_frame(buf, MessageType::Telemetry, &payload)
}

/// 编码指令帧（序列化前先钳位）。
pub fn build_command(buf: &mut [u8], data: &CommandData) -> Result<usize, FrameError> {
    let mut payload = [0u8; COMMAND_PAYLOAD_LEN];
    payload[0..2].copy_from_slice(&data.seq.to_le_bytes());
    payload[2..4].copy_from_slice(&quantize(data.throttle).to_le_bytes());
    payload[4..6].copy_from_slice(&quantize(data.steering).to_le_bytes());
    encode_frame(buf, MessageType::Command, &payload)
}

/// 编码日志帧，超长部分静默截断。
pub fn build_log(buf: &mut [u8], msg: &str) -> Result<usize, FrameError> {
    // 截断落在字符边界上，避免拆开多字节字符
    let mut len = msg.len().min(LOG_MAX_PAYLOAD);
    while !msg.is_char_boundary(len) {
        len -= 1;
    }
    encode_frame(buf, MessageType::Log, &msg.as_bytes()[..len])
}

pub fn build_ping(buf: &mut [u8]) -> Result<usize, FrameError> {
    encode_frame(buf, MessageType::Ping, &[])
}

pub fn build_pong(buf: &mut [u8]) -> Result<usize, FrameError> {
    encode_frame(buf, MessageType::Pong, &[])
}

/// 解码遥测帧。
pub fn parse_telemetry(buf: &[u8]) -> Result<TelemetryData, FrameError> {
    let payload = decode_frame(buf, MessageType::Telemetry, |len| len == TELEMETRY_PAYLOAD_LEN)?;
    Ok(decode_telemetry_payload(payload))
}

/// 解码指令帧，反量化后重新钳位（容忍 -32768）。
pub fn parse_command(buf: &[u8]) -> Result<CommandData, FrameError> {
    let payload = decode_frame(buf, MessageType::Command, |len| len == COMMAND_PAYLOAD_LEN)?;
    Ok(decode_command_payload(payload))
}

pub fn parse_log(buf: &[u8]) -> Result<String, FrameError> {
    let payload = decode_frame(buf, MessageType::Log, |len| len <= LOG_MAX_PAYLOAD)?;
    Ok(String::from_utf8_lossy(payload).to_string())
}

pub fn parse_ping(buf: &[u8]) -> Result<(), FrameError> {
    decode_frame(buf, MessageType::Ping, |len| len == 0).map(|_| ())
}

pub fn parse_pong(buf: &[u8]) -> Result<(), FrameError> {
    decode_frame(buf, MessageType::Pong, |len| len == 0).map(|_| ())
}

/// 按帧内类型解码任意消息，返回消息与消耗的字节数。
pub fn parse_message(buf: &[u8]) -> Result<(Message, usize), FrameError> {
    let header = decode_header(buf)?;
    let msg_type = MessageType::from_u8(header.msg_type).ok_or(FrameError::InvalidType)?;
    let message = match msg_type {
        MessageType::Command => Message::Command(parse_command(buf)?),
        MessageType::Telemetry => Message::Telemetry(parse_telemetry(buf)?),
        MessageType::Ping => {
            parse_ping(buf)?;
            Message::Ping
        }
        MessageType::Pong => {
            parse_pong(buf)?;
            Message::Pong
        }
        MessageType::Log => Message::Log(parse_log(buf)?),
    };
    Ok((message, header.frame_len()))
}

fn quantize(value: f32) -> i16 {
    (clamp_normalized(value) * 32767.0).round() as i16
}

fn dequantize(value: i16) -> f32 {
    clamp_normalized(value as f32 / 32767.0)
}

fn decode_telemetry_payload(payload: &[u8]) -> TelemetryData {
    let mut cursor = 0;
    let seq = read_u16(payload, &mut cursor);
    let status = LinkStatus::from_bits(payload[cursor]);
    cursor += 1;
    TelemetryData {
        seq,
        status,
        ax: read_i16(payload, &mut cursor),
        ay: read_i16(payload, &mut cursor),
        az: read_i16(payload, &mut cursor),
        gx: read_i16(payload, &mut cursor),
        gy: read_i16(payload, &mut cursor),
        gz: read_i16(payload, &mut cursor),
    }
}

fn decode_command_payload(payload: &[u8]) -> CommandData {
    let mut cursor = 0;
    let seq = read_u16(payload, &mut cursor);
    let throttle = dequantize(read_i16(payload, &mut cursor));
    let steering = dequantize(read_i16(payload, &mut cursor));
    CommandData {
        seq,
        throttle,
        steering,
    }
}

/// 读取 u16（小端），调用方已保证长度。
fn read_u16(data: &[u8], cursor: &mut usize) -> u16 {
    let value = u16::from_le_bytes([data[*cursor], data[*cursor + 1]]);
    *cursor += 2;
    value
}

fn read_i16(data: &[u8], cursor: &mut usize) -> i16 {
    read_u16(data, cursor) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{crc16, CRC_SIZE, HEADER_SIZE};

    fn sample_telemetry() -> TelemetryData {
        TelemetryData {
            seq: 513,
            status: LinkStatus {
                rc_ok: true,
                wifi_ok: false,
                failsafe_active: true,
            },
            ax: -1000,
            ay: 12,
            az: 998,
            gx: i16::MIN,
            gy: i16::MAX,
            gz: -3,
        }
    }

    #[test]
    fn test_telemetry_round_trip() {
        let mut buf = [0u8; 64];
        let data = sample_telemetry();
        let len = build_telemetry(&mut buf, &data).unwrap();
        assert_eq!(len, HEADER_SIZE + TELEMETRY_PAYLOAD_LEN + CRC_SIZE);
        assert_eq!(buf[HEADER_SIZE + 2], 0b101);
        assert_eq!(parse_telemetry(&buf[..len]), Ok(data));
    }

    #[test]
    fn test_command_round_trip_within_quantization() {
        let mut buf = [0u8; 32];
        for &(throttle, steering) in &[(0.0, 0.0), (1.0, -1.0), (0.123, -0.777), (-0.5, 0.999)] {
            let data = CommandData {
                seq: 7,
                throttle,
                steering,
            };
            let len = build_command(&mut buf, &data).unwrap();
            let parsed = parse_command(&buf[..len]).unwrap();
            assert_eq!(parsed.seq, 7);
            assert!((parsed.throttle - throttle).abs() < 0.001);
            assert!((parsed.steering - steering).abs() < 0.001);
        }
    }

    #[test]
    fn test_command_clamped_before_send() {
        let mut buf = [0u8; 32];
        let data = CommandData {
            seq: 0,
            throttle: 5.0,
            steering: -9.0,
        };
        let len = build_command(&mut buf, &data).unwrap();
        let parsed = parse_command(&buf[..len]).unwrap();
        assert_eq!(parsed.throttle, 1.0);
        assert_eq!(parsed.steering, -1.0);
    }

    #[test]
    fn test_command_extreme_quantized_value_reclamped() {
        let mut payload = [0u8; COMMAND_PAYLOAD_LEN];
        payload[2..4].copy_from_slice(&i16::MIN.to_le_bytes());
        payload[4..6].copy_from_slice(&i16::MIN.to_le_bytes());
        let mut buf = [0u8; 32];
        let len = encode_frame(&mut buf, MessageType::Command, &payload).unwrap();
        let parsed = parse_command(&buf[..len]).unwrap();
        assert_eq!(parsed.throttle, -1.0);
        assert_eq!(parsed.steering, -1.0);
    }

    #[test]
    fn test_command_encoder_sequence_per_instance() {
        let mut buf = [0u8; 32];
        let mut first = CommandEncoder::new();
        let mut second = CommandEncoder::new();
        for expected in 0..3u16 {
            let len = first.build(&mut buf, 0.1, 0.2).unwrap();
            assert_eq!(parse_command(&buf[..len]).unwrap().seq, expected);
        }
        let len = second.build(&mut buf, 0.0, 0.0).unwrap();
        assert_eq!(parse_command(&buf[..len]).unwrap().seq, 0);
        assert_eq!(first.next_seq(), 3);
    }

    #[test]
    fn test_command_encoder_does_not_advance_on_error() {
        let mut small = [0u8; 4];
        let mut encoder = CommandEncoder::new();
        assert_eq!(encoder.build(&mut small, 0.0, 0.0), Err(FrameError::BufferTooSmall));
        assert_eq!(encoder.next_seq(), 0);
    }

    #[test]
    fn test_flipped_crc_byte_detected() {
        let mut buf = [0u8; 64];
        let len = build_telemetry(&mut buf, &sample_telemetry()).unwrap();
        for pos in [len - 2, len - 1] {
            let mut corrupt = buf;
            corrupt[pos] ^= 0xFF;
            assert_eq!(parse_telemetry(&corrupt[..len]), Err(FrameError::CrcMismatch));
        }
    }

    #[test]
    fn test_flipped_payload_byte_detected() {
        let mut buf = [0u8; 64];
        let len = build_telemetry(&mut buf, &sample_telemetry()).unwrap();
        for pos in HEADER_SIZE..HEADER_SIZE + TELEMETRY_PAYLOAD_LEN {
            let mut corrupt = buf;
            corrupt[pos] ^= 0x10;
            assert_eq!(parse_telemetry(&corrupt[..len]), Err(FrameError::CrcMismatch));
        }
    }

    #[test]
    fn test_wrong_payload_length_rejected() {
        let mut buf = [0u8; 64];
        let len = encode_frame(&mut buf, MessageType::Telemetry, &[0u8; 14]).unwrap();
        assert_eq!(
            parse_telemetry(&buf[..len]),
            Err(FrameError::InvalidPayloadLength)
        );
        let len = encode_frame(&mut buf, MessageType::Ping, &[1]).unwrap();
        assert_eq!(parse_ping(&buf[..len]), Err(FrameError::InvalidPayloadLength));
    }

    #[test]
    fn test_log_truncated_to_limit() {
        let mut buf = [0u8; 512];
        let long = "x".repeat(LOG_MAX_PAYLOAD + 50);
        let len = build_log(&mut buf, &long).unwrap();
        assert_eq!(len, HEADER_SIZE + LOG_MAX_PAYLOAD + CRC_SIZE);
        assert_eq!(parse_log(&buf[..len]).unwrap().len(), LOG_MAX_PAYLOAD);
    }

    #[test]
    fn test_log_truncation_keeps_utf8_intact() {
        let mut buf = [0u8; 512];
        // 199 字节 ASCII 后接 3 字节汉字，上限落在字符中间
        let msg = format!("{}{}", "a".repeat(LOG_MAX_PAYLOAD - 1), "标定完成");
        let len = build_log(&mut buf, &msg).unwrap();
        let text = parse_log(&buf[..len]).unwrap();
        assert_eq!(text.len(), LOG_MAX_PAYLOAD - 1);
        assert!(!text.contains('\u{FFFD}'));
        assert_eq!(text, "a".repeat(LOG_MAX_PAYLOAD - 1));
    }

    #[test]
    fn test_ping_pong_frames() {
        let mut buf = [0u8; 16];
        let len = build_ping(&mut buf).unwrap();
        assert_eq!(len, HEADER_SIZE + CRC_SIZE);
        assert_eq!(parse_ping(&buf[..len]), Ok(()));
        assert_eq!(parse_pong(&buf[..len]), Err(FrameError::InvalidType));
        let len = build_pong(&mut buf).unwrap();
        assert_eq!(parse_pong(&buf[..len]), Ok(()));
        assert_eq!(crc16(&buf[2..6]).to_le_bytes(), [buf[6], buf[7]]);
    }

    #[test]
    fn test_parse_message_reports_consumed_length() {
        let mut buf = [0u8; 64];
        let len = build_log(&mut buf, "boot ok").unwrap();
        let (message, used) = parse_message(&buf[..len + 3]).unwrap();
        assert_eq!(message, Message::Log("boot ok".to_string()));
        assert_eq!(used, len);
    }

    #[test]
    fn test_telemetry_from_imu_saturates() {
        let imu = ImuData {
            ax: 0.5,
            ay: -1.0,
            az: 40.0,
            gx: 1.2345,
            gy: -100.0,
            gz: 0.0,
        };
        let data = TelemetryData::from_imu(1, LinkStatus::default(), &imu);
        assert_eq!(data.ax, 500);
        assert_eq!(data.ay, -1000);
        assert_eq!(data.az, i16::MAX);
        assert_eq!(data.gx, 1235);
        assert_eq!(data.gy, -32768);
    }
}
