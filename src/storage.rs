use std::fmt;

use crate::imu_calibration::ImuCalibData;
use crate::stabilization::{StabilizationConfig, STAB_CONFIG_MAGIC};

/// NVS 命名空间与键。
pub const CALIB_NAMESPACE: &str = "imu_calib";
pub const STAB_NAMESPACE: &str = "stab_cfg";
pub const BLOB_KEY: &str = "data";

pub const CALIB_BLOB_V1_LEN: usize = 28;
pub const CALIB_BLOB_LEN: usize = 52;
pub const STAB_BLOB_LEN: usize = 56;

const CALIB_VERSION_V1: u8 = 1;
const CALIB_VERSION: u8 = 2;
const STAB_VERSION: u8 = 1;
const FLAG_VALID: u8 = 0x01;

/// 二进制数据解码错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageError {
    TooShort,
    BadVersion,
    BadMagic,
    NotFinite,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StorageError::TooShort => "blob too short",
            StorageError::BadVersion => "unsupported blob version",
            StorageError::BadMagic => "bad magic",
            StorageError::NotFinite => "non-finite value",
        };
        f.write_str(text)
    }
}

impl std::error::Error for StorageError {}

/// 标定数据 → blob（v2，含重力与前进方向）。
pub fn calib_to_bytes(data: &ImuCalibData) -> [u8; CALIB_BLOB_LEN] {
    let mut out = [0u8; CALIB_BLOB_LEN];
    out[0] = CALIB_VERSION;
    out[1] = if data.valid { FLAG_VALID } else { 0 };
    let mut cursor = 4;
    for v in data
        .gyro_bias
        .iter()
        .chain(data.accel_bias.iter())
        .chain(data.gravity_vec.iter())
        .chain(data.forward_vec.iter())
    {
        write_f32(&mut out, &mut cursor, *v);
    }
    out
}

/// blob → 标定数据；兼容 v1（缺省重力 +Z、前进 +X）。
pub fn calib_from_bytes(blob: &[u8]) -> Result<ImuCalibData, StorageError> {
    if blob.len() < CALIB_BLOB_V1_LEN {
        return Err(StorageError::TooShort);
    }
    let version = blob[0];
    let has_vectors = match version {
        CALIB_VERSION_V1 => false,
        CALIB_VERSION if blob.len() >= CALIB_BLOB_LEN => true,
        CALIB_VERSION => return Err(StorageError::TooShort),
        _ => return Err(StorageError::BadVersion),
    };
    let mut data = ImuCalibData {
        valid: blob[1] & FLAG_VALID != 0,
        ..Default::default()
    };
    let mut cursor = 4;
    read_vec3(blob, &mut cursor, &mut data.gyro_bias)?;
    read_vec3(blob, &mut cursor, &mut data.accel_bias)?;
    if has_vectors {
        read_vec3(blob, &mut cursor, &mut data.gravity_vec)?;
        read_vec3(blob, &mut cursor, &mut data.forward_vec)?;
    }
    Ok(data)
}

/// 稳定配置 → blob。
pub fn stab_to_bytes(cfg: &StabilizationConfig) -> [u8; STAB_BLOB_LEN] {
    let mut out = [0u8; STAB_BLOB_LEN];
    out[0..4].copy_from_slice(&cfg.magic.to_le_bytes());
    out[4] = STAB_VERSION;
    out[5] = cfg.enabled as u8;
    out[6] = cfg.mode;
    out[7] = cfg.pitch_comp_enabled as u8;
    let mut cursor = 8;
    for v in [
        cfg.madgwick_beta,
        cfg.lpf_cutoff_hz,
        cfg.imu_sample_rate_hz,
        cfg.pid_kp,
        cfg.pid_ki,
        cfg.pid_kd,
        cfg.pid_max_integral,
        cfg.pid_max_correction,
        cfg.steer_to_yaw_rate_dps,
    ] {
        write_f32(&mut out, &mut cursor, v);
    }
    out[cursor..cursor + 4].copy_from_slice(&cfg.fade_ms.to_le_bytes());
    cursor += 4;
    write_f32(&mut out, &mut cursor, cfg.pitch_comp_gain);
    write_f32(&mut out, &mut cursor, cfg.pitch_comp_max_correction);
    out
}

/// blob → 稳定配置（只做格式检查，范围校验交给调用方）。
pub fn stab_from_bytes(blob: &[u8]) -> Result<StabilizationConfig, StorageError> {
    if blob.len() < STAB_BLOB_LEN {
        return Err(StorageError::TooShort);
    }
    let magic = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if magic != STAB_CONFIG_MAGIC {
        return Err(StorageError::BadMagic);
    }
    if blob[4] != STAB_VERSION {
        return Err(StorageError::BadVersion);
    }
    let mut cursor = 8;
    let mut floats = [0f32; 9];
    for slot in floats.iter_mut() {
        *slot = read_f32(blob, &mut cursor)?;
    }
    let fade_ms = u32::from_le_bytes([blob[cursor], blob[cursor + 1], blob[cursor + 2], blob[cursor + 3]]);
    cursor += 4;
    let pitch_comp_gain = read_f32(blob, &mut cursor)?;
    let pitch_comp_max_correction = read_f32(blob, &mut cursor)?;
    Ok(StabilizationConfig {
        enabled: blob[5] != 0,
        madgwick_beta: floats[0],
        lpf_cutoff_hz: floats[1],
        imu_sample_rate_hz: floats[2],
        mode: blob[6],
        pid_kp: floats[3],
        pid_ki: floats[4],
        pid_kd: floats[5],
        pid_max_integral: floats[6],
        pid_max_correction: floats[7],
        steer_to_yaw_rate_dps: floats[8],
        fade_ms,
        pitch_comp_enabled: blob[7] != 0,
        pitch_comp_gain,
        pitch_comp_max_correction,
        magic,
    })
}

fn write_f32(out: &mut [u8], cursor: &mut usize, value: f32) {
    out[*cursor..*cursor + 4].copy_from_slice(&value.to_le_bytes());
    *cursor += 4;
}

fn read_f32(data: &[u8], cursor: &mut usize) -> Result<f32, StorageError> {
    if *cursor + 4 > data.len() {
        return Err(StorageError::TooShort);
    }
    let value = f32::from_le_bytes([
        data[*cursor],
        data[*cursor + 1],
        data[*cursor + 2],
        data[*cursor + 3],
    ]);
    *cursor += 4;
    if !value.is_finite() {
        return Err(StorageError::NotFinite);
    }
    Ok(value)
}

fn read_vec3(data: &[u8], cursor: &mut usize, out: &mut [f32; 3]) -> Result<(), StorageError> {
    for slot in out.iter_mut() {
        *slot = read_f32(data, cursor)?;
    }
    Ok(())
}
