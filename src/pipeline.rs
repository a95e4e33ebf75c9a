use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, TryLockError};

use crate::failsafe::FailsafeState;
use crate::imu_calibration::{CalibError, CalibStatus, ImuCalibData};
use crate::model::{RcCommand, VehicleStatus};
use crate::stabilization::{ConfigError, StabilizationConfig};

/// 控制请求队列深度。
const REQUEST_QUEUE_DEPTH: usize = 8;
/// 输出超过该幅值视为行驶中。
const DRIVING_THRESHOLD: f32 = 0.05;

/// 阶段 1 标定请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibRequest {
    GyroOnly,
    Full,
}

/// 控制环状态快照（查询应答）。
#[derive(Clone, Debug, PartialEq)]
pub struct ControlStatus {
    pub calib_status: CalibStatus,
    pub calib_stage: u8,
    pub calib: ImuCalibData,
    pub failsafe: FailsafeState,
    pub stab_config: StabilizationConfig,
    pub applied_throttle: f32,
    pub applied_steering: f32,
}

impl ControlStatus {
    /// 状态灯使用的整车状态（失控保护优先）。
    pub fn vehicle_status(&self) -> VehicleStatus {
        if self.failsafe == FailsafeState::Active {
            VehicleStatus::Failsafe
        } else if self.calib_status == CalibStatus::Collecting {
            VehicleStatus::Calibrating
        } else if self.applied_throttle.abs().max(self.applied_steering.abs()) > DRIVING_THRESHOLD {
            VehicleStatus::Driving
        } else {
            VehicleStatus::Idle
        }
    }
}

/// 跨线程发给控制环的请求，由控制环在每个周期非阻塞取出。
#[derive(Debug)]
pub enum ControlRequest {
    Calibrate(CalibRequest),
    StartForwardCalibration {
        reply: Option<Sender<Result<(), CalibError>>>,
    },
    SetForwardDirection {
        vec: [f32; 3],
        reply: Option<Sender<bool>>,
    },
    SetStabilizationConfig {
        config: StabilizationConfig,
        persist: bool,
        reply: Option<Sender<Result<StabilizationConfig, ConfigError>>>,
    },
    QueryStatus(Sender<ControlStatus>),
}

/// 请求无法投递。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestError {
    Busy,
    Disconnected,
}

/// 单槽无线指令队列：新指令覆盖旧指令。
#[derive(Clone, Debug, Default)]
pub struct CommandSlot {
    inner: Arc<Mutex<Option<RcCommand>>>,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入指令（构造时已钳位）。
    pub fn send(&self, throttle: f32, steering: f32) {
        let cmd = RcCommand::new(throttle, steering);
        match self.inner.lock() {
            Ok(mut slot) => *slot = Some(cmd),
            Err(poisoned) => *poisoned.into_inner() = Some(cmd),
        }
    }

    /// 非阻塞取出；锁被占用时本周期视为无数据。
    pub fn try_take(&self) -> Option<RcCommand> {
        match self.inner.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// API/网络线程持有的控制句柄。
#[derive(Clone, Debug)]
pub struct ControlHandle {
    request_tx: SyncSender<ControlRequest>,
    commands: CommandSlot,
}

impl ControlHandle {
    pub fn send_command(&self, throttle: f32, steering: f32) {
        self.commands.send(throttle, steering);
    }

    pub fn commands(&self) -> &CommandSlot {
        &self.commands
    }

    pub fn request_calibration(&self, request: CalibRequest) -> Result<(), RequestError> {
        self.try_send(ControlRequest::Calibrate(request))
    }

    pub fn start_forward_calibration(&self) -> Result<Receiver<Result<(), CalibError>>, RequestError> {
        let (tx, rx) = mpsc::channel();
        self.try_send(ControlRequest::StartForwardCalibration { reply: Some(tx) })?;
        Ok(rx)
    }

    pub fn set_forward_direction(&self, vec: [f32; 3]) -> Result<Receiver<bool>, RequestError> {
        let (tx, rx) = mpsc::channel();
        self.try_send(ControlRequest::SetForwardDirection {
            vec,
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    pub fn set_stabilization_config(
        &self,
        config: StabilizationConfig,
        persist: bool,
    ) -> Result<Receiver<Result<StabilizationConfig, ConfigError>>, RequestError> {
        let (tx, rx) = mpsc::channel();
        self.try_send(ControlRequest::SetStabilizationConfig {
            config,
            persist,
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    pub fn query_status(&self) -> Result<Receiver<ControlStatus>, RequestError> {
        let (tx, rx) = mpsc::channel();
        self.try_send(ControlRequest::QueryStatus(tx))?;
        Ok(rx)
    }

    fn try_send(&self, request: ControlRequest) -> Result<(), RequestError> {
        self.request_tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => RequestError::Busy,
            TrySendError::Disconnected(_) => RequestError::Disconnected,
        })
    }
}

/// 控制环一侧的接收端。
#[derive(Debug)]
pub struct ControlInbox {
    request_rx: Receiver<ControlRequest>,
}

impl ControlInbox {
    /// 非阻塞取出一个请求。
    pub fn try_next(&self) -> Option<ControlRequest> {
        match self.request_rx.try_recv() {
            Ok(request) => Some(request),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// 控制环与外部线程之间的通道集合。
pub struct ControlChannels {
    pub handle: ControlHandle,
    pub inbox: ControlInbox,
}

impl ControlChannels {
    pub fn new(commands: CommandSlot) -> Self {
        let (request_tx, request_rx) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
        Self {
            handle: ControlHandle {
                request_tx,
                commands,
            },
            inbox: ControlInbox { request_rx },
        }
    }
}
