/// 失控保护状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailsafeState {
    Inactive,
    Active,
    Recovering,
}

impl FailsafeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailsafeState::Inactive => "inactive",
            FailsafeState::Active => "active",
            FailsafeState::Recovering => "recovering",
        }
    }
}

/// 默认超时（毫秒）。
pub const DEFAULT_FAILSAFE_TIMEOUT_MS: u32 = 250;

/// 失控保护状态机：任一控制源超时未活跃即进入 Active。
///
/// `last_active_ms` 为 `None` 时按 0 计算，因此无控制源启动时可以立即超时。
#[derive(Clone, Debug)]
pub struct Failsafe {
    timeout_ms: u32,
    state: FailsafeState,
    last_active_ms: Option<u32>,
}

impl Failsafe {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            timeout_ms,
            state: FailsafeState::Inactive,
            last_active_ms: None,
        }
    }

    /// 每个控制周期调用一次，返回更新后的状态。
    pub fn update(&mut self, now_ms: u32, rc_active: bool, wifi_active: bool) -> FailsafeState {
        if rc_active || wifi_active {
            self.last_active_ms = Some(now_ms);
            self.state = match self.state {
                FailsafeState::Active => FailsafeState::Recovering,
                FailsafeState::Recovering | FailsafeState::Inactive => FailsafeState::Inactive,
            };
            return self.state;
        }

        let last = self.last_active_ms.unwrap_or(0);
        if now_ms.wrapping_sub(last) >= self.timeout_ms {
            self.state = FailsafeState::Active;
        }
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == FailsafeState::Active
    }

    pub fn state(&self) -> FailsafeState {
        self.state
    }

    /// 距上次活跃的时间；从未活跃过时返回 0。
    pub fn time_since_last_active(&self, now_ms: u32) -> u32 {
        match self.last_active_ms {
            Some(last) => now_ms.wrapping_sub(last),
            None => 0,
        }
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    pub fn timeout(&self) -> u32 {
        self.timeout_ms
    }

    /// 恢复 Inactive 并清除时间戳，保留超时配置。
    pub fn reset(&mut self) {
        self.state = FailsafeState::Inactive;
        self.last_active_ms = None;
    }
}

impl Default for Failsafe {
    fn default() -> Self {
        Self::new(DEFAULT_FAILSAFE_TIMEOUT_MS)
    }
}
