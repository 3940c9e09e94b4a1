//! 设备操作状态机
//!
//! 每个数据搬运或位置变更操作执行前都要先过状态门。
//! OPEN 为初始态；关闭句柄是终态，由句柄所有权（消费 self）表达，
//! 不在枚举里。Suspended/Disconnected 为完整生命周期预留，
//! 所有状态门一律拒绝，不影响传输循环契约。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{PcmError, Result};
use crate::format::Direction;

/// 设备操作状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// 已打开，未安装硬件配置
    Open = 0,
    /// 硬件配置已安装
    Setup,
    /// 就绪，可启动
    Prepared,
    /// 运行中
    Running,
    /// 欠载/溢出，需 prepare/drop 恢复
    Xrun,
    /// 排空中（播放：等硬件消费完余量）
    Draining,
    /// 暂停
    Paused,
    /// 低功耗挂起（预留）
    Suspended,
    /// 设备断开（预留）
    Disconnected,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Setup => "SETUP",
            Self::Prepared => "PREPARED",
            Self::Running => "RUNNING",
            Self::Xrun => "XRUN",
            Self::Draining => "DRAINING",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    /// 是否已安装硬件配置（SETUP 及之后）
    pub fn has_setup(self) -> bool {
        !matches!(self, Self::Open | Self::Disconnected)
    }

    fn from_u8(v: u8) -> State {
        match v {
            0 => Self::Open,
            1 => Self::Setup,
            2 => Self::Prepared,
            3 => Self::Running,
            4 => Self::Xrun,
            5 => Self::Draining,
            6 => Self::Paused,
            7 => Self::Suspended,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// XRUN 对应的方向化错误：播放欠载，采集溢出
pub fn xrun_error(direction: Direction) -> PcmError {
    match direction {
        Direction::Playback => PcmError::Underrun,
        Direction::Capture => PcmError::Overrun,
    }
}

/// 原子状态容器
///
/// 后端（"驱动侧"）可以异步把 RUNNING 压成 XRUN，
/// 传输循环在每次等待之后重读，绝不跨挂起点缓存。
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: State) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    #[inline]
    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// 仅当当前状态等于 `from` 时迁移到 `to`
    pub fn transition(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 状态门：要求已安装硬件配置
    pub fn require_setup(&self, op: &'static str) -> Result<State> {
        let s = self.get();
        if !s.has_setup() {
            return Err(PcmError::BadState { op, state: s });
        }
        Ok(s)
    }
}

/// `prepare` 的合法出发状态
pub fn can_prepare(state: State) -> bool {
    matches!(
        state,
        State::Setup | State::Prepared | State::Running | State::Xrun | State::Paused
    )
}

/// `start` 仅允许从 PREPARED 出发
pub fn can_start(state: State) -> bool {
    state == State::Prepared
}

/// `drop` 允许任何已安装配置的状态
pub fn can_drop(state: State) -> bool {
    state.has_setup() && state != State::Suspended
}

/// `drain` 允许 RUNNING/PREPARED
pub fn can_drain(state: State) -> bool {
    matches!(state, State::Running | State::Prepared)
}

/// `rewind` 需要指针有意义的状态
pub fn can_rewind(state: State) -> bool {
    matches!(
        state,
        State::Prepared | State::Running | State::Draining | State::Paused
    )
}

/// 写端传输门：PREPARED 或 RUNNING；XRUN 给方向化错误；其余 BadState
pub fn write_gate(state: State, direction: Direction, op: &'static str) -> Result<()> {
    match state {
        State::Prepared | State::Running => Ok(()),
        State::Xrun => Err(xrun_error(direction)),
        s => Err(PcmError::BadState { op, state: s }),
    }
}

/// 读端传输门：PREPARED、RUNNING 或 DRAINING
pub fn read_gate(state: State, direction: Direction, op: &'static str) -> Result<()> {
    match state {
        State::Prepared | State::Running | State::Draining => Ok(()),
        State::Xrun => Err(xrun_error(direction)),
        s => Err(PcmError::BadState { op, state: s }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_tables() {
        // 写门
        assert!(write_gate(State::Prepared, Direction::Playback, "write").is_ok());
        assert!(write_gate(State::Running, Direction::Playback, "write").is_ok());
        assert_eq!(
            write_gate(State::Xrun, Direction::Playback, "write"),
            Err(PcmError::Underrun)
        );
        assert!(matches!(
            write_gate(State::Draining, Direction::Playback, "write"),
            Err(PcmError::BadState { .. })
        ));
        assert!(matches!(
            write_gate(State::Setup, Direction::Playback, "write"),
            Err(PcmError::BadState { .. })
        ));

        // 读门：DRAINING 也合法，XRUN 报 Overrun
        assert!(read_gate(State::Draining, Direction::Capture, "read").is_ok());
        assert_eq!(
            read_gate(State::Xrun, Direction::Capture, "read"),
            Err(PcmError::Overrun)
        );

        // 预留状态一律拒绝
        assert!(matches!(
            write_gate(State::Suspended, Direction::Playback, "write"),
            Err(PcmError::BadState { .. })
        ));
        assert!(matches!(
            read_gate(State::Disconnected, Direction::Capture, "read"),
            Err(PcmError::BadState { .. })
        ));
    }

    #[test]
    fn test_transition_legality() {
        assert!(can_prepare(State::Setup));
        assert!(can_prepare(State::Xrun));
        assert!(can_prepare(State::Paused));
        assert!(!can_prepare(State::Open));
        assert!(!can_prepare(State::Draining));

        assert!(can_start(State::Prepared));
        assert!(!can_start(State::Running));
        assert!(!can_start(State::Setup));

        assert!(can_drop(State::Draining));
        assert!(!can_drop(State::Open));

        assert!(can_drain(State::Running));
        assert!(!can_drain(State::Xrun));
    }

    #[test]
    fn test_state_cell_cas() {
        let cell = StateCell::new(State::Prepared);
        assert!(cell.transition(State::Prepared, State::Running));
        assert!(!cell.transition(State::Prepared, State::Running));
        assert_eq!(cell.get(), State::Running);
        // 驱动侧异步压 XRUN
        cell.set(State::Xrun);
        assert_eq!(cell.get(), State::Xrun);
    }
}
