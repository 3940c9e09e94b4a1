//! 错误分类
//!
//! 所有公开操作要么返回非负计数/值，要么返回一个分类错误。
//! 运行期状况（状态不符、xrun、would-block）不 panic，只有
//! 编程契约违背（如非零长度配空指针）才允许终止进程。

use crate::state::State;

/// PCM 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PcmError {
    /// 操作在当前状态下不合法
    #[error("{op} not allowed in state {state}")]
    BadState { op: &'static str, state: State },

    /// 播放欠载（应用供数不及时）
    #[error("playback underrun")]
    Underrun,

    /// 采集溢出（应用取数不及时）
    #[error("capture overrun")]
    Overrun,

    /// 非阻塞模式下无法推进
    #[error("operation would block")]
    WouldBlock,

    /// 前置条件违背（如 commit 偏移不匹配）
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// 能力缺失（如底层不支持 link）
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    /// 设备解析失败
    #[error("device not found: {0}")]
    NotFound(String),

    /// 配置空间无解
    #[error("no matching configuration")]
    Empty,

    /// 底层传输失败（对本层不透明）
    #[error("transport failure: {0}")]
    Transport(String),

    /// 采样格式物理宽度不在内核支持范围内
    #[error("unsupported physical sample width: {0} bits")]
    UnsupportedFormat(u32),
}

pub type Result<T> = std::result::Result<T, PcmError>;
