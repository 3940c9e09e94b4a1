//! pcmstream - 用户态 PCM 帧传输层
//!
//! 在应用和（硬件或虚拟）音频设备之间通过共享环形缓冲区搬运定长采样帧。
//!
//! 包含：
//! - Area: 位精确的 channel area 拷贝/静音原语（4-bit 至 64-bit 物理宽度）
//! - Ring: mmap 风格 begin/commit 环形缓冲区访问协议
//! - State: 设备操作状态机（非法迁移检测）
//! - Transfer: 阻塞/非阻塞读写循环（对齐、部分传输计账）

#![allow(dead_code)]

pub mod area;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod link;
pub mod ring;
pub mod state;
pub mod transfer;

pub use area::ChannelArea;
pub use config::{HwConfig, SwParams};
pub use device::{Device, Status};
pub use error::{PcmError, Result};
pub use format::{Access, Direction, SampleFormat};
pub use state::State;
