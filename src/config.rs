//! 已解析的硬件/软件配置
//!
//! 约束求解（mask/interval 协商）是外部协作者，本层只消费它的输出：
//! 一组已定死的 access/format/rate/period/buffer 组合。
//! 软件参数（阈值族）只通过显式安装变更，传输循环每次调用都会读。

use crate::error::{PcmError, Result};
use crate::format::{Access, SampleFormat, Subformat};

/// 指针回绕模数的安全上限：boundary 翻倍到不超过这里为止，
/// 保证 mod boundary 的指针运算在设备生命周期内不会歧义
const BOUNDARY_CEILING: u64 = 1 << 62;

/// 为给定缓冲区大小计算 boundary
///
/// 从 buffer_size 出发不断翻倍，始终保持 buffer_size 的整数倍。
pub fn boundary_for(buffer_size: u64) -> u64 {
    let mut b = buffer_size;
    while b < BOUNDARY_CEILING {
        b *= 2;
    }
    b
}

/// 已解析的硬件配置
///
/// 字段仅在 SETUP 及之后的状态有效。
#[derive(Clone, Debug)]
pub struct HwConfig {
    pub access: Access,
    pub format: SampleFormat,
    pub subformat: Subformat,
    pub channels: u32,
    /// 精确有理数采样率 rate_num/rate_den
    pub rate_num: u32,
    pub rate_den: u32,
    /// 周期大小（帧）：驱动上报进度的粒度
    pub period_size: u64,
    /// 缓冲区大小（帧）
    pub buffer_size: u64,
    /// 每样本有效位数
    pub msbits: u32,
}

impl HwConfig {
    /// 常用整数采样率的便捷构造
    pub fn new(
        access: Access,
        format: SampleFormat,
        channels: u32,
        rate: u32,
        period_size: u64,
        buffer_size: u64,
    ) -> Self {
        Self {
            access,
            format,
            subformat: Subformat::Std,
            channels,
            rate_num: rate,
            rate_den: 1,
            period_size,
            buffer_size,
            msbits: format.width(),
        }
    }

    /// 每样本物理位数
    pub fn sample_bits(&self) -> u32 {
        self.format.physical_width()
    }

    /// 每帧位数 = 每样本位数 × 声道数
    pub fn frame_bits(&self) -> u32 {
        self.sample_bits() * self.channels
    }

    /// 每帧字节数（要求帧位数按字节对齐，见 validate）
    pub fn frame_bytes(&self) -> usize {
        (self.frame_bits() / 8) as usize
    }

    /// 周期时长（微秒），按精确有理数速率计算
    pub fn period_time_us(&self) -> u64 {
        self.period_size * 1_000_000 * self.rate_den as u64 / self.rate_num as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(PcmError::InvalidArgument("channels must be > 0"));
        }
        if self.rate_num == 0 || self.rate_den == 0 {
            return Err(PcmError::InvalidArgument("rate must be > 0"));
        }
        if self.period_size == 0 || self.buffer_size == 0 {
            return Err(PcmError::InvalidArgument("period/buffer size must be > 0"));
        }
        if self.buffer_size < self.period_size || self.buffer_size % self.period_size != 0 {
            return Err(PcmError::InvalidArgument(
                "buffer size must be a multiple of period size",
            ));
        }
        if self.msbits > self.format.width() {
            return Err(PcmError::InvalidArgument("msbits exceeds format width"));
        }
        // 环内存按字节分配，帧流必须落在字节边界上
        if (self.buffer_size * self.frame_bits() as u64) % 8 != 0 {
            return Err(PcmError::InvalidArgument(
                "buffer bit size not byte aligned",
            ));
        }
        Ok(())
    }
}

/// 时间戳模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TstampMode {
    #[default]
    None,
    Enable,
}

impl TstampMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Enable => "ENABLE",
        }
    }
}

/// 旧式 start mode（兼容壳，纯由阈值推导，绝不单独存储）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// 数据到阈值自动启动
    Data,
    /// 只由显式 start 启动
    Explicit,
}

/// 旧式 xrun mode（兼容壳，同上）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XrunMode {
    /// 到停止阈值即判 xrun
    Stop,
    /// 永不自动判 xrun
    None,
}

/// 推导旧式 mode 用的幅值分界（历史遗留的启发式）
const LEGACY_MODE_PIVOT: u64 = 1024 * 1024;

/// 软件参数
#[derive(Clone, Debug)]
pub struct SwParams {
    /// 硬件侧累积到该帧数自动 start（播放为已填充帧数）
    pub start_threshold: u64,
    /// 可用帧数达到该值判 xrun；设为 boundary 可关闭
    pub stop_threshold: u64,
    /// 余量低于该值时开始向前预填静音
    pub silence_threshold: u64,
    /// 一次预填的静音帧数
    pub silence_size: u64,
    /// 就绪唤醒所需的最小可用帧数
    pub avail_min: u64,
    /// 传输对齐单位（帧）
    pub xfer_align: u64,
    /// 周期中断步进
    pub period_step: u32,
    /// 最小睡眠（毫秒粒度提示，0 = 纯中断驱动）
    pub sleep_min: u32,
    pub tstamp_mode: TstampMode,
}

impl SwParams {
    /// 给定硬件配置下的缺省软件参数
    pub fn default_for(hw: &HwConfig) -> Self {
        Self {
            start_threshold: 1,
            stop_threshold: hw.buffer_size,
            silence_threshold: 0,
            silence_size: 0,
            avail_min: hw.period_size,
            xfer_align: 1,
            period_step: 1,
            sleep_min: 0,
            tstamp_mode: TstampMode::None,
        }
    }

    pub fn validate(&self, hw: &HwConfig, boundary: u64) -> Result<()> {
        if self.avail_min == 0 {
            return Err(PcmError::InvalidArgument("avail_min must be > 0"));
        }
        if self.xfer_align == 0 || boundary % self.xfer_align != 0 {
            return Err(PcmError::InvalidArgument("xfer_align must divide boundary"));
        }
        if self.start_threshold == 0 {
            return Err(PcmError::InvalidArgument("start_threshold must be > 0"));
        }
        if self.stop_threshold > boundary {
            return Err(PcmError::InvalidArgument("stop_threshold exceeds boundary"));
        }
        if self.silence_threshold + self.silence_size > hw.buffer_size {
            return Err(PcmError::InvalidArgument(
                "silence_threshold + silence_size exceeds buffer size",
            ));
        }
        Ok(())
    }

    /// 旧式 start mode，由 start_threshold 幅值推导
    pub fn start_mode(&self) -> StartMode {
        if self.start_threshold > LEGACY_MODE_PIVOT {
            StartMode::Explicit
        } else {
            StartMode::Data
        }
    }

    /// 旧式 xrun mode，由 stop_threshold 幅值推导
    pub fn xrun_mode(&self) -> XrunMode {
        if self.stop_threshold > LEGACY_MODE_PIVOT {
            XrunMode::None
        } else {
            XrunMode::Stop
        }
    }
}
