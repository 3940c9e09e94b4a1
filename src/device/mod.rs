//! 设备句柄与操作分派
//!
//! 每个设备带两张操作表：
//! - `ControlOps`：慢路径，可能阻塞的控制操作（配置安装/释放、关闭等）
//! - `FastOps`：热路径，必须廉价、每次迭代都可调用（状态、可用量、
//!   prepare/start/stop、commit、等待）
//!
//! 后端按传输类型各自实现（内核设备、虚拟/软件设备、网络共享设备），
//! 本层只做状态门与转发。

pub mod null;
pub mod virt;

use std::any::Any;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::{boundary_for, HwConfig, SwParams};
use crate::error::{PcmError, Result};
use crate::format::Direction;
use crate::link::{AsyncCallback, AsyncRegistry};
use crate::ring::Ring;
use crate::state::State;

/// 设备静态信息
#[derive(Clone, Debug)]
pub struct StaticInfo {
    pub name: String,
    pub direction: Direction,
    pub backend: &'static str,
}

/// 运行时状态快照
#[derive(Clone, Debug)]
pub struct Status {
    pub state: State,
    /// 应用侧可用帧数；负值表示 xrun
    pub avail: i64,
    /// 应用指针与硬件播放/采集位置的距离（帧）
    pub delay: i64,
    /// 按 tstamp_mode 采集的时间戳
    pub tstamp: Option<SystemTime>,
}

/// 慢路径操作表：不频繁、可能阻塞
pub trait ControlOps: Send {
    fn close(&mut self) -> Result<()>;
    /// 安装硬件配置，返回后端创建的共享环
    fn install_hw(&mut self, cfg: &HwConfig) -> Result<Arc<Ring>>;
    /// 拆除硬件配置（仅 SETUP/PREPARED 合法），设备回到 OPEN
    fn free_hw(&mut self) -> Result<()>;
    fn install_sw(&mut self, sw: &SwParams) -> Result<()>;
    fn set_nonblock(&mut self, nonblock: bool) -> Result<()>;
    /// 启用异步通知模式并挂接订阅清单（幂等）
    fn enable_async(&mut self, registry: Arc<AsyncRegistry>) -> Result<()>;
    fn static_info(&self) -> StaticInfo;
}

/// 热路径操作表：必须廉价，传输循环每次迭代都可能调用
pub trait FastOps: Send + Sync {
    fn state(&self) -> State;
    fn status(&self) -> Result<Status>;
    fn prepare(&self) -> Result<()>;
    /// 应用指针同步到硬件位置（延迟压到 0）
    fn reset(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    /// 立即停止并丢弃未播/未读帧（ALSA 语义里的 drop）
    fn drop_frames(&self) -> Result<()>;
    fn drain(&self) -> Result<()>;
    fn pause(&self, enable: bool) -> Result<()>;
    fn rewind(&self, frames: u64) -> Result<u64>;
    fn delay(&self) -> Result<i64>;
    /// 刷新硬件指针并返回可用帧数；xrun 返回方向化错误。
    /// 这是唯一允许刷新硬件指针的读取点。
    fn avail_update(&self) -> Result<u64>;
    /// begin/commit 协议的 commit 半边：推进应用指针并做
    /// 驱动侧簿记（静音预填等）
    fn mmap_commit(&self, offset: u64, frames: u64) -> Result<u64>;
    /// 阻塞等待就绪；`None` 为无限等。返回是否就绪（false = 超时）
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;
    /// 与另一设备建立同步组；底层不支持时报 Unsupported
    fn link(&self, _other: &dyn FastOps) -> Result<()> {
        Err(PcmError::Unsupported("link"))
    }
    fn unlink(&self) -> Result<()> {
        Err(PcmError::Unsupported("link"))
    }
    fn as_any(&self) -> &dyn Any;
}

/// 一个已打开的音频流端点
///
/// 设备句柄假定被单一逻辑线程顺序使用（内部不加锁）；
/// 并发只来自驱动侧异步推进硬件指针和就绪通知。
pub struct Device {
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) nonblock: bool,
    pub(crate) ops: Box<dyn ControlOps>,
    pub(crate) fast: Arc<dyn FastOps>,
    /// 安装硬件配置后有效
    pub(crate) ring: Option<Arc<Ring>>,
    pub(crate) hw: Option<HwConfig>,
    pub(crate) sw: Option<SwParams>,
    async_reg: Arc<AsyncRegistry>,
    async_enabled: bool,
    closed: bool,
}

impl Device {
    /// 由后端 open 构造；初始状态 OPEN
    pub(crate) fn from_parts(
        name: String,
        direction: Direction,
        ops: Box<dyn ControlOps>,
        fast: Arc<dyn FastOps>,
    ) -> Self {
        Self {
            name,
            direction,
            nonblock: false,
            ops,
            fast,
            ring: None,
            hw: None,
            sw: None,
            async_reg: AsyncRegistry::new(),
            async_enabled: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> State {
        self.fast.state()
    }

    pub fn hw_config(&self) -> Option<&HwConfig> {
        self.hw.as_ref()
    }

    pub fn sw_params_current(&self) -> Option<&SwParams> {
        self.sw.as_ref()
    }

    pub(crate) fn require_setup(&self, op: &'static str) -> Result<()> {
        if self.ring.is_none() {
            return Err(PcmError::BadState {
                op,
                state: self.fast.state(),
            });
        }
        Ok(())
    }

    /// 安装硬件配置并自动 prepare
    pub fn hw_params(&mut self, cfg: HwConfig) -> Result<()> {
        cfg.validate()?;
        let ring = self.ops.install_hw(&cfg)?;
        let sw = SwParams::default_for(&cfg);
        self.ops.install_sw(&sw)?;
        log::debug!(
            "hw config installed: {} {}ch {}/{} Hz period={} buffer={}",
            cfg.format.name(),
            cfg.channels,
            cfg.rate_num,
            cfg.rate_den,
            cfg.period_size,
            cfg.buffer_size
        );
        self.ring = Some(ring);
        self.hw = Some(cfg);
        self.sw = Some(sw);
        self.fast.prepare()
    }

    /// 安装软件参数
    pub fn sw_params(&mut self, sw: SwParams) -> Result<()> {
        self.require_setup("sw_params")?;
        let hw = self.hw.as_ref().unwrap();
        let boundary = self.ring.as_ref().unwrap().boundary();
        sw.validate(hw, boundary)?;
        self.ops.install_sw(&sw)?;
        self.sw = Some(sw);
        Ok(())
    }

    /// 拆除硬件配置，回到 OPEN
    pub fn hw_free(&mut self) -> Result<()> {
        self.require_setup("hw_free")?;
        let state = self.fast.state();
        if !matches!(state, State::Setup | State::Prepared) {
            return Err(PcmError::BadState {
                op: "hw_free",
                state,
            });
        }
        self.ops.free_hw()?;
        self.ring = None;
        self.hw = None;
        self.sw = None;
        Ok(())
    }

    pub fn set_nonblock(&mut self, nonblock: bool) -> Result<()> {
        self.ops.set_nonblock(nonblock)?;
        self.nonblock = nonblock;
        Ok(())
    }

    pub fn is_nonblock(&self) -> bool {
        self.nonblock
    }

    // ---- 状态控制（转发热路径表） ----

    pub fn prepare(&self) -> Result<()> {
        self.require_setup("prepare")?;
        self.fast.prepare()
    }

    pub fn reset(&self) -> Result<()> {
        self.require_setup("reset")?;
        self.fast.reset()
    }

    pub fn start(&self) -> Result<()> {
        self.require_setup("start")?;
        self.fast.start()
    }

    pub fn drop_frames(&self) -> Result<()> {
        self.require_setup("drop")?;
        self.fast.drop_frames()
    }

    pub fn drain(&self) -> Result<()> {
        self.require_setup("drain")?;
        self.fast.drain()
    }

    pub fn pause(&self, enable: bool) -> Result<()> {
        self.require_setup("pause")?;
        self.fast.pause(enable)
    }

    pub fn rewind(&self, frames: u64) -> Result<u64> {
        self.require_setup("rewind")?;
        if frames == 0 {
            return Err(PcmError::InvalidArgument("rewind of zero frames"));
        }
        self.fast.rewind(frames)
    }

    pub fn delay(&self) -> Result<i64> {
        self.require_setup("delay")?;
        self.fast.delay()
    }

    pub fn status(&self) -> Result<Status> {
        self.fast.status()
    }

    /// 刷新硬件指针并返回应用侧可用帧数
    pub fn avail_update(&self) -> Result<u64> {
        self.require_setup("avail_update")?;
        self.fast.avail_update()
    }

    /// 阻塞等待设备就绪（可读/可写）；`None` 无限等
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.require_setup("wait")?;
        self.fast.wait(timeout)
    }

    // ---- begin/commit 零拷贝访问 ----

    /// 申请访问环形缓冲区的一段
    ///
    /// 返回 (channel areas, 应用指针在缓冲区内的偏移, 授予帧数)。
    /// 授予量不会跨物理回绕点；要续过回绕点需再次 begin。
    pub fn mmap_begin(&self, wanted: u64) -> Result<(Vec<crate::area::ChannelArea>, u64, u64)> {
        self.require_setup("mmap_begin")?;
        let ring = self.ring.as_ref().unwrap();
        let (offset, granted) = ring.begin(wanted, self.direction);
        Ok((ring.areas(), offset, granted))
    }

    /// 提交 begin 过的访问
    ///
    /// `offset` 必须等于最近一次 begin 返回的值，`frames` 不得超过
    /// 当前可用量；违背前置条件返回 InvalidArgument，指针不动。
    pub fn mmap_commit(&self, offset: u64, frames: u64) -> Result<u64> {
        self.require_setup("mmap_commit")?;
        let ring = self.ring.as_ref().unwrap();
        if offset != ring.appl_ptr() % ring.buffer_size() {
            return Err(PcmError::InvalidArgument("commit offset mismatch"));
        }
        if frames > ring.avail(self.direction).max(0) as u64 {
            return Err(PcmError::InvalidArgument("commit exceeds available frames"));
        }
        self.fast.mmap_commit(offset, frames)
    }

    // ---- 单位换算 ----

    pub fn bytes_to_frames(&self, bytes: usize) -> Result<u64> {
        self.require_setup("bytes_to_frames")?;
        let fb = self.hw.as_ref().unwrap().frame_bits() as usize;
        if bytes * 8 % fb != 0 {
            return Err(PcmError::InvalidArgument("byte count not frame aligned"));
        }
        Ok((bytes * 8 / fb) as u64)
    }

    pub fn frames_to_bytes(&self, frames: u64) -> Result<usize> {
        self.require_setup("frames_to_bytes")?;
        let fb = self.hw.as_ref().unwrap().frame_bits() as u64;
        Ok((frames * fb / 8) as usize)
    }

    pub fn bytes_to_samples(&self, bytes: usize) -> Result<u64> {
        self.require_setup("bytes_to_samples")?;
        let sb = self.hw.as_ref().unwrap().sample_bits() as usize;
        if bytes * 8 % sb != 0 {
            return Err(PcmError::InvalidArgument("byte count not sample aligned"));
        }
        Ok((bytes * 8 / sb) as u64)
    }

    pub fn samples_to_bytes(&self, samples: u64) -> Result<usize> {
        self.require_setup("samples_to_bytes")?;
        let sb = self.hw.as_ref().unwrap().sample_bits() as u64;
        Ok((samples * sb / 8) as usize)
    }

    // ---- 异步通知订阅 ----

    /// 登记就绪通知订阅者；首个订阅者会同时启用设备的异步通知模式
    pub fn add_async_handler(&mut self, cb: AsyncCallback) -> Result<u64> {
        if !self.async_enabled {
            self.ops.enable_async(self.async_reg.clone())?;
            self.async_enabled = true;
        }
        Ok(self.async_reg.add(cb))
    }

    /// 按令牌移除订阅者；通知模式保持启用，只释放订阅记录
    pub fn remove_async_handler(&mut self, token: u64) -> Result<()> {
        if self.async_reg.remove(token) {
            Ok(())
        } else {
            Err(PcmError::InvalidArgument("unknown async handler token"))
        }
    }

    // ---- link ----

    /// 与另一设备建立同步组：之后对任一成员的 start/drop/prepare
    /// 作用于整组。两端底层都要支持该原语。
    pub fn link(&self, other: &Device) -> Result<()> {
        self.fast.link(other.fast.as_ref())
    }

    /// 从同步组移除；未加入时返回错误
    pub fn unlink(&self) -> Result<()> {
        self.fast.unlink()
    }

    // ---- 关闭 ----

    /// 关闭句柄并释放资源
    ///
    /// 尚有数据未冲掉时：阻塞播放句柄隐式 drain，
    /// 采集或非阻塞句柄隐式 drop。
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.ring.is_some() {
            if self.nonblock || self.direction == Direction::Capture {
                let _ = self.fast.drop_frames();
            } else {
                let _ = self.fast.drain();
                // 软件后端没有自主消费者，drain 不能无限等；
                // 残留 DRAINING 时强制停住再拆配置
                if self.fast.state() == State::Draining {
                    let _ = self.fast.drop_frames();
                }
            }
            self.ops.free_hw()?;
            self.ring = None;
        }
        self.async_reg.clear();
        self.ops.close()
    }

    /// 人类可读的 hw/sw 配置转储
    pub fn dump_setup(&self) -> String {
        let mut out = String::new();
        let info = self.ops.static_info();
        let _ = writeln!(out, "name         : {}", info.name);
        let _ = writeln!(out, "backend      : {}", info.backend);
        let _ = writeln!(out, "stream       : {}", self.direction.name());
        match (&self.hw, &self.sw, &self.ring) {
            (Some(hw), Some(sw), Some(ring)) => {
                let _ = writeln!(out, "access       : {}", hw.access.name());
                let _ = writeln!(out, "format       : {}", hw.format.name());
                let _ = writeln!(out, "subformat    : {}", hw.subformat.name());
                let _ = writeln!(out, "channels     : {}", hw.channels);
                let _ = writeln!(out, "rate         : {}/{}", hw.rate_num, hw.rate_den);
                let _ = writeln!(out, "msbits       : {}", hw.msbits);
                let _ = writeln!(out, "period_size  : {}", hw.period_size);
                let _ = writeln!(out, "period_time  : {} us", hw.period_time_us());
                let _ = writeln!(out, "buffer_size  : {}", hw.buffer_size);
                let _ = writeln!(out, "frame_bits   : {}", hw.frame_bits());
                let _ = writeln!(out, "start_threshold  : {}", sw.start_threshold);
                let _ = writeln!(out, "stop_threshold   : {}", sw.stop_threshold);
                let _ = writeln!(out, "silence_threshold: {}", sw.silence_threshold);
                let _ = writeln!(out, "silence_size : {}", sw.silence_size);
                let _ = writeln!(out, "avail_min    : {}", sw.avail_min);
                let _ = writeln!(out, "xfer_align   : {}", sw.xfer_align);
                let _ = writeln!(out, "boundary     : {}", ring.boundary());
            }
            _ => {
                let _ = writeln!(out, "setup        : (not installed)");
            }
        }
        out
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                log::warn!("close on drop failed: {}", e);
            }
        }
    }
}

/// 设备发现协作者的薄入口：按名字解析到内置后端
///
/// 配置文件驱动的解析和动态插件加载是外部协作者（§不在本层），
/// 这里只认内置类型名。
pub fn open(name: &str, direction: Direction) -> Result<Device> {
    match name {
        "null" => Ok(null::NullBackend::open(direction)),
        "virt" => Ok(virt::VirtBackend::open(direction).0),
        other => Err(PcmError::NotFound(other.to_string())),
    }
}

/// 安装配置时统一计算 boundary（后端共用）
pub(crate) fn ring_for(cfg: &HwConfig) -> Arc<Ring> {
    Arc::new(Ring::new(cfg, boundary_for(cfg.buffer_size)))
}
