//! virt 后端：进程内虚拟设备
//!
//! 硬件侧没有真实时钟，由 `VirtCtl`（"驱动手柄"）显式推进：
//! 测试或宿主代码调用 `advance` 模拟中断消费/生产帧。
//! 欠载/溢出按 stop_threshold 判定，排空在余量耗尽时完成。
//! 这是唯一支持 link 同步组的内置后端。

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::{HwConfig, SwParams, TstampMode};
use crate::device::{ring_for, ControlOps, Device, FastOps, StaticInfo, Status};
use crate::error::{PcmError, Result};
use crate::format::Direction;
use crate::link::{AsyncRegistry, LinkGroup, LinkMember};
use crate::ring::Ring;
use crate::state::{self, xrun_error, State, StateCell};

struct VirtShared {
    direction: Direction,
    state: StateCell,
    ring: Mutex<Option<Arc<Ring>>>,
    sw: Mutex<Option<SwParams>>,
    group: Mutex<Option<Arc<LinkGroup>>>,
    async_reg: Mutex<Option<Arc<AsyncRegistry>>>,
    period_size: AtomicU64,
    period_accum: AtomicU64,
    /// 就绪唤醒：硬件推进、xrun、状态变更时 notify_all
    wait_lock: Mutex<()>,
    wakeup: Condvar,
}

impl VirtShared {
    fn ring(&self, op: &'static str) -> Result<Arc<Ring>> {
        self.ring
            .lock()
            .unwrap()
            .clone()
            .ok_or(PcmError::BadState {
                op,
                state: self.state.get(),
            })
    }

    fn sw(&self) -> Option<SwParams> {
        self.sw.lock().unwrap().clone()
    }

    fn notify(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.wakeup.notify_all();
    }

    fn dispatch_periods(&self, frames: u64) {
        let period = self.period_size.load(Ordering::Relaxed);
        if period == 0 {
            return;
        }
        let reg = self.async_reg.lock().unwrap().clone();
        let Some(reg) = reg else { return };
        let mut accum = self.period_accum.fetch_add(frames, Ordering::Relaxed) + frames;
        while accum >= period {
            reg.dispatch();
            accum -= period;
            self.period_accum.fetch_sub(period, Ordering::Relaxed);
        }
    }

    /// 驱动侧推进硬件指针，返回实际推进的帧数
    ///
    /// 播放最多消费已填充的余量；采集最多生产到缓冲区写满。
    /// 推进后按 stop_threshold 判定 xrun，排空完成迁回 PREPARED。
    fn advance_hw(&self, frames: u64) -> Result<u64> {
        let s = self.state.get();
        if !matches!(s, State::Running | State::Draining) {
            return Err(PcmError::BadState {
                op: "advance",
                state: s,
            });
        }
        let ring = self.ring("advance")?;
        let moved = match self.direction {
            Direction::Playback => {
                let filled = ring.filled();
                let n = frames.min(filled);
                ring.hw_forward(n);
                if n < frames {
                    // 驱动要的比应用给的多
                    match self.state.get() {
                        State::Draining => {
                            self.state.set(State::Prepared);
                            log::debug!("virt: drain complete");
                        }
                        State::Running => {
                            let stop = self
                                .sw()
                                .map(|sw| sw.stop_threshold)
                                .unwrap_or(ring.buffer_size());
                            if ring.avail(Direction::Playback) >= stop as i64 {
                                self.state.set(State::Xrun);
                                log::warn!("virt: playback underrun");
                            }
                        }
                        _ => {}
                    }
                }
                n
            }
            Direction::Capture => {
                if s == State::Draining {
                    // 采集排空：硬件已停止生产
                    return Ok(0);
                }
                let free = ring.buffer_size() as i64 - ring.avail(Direction::Capture);
                let n = frames.min(free.max(0) as u64);
                ring.hw_forward(n);
                let stop = self
                    .sw()
                    .map(|sw| sw.stop_threshold)
                    .unwrap_or(ring.buffer_size());
                let over = n < frames
                    || (stop < ring.buffer_size()
                        && ring.avail(Direction::Capture) >= stop as i64);
                if over && self.state.get() == State::Running {
                    self.state.set(State::Xrun);
                    log::warn!("virt: capture overrun");
                }
                n
            }
        };
        if moved > 0 {
            self.dispatch_periods(moved);
        }
        self.notify();
        Ok(moved)
    }

    /// 等待就绪条件：xrun、停机状态或 avail >= avail_min
    fn ready(&self) -> bool {
        let s = self.state.get();
        if !matches!(s, State::Running | State::Draining | State::Prepared) {
            return true;
        }
        let Ok(ring) = self.ring("wait") else {
            return true;
        };
        let min = self.sw().map(|sw| sw.avail_min).unwrap_or(1).max(1);
        ring.avail(self.direction) >= min as i64
    }
}

impl LinkMember for VirtShared {
    fn member_start(&self) -> Result<()> {
        if !self.state.transition(State::Prepared, State::Running) {
            return Err(PcmError::BadState {
                op: "start",
                state: self.state.get(),
            });
        }
        self.notify();
        Ok(())
    }

    fn member_stop(&self) -> Result<()> {
        let s = self.state.get();
        if !state::can_drop(s) {
            return Err(PcmError::BadState { op: "drop", state: s });
        }
        let ring = self.ring("drop")?;
        ring.reset_ptrs();
        self.period_accum.store(0, Ordering::Relaxed);
        self.state.set(State::Prepared);
        self.notify();
        Ok(())
    }

    fn member_prepare(&self) -> Result<()> {
        let s = self.state.get();
        if !state::can_prepare(s) {
            return Err(PcmError::BadState {
                op: "prepare",
                state: s,
            });
        }
        let ring = self.ring("prepare")?;
        ring.reset_ptrs();
        self.period_accum.store(0, Ordering::Relaxed);
        self.state.set(State::Prepared);
        self.notify();
        Ok(())
    }
}

pub(crate) struct VirtFast {
    shared: Arc<VirtShared>,
}

impl VirtFast {
    /// 组内 fan-out：已入组时作用于全组，否则只动自己
    fn with_group(
        &self,
        solo: impl Fn(&VirtShared) -> Result<()>,
        grouped: impl Fn(&LinkGroup) -> Result<()>,
    ) -> Result<()> {
        let group = self.shared.group.lock().unwrap().clone();
        match group {
            Some(g) => grouped(g.as_ref()),
            None => solo(self.shared.as_ref()),
        }
    }
}

impl FastOps for VirtFast {
    fn state(&self) -> State {
        self.shared.state.get()
    }

    fn status(&self) -> Result<Status> {
        let state = self.shared.state.get();
        let (avail, delay) = match self.shared.ring("status") {
            Ok(ring) => (ring.avail(self.shared.direction), self.delay().unwrap_or(0)),
            Err(_) => (0, 0),
        };
        let tstamp = match self.shared.sw().map(|sw| sw.tstamp_mode) {
            Some(TstampMode::Enable) => Some(SystemTime::now()),
            _ => None,
        };
        Ok(Status {
            state,
            avail,
            delay,
            tstamp,
        })
    }

    fn prepare(&self) -> Result<()> {
        self.with_group(|s| s.member_prepare(), |g| g.prepare_all())
    }

    fn reset(&self) -> Result<()> {
        let ring = self.shared.ring("reset")?;
        ring.sync_appl_to_hw();
        self.shared.notify();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.with_group(|s| s.member_start(), |g| g.start_all())?;
        log::debug!("virt: started");
        Ok(())
    }

    fn drop_frames(&self) -> Result<()> {
        self.with_group(|s| s.member_stop(), |g| g.stop_all())
    }

    fn drain(&self) -> Result<()> {
        let s = self.shared.state.get();
        if !state::can_drain(s) {
            return Err(PcmError::BadState { op: "drain", state: s });
        }
        let ring = self.shared.ring("drain")?;
        match self.shared.direction {
            Direction::Playback => {
                if ring.filled() == 0 {
                    // 没有余量，立即完成
                    self.shared.state.set(State::Prepared);
                } else {
                    self.shared.state.set(State::Draining);
                }
            }
            Direction::Capture => {
                // 采集排空：硬件停止生产，余量仍可读尽
                self.shared.state.set(State::Draining);
            }
        }
        self.shared.notify();
        Ok(())
    }

    fn pause(&self, enable: bool) -> Result<()> {
        let (from, to) = if enable {
            (State::Running, State::Paused)
        } else {
            (State::Paused, State::Running)
        };
        if !self.shared.state.transition(from, to) {
            return Err(PcmError::BadState {
                op: "pause",
                state: self.shared.state.get(),
            });
        }
        self.shared.notify();
        Ok(())
    }

    fn rewind(&self, frames: u64) -> Result<u64> {
        let s = self.shared.state.get();
        if !state::can_rewind(s) {
            return Err(PcmError::BadState {
                op: "rewind",
                state: s,
            });
        }
        let ring = self.shared.ring("rewind")?;
        Ok(ring.appl_rewind(frames, self.shared.direction))
    }

    fn delay(&self) -> Result<i64> {
        let ring = self.shared.ring("delay")?;
        Ok(match self.shared.direction {
            Direction::Playback => ring.filled() as i64,
            Direction::Capture => ring.avail(Direction::Capture),
        })
    }

    fn avail_update(&self) -> Result<u64> {
        if self.shared.state.get() == State::Xrun {
            return Err(xrun_error(self.shared.direction));
        }
        let ring = self.shared.ring("avail_update")?;
        Ok(ring.avail(self.shared.direction).max(0) as u64)
    }

    fn mmap_commit(&self, _offset: u64, frames: u64) -> Result<u64> {
        let ring = self.shared.ring("mmap_commit")?;
        ring.appl_forward(frames);
        // 静音预填：欠载时硬件读到的是静音而不是陈旧样本
        if self.shared.direction == Direction::Playback {
            if let Some(sw) = self.shared.sw() {
                if sw.silence_size > 0 {
                    let ahead = ring.avail(Direction::Playback).max(0) as u64;
                    let n = sw.silence_size.min(ahead);
                    if n > 0 {
                        ring.silence_range(ring.appl_ptr(), n)?;
                    }
                }
            }
        }
        self.shared.notify();
        Ok(frames)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut guard = self.shared.wait_lock.lock().unwrap();
        loop {
            if self.shared.ready() {
                return Ok(true);
            }
            match deadline {
                None => {
                    guard = self.shared.wakeup.wait(guard).unwrap();
                }
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    let (g, res) = self.shared.wakeup.wait_timeout(guard, d - now).unwrap();
                    guard = g;
                    if res.timed_out() && !self.shared.ready() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn link(&self, other: &dyn FastOps) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<VirtFast>()
            .ok_or(PcmError::Unsupported("link across backend types"))?;
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return Err(PcmError::InvalidArgument("cannot link device to itself"));
        }
        // 取已有的组或建新组；两端都已入不同组时拒绝
        let mut mine = self.shared.group.lock().unwrap();
        let mut theirs = other.shared.group.lock().unwrap();
        match (mine.as_ref(), theirs.as_ref()) {
            (Some(a), Some(b)) => {
                if !Arc::ptr_eq(a, b) {
                    return Err(PcmError::InvalidArgument("already linked to another group"));
                }
            }
            (Some(g), None) => {
                g.add(other.shared.clone());
                *theirs = Some(g.clone());
            }
            (None, Some(g)) => {
                g.add(self.shared.clone());
                *mine = Some(g.clone());
            }
            (None, None) => {
                let g = LinkGroup::new();
                g.add(self.shared.clone());
                g.add(other.shared.clone());
                *mine = Some(g.clone());
                *theirs = Some(g);
            }
        }
        Ok(())
    }

    fn unlink(&self) -> Result<()> {
        let mut mine = self.shared.group.lock().unwrap();
        match mine.take() {
            Some(g) => {
                let me: Arc<dyn LinkMember> = self.shared.clone();
                g.remove(&me);
                Ok(())
            }
            None => Err(PcmError::InvalidArgument("not linked")),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct VirtControl {
    shared: Arc<VirtShared>,
}

impl ControlOps for VirtControl {
    fn close(&mut self) -> Result<()> {
        self.shared.notify();
        Ok(())
    }

    fn install_hw(&mut self, cfg: &HwConfig) -> Result<Arc<Ring>> {
        let s = self.shared.state.get();
        if !matches!(s, State::Open | State::Setup) {
            return Err(PcmError::BadState {
                op: "hw_params",
                state: s,
            });
        }
        let ring = ring_for(cfg);
        ring.lock_memory();
        *self.shared.ring.lock().unwrap() = Some(ring.clone());
        self.shared
            .period_size
            .store(cfg.period_size, Ordering::Relaxed);
        self.shared.state.set(State::Setup);
        Ok(ring)
    }

    fn free_hw(&mut self) -> Result<()> {
        let s = self.shared.state.get();
        if !s.has_setup() {
            return Err(PcmError::BadState {
                op: "hw_free",
                state: s,
            });
        }
        *self.shared.ring.lock().unwrap() = None;
        self.shared.state.set(State::Open);
        Ok(())
    }

    fn install_sw(&mut self, sw: &SwParams) -> Result<()> {
        *self.shared.sw.lock().unwrap() = Some(sw.clone());
        Ok(())
    }

    fn set_nonblock(&mut self, _nonblock: bool) -> Result<()> {
        Ok(())
    }

    fn enable_async(&mut self, registry: Arc<AsyncRegistry>) -> Result<()> {
        *self.shared.async_reg.lock().unwrap() = Some(registry);
        Ok(())
    }

    fn static_info(&self) -> StaticInfo {
        StaticInfo {
            name: "virt".to_string(),
            direction: self.shared.direction,
            backend: "virt",
        }
    }
}

/// 驱动手柄：模拟硬件中断侧
///
/// 持有与设备相同的共享体；设备关闭后 advance 返回 BadState。
pub struct VirtCtl {
    shared: Arc<VirtShared>,
}

impl VirtCtl {
    /// 推进硬件指针 `frames`（消费/生产），返回实际推进量
    pub fn advance(&self, frames: u64) -> Result<u64> {
        self.shared.advance_hw(frames)
    }

    /// 直接把设备压进 XRUN（测试故障注入）
    pub fn force_xrun(&self) {
        self.shared.state.set(State::Xrun);
        self.shared.notify();
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    /// 硬件侧视角的环（采集测试往里写样本用）
    pub fn ring(&self) -> Option<Arc<Ring>> {
        self.shared.ring.lock().unwrap().clone()
    }
}

/// virt 后端入口
pub struct VirtBackend;

impl VirtBackend {
    pub fn open(direction: Direction) -> (Device, VirtCtl) {
        let shared = Arc::new(VirtShared {
            direction,
            state: StateCell::new(State::Open),
            ring: Mutex::new(None),
            sw: Mutex::new(None),
            group: Mutex::new(None),
            async_reg: Mutex::new(None),
            period_size: AtomicU64::new(0),
            period_accum: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        });
        let dev = Device::from_parts(
            "virt".to_string(),
            direction,
            Box::new(VirtControl {
                shared: shared.clone(),
            }),
            Arc::new(VirtFast {
                shared: shared.clone(),
            }),
        );
        (dev, VirtCtl { shared })
    }
}
