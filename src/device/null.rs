//! null 后端：黑洞设备
//!
//! 播放侧即写即弃（硬件指针影随应用指针），采集侧提供无穷静音。
//! 没有真实时钟，等待永远立即就绪。适合吞吐测试和演示。

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::{HwConfig, SwParams, TstampMode};
use crate::device::{ring_for, ControlOps, Device, FastOps, StaticInfo, Status};
use crate::error::{PcmError, Result};
use crate::format::Direction;
use crate::link::AsyncRegistry;
use crate::ring::Ring;
use crate::state::{self, State, StateCell};

struct NullShared {
    direction: Direction,
    state: StateCell,
    ring: Mutex<Option<Arc<Ring>>>,
    sw: Mutex<Option<SwParams>>,
    async_reg: Mutex<Option<Arc<AsyncRegistry>>>,
    period_size: AtomicU64,
    /// 自上次通知起累计提交的帧数
    period_accum: AtomicU64,
}

impl NullShared {
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

    /// 硬件指针影随应用指针：播放立即消费，采集始终喂满
    fn shadow_hw(&self, ring: &Ring) {
        let appl = ring.appl_ptr();
        match self.direction {
            Direction::Playback => ring.hw_store(appl),
            Direction::Capture => {
                if matches!(self.state.get(), State::Running | State::Draining) {
                    ring.hw_store((appl + ring.buffer_size()) % ring.boundary());
                }
            }
        }
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
}

struct NullFast {
    shared: Arc<NullShared>,
}

impl FastOps for NullFast {
    fn state(&self) -> State {
        self.shared.state.get()
    }

    fn status(&self) -> Result<Status> {
        let state = self.shared.state.get();
        let (avail, delay) = match self.shared.ring("status") {
            Ok(ring) => {
                self.shared.shadow_hw(&ring);
                (ring.avail(self.shared.direction), self.delay()?)
            }
            Err(_) => (0, 0),
        };
        let tstamp = match self.shared.sw.lock().unwrap().as_ref().map(|s| s.tstamp_mode) {
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
        let s = self.shared.state.get();
        if !state::can_prepare(s) {
            return Err(PcmError::BadState {
                op: "prepare",
                state: s,
            });
        }
        let ring = self.shared.ring("prepare")?;
        ring.reset_ptrs();
        self.shared.period_accum.store(0, Ordering::Relaxed);
        self.shared.state.set(State::Prepared);
        log::debug!("null: prepared, pointers reset");
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let ring = self.shared.ring("reset")?;
        ring.sync_appl_to_hw();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if !self.shared.state.transition(State::Prepared, State::Running) {
            return Err(PcmError::BadState {
                op: "start",
                state: self.shared.state.get(),
            });
        }
        log::debug!("null: started");
        Ok(())
    }

    fn drop_frames(&self) -> Result<()> {
        let s = self.shared.state.get();
        if !state::can_drop(s) {
            return Err(PcmError::BadState {
                op: "drop",
                state: s,
            });
        }
        let ring = self.shared.ring("drop")?;
        ring.reset_ptrs();
        self.shared.state.set(State::Prepared);
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        let s = self.shared.state.get();
        if !state::can_drain(s) {
            return Err(PcmError::BadState {
                op: "drain",
                state: s,
            });
        }
        // 没有积压：直接排空完成
        let ring = self.shared.ring("drain")?;
        ring.hw_store(ring.appl_ptr());
        self.shared.state.set(State::Prepared);
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
        let ring = self.shared.ring("avail_update")?;
        self.shared.shadow_hw(&ring);
        Ok(ring.avail(self.shared.direction).max(0) as u64)
    }

    fn mmap_commit(&self, _offset: u64, frames: u64) -> Result<u64> {
        let ring = self.shared.ring("mmap_commit")?;
        ring.appl_forward(frames);
        self.shared.shadow_hw(&ring);
        self.shared.dispatch_periods(frames);
        Ok(frames)
    }

    fn wait(&self, _timeout: Option<Duration>) -> Result<bool> {
        // 黑洞永远就绪
        Ok(true)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct NullControl {
    shared: Arc<NullShared>,
}

impl ControlOps for NullControl {
    fn close(&mut self) -> Result<()> {
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
            name: "null".to_string(),
            direction: self.shared.direction,
            backend: "null",
        }
    }
}

/// null 后端入口
pub struct NullBackend;

impl NullBackend {
    pub fn open(direction: Direction) -> Device {
        let shared = Arc::new(NullShared {
            direction,
            state: StateCell::new(State::Open),
            ring: Mutex::new(None),
            sw: Mutex::new(None),
            async_reg: Mutex::new(None),
            period_size: AtomicU64::new(0),
            period_accum: AtomicU64::new(0),
        });
        Device::from_parts(
            "null".to_string(),
            direction,
            Box::new(NullControl {
                shared: shared.clone(),
            }),
            Arc::new(NullFast { shared }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Access, SampleFormat};

    fn cfg() -> HwConfig {
        HwConfig::new(
            Access::RwInterleaved,
            SampleFormat::S16Le,
            2,
            48000,
            1024,
            4096,
        )
    }

    #[test]
    fn test_null_lifecycle() {
        let mut dev = NullBackend::open(Direction::Playback);
        assert_eq!(dev.state(), State::Open);
        // 未配置时一切传输类操作都是 BadState
        assert!(matches!(
            dev.start(),
            Err(PcmError::BadState { op: "start", .. })
        ));

        dev.hw_params(cfg()).unwrap();
        assert_eq!(dev.state(), State::Prepared);
        dev.start().unwrap();
        assert_eq!(dev.state(), State::Running);
        // start 只能从 PREPARED
        assert!(matches!(dev.start(), Err(PcmError::BadState { .. })));

        dev.pause(true).unwrap();
        assert_eq!(dev.state(), State::Paused);
        dev.pause(false).unwrap();
        dev.drop_frames().unwrap();
        assert_eq!(dev.state(), State::Prepared);

        dev.hw_free().unwrap();
        assert_eq!(dev.state(), State::Open);
        dev.close().unwrap();
    }

    #[test]
    fn test_null_playback_always_writable() {
        let mut dev = NullBackend::open(Direction::Playback);
        dev.hw_params(cfg()).unwrap();
        assert_eq!(dev.avail_update().unwrap(), 4096);
        let (_, offset, granted) = dev.mmap_begin(4096).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(granted, 4096);
        dev.mmap_commit(offset, granted).unwrap();
        // 即写即弃，照样全量可写
        assert_eq!(dev.avail_update().unwrap(), 4096);
        assert_eq!(dev.delay().unwrap(), 0);
    }

    #[test]
    fn test_null_capture_feeds_silence_after_start() {
        let mut dev = NullBackend::open(Direction::Capture);
        dev.hw_params(cfg()).unwrap();
        // 未启动：无可读
        assert_eq!(dev.avail_update().unwrap(), 0);
        dev.start().unwrap();
        assert_eq!(dev.avail_update().unwrap(), 4096);
    }

    #[test]
    fn test_null_prepare_idempotent() {
        let mut dev = NullBackend::open(Direction::Playback);
        dev.hw_params(cfg()).unwrap();
        let (_, offset, granted) = dev.mmap_begin(128).unwrap();
        dev.mmap_commit(offset, granted).unwrap();
        dev.prepare().unwrap();
        let a1 = dev.avail_update().unwrap();
        dev.prepare().unwrap();
        let a2 = dev.avail_update().unwrap();
        assert_eq!(a1, a2);
        assert_eq!(dev.state(), State::Prepared);
        let ring = dev.ring.as_ref().unwrap();
        assert_eq!(ring.appl_ptr(), 0);
        assert_eq!(ring.hw_ptr(), 0);
    }

    #[test]
    fn test_null_link_unsupported() {
        let mut a = NullBackend::open(Direction::Playback);
        let mut b = NullBackend::open(Direction::Playback);
        a.hw_params(cfg()).unwrap();
        b.hw_params(cfg()).unwrap();
        assert_eq!(a.link(&b), Err(PcmError::Unsupported("link")));
        assert_eq!(a.unlink(), Err(PcmError::Unsupported("link")));
    }
}
