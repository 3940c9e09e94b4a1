//! 环形缓冲区协议
//!
//! 应用指针和硬件指针是单调递增（mod boundary）的一对计数器，
//! 每侧只有一个写者：应用/传输层推进 appl，驱动/后端推进 hw。
//! 两个指针各自独占一个 cache line，避免 false sharing。
//!
//! 样本内存在安装硬件配置时一次性预分配，可选 mlock 锁定
//! 防止 page fault 引入时序抖动。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::area::{self, ChannelArea};
use crate::config::HwConfig;
use crate::error::Result;
use crate::format::{Direction, SampleFormat};

/// 共享环形缓冲区：指针对 + 几何参数 + 样本内存
pub struct Ring {
    appl: CachePadded<AtomicU64>,
    hw: CachePadded<AtomicU64>,

    buffer_size: u64,
    boundary: u64,
    channels: u32,
    format: SampleFormat,
    /// 环内样本是否按声道交织存放
    interleaved: bool,

    data: Box<[UnsafeCell<u8>]>,
    memory_locked: AtomicBool,
}

// 内存只通过 begin/commit 协议变更，单写者协议由上层保证
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(hw: &HwConfig, boundary: u64) -> Self {
        let bytes = (hw.buffer_size * hw.frame_bits() as u64 / 8) as usize;
        let data: Vec<UnsafeCell<u8>> = (0..bytes).map(|_| UnsafeCell::new(0)).collect();
        Self {
            appl: CachePadded::new(AtomicU64::new(0)),
            hw: CachePadded::new(AtomicU64::new(0)),
            buffer_size: hw.buffer_size,
            boundary,
            channels: hw.channels,
            format: hw.format,
            interleaved: hw.access.is_interleaved(),
            data: data.into_boxed_slice(),
            memory_locked: AtomicBool::new(false),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    #[inline]
    pub fn appl_ptr(&self) -> u64 {
        self.appl.load(Ordering::Acquire)
    }

    #[inline]
    pub fn hw_ptr(&self) -> u64 {
        self.hw.load(Ordering::Acquire)
    }

    /// (a - b) mod boundary
    #[inline]
    fn diff(a: u64, b: u64, boundary: u64) -> u64 {
        if a >= b {
            a - b
        } else {
            a + boundary - b
        }
    }

    /// 应用侧可消费/可生产的帧数
    ///
    /// 播放：buffer_size - (appl - hw)；采集：hw - appl（均 mod boundary）。
    /// 负值表示 xrun（播放被硬件追过 / 采集溢出由上层按阈值判定）。
    pub fn avail(&self, direction: Direction) -> i64 {
        let appl = self.appl_ptr();
        let hw = self.hw_ptr();
        match direction {
            Direction::Playback => {
                let filled = Self::diff(appl, hw, self.boundary);
                self.buffer_size as i64 - filled as i64
            }
            Direction::Capture => Self::diff(hw, appl, self.boundary) as i64,
        }
    }

    /// 播放侧已填充（硬件尚未消费）的帧数
    pub fn filled(&self) -> u64 {
        Self::diff(self.appl_ptr(), self.hw_ptr(), self.boundary)
    }

    /// begin/commit 协议的 begin 半边
    ///
    /// 返回 (应用指针在缓冲区内的偏移, 授予帧数)。授予帧数
    /// = min(wanted, avail, 到物理回绕点的距离)，绝不跨回绕点。
    pub fn begin(&self, wanted: u64, direction: Direction) -> (u64, u64) {
        let offset = self.appl_ptr() % self.buffer_size;
        let cont = self.buffer_size - offset;
        let avail = self.avail(direction).max(0) as u64;
        (offset, wanted.min(avail).min(cont))
    }

    /// 应用指针前进 frames（mod boundary）；单写者为应用侧
    pub fn appl_forward(&self, frames: u64) {
        let appl = self.appl_ptr();
        self.appl.store((appl + frames) % self.boundary, Ordering::Release);
    }

    /// 应用指针后退至多 frames，返回实际位移
    ///
    /// 上限是缓冲区内尚属于应用的部分（buffer_size - avail）。
    pub fn appl_rewind(&self, frames: u64, direction: Direction) -> u64 {
        let avail = self.avail(direction).max(0) as u64;
        let limit = self.buffer_size.saturating_sub(avail);
        let n = frames.min(limit);
        let appl = self.appl_ptr();
        let new = if appl >= n {
            appl - n
        } else {
            appl + self.boundary - n
        };
        self.appl.store(new, Ordering::Release);
        n
    }

    /// 硬件指针前进（仅后端调用；单写者为驱动侧）
    pub fn hw_forward(&self, frames: u64) {
        let hw = self.hw_ptr();
        self.hw.store((hw + frames) % self.boundary, Ordering::Release);
    }

    /// 直接落硬件指针（null 后端让 hw 影随 appl 用）
    pub fn hw_store(&self, value: u64) {
        self.hw.store(value % self.boundary, Ordering::Release);
    }

    /// 两个指针复位到同步零点（prepare/drop）
    pub fn reset_ptrs(&self) {
        self.appl.store(0, Ordering::Release);
        self.hw.store(0, Ordering::Release);
    }

    /// 应用指针同步到当前硬件位置（reset：把延迟压到 0）
    pub fn sync_appl_to_hw(&self) {
        let hw = self.hw_ptr();
        self.appl.store(hw, Ordering::Release);
    }

    fn base(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    /// 环形缓冲区的 channel areas（按安装时的访问模式布局）
    pub fn areas(&self) -> Vec<ChannelArea> {
        let width = self.format.physical_width();
        if self.interleaved {
            area::areas_from_interleaved(self.base(), self.channels, self.format)
        } else {
            let chan_bytes = (self.buffer_size * width as u64 / 8) as usize;
            let bufs: Vec<*mut u8> = (0..self.channels as usize)
                .map(|c| unsafe { self.base().add(c * chan_bytes) })
                .collect();
            area::areas_from_bufs(&bufs, self.format)
        }
    }

    /// 整个缓冲区写静音
    pub fn silence_all(&self) -> Result<()> {
        area::areas_silence(&self.areas(), 0, self.buffer_size, self.format)
    }

    /// 从 frame_offset 起对 frames 帧写静音（commit 侧的静音预填用）
    pub fn silence_range(&self, frame_offset: u64, frames: u64) -> Result<()> {
        let areas = self.areas();
        let mut off = frame_offset % self.buffer_size;
        let mut left = frames.min(self.buffer_size);
        while left > 0 {
            let cont = (self.buffer_size - off).min(left);
            area::areas_silence(&areas, off, cont, self.format)?;
            off = (off + cont) % self.buffer_size;
            left -= cont;
        }
        Ok(())
    }

    /// 锁定样本内存，防止换页引起的时序抖动
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }
        if self.data.is_empty() {
            return true;
        }
        let ptr = self.data.as_ptr() as *const libc::c_void;
        let len = self.data.len();
        let result = unsafe { libc::mlock(ptr, len) };
        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("ring memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "failed to lock ring memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    #[cfg(unix)]
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }
        let ptr = self.data.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.data.len());
        }
        self.memory_locked.store(false, Ordering::Release);
        log::debug!("ring memory unlocked");
    }

    #[cfg(not(unix))]
    pub fn unlock_memory(&self) {}
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::boundary_for;
    use crate::format::{Access, SampleFormat};

    fn ring() -> Ring {
        let hw = HwConfig::new(
            Access::RwInterleaved,
            SampleFormat::S16Le,
            2,
            48000,
            1024,
            4096,
        );
        Ring::new(&hw, boundary_for(hw.buffer_size))
    }

    #[test]
    fn test_avail_playback_capture() {
        let r = ring();
        // 空环：播放全可写，采集无可读
        assert_eq!(r.avail(Direction::Playback), 4096);
        assert_eq!(r.avail(Direction::Capture), 0);

        r.appl_forward(1000);
        assert_eq!(r.avail(Direction::Playback), 3096);
        assert_eq!(r.filled(), 1000);

        r.hw_forward(400);
        assert_eq!(r.avail(Direction::Playback), 3496);

        // 采集视角：硬件写入领先应用读出
        let r = ring();
        r.hw_forward(2048);
        assert_eq!(r.avail(Direction::Capture), 2048);
        r.appl_forward(2000);
        assert_eq!(r.avail(Direction::Capture), 48);
    }

    #[test]
    fn test_avail_negative_on_overtake() {
        let r = ring();
        // 硬件追过应用指针（播放欠载被驱动继续消费）
        r.appl_forward(4096);
        r.hw_forward(5000);
        assert!(r.avail(Direction::Playback) > 4096 || r.avail(Direction::Playback) < 0);
        // filled 视角：回绕后 appl - hw 变成 boundary - 904
        let avail = r.avail(Direction::Playback);
        assert!(avail < 0, "avail = {}", avail);
    }

    #[test]
    fn test_boundary_wraparound() {
        let hw = HwConfig::new(
            Access::RwInterleaved,
            SampleFormat::S16Le,
            2,
            48000,
            1024,
            4096,
        );
        let r = Ring::new(&hw, boundary_for(4096));
        let b = r.boundary();
        // 两个指针一步推到 boundary 附近再跨过去
        // （boundary 是 4096 的倍数，物理偏移保持对齐）
        r.appl_forward(b - 4096);
        r.hw_forward(b - 4096);
        assert_eq!(r.avail(Direction::Playback), 4096);
        r.appl_forward(4000);
        r.hw_forward(4000);
        assert_eq!(r.avail(Direction::Playback), 4096);
        r.appl_forward(200); // 跨 boundary
        assert!(r.appl_ptr() < 4096);
        assert_eq!(r.avail(Direction::Playback), 3896);
    }

    #[test]
    fn test_begin_never_crosses_physical_wrap() {
        let r = ring();
        r.appl_forward(4000);
        r.hw_forward(3000); // filled = 1000, avail = 3096
        let (offset, granted) = r.begin(500, Direction::Playback);
        assert_eq!(offset, 4000 % 4096);
        assert_eq!(granted, 96, "must clamp to distance-to-wrap");
        // 下一次 begin 才能续过回绕点
        r.appl_forward(96);
        let (offset, granted) = r.begin(500, Direction::Playback);
        assert_eq!(offset, 0);
        assert_eq!(granted, 500);
    }

    #[test]
    fn test_begin_clamps_to_avail() {
        let r = ring();
        r.appl_forward(4090);
        // avail = 6
        let (_, granted) = r.begin(100, Direction::Playback);
        assert_eq!(granted, 6);
    }

    #[test]
    fn test_rewind_clamped() {
        let r = ring();
        r.appl_forward(100);
        // 只填了 100 帧，最多退 100
        let moved = r.appl_rewind(500, Direction::Playback);
        assert_eq!(moved, 100);
        assert_eq!(r.appl_ptr(), 0);

        // 采集：读走 50 帧后最多退 50
        let r = ring();
        r.hw_forward(200);
        r.appl_forward(50);
        let moved = r.appl_rewind(500, Direction::Capture);
        // limit = buffer_size - avail = 4096 - 150
        assert_eq!(moved, 500.min(4096 - 150));
    }

    #[test]
    fn test_reset_and_sync() {
        let r = ring();
        r.appl_forward(123);
        r.hw_forward(45);
        r.reset_ptrs();
        assert_eq!(r.appl_ptr(), 0);
        assert_eq!(r.hw_ptr(), 0);

        r.hw_forward(77);
        r.sync_appl_to_hw();
        assert_eq!(r.appl_ptr(), 77);
        assert_eq!(r.avail(Direction::Playback), 4096);
    }

    #[test]
    fn test_silence_all_writes_pattern() {
        let hw = HwConfig::new(
            Access::RwInterleaved,
            SampleFormat::U8,
            1,
            8000,
            16,
            64,
        );
        let r = Ring::new(&hw, boundary_for(64));
        r.silence_all().unwrap();
        let areas = r.areas();
        let p = areas[0].addr();
        for i in 0..64 {
            assert_eq!(unsafe { *p.add(i) }, 0x80);
        }
    }
}
