//! 帧传输引擎
//!
//! 读写循环建立在 begin/copy/commit 协议之上：状态门 → 刷新可用量 →
//! 不足则等待（阻塞）或报 WouldBlock（非阻塞）→ 搬运一段 → 按
//! start_threshold 决定是否自动启动。任何等待挂起点之后都重读状态，
//! 绝不跨挂起点缓存。
//!
//! 部分完成优先于错误：循环中途出错时，已搬运帧数 > 0 就返回计数，
//! 错误留给下一次调用再现。

use crate::area::{self, ChannelArea};
use crate::device::Device;
use crate::error::{PcmError, Result};
use crate::format::{Access, Direction};
use crate::state::{self, xrun_error, State};

/// 对齐传输量：超过 xfer_align 时去掉零头
fn align_size(size: u64, xfer_align: u64) -> u64 {
    let align = xfer_align.max(1);
    if size > align {
        size - size % align
    } else {
        size
    }
}

/// 一段已知可用的帧搬进环：物理回绕点处拆成两次 begin/commit
fn write_chunk(dev: &Device, src: &[ChannelArea], src_offset: u64, frames: u64) -> Result<u64> {
    let format = dev.hw.as_ref().unwrap().format;
    let mut xfer = 0u64;
    while xfer < frames {
        let (dst, offset, granted) = dev.mmap_begin(frames - xfer)?;
        if granted == 0 {
            break;
        }
        area::areas_copy(&dst, offset, src, src_offset + xfer, granted, format)?;
        let done = dev.mmap_commit(offset, granted)?;
        xfer += done;
        if done < granted {
            break;
        }
    }
    Ok(xfer)
}

/// 一段已知可用的帧从环搬出
fn read_chunk(dev: &Device, dst: &[ChannelArea], dst_offset: u64, frames: u64) -> Result<u64> {
    let format = dev.hw.as_ref().unwrap().format;
    let mut xfer = 0u64;
    while xfer < frames {
        let (src, offset, granted) = dev.mmap_begin(frames - xfer)?;
        if granted == 0 {
            break;
        }
        area::areas_copy(dst, dst_offset + xfer, &src, offset, granted, format)?;
        let done = dev.mmap_commit(offset, granted)?;
        xfer += done;
        if done < granted {
            break;
        }
    }
    Ok(xfer)
}

/// 写端传输循环
///
/// PREPARED 时按 start_threshold 自动启动：一次搬运后缓冲区内
/// 帧数（含本次）达到阈值即 start。返回实际写入帧数。
pub(crate) fn write_areas(
    dev: &Device,
    areas: &[ChannelArea],
    mut offset: u64,
    size: u64,
) -> Result<u64> {
    if size == 0 {
        return Ok(0);
    }
    let sw = dev.sw.as_ref().unwrap().clone();
    let buffer_size = dev.hw.as_ref().unwrap().buffer_size;
    let align = sw.xfer_align.max(1);
    let mut size = align_size(size, sw.xfer_align);

    let mut state = dev.state();
    state::write_gate(state, dev.direction(), "write")?;

    let mut xfer = 0u64;
    let mut err = None;
    while size > 0 {
        if state == State::Xrun {
            err = Some(xrun_error(dev.direction()));
            break;
        }
        let mut avail = match dev.avail_update() {
            Ok(a) => a,
            Err(e) => {
                err = Some(e);
                break;
            }
        };
        // 凑不出一个对齐单位才等待；avail_min 只作用于 wait 的就绪判定
        if state == State::Running && (avail == 0 || (size >= align && avail < align)) {
            if dev.is_nonblock() {
                err = Some(PcmError::WouldBlock);
                break;
            }
            if let Err(e) = dev.wait(None) {
                err = Some(e);
                break;
            }
            state = dev.state();
            continue;
        }
        if state == State::Prepared && avail == 0 {
            // 未启动且缓冲区已满：等待不会有硬件来消费
            err = Some(xrun_error(dev.direction()));
            break;
        }
        if avail > align {
            avail -= avail % align;
        }
        let frames = size.min(avail);
        let done = match write_chunk(dev, areas, offset, frames) {
            Ok(n) => n,
            Err(e) => {
                err = Some(e);
                break;
            }
        };
        if state == State::Prepared {
            let hw_avail = buffer_size - avail + done;
            if hw_avail >= sw.start_threshold {
                if let Err(e) = dev.start() {
                    err = Some(e);
                    break;
                }
                state = dev.state();
            }
        }
        offset += done;
        size -= done;
        xfer += done;
    }
    if xfer > 0 {
        Ok(xfer)
    } else {
        match err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }
}

/// 读端传输循环
///
/// 进入时 PREPARED 且请求量达到 start_threshold 即自动启动。
/// DRAINING 把余量读尽后返回 Underrun（流已终止）。
pub(crate) fn read_areas(
    dev: &Device,
    areas: &[ChannelArea],
    mut offset: u64,
    size: u64,
) -> Result<u64> {
    if size == 0 {
        return Ok(0);
    }
    let sw = dev.sw.as_ref().unwrap().clone();
    let align = sw.xfer_align.max(1);
    let mut size = align_size(size, sw.xfer_align);

    let mut state = dev.state();
    state::read_gate(state, dev.direction(), "read")?;
    if state == State::Prepared && size >= sw.start_threshold {
        dev.start()?;
        state = dev.state();
    }

    let mut xfer = 0u64;
    let mut err = None;
    while size > 0 {
        if state == State::Xrun {
            err = Some(xrun_error(dev.direction()));
            break;
        }
        let mut avail = match dev.avail_update() {
            Ok(a) => a,
            Err(e) => {
                err = Some(e);
                break;
            }
        };
        if state == State::Draining && avail == 0 {
            // 排空完毕，流终止
            err = Some(PcmError::Underrun);
            break;
        }
        // 凑不出一个对齐单位才等待；avail_min 只作用于 wait 的就绪判定
        if state == State::Running && (avail == 0 || (size >= align && avail < align)) {
            if dev.is_nonblock() {
                err = Some(PcmError::WouldBlock);
                break;
            }
            if let Err(e) = dev.wait(None) {
                err = Some(e);
                break;
            }
            state = dev.state();
            continue;
        }
        if state == State::Prepared && avail == 0 {
            // 低于启动阈值又没有存量可读。流未启动前硬件不会产出，
            // 软件后端也没有时钟，阻塞在这里只会死锁，直接报断流错误
            err = Some(xrun_error(dev.direction()));
            break;
        }
        if avail > align {
            avail -= avail % align;
        }
        let frames = size.min(avail);
        let done = match read_chunk(dev, areas, offset, frames) {
            Ok(n) => n,
            Err(e) => {
                err = Some(e);
                break;
            }
        };
        offset += done;
        size -= done;
        xfer += done;
        state = dev.state();
    }
    if xfer > 0 {
        Ok(xfer)
    } else {
        match err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }
}

impl Device {
    fn check_rw(&self, want: Access, op: &'static str) -> Result<()> {
        self.require_setup(op)?;
        let access = self.hw.as_ref().unwrap().access;
        if access != want {
            return Err(PcmError::InvalidArgument("access mode mismatch"));
        }
        Ok(())
    }

    /// 交织写：`buf` 按帧交织存放 `frames` 帧。返回实际写入帧数
    pub fn writei(&self, buf: &[u8], frames: u64) -> Result<u64> {
        self.check_rw(Access::RwInterleaved, "writei")?;
        if self.direction() != Direction::Playback {
            return Err(PcmError::InvalidArgument("writei on capture stream"));
        }
        if buf.len() < self.frames_to_bytes(frames)? {
            return Err(PcmError::InvalidArgument("buffer shorter than frame count"));
        }
        let hw = self.hw.as_ref().unwrap();
        // 源 areas 只读，不会透过指针写用户缓冲
        let areas = area::areas_from_interleaved(buf.as_ptr() as *mut u8, hw.channels, hw.format);
        write_areas(self, &areas, 0, frames)
    }

    /// 交织读：读入至多 `frames` 帧。返回实际读取帧数
    pub fn readi(&self, buf: &mut [u8], frames: u64) -> Result<u64> {
        self.check_rw(Access::RwInterleaved, "readi")?;
        if self.direction() != Direction::Capture {
            return Err(PcmError::InvalidArgument("readi on playback stream"));
        }
        if buf.len() < self.frames_to_bytes(frames)? {
            return Err(PcmError::InvalidArgument("buffer shorter than frame count"));
        }
        let hw = self.hw.as_ref().unwrap();
        let areas = area::areas_from_interleaved(buf.as_mut_ptr(), hw.channels, hw.format);
        read_areas(self, &areas, 0, frames)
    }

    /// 非交织写：每声道一条缓冲
    pub fn writen(&self, bufs: &[&[u8]], frames: u64) -> Result<u64> {
        self.check_rw(Access::RwNonInterleaved, "writen")?;
        if self.direction() != Direction::Playback {
            return Err(PcmError::InvalidArgument("writen on capture stream"));
        }
        let hw = self.hw.as_ref().unwrap();
        if bufs.len() != hw.channels as usize {
            return Err(PcmError::InvalidArgument("channel buffer count mismatch"));
        }
        let chan_bytes = (frames * hw.sample_bits() as u64 / 8) as usize;
        if bufs.iter().any(|b| b.len() < chan_bytes) {
            return Err(PcmError::InvalidArgument("buffer shorter than frame count"));
        }
        let ptrs: Vec<*mut u8> = bufs.iter().map(|b| b.as_ptr() as *mut u8).collect();
        let areas = area::areas_from_bufs(&ptrs, hw.format);
        write_areas(self, &areas, 0, frames)
    }

    /// 非交织读：每声道一条缓冲
    pub fn readn(&self, bufs: &mut [&mut [u8]], frames: u64) -> Result<u64> {
        self.check_rw(Access::RwNonInterleaved, "readn")?;
        if self.direction() != Direction::Capture {
            return Err(PcmError::InvalidArgument("readn on playback stream"));
        }
        let hw = self.hw.as_ref().unwrap();
        if bufs.len() != hw.channels as usize {
            return Err(PcmError::InvalidArgument("channel buffer count mismatch"));
        }
        let chan_bytes = (frames * hw.sample_bits() as u64 / 8) as usize;
        if bufs.iter().any(|b| b.len() < chan_bytes) {
            return Err(PcmError::InvalidArgument("buffer shorter than frame count"));
        }
        let ptrs: Vec<*mut u8> = bufs.iter_mut().map(|b| b.as_mut_ptr()).collect();
        let areas = area::areas_from_bufs(&ptrs, hw.format);
        read_areas(self, &areas, 0, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HwConfig, SwParams};
    use crate::device::virt::{VirtBackend, VirtCtl};
    use crate::format::SampleFormat;
    use std::time::Duration;

    const FRAME_BYTES: usize = 4; // S16Le x 2ch

    fn cfg(access: Access) -> HwConfig {
        HwConfig::new(access, SampleFormat::S16Le, 2, 48000, 1024, 4096)
    }

    fn playback(access: Access) -> (Device, VirtCtl) {
        let (mut dev, ctl) = VirtBackend::open(Direction::Playback);
        dev.hw_params(cfg(access)).unwrap();
        (dev, ctl)
    }

    fn capture(access: Access) -> (Device, VirtCtl) {
        let (mut dev, ctl) = VirtBackend::open(Direction::Capture);
        dev.hw_params(cfg(access)).unwrap();
        (dev, ctl)
    }

    fn frames_buf(frames: usize, fill: u8) -> Vec<u8> {
        vec![fill; frames * FRAME_BYTES]
    }

    fn set_start_threshold(dev: &mut Device, threshold: u64) {
        let hw = dev.hw_config().unwrap().clone();
        let mut sw = SwParams::default_for(&hw);
        sw.start_threshold = threshold;
        dev.sw_params(sw).unwrap();
    }

    #[test]
    fn test_write_starts_once_at_threshold() {
        let (mut dev, _ctl) = playback(Access::RwInterleaved);
        set_start_threshold(&mut dev, 1024);

        // 1023 帧：差一帧，不启动
        assert_eq!(dev.writei(&frames_buf(1023, 1), 1023).unwrap(), 1023);
        assert_eq!(dev.state(), State::Prepared);
        // 第 1024 帧触发启动，且只启动一次
        assert_eq!(dev.writei(&frames_buf(1, 1), 1).unwrap(), 1);
        assert_eq!(dev.state(), State::Running);
        assert_eq!(dev.writei(&frames_buf(1, 1), 1).unwrap(), 1);
        assert_eq!(dev.state(), State::Running);
        assert_eq!(dev.delay().unwrap(), 1025);
    }

    #[test]
    fn test_write_fills_buffer_before_start() {
        let (mut dev, _ctl) = playback(Access::RwInterleaved);
        set_start_threshold(&mut dev, 8192); // 高于缓冲区，永不自动启动

        assert_eq!(dev.writei(&frames_buf(4096, 1), 4096).unwrap(), 4096);
        assert_eq!(dev.state(), State::Prepared);
        // 满了还没启动：没有硬件会来消费
        assert_eq!(
            dev.writei(&frames_buf(64, 1), 64),
            Err(PcmError::Underrun)
        );
    }

    #[test]
    fn test_write_nonblock_wouldblock_when_full() {
        let (mut dev, _ctl) = playback(Access::RwInterleaved);
        dev.set_nonblock(true).unwrap();
        assert_eq!(dev.writei(&frames_buf(4096, 1), 4096).unwrap(), 4096);
        assert_eq!(dev.state(), State::Running); // start_threshold 默认 1
        assert_eq!(
            dev.writei(&frames_buf(64, 1), 64),
            Err(PcmError::WouldBlock)
        );
    }

    #[test]
    fn test_write_partial_progress_beats_error() {
        let (mut dev, _ctl) = playback(Access::RwInterleaved);
        dev.set_nonblock(true).unwrap();
        // 超量请求：吃掉全部可用量后才轮到 WouldBlock，部分完成优先返回计数
        assert_eq!(dev.writei(&frames_buf(5000, 1), 5000).unwrap(), 4096);
        assert_eq!(
            dev.writei(&frames_buf(200, 1), 200),
            Err(PcmError::WouldBlock)
        );
    }

    #[test]
    fn test_write_below_avail_min_still_fits() {
        let (mut dev, _ctl) = playback(Access::RwInterleaved);
        dev.set_nonblock(true).unwrap();
        assert_eq!(dev.writei(&frames_buf(4000, 1), 4000).unwrap(), 4000);
        // 余 96 帧低于 avail_min，但请求量不超过可用量就照常写入
        assert_eq!(dev.writei(&frames_buf(96, 1), 96).unwrap(), 96);
    }

    #[test]
    fn test_write_nonblock_partial_when_low() {
        let (mut dev, ctl) = playback(Access::RwInterleaved);
        dev.set_nonblock(true).unwrap();
        assert_eq!(dev.writei(&frames_buf(4096, 1), 4096).unwrap(), 4096);
        assert_eq!(dev.state(), State::Running);
        ctl.advance(500).unwrap();
        // 可用量虽低于 avail_min，也要先吐出这 500 帧而不是 WouldBlock
        assert_eq!(dev.writei(&frames_buf(1000, 2), 1000).unwrap(), 500);
        assert_eq!(
            dev.writei(&frames_buf(1000, 2), 1000),
            Err(PcmError::WouldBlock)
        );
    }

    #[test]
    fn test_read_nonblock_partial_when_low() {
        let (mut dev, ctl) = capture(Access::RwInterleaved);
        dev.set_nonblock(true).unwrap();
        dev.start().unwrap();
        ctl.advance(500).unwrap();
        let mut out = frames_buf(1000, 0);
        assert_eq!(dev.readi(&mut out, 1000).unwrap(), 500);
        assert_eq!(dev.readi(&mut out, 1000), Err(PcmError::WouldBlock));
    }

    #[test]
    fn test_chunk_rounded_down_to_xfer_align() {
        let (mut dev, ctl) = playback(Access::RwInterleaved);
        let hw = dev.hw_config().unwrap().clone();
        let mut sw = SwParams::default_for(&hw);
        sw.xfer_align = 64;
        dev.sw_params(sw).unwrap();
        dev.set_nonblock(true).unwrap();

        assert_eq!(dev.writei(&frames_buf(4096, 1), 4096).unwrap(), 4096);
        assert_eq!(dev.state(), State::Running);
        ctl.advance(100).unwrap();
        // 可用量 100 向下取整到 64；余 36 不足一个对齐单位，留待下次
        assert_eq!(dev.writei(&frames_buf(128, 1), 128).unwrap(), 64);
    }

    #[test]
    fn test_read_prepared_empty_errors_instead_of_blocking() {
        let (mut dev, _ctl) = capture(Access::RwInterleaved);
        set_start_threshold(&mut dev, 8192);
        let mut out = frames_buf(16, 0);
        // 未启动且无存量：等下去不会有数据，直接报错
        assert_eq!(dev.readi(&mut out, 16), Err(PcmError::Overrun));
    }

    #[test]
    fn test_blocking_write_wakes_on_consumption() {
        let (dev, ctl) = playback(Access::RwInterleaved);
        assert_eq!(dev.writei(&frames_buf(4096, 1), 4096).unwrap(), 4096);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ctl.advance(2048).unwrap();
        });
        // 阻塞直到驱动消费出空间
        assert_eq!(dev.writei(&frames_buf(1024, 2), 1024).unwrap(), 1024);
        t.join().unwrap();
        assert_eq!(dev.delay().unwrap(), 4096 - 2048 + 1024);
    }

    #[test]
    fn test_write_after_xrun_reports_underrun() {
        let (dev, ctl) = playback(Access::RwInterleaved);
        assert_eq!(dev.writei(&frames_buf(64, 1), 64).unwrap(), 64);
        ctl.advance(200).unwrap();
        assert_eq!(dev.state(), State::Xrun);
        assert_eq!(dev.writei(&frames_buf(64, 1), 64), Err(PcmError::Underrun));
        // prepare 后恢复写入
        dev.prepare().unwrap();
        assert_eq!(dev.writei(&frames_buf(64, 1), 64).unwrap(), 64);
    }

    #[test]
    fn test_xfer_align_trims_remainder() {
        let (mut dev, _ctl) = playback(Access::RwInterleaved);
        let hw = dev.hw_config().unwrap().clone();
        let mut sw = SwParams::default_for(&hw);
        sw.xfer_align = 64;
        sw.start_threshold = 8192;
        dev.sw_params(sw).unwrap();

        assert_eq!(dev.writei(&frames_buf(100, 1), 100).unwrap(), 64);
        // 不足一个对齐单位时原样传输
        assert_eq!(dev.writei(&frames_buf(30, 1), 30).unwrap(), 30);
    }

    #[test]
    fn test_capture_roundtrip_interleaved() {
        let (dev, ctl) = capture(Access::RwInterleaved);
        // 硬件侧先落样本再推进
        let ring = ctl.ring().unwrap();
        let areas = ring.areas();
        let src = frames_buf(256, 0xA5);
        let src_areas = area::areas_from_interleaved(
            src.as_ptr() as *mut u8,
            2,
            SampleFormat::S16Le,
        );
        area::areas_copy(&areas, 0, &src_areas, 0, 256, SampleFormat::S16Le).unwrap();

        dev.start().unwrap();
        ctl.advance(256).unwrap();

        let mut out = frames_buf(256, 0);
        assert_eq!(dev.readi(&mut out, 256).unwrap(), 256);
        assert_eq!(out, src);
        assert_eq!(dev.avail_update().unwrap(), 0);
    }

    #[test]
    fn test_read_autostarts_at_entry() {
        let (dev, ctl) = capture(Access::RwInterleaved);
        assert_eq!(dev.state(), State::Prepared);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ctl.advance(1024).unwrap();
        });
        // start_threshold 默认 1：进入读循环即启动，随后阻塞到硬件生产
        let mut out = frames_buf(1024, 0);
        assert_eq!(dev.readi(&mut out, 1024).unwrap(), 1024);
        t.join().unwrap();
        assert_eq!(dev.state(), State::Running);
    }

    #[test]
    fn test_draining_capture_reads_residue_then_underrun() {
        let (dev, ctl) = capture(Access::RwInterleaved);
        dev.start().unwrap();
        ctl.advance(100).unwrap();
        dev.drain().unwrap();
        assert_eq!(dev.state(), State::Draining);

        let mut out = frames_buf(100, 0);
        // 余量仍可读，且可分批
        assert_eq!(dev.readi(&mut out, 40).unwrap(), 40);
        assert_eq!(dev.readi(&mut out, 100).unwrap(), 60);
        // 读尽之后：流已终止
        assert_eq!(dev.readi(&mut out, 1), Err(PcmError::Underrun));
    }

    #[test]
    fn test_noninterleaved_roundtrip() {
        let (dev, ctl) = capture(Access::RwNonInterleaved);
        let ring = ctl.ring().unwrap();
        let areas = ring.areas();
        // 两声道各写一个可区分的样本串
        let left: Vec<u8> = (0..128u32).flat_map(|i| [(i & 0xff) as u8, 0x10]).collect();
        let right: Vec<u8> = (0..128u32).flat_map(|i| [(i & 0xff) as u8, 0x20]).collect();
        let ptrs = [left.as_ptr() as *mut u8, right.as_ptr() as *mut u8];
        let src_areas = area::areas_from_bufs(&ptrs, SampleFormat::S16Le);
        area::areas_copy(&areas, 0, &src_areas, 0, 128, SampleFormat::S16Le).unwrap();

        dev.start().unwrap();
        ctl.advance(128).unwrap();

        let mut out_l = vec![0u8; 256];
        let mut out_r = vec![0u8; 256];
        {
            let mut bufs: Vec<&mut [u8]> = vec![&mut out_l, &mut out_r];
            assert_eq!(dev.readn(&mut bufs, 128).unwrap(), 128);
        }
        assert_eq!(out_l, left);
        assert_eq!(out_r, right);
    }

    #[test]
    fn test_access_and_direction_checks() {
        let (dev, _ctl) = playback(Access::RwInterleaved);
        let mut buf = frames_buf(16, 0);
        assert_eq!(
            dev.readi(&mut buf, 16),
            Err(PcmError::InvalidArgument("readi on playback stream"))
        );
        assert_eq!(
            dev.writen(&[&buf, &buf], 16),
            Err(PcmError::InvalidArgument("access mode mismatch"))
        );
        // 帧数超过缓冲长度
        assert_eq!(
            dev.writei(&buf, 64),
            Err(PcmError::InvalidArgument("buffer shorter than frame count"))
        );
    }

    #[test]
    fn test_write_wraps_physical_boundary() {
        let (dev, ctl) = playback(Access::RwInterleaved);
        assert_eq!(dev.writei(&frames_buf(4000, 1), 4000).unwrap(), 4000);
        ctl.advance(3000).unwrap();
        // 500 帧跨物理回绕点（4000 → 404），内容要连续落位
        let pat: Vec<u8> = (0..500 * FRAME_BYTES).map(|i| (i % 251) as u8).collect();
        assert_eq!(dev.writei(&pat, 500).unwrap(), 500);

        let ring = ctl.ring().unwrap();
        let areas = ring.areas();
        let base = areas[0].addr();
        // 回绕前最后一字节和回绕后第一字节
        let pre = unsafe { *base.add(4095 * FRAME_BYTES + 3) };
        let post = unsafe { *base.add(0) };
        assert_eq!(pre, pat[96 * FRAME_BYTES - 1]);
        assert_eq!(post, pat[96 * FRAME_BYTES]);
    }

    #[test]
    fn test_avail_shrinks_by_committed() {
        let (dev, _ctl) = playback(Access::RwInterleaved);
        let before = dev.avail_update().unwrap();
        let (_, offset, granted) = dev.mmap_begin(300).unwrap();
        dev.mmap_commit(offset, granted).unwrap();
        assert_eq!(dev.avail_update().unwrap(), before - granted);
    }

    #[test]
    fn test_commit_preconditions_rejected() {
        let (dev, _ctl) = playback(Access::RwInterleaved);
        let (_, offset, _) = dev.mmap_begin(100).unwrap();
        // 偏移不符 / 超量提交都不动指针
        assert!(matches!(
            dev.mmap_commit(offset + 1, 10),
            Err(PcmError::InvalidArgument(_))
        ));
        assert!(matches!(
            dev.mmap_commit(offset, 4097),
            Err(PcmError::InvalidArgument(_))
        ));
        assert_eq!(dev.avail_update().unwrap(), 4096);
    }
}
