//! Channel area 描述与位精确拷贝/静音内核
//!
//! ChannelArea 描述一个声道的样本存储：基地址 + 首样本位偏移 + 样本间位步进。
//! 交织、非交织、任意打包布局共用同一套拷贝/静音原语。
//!
//! 快路径：紧密打包（步进 == 物理宽度且字节对齐）时按 64 位块批量写，
//! 标量尾部收尾。慢路径：逐样本按位/字节步进，4-bit 格式要跟踪
//! 当前写的是字节的高半还是低半 nibble，并保留另一半。

use crate::error::{PcmError, Result};
use crate::format::SampleFormat;

/// 一个声道的样本存储描述
///
/// 调用方瞬态持有；内核不会在单次操作之外保留它。
/// `addr` 为空指针表示无后备存储（"null" area）：
/// 作为拷贝源时等价于静音，作为目的时操作为 no-op。
#[derive(Clone, Copy, Debug)]
pub struct ChannelArea {
    addr: *mut u8,
    /// 首样本的位偏移
    first: u32,
    /// 相邻样本间的位步进
    step: u32,
}

impl ChannelArea {
    /// 从原始指针构造
    ///
    /// # Safety
    ///
    /// `addr` 必须在本次操作期间有效，且覆盖
    /// `first + n * step` 位所能触及的全部字节。
    pub unsafe fn new(addr: *mut u8, first: u32, step: u32) -> Self {
        Self { addr, first, step }
    }

    /// 无后备存储的 area
    pub fn null(first: u32, step: u32) -> Self {
        Self {
            addr: std::ptr::null_mut(),
            first,
            step,
        }
    }

    pub fn is_null(&self) -> bool {
        self.addr.is_null()
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// 第 `offset` 个样本所在的字节指针和字节内位偏移
    #[inline]
    fn ptr_bit(&self, offset: u64) -> (*mut u8, u32) {
        let bits = self.first as u64 + offset * self.step as u64;
        (
            unsafe { self.addr.add((bits / 8) as usize) },
            (bits % 8) as u32,
        )
    }
}

/// 将 `samples` 个样本写为该格式的数字静音
///
/// `dst_offset` 为 area 内的样本偏移。
pub fn area_silence(
    dst: &ChannelArea,
    dst_offset: u64,
    samples: usize,
    format: SampleFormat,
) -> Result<()> {
    if dst.is_null() {
        return Ok(());
    }
    let width = format.physical_width();
    let silence = format.silence_64();
    let (mut p, bit) = dst.ptr_bit(dst_offset);
    let mut remaining = samples;

    // 快路径：紧密打包且字节对齐，按 64 位块写静音模式
    if dst.step == width && bit == 0 {
        let dwords = remaining * width as usize / 64;
        unsafe {
            for _ in 0..dwords {
                (p as *mut u64).write_unaligned(silence.to_le());
                p = p.add(8);
            }
        }
        remaining -= dwords * (64 / width as usize);
        if remaining == 0 {
            return Ok(());
        }
    }

    let step_bytes = (dst.step / 8) as usize;
    unsafe {
        match width {
            4 => {
                let nib = (silence & 0x0f) as u8;
                let mut dstbit = bit;
                let bit_step = dst.step % 8;
                while remaining > 0 {
                    if dstbit != 0 {
                        *p = (*p & 0xf0) | nib;
                    } else {
                        *p = (*p & 0x0f) | (nib << 4);
                    }
                    p = p.add(step_bytes);
                    dstbit += bit_step;
                    if dstbit >= 8 {
                        p = p.add(1);
                        dstbit -= 8;
                    }
                    remaining -= 1;
                }
            }
            8 => {
                let sil = silence as u8;
                while remaining > 0 {
                    *p = sil;
                    p = p.add(step_bytes);
                    remaining -= 1;
                }
            }
            16 => {
                let sil = (silence as u16).to_le();
                while remaining > 0 {
                    (p as *mut u16).write_unaligned(sil);
                    p = p.add(step_bytes);
                    remaining -= 1;
                }
            }
            32 => {
                let sil = (silence as u32).to_le();
                while remaining > 0 {
                    (p as *mut u32).write_unaligned(sil);
                    p = p.add(step_bytes);
                    remaining -= 1;
                }
            }
            64 => {
                let sil = silence.to_le();
                while remaining > 0 {
                    (p as *mut u64).write_unaligned(sil);
                    p = p.add(step_bytes);
                    remaining -= 1;
                }
            }
            w => return Err(PcmError::UnsupportedFormat(w)),
        }
    }
    Ok(())
}

/// 将 `samples` 个样本从 `src` 拷贝到 `dst`
///
/// 源无后备存储时等价于对 `dst` 静音；
/// 目的无后备存储时为成功的 no-op。
pub fn area_copy(
    dst: &ChannelArea,
    dst_offset: u64,
    src: &ChannelArea,
    src_offset: u64,
    samples: usize,
    format: SampleFormat,
) -> Result<()> {
    if src.is_null() {
        return area_silence(dst, dst_offset, samples, format);
    }
    if dst.is_null() {
        return Ok(());
    }
    let width = format.physical_width();
    let (mut sp, sbit) = src.ptr_bit(src_offset);
    let (mut dp, dbit) = dst.ptr_bit(dst_offset);
    let mut remaining = samples;

    // 快路径：两侧都紧密打包且字节对齐，整块 memcpy
    if src.step == width && dst.step == width && sbit == 0 && dbit == 0 {
        let bytes = remaining * width as usize / 8;
        unsafe {
            std::ptr::copy_nonoverlapping(sp, dp, bytes);
            sp = sp.add(bytes);
            dp = dp.add(bytes);
        }
        remaining -= bytes * 8 / width as usize;
        if remaining == 0 {
            return Ok(());
        }
    }

    let src_step = (src.step / 8) as usize;
    let dst_step = (dst.step / 8) as usize;
    unsafe {
        match width {
            4 => {
                let mut srcbit = sbit;
                let mut dstbit = dbit;
                let src_bit_step = src.step % 8;
                let dst_bit_step = dst.step % 8;
                while remaining > 0 {
                    // 归一化到低 nibble 再放回目标相位，保留目标的另一半
                    let v = if srcbit != 0 {
                        *sp & 0x0f
                    } else {
                        (*sp & 0xf0) >> 4
                    };
                    if dstbit != 0 {
                        *dp = (*dp & 0xf0) | v;
                    } else {
                        *dp = (*dp & 0x0f) | (v << 4);
                    }
                    sp = sp.add(src_step);
                    srcbit += src_bit_step;
                    if srcbit >= 8 {
                        sp = sp.add(1);
                        srcbit -= 8;
                    }
                    dp = dp.add(dst_step);
                    dstbit += dst_bit_step;
                    if dstbit >= 8 {
                        dp = dp.add(1);
                        dstbit -= 8;
                    }
                    remaining -= 1;
                }
            }
            8 => {
                while remaining > 0 {
                    *dp = *sp;
                    sp = sp.add(src_step);
                    dp = dp.add(dst_step);
                    remaining -= 1;
                }
            }
            16 => {
                while remaining > 0 {
                    (dp as *mut u16).write_unaligned((sp as *const u16).read_unaligned());
                    sp = sp.add(src_step);
                    dp = dp.add(dst_step);
                    remaining -= 1;
                }
            }
            32 => {
                while remaining > 0 {
                    (dp as *mut u32).write_unaligned((sp as *const u32).read_unaligned());
                    sp = sp.add(src_step);
                    dp = dp.add(dst_step);
                    remaining -= 1;
                }
            }
            64 => {
                while remaining > 0 {
                    (dp as *mut u64).write_unaligned((sp as *const u64).read_unaligned());
                    sp = sp.add(src_step);
                    dp = dp.add(dst_step);
                    remaining -= 1;
                }
            }
            w => return Err(PcmError::UnsupportedFormat(w)),
        }
    }
    Ok(())
}

/// 检测从 `areas[i]` 起有多少连续声道在物理上构成一块交织区域：
/// 地址与步进一致，首位偏移恰好逐声道递增一个物理宽度
fn interleaved_run(areas: &[ChannelArea], i: usize, width: u32) -> usize {
    let begin = &areas[i];
    let mut chns = 1;
    while i + chns < areas.len() {
        let prev = &areas[i + chns - 1];
        let a = &areas[i + chns];
        if a.addr != begin.addr || a.step != begin.step || a.first != prev.first + width {
            break;
        }
        chns += 1;
    }
    chns
}

fn collapsed(begin: &ChannelArea, width: u32) -> ChannelArea {
    ChannelArea {
        addr: begin.addr,
        first: begin.first,
        step: width,
    }
}

/// 多声道静音，带交织区域折叠优化
///
/// 折叠纯属吞吐优化，语义与逐声道调用完全一致
/// （见 `areas_silence_uncollapsed`，测试用它做对照）。
pub fn areas_silence(
    areas: &[ChannelArea],
    offset: u64,
    frames: u64,
    format: SampleFormat,
) -> Result<()> {
    let width = format.physical_width();
    let mut i = 0;
    while i < areas.len() {
        let begin = &areas[i];
        let chns = interleaved_run(areas, i, width);
        if chns > 1 && chns as u32 * width == begin.step {
            // 折叠为一次宽调用
            let d = collapsed(begin, width);
            area_silence(&d, offset * chns as u64, (frames * chns as u64) as usize, format)?;
            i += chns;
        } else {
            area_silence(begin, offset, frames as usize, format)?;
            i += 1;
        }
    }
    Ok(())
}

/// 多声道静音，禁用折叠的单一代码路径
pub(crate) fn areas_silence_uncollapsed(
    areas: &[ChannelArea],
    offset: u64,
    frames: u64,
    format: SampleFormat,
) -> Result<()> {
    for a in areas {
        area_silence(a, offset, frames as usize, format)?;
    }
    Ok(())
}

/// 多声道拷贝，带交织区域折叠优化
pub fn areas_copy(
    dst_areas: &[ChannelArea],
    dst_offset: u64,
    src_areas: &[ChannelArea],
    src_offset: u64,
    frames: u64,
    format: SampleFormat,
) -> Result<()> {
    if dst_areas.len() != src_areas.len() {
        return Err(PcmError::InvalidArgument("channel count mismatch"));
    }
    let width = format.physical_width();
    let mut i = 0;
    while i < dst_areas.len() {
        let db = &dst_areas[i];
        let sb = &src_areas[i];
        // 只有源和目的都构成同宽交织块且步进相同才能折叠
        let run_d = interleaved_run(dst_areas, i, width);
        let run_s = interleaved_run(src_areas, i, width);
        let chns = run_d.min(run_s);
        if chns > 1 && db.step == sb.step && chns as u32 * width == db.step {
            let d = collapsed(db, width);
            let s = collapsed(sb, width);
            area_copy(
                &d,
                dst_offset * chns as u64,
                &s,
                src_offset * chns as u64,
                (frames * chns as u64) as usize,
                format,
            )?;
            i += chns;
        } else {
            area_copy(db, dst_offset, sb, src_offset, frames as usize, format)?;
            i += 1;
        }
    }
    Ok(())
}

/// 多声道拷贝，禁用折叠的单一代码路径
pub(crate) fn areas_copy_uncollapsed(
    dst_areas: &[ChannelArea],
    dst_offset: u64,
    src_areas: &[ChannelArea],
    src_offset: u64,
    frames: u64,
    format: SampleFormat,
) -> Result<()> {
    if dst_areas.len() != src_areas.len() {
        return Err(PcmError::InvalidArgument("channel count mismatch"));
    }
    for (d, s) in dst_areas.iter().zip(src_areas.iter()) {
        area_copy(d, dst_offset, s, src_offset, frames as usize, format)?;
    }
    Ok(())
}

/// 为一块交织缓冲区构造逐声道 area（声道 c 的首样本偏移 c 个样本宽）
pub fn areas_from_interleaved(
    buf: *mut u8,
    channels: u32,
    format: SampleFormat,
) -> Vec<ChannelArea> {
    let width = format.physical_width();
    (0..channels)
        .map(|c| ChannelArea {
            addr: buf,
            first: c * width,
            step: channels * width,
        })
        .collect()
}

/// 为每声道独立缓冲区构造 area
pub fn areas_from_bufs(bufs: &[*mut u8], format: SampleFormat) -> Vec<ChannelArea> {
    let width = format.physical_width();
    bufs.iter()
        .map(|&b| ChannelArea {
            addr: b,
            first: 0,
            step: width,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 通过 area 寻址读回第 idx 个样本（物理宽度位）
    fn read_sample(area: &ChannelArea, idx: u64, width: u32) -> u64 {
        let (p, bit) = area.ptr_bit(idx);
        unsafe {
            match width {
                4 => {
                    if bit != 0 {
                        (*p & 0x0f) as u64
                    } else {
                        ((*p & 0xf0) >> 4) as u64
                    }
                }
                8 => *p as u64,
                16 => (p as *const u16).read_unaligned() as u64,
                32 => (p as *const u32).read_unaligned() as u64,
                64 => (p as *const u64).read_unaligned(),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_silence_packed_16bit_with_tail() {
        // 7 个样本：1 个 64 位块 + 3 个标量尾部
        let mut buf = [0xffu8; 16];
        let area = unsafe { ChannelArea::new(buf.as_mut_ptr(), 0, 16) };
        area_silence(&area, 0, 7, SampleFormat::U16Le).unwrap();
        for i in 0..7 {
            assert_eq!(read_sample(&area, i, 16), 0x8000, "sample {}", i);
        }
        // 第 8 个样本不能被碰到
        assert_eq!(read_sample(&area, 7, 16), 0xffff);
    }

    #[test]
    fn test_silence_u8_pattern() {
        let mut buf = [0u8; 8];
        let area = unsafe { ChannelArea::new(buf.as_mut_ptr(), 0, 8) };
        area_silence(&area, 0, 8, SampleFormat::U8).unwrap();
        assert_eq!(buf, [0x80; 8]);
    }

    #[test]
    fn test_silence_strided_offset() {
        // 步进 32 位的 16 位样本（交织双声道的一个声道），带起始偏移
        let mut buf = [0x11u8; 16];
        let area = unsafe { ChannelArea::new(buf.as_mut_ptr(), 16, 32) };
        area_silence(&area, 0, 3, SampleFormat::U16Le).unwrap();
        // 声道样本在字节 2-3、6-7、10-11；其余字节保持 0x11
        assert_eq!(read_sample(&area, 0, 16), 0x8000);
        assert_eq!(read_sample(&area, 1, 16), 0x8000);
        assert_eq!(read_sample(&area, 2, 16), 0x8000);
        assert_eq!(buf[0], 0x11);
        assert_eq!(buf[4], 0x11);
        assert_eq!(buf[12], 0x11);
    }

    #[test]
    fn test_silence_4bit_preserves_other_nibble() {
        // 从低 nibble 相位开始静音（ADPCM 静音为 0），高 nibble 必须保留
        let mut buf = [0xffu8; 4];
        let area = unsafe { ChannelArea::new(buf.as_mut_ptr(), 4, 8) };
        area_silence(&area, 0, 4, SampleFormat::ImaAdpcm).unwrap();
        assert_eq!(buf, [0xf0; 4]);

        // 高 nibble 相位，低 nibble 保留
        let mut buf = [0xffu8; 4];
        let area = unsafe { ChannelArea::new(buf.as_mut_ptr(), 0, 8) };
        area_silence(&area, 0, 4, SampleFormat::ImaAdpcm).unwrap();
        assert_eq!(buf, [0x0f; 4]);
    }

    #[test]
    fn test_silence_4bit_packed_walks_nibbles() {
        // 紧密打包的 4-bit：连续 nibble 交替高低相位
        let mut buf = [0xffu8; 2];
        let area = unsafe { ChannelArea::new(buf.as_mut_ptr(), 0, 4) };
        area_silence(&area, 0, 3, SampleFormat::ImaAdpcm).unwrap();
        // 前 3 个 nibble 清零，第 4 个保留
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], 0x0f);
    }

    #[test]
    fn test_copy_roundtrip_all_widths() {
        // 每种物理宽度：已静音的目的写入已知模式再读回，逐字节一致
        let cases: &[(SampleFormat, u32)] = &[
            (SampleFormat::ImaAdpcm, 4),
            (SampleFormat::U8, 8),
            (SampleFormat::S16Le, 16),
            (SampleFormat::S32Le, 32),
            (SampleFormat::Float64Le, 64),
        ];
        for &(fmt, width) in cases {
            let n = 16u64;
            let bytes = (n * width as u64 / 8) as usize;
            let mut src: Vec<u8> = (0..bytes).map(|i| (i as u8).wrapping_mul(37).wrapping_add(11)).collect();
            let mut dst = vec![0u8; bytes];
            let s = unsafe { ChannelArea::new(src.as_mut_ptr(), 0, width) };
            let d = unsafe { ChannelArea::new(dst.as_mut_ptr(), 0, width) };
            area_silence(&d, 0, n as usize, fmt).unwrap();
            area_copy(&d, 0, &s, 0, n as usize, fmt).unwrap();
            for i in 0..n {
                assert_eq!(
                    read_sample(&d, i, width),
                    read_sample(&s, i, width),
                    "{} sample {}",
                    fmt.name(),
                    i
                );
            }
        }
    }

    #[test]
    fn test_copy_nonunit_stride_nonzero_offset() {
        // 非单位步进 + 非零位偏移：源是交织双声道的右声道，
        // 目的是独立声道缓冲区
        let mut src = [0u8; 16];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut dst = [0u8; 8];
        let s = unsafe { ChannelArea::new(src.as_mut_ptr(), 16, 32) };
        let d = unsafe { ChannelArea::new(dst.as_mut_ptr(), 0, 16) };
        area_copy(&d, 0, &s, 0, 4, SampleFormat::S16Le).unwrap();
        // 右声道样本位于字节 (2,3) (6,7) (10,11) (14,15)
        assert_eq!(dst, [2, 3, 6, 7, 10, 11, 14, 15]);
    }

    #[test]
    fn test_copy_4bit_cross_phase() {
        // 源低 nibble 相位 → 目的高 nibble 相位，值必须跟着换相
        let mut src = [0x0au8; 1]; // 低 nibble = 0xa
        let mut dst = [0x0fu8; 1];
        let s = unsafe { ChannelArea::new(src.as_mut_ptr(), 4, 8) };
        let d = unsafe { ChannelArea::new(dst.as_mut_ptr(), 0, 8) };
        area_copy(&d, 0, &s, 0, 1, SampleFormat::ImaAdpcm).unwrap();
        assert_eq!(dst[0], 0xaf);
    }

    #[test]
    fn test_copy_null_src_silences_null_dst_noop() {
        let mut dst = [0xffu8; 4];
        let d = unsafe { ChannelArea::new(dst.as_mut_ptr(), 0, 8) };
        let s = ChannelArea::null(0, 8);
        area_copy(&d, 0, &s, 0, 4, SampleFormat::U8).unwrap();
        assert_eq!(dst, [0x80; 4]);

        // 目的为 null：成功且什么都不发生
        let mut src = [1u8; 4];
        let s = unsafe { ChannelArea::new(src.as_mut_ptr(), 0, 8) };
        area_copy(&ChannelArea::null(0, 8), 0, &s, 0, 4, SampleFormat::U8).unwrap();
    }

    #[test]
    fn test_areas_copy_collapse_transparent() {
        // N 个紧密交织声道：折叠路径和逐声道路径输出逐字节一致
        for channels in [2u32, 4] {
            let fmt = SampleFormat::S16Le;
            let frames = 32u64;
            let bytes = (frames * channels as u64 * 2) as usize;
            let mut src: Vec<u8> = (0..bytes).map(|i| (i as u8).wrapping_mul(93)).collect();
            let mut dst_a = vec![0u8; bytes];
            let mut dst_b = vec![0u8; bytes];

            let src_areas = areas_from_interleaved(src.as_mut_ptr(), channels, fmt);
            let a_areas = areas_from_interleaved(dst_a.as_mut_ptr(), channels, fmt);
            let b_areas = areas_from_interleaved(dst_b.as_mut_ptr(), channels, fmt);

            areas_copy(&a_areas, 0, &src_areas, 0, frames, fmt).unwrap();
            areas_copy_uncollapsed(&b_areas, 0, &src_areas, 0, frames, fmt).unwrap();
            assert_eq!(dst_a, dst_b, "{} channels", channels);
            assert_eq!(dst_a, src);
        }
    }

    #[test]
    fn test_areas_silence_collapse_transparent() {
        let fmt = SampleFormat::U16Le;
        let channels = 2u32;
        let frames = 16u64;
        let bytes = (frames * channels as u64 * 2) as usize;
        let mut a = vec![0xabu8; bytes];
        let mut b = vec![0xabu8; bytes];
        let a_areas = areas_from_interleaved(a.as_mut_ptr(), channels, fmt);
        let b_areas = areas_from_interleaved(b.as_mut_ptr(), channels, fmt);
        areas_silence(&a_areas, 2, 10, fmt).unwrap();
        areas_silence_uncollapsed(&b_areas, 2, 10, fmt).unwrap();
        assert_eq!(a, b);
        // 偏移前的帧不能被碰到
        assert_eq!(&a[..8], &[0xab; 8]);
    }

    #[test]
    fn test_areas_copy_noninterleaved_no_collapse() {
        // 独立声道缓冲区无法折叠，但结果仍然正确
        let fmt = SampleFormat::U8;
        let mut l = [1u8, 2, 3, 4];
        let mut r = [5u8, 6, 7, 8];
        let mut dst = [0u8; 8];
        let src_areas = areas_from_bufs(&[l.as_mut_ptr(), r.as_mut_ptr()], fmt);
        let dst_areas = areas_from_interleaved(dst.as_mut_ptr(), 2, fmt);
        areas_copy(&dst_areas, 0, &src_areas, 0, 4, fmt).unwrap();
        assert_eq!(dst, [1, 5, 2, 6, 3, 7, 4, 8]);
    }
}
