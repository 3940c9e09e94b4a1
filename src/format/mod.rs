//! 采样格式、访问模式与流方向
//!
//! 原设计用全局静态名字表做枚举到字符串的映射，这里改为
//! 封闭枚举上的穷尽 match，不引入任何进程级可变状态。
//!
//! 物理宽度（physical width）是样本在内存中占用的位数，
//! 与有效位数（width）可能不同：S24_LE 有效 24 位但物理占 32 位。

/// 流方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 播放：应用生产，设备消费
    Playback,
    /// 采集：设备生产，应用消费
    Capture,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Playback => "PLAYBACK",
            Self::Capture => "CAPTURE",
        }
    }
}

/// 环形缓冲区访问模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// 交织读写：LRLRLR...，一块打包缓冲区
    RwInterleaved,
    /// 非交织读写：每声道独立缓冲区
    RwNonInterleaved,
    /// 交织 mmap：直接拿 begin/commit 访问环形缓冲区
    MmapInterleaved,
    /// 非交织 mmap
    MmapNonInterleaved,
}

impl Access {
    pub fn name(self) -> &'static str {
        match self {
            Self::RwInterleaved => "RW_INTERLEAVED",
            Self::RwNonInterleaved => "RW_NONINTERLEAVED",
            Self::MmapInterleaved => "MMAP_INTERLEAVED",
            Self::MmapNonInterleaved => "MMAP_NONINTERLEAVED",
        }
    }

    /// 环内样本是否按声道交织存放
    pub fn is_interleaved(self) -> bool {
        matches!(self, Self::RwInterleaved | Self::MmapInterleaved)
    }
}

/// 子格式（目前只有标准一种，保留位）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Subformat {
    #[default]
    Std,
}

impl Subformat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Std => "STD",
        }
    }
}

/// 采样格式
///
/// 封闭集合，覆盖内核支持的每种物理宽度：
/// 4 (ADPCM)、8、16、32、64 位
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// 有符号 8 位
    S8,
    /// 无符号 8 位（静音为中点偏置 0x80）
    U8,
    /// 有符号 16 位 little-endian
    S16Le,
    /// 无符号 16 位 little-endian
    U16Le,
    /// 有符号 24 位，低对齐存于 32 位 little-endian
    S24Le,
    /// 有符号 32 位 little-endian
    S32Le,
    /// 无符号 32 位 little-endian
    U32Le,
    /// IEEE float 32 位 little-endian
    FloatLe,
    /// IEEE float 64 位 little-endian
    Float64Le,
    /// mu-law 压扩 8 位（静音 0x7F）
    MuLaw,
    /// a-law 压扩 8 位（静音 0x55）
    ALaw,
    /// IMA ADPCM 4 位
    ImaAdpcm,
}

impl SampleFormat {
    /// 有效位数
    pub fn width(self) -> u32 {
        match self {
            Self::S8 | Self::U8 | Self::MuLaw | Self::ALaw => 8,
            Self::S16Le | Self::U16Le => 16,
            Self::S24Le => 24,
            Self::S32Le | Self::U32Le | Self::FloatLe => 32,
            Self::Float64Le => 64,
            Self::ImaAdpcm => 4,
        }
    }

    /// 物理位数（样本在内存中实际占用的位数）
    pub fn physical_width(self) -> u32 {
        match self {
            Self::S8 | Self::U8 | Self::MuLaw | Self::ALaw => 8,
            Self::S16Le | Self::U16Le => 16,
            Self::S24Le | Self::S32Le | Self::U32Le | Self::FloatLe => 32,
            Self::Float64Le => 64,
            Self::ImaAdpcm => 4,
        }
    }

    /// 数字静音的 64 位填充模式
    ///
    /// 样本级静音模式在 64 位内重复：有符号/浮点格式为全零，
    /// 无符号格式为符号位偏置，压扩格式为各自的零电平码。
    pub fn silence_64(self) -> u64 {
        match self {
            Self::S8 | Self::S16Le | Self::S24Le | Self::S32Le => 0,
            Self::FloatLe | Self::Float64Le => 0,
            Self::ImaAdpcm => 0,
            Self::U8 => 0x8080_8080_8080_8080,
            Self::U16Le => 0x8000_8000_8000_8000,
            Self::U32Le => 0x8000_0000_8000_0000,
            Self::MuLaw => 0x7f7f_7f7f_7f7f_7f7f,
            Self::ALaw => 0x5555_5555_5555_5555,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::S8 => "S8",
            Self::U8 => "U8",
            Self::S16Le => "S16_LE",
            Self::U16Le => "U16_LE",
            Self::S24Le => "S24_LE",
            Self::S32Le => "S32_LE",
            Self::U32Le => "U32_LE",
            Self::FloatLe => "FLOAT_LE",
            Self::Float64Le => "FLOAT64_LE",
            Self::MuLaw => "MU_LAW",
            Self::ALaw => "A_LAW",
            Self::ImaAdpcm => "IMA_ADPCM",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::S8 => "Signed 8 bit",
            Self::U8 => "Unsigned 8 bit",
            Self::S16Le => "Signed 16 bit Little Endian",
            Self::U16Le => "Unsigned 16 bit Little Endian",
            Self::S24Le => "Signed 24 bit Little Endian",
            Self::S32Le => "Signed 32 bit Little Endian",
            Self::U32Le => "Unsigned 32 bit Little Endian",
            Self::FloatLe => "Float 32 bit Little Endian",
            Self::Float64Le => "Float 64 bit Little Endian",
            Self::MuLaw => "Mu-Law",
            Self::ALaw => "A-Law",
            Self::ImaAdpcm => "Ima-ADPCM",
        }
    }
}
