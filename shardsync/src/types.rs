/// Global rank of one participant (process rank × devices per process +
/// local device index), or a process rank in the messaging layer.
pub type Rank = usize;

/// Element types a buffer or checkpoint item may declare.
///
/// Collectives accept only [`DataType::F32`] and [`DataType::F16`]; the other
/// variants exist so checkpoint items can carry their original type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    /// Inverse of `self as u8`, used by the checkpoint frame encoding.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => DataType::F32,
            1 => DataType::F64,
            2 => DataType::F16,
            3 => DataType::BF16,
            4 => DataType::I8,
            5 => DataType::I32,
            6 => DataType::I64,
            7 => DataType::U8,
            8 => DataType::U32,
            9 => DataType::U64,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => f.write_str("cpu"),
            DeviceKind::Gpu => f.write_str("gpu"),
        }
    }
}

/// A physical device: its class plus the ordinal the driver knows it by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl Device {
    pub const fn cpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            ordinal,
        }
    }

    pub const fn gpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            ordinal,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.ordinal)
    }
}

/// The two aggregate buffers every replica holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Params,
    Grads,
}
