//! Element-wise summation on byte slices, used by the host backend.

use half::f16;

use crate::error::{Result, SyncError};
use crate::types::DataType;

/// Types the host backend can sum, read and written in native byte order.
trait Summable: Copy + 'static {
    const SIZE: usize;
    fn read_ne(bytes: &[u8]) -> Self;
    fn write_ne(self, bytes: &mut [u8]);
    fn add(a: Self, b: Self) -> Self;
}

impl Summable for f32 {
    const SIZE: usize = 4;
    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    #[inline]
    fn write_ne(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_ne_bytes());
    }
    #[inline]
    fn add(a: Self, b: Self) -> Self {
        a + b
    }
}

impl Summable for f16 {
    const SIZE: usize = 2;
    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        f16::from_ne_bytes([bytes[0], bytes[1]])
    }
    #[inline]
    fn write_ne(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_ne_bytes());
    }
    #[inline]
    fn add(a: Self, b: Self) -> Self {
        // accumulate in f32, round once
        f16::from_f32(a.to_f32() + b.to_f32())
    }
}

/// `dst[i] += src[i]` for every element, interpreting both as `dtype`.
///
/// `dst` and `src` must have the same length, a multiple of the element size.
pub(crate) fn sum_into(dst: &mut [u8], src: &[u8], dtype: DataType) -> Result<()> {
    if dst.len() != src.len() {
        return Err(SyncError::SizeMismatch {
            context: "sum_into",
            expected: dst.len(),
            actual: src.len(),
        });
    }
    match dtype {
        DataType::F32 => sum_typed::<f32>(dst, src),
        DataType::F16 => sum_typed::<f16>(dst, src),
        _ => {
            return Err(SyncError::UnsupportedPrecision {
                dtype,
                operation: "sum",
            });
        }
    }
    Ok(())
}

fn sum_typed<T: Summable>(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        T::add(T::read_ne(d), T::read_ne(s)).write_ne(d);
    }
}
