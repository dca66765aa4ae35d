//! Buffer layouts and content footprints
//!
//! A layout describes the shape of one registered buffer. Its footprint is a
//! CRC32C over the dimensions, so two buffers with the same shape share
//! performance history.

use serde::Serialize;

/// Shape of a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Layout {
    /// A single opaque value of `size` bytes.
    Variable { size: usize },
    /// `len` contiguous elements.
    Vector { len: usize, elem_size: usize },
    /// Row-major `rows x cols` matrix.
    Matrix {
        rows: usize,
        cols: usize,
        elem_size: usize,
    },
}

impl Layout {
    /// Vector of `len` elements of `T`.
    #[inline]
    pub fn vector_of<T: Element>(len: usize) -> Self {
        Layout::Vector {
            len,
            elem_size: T::SIZE,
        }
    }

    /// Matrix of `T`.
    #[inline]
    pub fn matrix_of<T: Element>(
        rows: usize,
        cols: usize,
    ) -> Self {
        Layout::Matrix {
            rows,
            cols,
            elem_size: T::SIZE,
        }
    }

    /// Single value of `T`.
    #[inline]
    pub fn variable_of<T: Element>() -> Self {
        Layout::Variable { size: T::SIZE }
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        match *self {
            Layout::Variable { size } => size,
            Layout::Vector { len, elem_size } => len * elem_size,
            Layout::Matrix {
                rows,
                cols,
                elem_size,
            } => rows * cols * elem_size,
        }
    }

    /// Content-layout hash.
    pub fn footprint(&self) -> Footprint {
        let crc = match *self {
            Layout::Variable { size } => crc32c_u32(size as u32, 0),
            Layout::Vector { len, elem_size } => crc32c_u32(len as u32, crc32c_u32(elem_size as u32, 1)),
            Layout::Matrix {
                rows,
                cols,
                elem_size,
            } => {
                let crc = crc32c_u32(elem_size as u32, 2);
                crc32c_u32(cols as u32, crc32c_u32(rows as u32, crc))
            },
        };
        Footprint(crc)
    }
}

/// Footprint of a buffer or of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Footprint(pub u32);

impl Footprint {
    /// Combine footprints in buffer order.
    pub fn combine<I: IntoIterator<Item = Footprint>>(parts: I) -> Footprint {
        Footprint(parts.into_iter().fold(0, |crc, fp| crc32c_u32(fp.0, crc)))
    }
}

const CRC32C_POLY_BE: u32 = 0x1EDC_6F41;

fn crc32c_byte(
    byte: u8,
    crc: u32,
) -> u32 {
    let mut crc = crc ^ ((byte as u32) << 24);
    for _ in 0..8 {
        crc = if crc & 0x8000_0000 != 0 {
            (crc << 1) ^ CRC32C_POLY_BE
        } else {
            crc << 1
        };
    }
    crc
}

/// Big-endian CRC32C of one word chained onto `crc`.
pub fn crc32c_u32(
    input: u32,
    crc: u32,
) -> u32 {
    input.to_be_bytes().iter().fold(crc, |crc, b| crc32c_byte(*b, crc))
}

/// Plain element types that can be stored in buffers.
pub trait Element: Copy + Send + Sync + 'static {
    /// Size in bytes.
    const SIZE: usize;

    /// Decode from little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode as little-endian bytes.
    fn write_le(
        self,
        out: &mut [u8],
    );
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(
                    self,
                    out: &mut [u8],
                ) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Encode a slice of elements.
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    for (chunk, v) in out.chunks_exact_mut(T::SIZE).zip(values) {
        v.write_le(chunk);
    }
    out
}

/// Decode a byte buffer into elements. Trailing partial elements are dropped.
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}
