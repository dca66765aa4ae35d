//! Partition filters
//!
//! A filter splits a parent layout into child layouts plus the byte range each
//! child covers in the parent's contiguous storage.

use std::ops::Range;

use super::layout::Layout;
use crate::runtime::error::DataError;

/// How to split a handle into children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Split a vector into `parts` contiguous blocks.
    Block { parts: usize },
    /// Split a matrix into `parts` blocks of whole rows.
    RowBlock { parts: usize },
}

/// Size and offset of chunk `index` when `n` items are cut in `parts`.
///
/// The remainder goes to the first chunks, one item each.
pub fn chunk_size_and_offset(
    n: usize,
    parts: usize,
    index: usize,
) -> (usize, usize) {
    let base = n / parts;
    let rem = n % parts;
    let size = base + usize::from(index < rem);
    let offset = index * base + index.min(rem);
    (size, offset)
}

impl Filter {
    fn parts(&self) -> usize {
        match *self {
            Filter::Block { parts } | Filter::RowBlock { parts } => parts,
        }
    }

    /// Child layouts and their byte ranges in the parent.
    pub fn split(
        &self,
        layout: &Layout,
    ) -> Result<Vec<(Layout, Range<usize>)>, DataError> {
        let parts = self.parts();
        if parts == 0 {
            return Err(DataError::BadFilter("zero parts".to_string()));
        }

        match (*self, *layout) {
            (Filter::Block { .. }, Layout::Vector { len, elem_size }) => {
                if parts > len {
                    return Err(DataError::BadFilter(format!(
                        "{parts} parts for a vector of {len} elements"
                    )));
                }
                Ok((0..parts)
                    .map(|i| {
                        let (size, offset) = chunk_size_and_offset(len, parts, i);
                        let start = offset * elem_size;
                        (
                            Layout::Vector {
                                len: size,
                                elem_size,
                            },
                            start..start + size * elem_size,
                        )
                    })
                    .collect())
            },
            (
                Filter::RowBlock { .. },
                Layout::Matrix {
                    rows,
                    cols,
                    elem_size,
                },
            ) => {
                if parts > rows {
                    return Err(DataError::BadFilter(format!(
                        "{parts} parts for a matrix of {rows} rows"
                    )));
                }
                let row_bytes = cols * elem_size;
                Ok((0..parts)
                    .map(|i| {
                        let (size, offset) = chunk_size_and_offset(rows, parts, i);
                        let start = offset * row_bytes;
                        (
                            Layout::Matrix {
                                rows: size,
                                cols,
                                elem_size,
                            },
                            start..start + size * row_bytes,
                        )
                    })
                    .collect())
            },
            (filter, layout) => Err(DataError::BadFilter(format!(
                "{filter:?} does not apply to {layout:?}"
            ))),
        }
    }
}
