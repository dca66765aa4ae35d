//! Reduction methods for `Redux` accesses.

use std::fmt;
use std::sync::Arc;

use crate::runtime::coherency::AccessMode;
use crate::runtime::data::Layout;
use crate::runtime::error::fatal;
use crate::runtime::memory::Storage;
use crate::runtime::task::{BufferView, Buffers, KernelFn, KernelResult};

/// Application-supplied init and fold kernels.
///
/// `init` receives one writable buffer and sets it to the neutral element.
/// `reduce` receives `(destination, contribution)` and folds the second into
/// the first.
#[derive(Clone)]
pub struct ReductionOps {
    init: KernelFn,
    reduce: KernelFn,
}

impl fmt::Debug for ReductionOps {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("ReductionOps")
    }
}

impl ReductionOps {
    pub fn new<I, R>(
        init: I,
        reduce: R,
    ) -> Self
    where
        I: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
        R: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
    {
        Self {
            init: Arc::new(init),
            reduce: Arc::new(reduce),
        }
    }

    /// Set `block` to the neutral element.
    pub(crate) fn init_block(
        &self,
        block: &Storage,
        layout: Layout,
    ) {
        let mut buffers = Buffers::new(vec![BufferView::open(block, layout, AccessMode::Write)]);
        if let Err(e) = (self.init)(&mut buffers, &[]) {
            fatal("reduction init failed", &e.to_string());
        }
    }

    /// Fold `contribution` into `dst`.
    pub(crate) fn fold(
        &self,
        dst: &Storage,
        contribution: &Storage,
        layout: Layout,
    ) {
        let mut buffers = Buffers::new(vec![
            BufferView::open(dst, layout, AccessMode::ReadWrite),
            BufferView::open(contribution, layout, AccessMode::Read),
        ]);
        if let Err(e) = (self.reduce)(&mut buffers, &[]) {
            fatal("reduction fold failed", &e.to_string());
        }
    }
}
