//! Codelets and the kernel calling convention
//!
//! A codelet bundles one implementation per supported architecture. Each
//! implementation receives the job's buffers, already coherent on the worker's
//! memory node, plus the opaque argument blob given at submission.

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::runtime::coherency::AccessMode;
use crate::runtime::data::{Element, Layout};
use crate::runtime::error::KernelError;
use crate::runtime::memory::Storage;
use crate::runtime::worker::WorkerArch;

/// Result of one kernel invocation.
pub type KernelResult = Result<(), KernelError>;

/// Kernel entry point: `(buffers, argument_blob)`.
pub type KernelFn = Arc<dyn Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync>;

/// Extra eligibility test: `(worker architecture, implementation index)`.
pub type CanExecuteFn = Arc<dyn Fn(WorkerArch, usize) -> bool + Send + Sync>;

/// One architecture-specific implementation.
#[derive(Clone)]
pub enum Implementation {
    Cpu(KernelFn),
    Cuda(KernelFn),
    OpenCl(KernelFn),
}

impl fmt::Debug for Implementation {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Implementation::{:?}", self.arch())
    }
}

impl Implementation {
    /// Architecture this implementation runs on.
    #[inline]
    pub fn arch(&self) -> WorkerArch {
        match self {
            Implementation::Cpu(_) => WorkerArch::Cpu,
            Implementation::Cuda(_) => WorkerArch::Cuda,
            Implementation::OpenCl(_) => WorkerArch::OpenCl,
        }
    }

    /// Kernel entry point.
    #[inline]
    pub fn func(&self) -> &KernelFn {
        match self {
            Implementation::Cpu(f) | Implementation::Cuda(f) | Implementation::OpenCl(f) => f,
        }
    }
}

/// Per-architecture functions implementing a task's computation.
#[derive(Clone)]
pub struct Codelet {
    name: String,
    implementations: Vec<Implementation>,
    nbuffers: Option<usize>,
    model: bool,
    can_execute: Option<CanExecuteFn>,
}

impl fmt::Debug for Codelet {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Codelet")
            .field("name", &self.name)
            .field("implementations", &self.implementations)
            .field("nbuffers", &self.nbuffers)
            .field("model", &self.model)
            .finish()
    }
}

impl Codelet {
    /// Empty codelet; add implementations with the builder methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementations: Vec::new(),
            nbuffers: None,
            model: true,
            can_execute: None,
        }
    }

    /// Add a CPU implementation.
    pub fn cpu<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
    {
        self.implementations.push(Implementation::Cpu(Arc::new(f)));
        self
    }

    /// Add a CUDA implementation.
    pub fn cuda<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
    {
        self.implementations.push(Implementation::Cuda(Arc::new(f)));
        self
    }

    /// Add an OpenCL implementation.
    pub fn opencl<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
    {
        self.implementations.push(Implementation::OpenCl(Arc::new(f)));
        self
    }

    /// Require exactly `n` buffers at submission.
    pub fn nbuffers(
        mut self,
        n: usize,
    ) -> Self {
        self.nbuffers = Some(n);
        self
    }

    /// Enable or disable the history performance model (enabled by default).
    pub fn with_model(
        mut self,
        enabled: bool,
    ) -> Self {
        self.model = enabled;
        self
    }

    /// Restrict eligibility beyond architecture matching.
    pub fn can_execute<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(WorkerArch, usize) -> bool + Send + Sync + 'static,
    {
        self.can_execute = Some(Arc::new(f));
        self
    }

    /// Symbol used as performance model key.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All implementations in declaration order.
    #[inline]
    pub fn implementations(&self) -> &[Implementation] {
        &self.implementations
    }

    /// Required buffer count, if declared.
    #[inline]
    pub fn expected_buffers(&self) -> Option<usize> {
        self.nbuffers
    }

    /// Whether executions feed the performance model.
    #[inline]
    pub fn has_model(&self) -> bool {
        self.model
    }

    /// Implementations usable on `arch`, with their indices.
    pub fn eligible(
        &self,
        arch: WorkerArch,
    ) -> impl Iterator<Item = (usize, &Implementation)> + '_ {
        self.implementations
            .iter()
            .enumerate()
            .filter(move |(i, imp)| {
                imp.arch() == arch
                    && self
                        .can_execute
                        .as_ref()
                        .map(|f| f(arch, *i))
                        .unwrap_or(true)
            })
    }

    /// Whether any implementation runs on `arch`.
    pub fn can_run_on(
        &self,
        arch: WorkerArch,
    ) -> bool {
        self.eligible(arch).next().is_some()
    }
}

enum ViewBytes<'a> {
    Read(RwLockReadGuard<'a, Vec<u8>>),
    Write(RwLockWriteGuard<'a, Vec<u8>>),
}

/// One buffer as seen by a kernel.
pub struct BufferView<'a> {
    layout: Layout,
    mode: AccessMode,
    bytes: ViewBytes<'a>,
}

impl<'a> BufferView<'a> {
    /// Open `storage` with the guard kind matching `mode`.
    pub(crate) fn open(
        storage: &'a Storage,
        layout: Layout,
        mode: AccessMode,
    ) -> Self {
        let bytes = if mode == AccessMode::Read {
            ViewBytes::Read(storage.read())
        } else {
            ViewBytes::Write(storage.write())
        };
        Self {
            layout,
            mode,
            bytes,
        }
    }

    /// Buffer layout.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Declared access mode.
    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.bytes {
            ViewBytes::Read(g) => g,
            ViewBytes::Write(g) => g,
        }
    }

    /// Mutable bytes, `None` for read-only buffers.
    pub fn try_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.bytes {
            ViewBytes::Read(_) => None,
            ViewBytes::Write(g) => Some(g.as_mut_slice()),
        }
    }

    /// Mutable bytes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was declared `Read`.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let mode = self.mode;
        match self.try_bytes_mut() {
            Some(bytes) => bytes,
            None => panic!("buffer opened {mode:?} cannot be written"),
        }
    }

    /// Number of `T` elements.
    #[inline]
    pub fn len<T: Element>(&self) -> usize {
        self.bytes().len() / T::SIZE
    }

    /// Whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Element `i`.
    #[inline]
    pub fn get<T: Element>(
        &self,
        i: usize,
    ) -> T {
        T::read_le(&self.bytes()[i * T::SIZE..])
    }

    /// Store element `i`.
    #[inline]
    pub fn set<T: Element>(
        &mut self,
        i: usize,
        value: T,
    ) {
        value.write_le(&mut self.bytes_mut()[i * T::SIZE..]);
    }

    /// Decode the whole buffer.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        crate::runtime::data::decode(self.bytes())
    }
}

/// Buffers handed to a kernel, in declaration order.
pub struct Buffers<'a> {
    views: Vec<BufferView<'a>>,
}

impl<'a> Buffers<'a> {
    pub(crate) fn new(views: Vec<BufferView<'a>>) -> Self {
        Self { views }
    }

    /// Number of buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether there are no buffers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Buffer `i`.
    #[inline]
    pub fn get(
        &self,
        i: usize,
    ) -> &BufferView<'a> {
        &self.views[i]
    }

    /// Mutable buffer `i`.
    #[inline]
    pub fn get_mut(
        &mut self,
        i: usize,
    ) -> &mut BufferView<'a> {
        &mut self.views[i]
    }

    /// Two distinct buffers, the first mutable.
    pub fn pair_mut(
        &mut self,
        dst: usize,
        src: usize,
    ) -> (&mut BufferView<'a>, &BufferView<'a>) {
        assert_ne!(dst, src, "pair_mut needs two distinct buffers");
        if dst < src {
            let (a, b) = self.views.split_at_mut(src);
            (&mut a[dst], &b[0])
        } else {
            let (a, b) = self.views.split_at_mut(dst);
            (&mut b[0], &a[src])
        }
    }
}
