//! Spans and the per-device data map queried by node kernels.

use rustc_hash::FxHashMap;

use crate::node::Node;

/// A borrowed view of a node's most recent output on one device.
///
/// The pointer is only dereferenceable on the device owning the map the span
/// was read from; `as_slice` must not be called on spans published into a
/// device-side map.
#[derive(Debug, Clone, Copy)]
pub struct DataSpan {
    ptr: *const f64,
    len: usize,
}

impl DataSpan {
    pub fn new(ptr: *const f64, len: usize) -> Self {
        DataSpan { ptr, len }
    }

    pub fn from_slice(slice: &[f64]) -> Self {
        DataSpan {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    /// Raw pointer to the first element.
    pub fn data(&self) -> *const f64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the span as a slice. Valid only for host-addressable spans whose
    /// producer has completed.
    pub fn as_slice(&self) -> &[f64] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A mutable output span handed to a kernel.
#[derive(Debug)]
pub struct SpanMut {
    ptr: *mut f64,
    len: usize,
}

impl SpanMut {
    pub fn new(ptr: *mut f64, len: usize) -> Self {
        SpanMut { ptr, len }
    }

    pub fn data(&self) -> *mut f64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the output as a mutable slice. Valid only when the span is
    /// host-addressable.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Per-node configuration handed to kernels through the data map. In CUDA
/// mode it carries the stream the node's work must be ordered on.
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    #[cfg(feature = "cuda")]
    stream: Option<std::sync::Arc<crate::cuda::Stream>>,
}

impl KernelConfig {
    pub fn use_cuda(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            self.stream.is_some()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    #[cfg(feature = "cuda")]
    pub fn set_stream(&mut self, stream: std::sync::Arc<crate::cuda::Stream>) {
        self.stream = Some(stream);
    }

    #[cfg(feature = "cuda")]
    pub fn stream(&self) -> Option<&std::sync::Arc<crate::cuda::Stream>> {
        self.stream.as_ref()
    }
}

/// Mapping from node identity to that node's most recent output span on one
/// device.
///
/// Lookup is direct-addressed through the driver-assigned data token. Nodes
/// without a token (variables keep theirs unset at analysis time) fall back
/// to a name-keyed map, so every node the driver touches stays resolvable.
#[derive(Debug, Default)]
pub struct DataMap {
    spans: Vec<Option<DataSpan>>,
    by_name: FxHashMap<String, DataSpan>,
    #[cfg(feature = "cuda")]
    configs: Vec<KernelConfig>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes the token-indexed table to `k` slots and clears all entries.
    pub fn resize(&mut self, k: usize) {
        self.spans.clear();
        self.spans.resize(k, None);
        self.by_name.clear();
        #[cfg(feature = "cuda")]
        {
            self.configs.resize(k, KernelConfig::default());
        }
    }

    /// Publishes `span` as the current output of `node`.
    pub fn set(&mut self, node: &dyn Node, span: DataSpan) {
        match node.data_token() {
            Some(token) => {
                if token >= self.spans.len() {
                    self.spans.resize(token + 1, None);
                }
                self.spans[token] = Some(span);
            }
            None => {
                self.by_name.insert(node.name().to_string(), span);
            }
        }
    }

    /// Looks up the current output of `node`, if any.
    pub fn get(&self, node: &dyn Node) -> Option<DataSpan> {
        match node.data_token() {
            Some(token) => self.spans.get(token).copied().flatten(),
            None => self.by_name.get(node.name()).copied(),
        }
    }

    /// Looks up the current output of `node`. Panics if the node has never
    /// been published, which indicates an undeclared dependency.
    pub fn at(&self, node: &dyn Node) -> DataSpan {
        match self.get(node) {
            Some(span) => span,
            None => panic!("no data span registered for node '{}'", node.name()),
        }
    }

    /// Stores the kernel configuration for `node`.
    #[cfg(feature = "cuda")]
    pub fn set_config(&mut self, node: &dyn Node, cfg: KernelConfig) {
        if let Some(token) = node.data_token() {
            if token >= self.configs.len() {
                self.configs.resize(token + 1, KernelConfig::default());
            }
            self.configs[token] = cfg;
        }
    }

    /// Returns the kernel configuration for `node`.
    pub fn config(&self, node: &dyn Node) -> KernelConfig {
        #[cfg(feature = "cuda")]
        {
            if let Some(token) = node.data_token() {
                if let Some(cfg) = self.configs.get(token) {
                    return cfg.clone();
                }
            }
        }
        let _ = node;
        KernelConfig::default()
    }
}
