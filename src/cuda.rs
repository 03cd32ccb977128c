//! Thin wrapper over the CUDA driver API: streams, events, device arrays and
//! pinned host arrays, shaped the way the heterogeneous scheduler consumes
//! them.
//!
//! Creation goes through fallible paths surfaced as [`EvalError`]; operations
//! on the evaluation hot path treat device failure as fatal.

use std::sync::Arc;

use cudarc::driver::sys;
use cudarc::driver::{CudaContext, CudaEvent, CudaSlice, CudaStream, DevicePtr};

use crate::error::{EvalError, Result};

/// True when at least one CUDA device can be initialised.
pub fn has_cuda() -> bool {
    CudaContext::new(0).is_ok()
}

/// Owns the context of device 0 for the lifetime of a fit.
pub struct CudaEnv {
    ctx: Arc<CudaContext>,
}

impl CudaEnv {
    pub fn new() -> Result<Self> {
        let ctx = CudaContext::new(0).map_err(|e| {
            EvalError::UnsupportedMode(format!("failed to initialise CUDA device 0: {e}"))
        })?;
        Ok(CudaEnv { ctx })
    }

    pub fn default_stream(&self) -> Arc<Stream> {
        Arc::new(Stream {
            inner: self.ctx.default_stream(),
        })
    }

    pub fn new_stream(&self) -> Arc<Stream> {
        Arc::new(Stream {
            inner: self.ctx.new_stream().expect("failed to create CUDA stream"),
        })
    }

    pub fn new_event(&self) -> Event {
        Event {
            inner: self
                .ctx
                .new_event(None)
                .expect("failed to create CUDA event"),
        }
    }

    /// The underlying cudarc context, for callers that compile and launch
    /// their own kernels.
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}

/// An ordered device command queue.
pub struct Stream {
    inner: Arc<CudaStream>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Stream {
    /// True while work submitted to this stream has not completed.
    pub fn is_active(&self) -> bool {
        let status = unsafe { sys::cuStreamQuery(self.inner.cu_stream()) };
        match status {
            sys::CUresult::CUDA_SUCCESS => false,
            sys::CUresult::CUDA_ERROR_NOT_READY => true,
            err => panic!("cuStreamQuery failed: {err:?}"),
        }
    }

    /// Orders all future work on this stream after `event`.
    pub fn wait_event(&self, event: &Event) {
        self.inner
            .wait(&event.inner)
            .expect("cuStreamWaitEvent failed");
    }

    /// The underlying cudarc stream, for callers that launch their own
    /// kernels.
    pub fn cuda_stream(&self) -> &Arc<CudaStream> {
        &self.inner
    }
}

/// A recordable synchronisation point on a stream.
pub struct Event {
    inner: CudaEvent,
}

impl Event {
    /// Records this event at the current tail of `stream`.
    pub fn record(&self, stream: &Stream) {
        self.inner
            .record(stream.cuda_stream())
            .expect("cuEventRecord failed");
    }
}

/// A device-resident array of doubles.
pub struct DeviceArray {
    slice: CudaSlice<f64>,
}

impl DeviceArray {
    pub fn zeros(stream: &Stream, len: usize) -> Self {
        DeviceArray {
            slice: stream
                .cuda_stream()
                .alloc_zeros::<f64>(len)
                .expect("CUDA allocation failed"),
        }
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.len() == 0
    }

    /// Device pointer to the first element.
    pub fn ptr(&self) -> *mut f64 {
        let base: sys::CUdeviceptr = *self.slice.device_ptr();
        base as usize as *mut f64
    }

    /// Device pointer to the element at `offset`.
    pub fn ptr_at(&self, offset: usize) -> *const f64 {
        let base: sys::CUdeviceptr = *self.slice.device_ptr();
        (base as usize + offset * std::mem::size_of::<f64>()) as *const f64
    }

    /// Synchronous host-to-device copy into the region starting at `offset`.
    pub fn copy_from_host(&mut self, offset: usize, src: &[f64]) {
        assert!(offset + src.len() <= self.slice.len(), "copy out of range");
        let base: sys::CUdeviceptr = *self.slice.device_ptr();
        let dst = base + (offset * std::mem::size_of::<f64>()) as sys::CUdeviceptr;
        let status =
            unsafe { sys::cuMemcpyHtoD_v2(dst, src.as_ptr().cast(), std::mem::size_of_val(src)) };
        if status != sys::CUresult::CUDA_SUCCESS {
            panic!("cuMemcpyHtoD failed: {status:?}");
        }
    }
}

/// Page-locked host memory, simultaneously addressable from the device.
pub struct PinnedArray {
    ptr: *mut f64,
    len: usize,
}

impl PinnedArray {
    pub fn new(len: usize) -> Self {
        let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
        let bytes = len.max(1) * std::mem::size_of::<f64>();
        let flags = sys::CU_MEMHOSTALLOC_DEVICEMAP | sys::CU_MEMHOSTALLOC_PORTABLE;
        let status = unsafe { sys::cuMemHostAlloc(&mut ptr, bytes, flags) };
        if status != sys::CUresult::CUDA_SUCCESS {
            panic!("cuMemHostAlloc failed: {status:?}");
        }
        PinnedArray {
            ptr: ptr.cast(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The pinned pointer, valid on both host and device.
    pub fn ptr(&self) -> *mut f64 {
        self.ptr
    }
}

impl Drop for PinnedArray {
    fn drop(&mut self) {
        unsafe {
            sys::cuMemFreeHost(self.ptr.cast());
        }
    }
}
