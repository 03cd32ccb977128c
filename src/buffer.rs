//! Pool-backed scratch buffers for batched node outputs.
//!
//! Scalars never come through here; they live in the driver's inline slots.
//! Batched outputs borrow storage from size-keyed pools, and dropping a
//! handle returns the storage to its pool for the next request of the same
//! length. Pools grow monotonically over a fit and are never defragmented.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use crate::cuda;

/// A scratch allocation for one node output.
///
/// Only the accessors matching the buffer's placement are valid: a host
/// buffer has no device address and vice versa. Pinned buffers answer all
/// four.
pub trait ScratchBuffer {
    fn len(&self) -> usize;

    fn cpu_read_ptr(&self) -> *const f64;

    fn cpu_write_ptr(&mut self) -> *mut f64;

    fn gpu_read_ptr(&self) -> *const f64;

    fn gpu_write_ptr(&mut self) -> *mut f64;
}

type HostPool = Rc<RefCell<HashMap<usize, Vec<Vec<f64>>>>>;

#[cfg(feature = "cuda")]
type DevicePool = Rc<RefCell<HashMap<usize, Vec<cuda::DeviceArray>>>>;

#[cfg(feature = "cuda")]
type PinnedPool = Rc<RefCell<HashMap<usize, Vec<cuda::PinnedArray>>>>;

/// Hands out scratch buffers and recycles their storage.
#[derive(Default)]
pub struct BufferManager {
    host_pool: HostPool,
    #[cfg(feature = "cuda")]
    device_pool: DevicePool,
    #[cfg(feature = "cuda")]
    pinned_pool: PinnedPool,
    #[cfg(feature = "cuda")]
    alloc_stream: Option<Arc<cuda::Stream>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the stream device allocations are issued on. Required before
    /// `make_device` or `make_pinned` can be used.
    #[cfg(feature = "cuda")]
    pub fn set_alloc_stream(&mut self, stream: Arc<cuda::Stream>) {
        self.alloc_stream = Some(stream);
    }

    /// A host-RAM buffer of `n` doubles.
    pub fn make_host(&self, n: usize) -> Box<dyn ScratchBuffer> {
        let data = self
            .host_pool
            .borrow_mut()
            .get_mut(&n)
            .and_then(Vec::pop)
            .unwrap_or_else(|| vec![0.0; n]);
        Box::new(HostBuffer {
            data,
            pool: Rc::clone(&self.host_pool),
        })
    }

    /// A device-RAM buffer of `n` doubles.
    #[cfg(feature = "cuda")]
    pub fn make_device(&self, n: usize) -> Box<dyn ScratchBuffer> {
        let stream = self
            .alloc_stream
            .as_ref()
            .expect("no allocation stream registered");
        let array = self
            .device_pool
            .borrow_mut()
            .get_mut(&n)
            .and_then(Vec::pop)
            .unwrap_or_else(|| cuda::DeviceArray::zeros(stream, n));
        Box::new(DeviceBuffer {
            array: Some(array),
            pool: Rc::clone(&self.device_pool),
        })
    }

    /// A pinned host buffer of `n` doubles, addressable from both sides.
    /// Device work touching it must be ordered on `stream`.
    #[cfg(feature = "cuda")]
    pub fn make_pinned(&self, n: usize, stream: Arc<cuda::Stream>) -> Box<dyn ScratchBuffer> {
        let array = self
            .pinned_pool
            .borrow_mut()
            .get_mut(&n)
            .and_then(Vec::pop)
            .unwrap_or_else(|| cuda::PinnedArray::new(n));
        Box::new(PinnedBuffer {
            array: Some(array),
            stream,
            pool: Rc::clone(&self.pinned_pool),
        })
    }
}

struct HostBuffer {
    data: Vec<f64>,
    pool: HostPool,
}

impl ScratchBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn cpu_read_ptr(&self) -> *const f64 {
        self.data.as_ptr()
    }

    fn cpu_write_ptr(&mut self) -> *mut f64 {
        self.data.as_mut_ptr()
    }

    fn gpu_read_ptr(&self) -> *const f64 {
        panic!("host buffer is not device-addressable");
    }

    fn gpu_write_ptr(&mut self) -> *mut f64 {
        panic!("host buffer is not device-addressable");
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        self.pool
            .borrow_mut()
            .entry(data.len())
            .or_default()
            .push(data);
    }
}

#[cfg(feature = "cuda")]
struct DeviceBuffer {
    array: Option<cuda::DeviceArray>,
    pool: DevicePool,
}

#[cfg(feature = "cuda")]
impl ScratchBuffer for DeviceBuffer {
    fn len(&self) -> usize {
        self.array.as_ref().map_or(0, cuda::DeviceArray::len)
    }

    fn cpu_read_ptr(&self) -> *const f64 {
        panic!("device buffer is not host-addressable");
    }

    fn cpu_write_ptr(&mut self) -> *mut f64 {
        panic!("device buffer is not host-addressable");
    }

    fn gpu_read_ptr(&self) -> *const f64 {
        self.array.as_ref().expect("buffer already released").ptr()
    }

    fn gpu_write_ptr(&mut self) -> *mut f64 {
        self.array.as_ref().expect("buffer already released").ptr()
    }
}

#[cfg(feature = "cuda")]
impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(array) = self.array.take() {
            self.pool
                .borrow_mut()
                .entry(array.len())
                .or_default()
                .push(array);
        }
    }
}

#[cfg(feature = "cuda")]
struct PinnedBuffer {
    array: Option<cuda::PinnedArray>,
    #[allow(dead_code)]
    stream: Arc<cuda::Stream>,
    pool: PinnedPool,
}

#[cfg(feature = "cuda")]
impl ScratchBuffer for PinnedBuffer {
    fn len(&self) -> usize {
        self.array.as_ref().map_or(0, cuda::PinnedArray::len)
    }

    fn cpu_read_ptr(&self) -> *const f64 {
        self.array.as_ref().expect("buffer already released").ptr()
    }

    fn cpu_write_ptr(&mut self) -> *mut f64 {
        self.array.as_ref().expect("buffer already released").ptr()
    }

    fn gpu_read_ptr(&self) -> *const f64 {
        self.array.as_ref().expect("buffer already released").ptr()
    }

    fn gpu_write_ptr(&mut self) -> *mut f64 {
        self.array.as_ref().expect("buffer already released").ptr()
    }
}

#[cfg(feature = "cuda")]
impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if let Some(array) = self.array.take() {
            self.pool
                .borrow_mut()
                .entry(array.len())
                .or_default()
                .push(array);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_storage_is_reused_for_same_length() {
        let manager = BufferManager::new();

        let first = manager.make_host(16);
        let first_ptr = first.cpu_read_ptr();
        drop(first);

        let second = manager.make_host(16);
        assert_eq!(second.cpu_read_ptr(), first_ptr);
    }

    #[test]
    fn live_buffers_never_alias() {
        let manager = BufferManager::new();

        let a = manager.make_host(8);
        let b = manager.make_host(8);
        assert_ne!(a.cpu_read_ptr(), b.cpu_read_ptr());
    }

    #[test]
    fn pools_are_keyed_by_length() {
        let manager = BufferManager::new();

        let small = manager.make_host(4);
        let small_ptr = small.cpu_read_ptr();
        drop(small);

        let large = manager.make_host(1024);
        assert_ne!(large.cpu_read_ptr(), small_ptr);
        assert_eq!(large.len(), 1024);

        // The 4-slot still sits in its own pool.
        let small_again = manager.make_host(4);
        assert_eq!(small_again.cpu_read_ptr(), small_ptr);
    }

    #[test]
    fn pool_grows_monotonically() {
        let manager = BufferManager::new();

        let a = manager.make_host(32);
        let b = manager.make_host(32);
        drop(a);
        drop(b);
        assert_eq!(manager.host_pool.borrow()[&32].len(), 2);

        let _c = manager.make_host(32);
        assert_eq!(manager.host_pool.borrow()[&32].len(), 1);
    }

    #[test]
    #[should_panic(expected = "not device-addressable")]
    fn host_buffer_rejects_device_access() {
        let manager = BufferManager::new();
        let buffer = manager.make_host(4);
        let _ = buffer.gpu_read_ptr();
    }
}
