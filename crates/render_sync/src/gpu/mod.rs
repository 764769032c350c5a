//! # GPU Collaborator
//!
//! The synchronization core never talks to a graphics API directly. It sees
//! the GPU as a [`GpuDevice`] that can allocate buffers, accept recorded
//! copy work, and signal a [`GpuCounter`] once that work retires.
//!
//! ## Modules
//!
//! - **layout**: `#[repr(C)]` records copied into GPU buffers
//! - **upload**: bounded staging allocator for CPU to GPU copies
//! - **simulated**: in-process device used by tests and the demo app

pub mod layout;
pub mod upload;
pub mod simulated;

use crate::sync::GpuCounter;

pub use layout::{InstanceGpu, MeshGpu, NodeGpu, NodeInstancesGpu, Vertex, INVALID_INDEX};
pub use simulated::{Hazard, HazardKind, RetireMode, RetireWorker, SimulatedGpu};
pub use upload::{UpdateResult, UploadBuffer};

slotmap::new_key_type! {
    /// Handle to a buffer owned by a [`GpuDevice`]
    pub struct GpuBufferHandle;
}

/// GPU collaborator errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Device memory exhausted
    #[error("out of GPU memory allocating {requested} bytes")]
    OutOfMemory {
        /// Size of the failed allocation
        requested: usize,
    },
    
    /// Handle does not name a live buffer
    #[error("unknown GPU buffer {0:?}")]
    UnknownBuffer(GpuBufferHandle),
    
    /// Access past the end of a buffer
    #[error("access of {size} bytes at offset {offset} exceeds buffer size {capacity}")]
    OutOfBounds {
        /// Start of the access
        offset: usize,
        /// Length of the access
        size: usize,
        /// Buffer size in bytes
        capacity: usize,
    },
}

/// Allocated GPU buffer description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    /// Device handle
    pub handle: GpuBufferHandle,
    /// Number of elements
    pub capacity: usize,
    /// Size of one element in bytes
    pub element_size: usize,
}

impl GpuBuffer {
    /// Total size in bytes
    pub fn size_bytes(&self) -> usize {
        self.capacity * self.element_size
    }
    
    /// Byte offset of element `index`
    pub fn offset_of(&self, index: usize) -> usize {
        index * self.element_size
    }
}

/// One buffer-to-buffer copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Source buffer
    pub src: GpuBufferHandle,
    /// Byte offset in the source
    pub src_offset: usize,
    /// Destination buffer
    pub dst: GpuBufferHandle,
    /// Byte offset in the destination
    pub dst_offset: usize,
    /// Bytes to copy
    pub size: usize,
}

/// Recorded GPU work: copies plus buffers read by opaque kernels
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    copies: Vec<CopyRegion>,
    reads: Vec<GpuBufferHandle>,
}

impl CommandList {
    /// Create an empty command list
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Record a copy region
    pub fn copy(&mut self, region: CopyRegion) {
        self.copies.push(region);
    }
    
    /// Declare that the work reads `buffer` (culling, draw generation, ...)
    pub fn read(&mut self, buffer: GpuBufferHandle) {
        if !self.reads.contains(&buffer) {
            self.reads.push(buffer);
        }
    }
    
    /// Recorded copies
    pub fn copies(&self) -> &[CopyRegion] {
        &self.copies
    }
    
    /// Declared reads
    pub fn reads(&self) -> &[GpuBufferHandle] {
        &self.reads
    }
    
    /// Check if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.reads.is_empty()
    }
    
    /// Check whether this work accesses `buffer` as a copy source or a read
    pub fn reads_from(&self, buffer: GpuBufferHandle) -> bool {
        self.reads.contains(&buffer) || self.copies.iter().any(|copy| copy.src == buffer)
    }
}

/// Opaque GPU device
pub trait GpuDevice: Send + Sync + 'static {
    /// Allocate a buffer of `capacity` elements of `element_size` bytes
    fn create_buffer(&self, label: &str, capacity: usize, element_size: usize) -> Result<GpuBuffer, GpuError>;
    
    /// Release a buffer
    fn destroy_buffer(&self, handle: GpuBufferHandle) -> Result<(), GpuError>;
    
    /// Write host data into a host-visible buffer
    fn write_buffer(&self, handle: GpuBufferHandle, offset: usize, bytes: &[u8]) -> Result<(), GpuError>;
    
    /// Submit recorded work; `counter` reaches `signal_value` once it retires
    fn submit(&self, commands: CommandList, counter: &GpuCounter, signal_value: u64) -> Result<(), GpuError>;
}
