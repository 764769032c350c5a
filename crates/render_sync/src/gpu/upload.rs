//! Bounded upload staging
//!
//! All CPU to GPU transfers of one submission are staged in a single
//! host-visible buffer and copied to their destinations by recorded
//! [`CopyRegion`]s. The buffer may only be [`reset`](UploadBuffer::reset)
//! once the submission reading it has retired.

use super::{CommandList, CopyRegion, GpuBuffer, GpuBufferHandle, GpuDevice, GpuError};

/// Alignment of every staged region
pub const UPLOAD_ALIGNMENT: usize = 16;

/// Outcome of an incremental GPU update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Nothing was pending
    NothingToDo,
    /// Every pending item was recorded
    Updated,
    /// The upload buffer filled up; flush, wait, reset and call again
    MoreWorkRemains,
}

impl UpdateResult {
    /// Check whether the caller has to flush and retry
    pub fn needs_retry(self) -> bool {
        self == UpdateResult::MoreWorkRemains
    }
}

/// Linear allocator over a host-visible staging buffer
#[derive(Debug)]
pub struct UploadBuffer {
    buffer: GpuBuffer,
    cursor: usize,
}

impl UploadBuffer {
    /// Allocate a staging buffer of `bytes` bytes on `device`
    pub fn new(device: &dyn GpuDevice, bytes: usize) -> Result<Self, GpuError> {
        let buffer = device.create_buffer("upload", bytes, 1)?;
        Ok(Self { buffer, cursor: 0 })
    }
    
    /// Staging buffer handle
    pub fn handle(&self) -> GpuBufferHandle {
        self.buffer.handle
    }
    
    /// Total staging size
    pub fn capacity(&self) -> usize {
        self.buffer.size_bytes()
    }
    
    /// Bytes reserved since the last reset
    pub fn used(&self) -> usize {
        self.cursor
    }
    
    /// Check whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }
    
    /// Check whether `size` bytes could fit into an empty buffer
    pub fn can_ever_fit(&self, size: usize) -> bool {
        size <= self.capacity()
    }
    
    /// Reserve `size` bytes at an `align`-aligned offset
    pub fn reserve(&mut self, size: usize, align: usize) -> Option<usize> {
        let offset = self.cursor.checked_next_multiple_of(align.max(1))?;
        let end = offset.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }
        self.cursor = end;
        Some(offset)
    }
    
    /// Stage `bytes` and record their copy into `dst` at `dst_offset`
    ///
    /// Returns `Ok(false)` without recording anything when the bytes do not
    /// fit into the remaining space.
    pub fn stage(
        &mut self,
        device: &dyn GpuDevice,
        commands: &mut CommandList,
        bytes: &[u8],
        dst: GpuBufferHandle,
        dst_offset: usize,
    ) -> Result<bool, GpuError> {
        if bytes.is_empty() {
            return Ok(true);
        }
        let Some(offset) = self.reserve(bytes.len(), UPLOAD_ALIGNMENT) else {
            return Ok(false);
        };
        
        device.write_buffer(self.buffer.handle, offset, bytes)?;
        commands.copy(CopyRegion {
            src: self.buffer.handle,
            src_offset: offset,
            dst,
            dst_offset,
            size: bytes.len(),
        });
        Ok(true)
    }
    
    /// Forget every reservation
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
    
    /// Release the staging buffer
    pub fn destroy(self, device: &dyn GpuDevice) -> Result<(), GpuError> {
        device.destroy_buffer(self.buffer.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SimulatedGpu;
    
    #[test]
    fn test_reserve_aligns_and_fills() {
        let gpu = SimulatedGpu::new();
        let mut upload = UploadBuffer::new(&gpu, 64).unwrap();
        
        assert_eq!(upload.reserve(10, 16), Some(0));
        assert_eq!(upload.reserve(10, 16), Some(16));
        assert_eq!(upload.reserve(32, 16), Some(32));
        assert_eq!(upload.reserve(1, 16), None);
        
        upload.reset();
        assert!(upload.is_empty());
        assert_eq!(upload.reserve(64, 16), Some(0));
    }
    
    #[test]
    fn test_stage_records_copy() {
        let gpu = SimulatedGpu::new();
        let mut upload = UploadBuffer::new(&gpu, 32).unwrap();
        let target = gpu.create_buffer("target", 8, 1).unwrap();
        let mut commands = CommandList::new();
        
        assert!(upload.stage(&gpu, &mut commands, &[1, 2, 3], target.handle, 4).unwrap());
        assert_eq!(commands.copies().len(), 1);
        assert_eq!(commands.copies()[0].dst_offset, 4);
        assert_eq!(commands.copies()[0].size, 3);
        
        assert!(!upload.stage(&gpu, &mut commands, &[0; 32], target.handle, 0).unwrap());
        assert_eq!(commands.copies().len(), 1);
    }
}
