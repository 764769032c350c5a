//! In-process GPU device
//!
//! Buffers are byte vectors and submissions are queued until retired, either
//! at submit time ([`RetireMode::Immediate`]) or when the owner calls
//! [`SimulatedGpu::retire_next`] ([`RetireMode::Manual`]). Copies execute
//! when their submission retires, like on a real queue.
//!
//! Every host write, copy destination or destroy that touches a buffer still
//! read by unretired work is recorded as a [`Hazard`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use slotmap::SlotMap;

use crate::foundation::logging::{trace, warn};
use crate::sync::GpuCounter;
use super::{CommandList, GpuBuffer, GpuBufferHandle, GpuDevice, GpuError};

/// When submitted work retires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireMode {
    /// Work retires inside `submit`
    Immediate,
    /// Work retires only through `retire_next` / `retire_all`
    Manual,
}

/// How a buffer was touched while in-flight work still read it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardKind {
    /// Host write into a buffer read by pending work
    HostWrite,
    /// Copy destination read by earlier pending work
    CopyWrite,
    /// Buffer destroyed while pending work reads it
    Destroy,
}

/// Write-after-read violation observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hazard {
    /// Affected buffer
    pub buffer: GpuBufferHandle,
    /// Label given at creation
    pub label: String,
    /// Offending access
    pub kind: HazardKind,
}

struct BufferData {
    label: String,
    bytes: Vec<u8>,
}

struct Submission {
    commands: CommandList,
    counter: GpuCounter,
    signal_value: u64,
}

#[derive(Default)]
struct Inner {
    buffers: SlotMap<GpuBufferHandle, BufferData>,
    pending: VecDeque<Submission>,
    hazards: Vec<Hazard>,
    allocated_bytes: usize,
    submitted: u64,
}

impl Inner {
    fn buffer(&self, handle: GpuBufferHandle) -> Result<&BufferData, GpuError> {
        self.buffers.get(handle).ok_or(GpuError::UnknownBuffer(handle))
    }
    
    fn record_if_read(&mut self, buffer: GpuBufferHandle, kind: HazardKind) {
        if self.pending.iter().any(|submission| submission.commands.reads_from(buffer)) {
            let label = self.buffers.get(buffer).map(|data| data.label.clone()).unwrap_or_default();
            warn!("GPU hazard {kind:?} on buffer '{label}'");
            self.hazards.push(Hazard { buffer, label, kind });
        }
    }
    
    fn execute(&mut self, submission: Submission) {
        for copy in submission.commands.copies() {
            let Some(src) = self.buffers.get(copy.src) else { continue };
            let Some(bytes) = src.bytes.get(copy.src_offset..copy.src_offset + copy.size) else { continue };
            let bytes = bytes.to_vec();
            if let Some(dst) = self.buffers.get_mut(copy.dst) {
                if let Some(target) = dst.bytes.get_mut(copy.dst_offset..copy.dst_offset + copy.size) {
                    target.copy_from_slice(&bytes);
                }
            }
        }
        trace!("GPU retired work signalling {}", submission.signal_value);
        submission.counter.signal(submission.signal_value);
    }
}

fn check_range(offset: usize, size: usize, capacity: usize) -> Result<(), GpuError> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(GpuError::OutOfBounds { offset, size, capacity }),
    }
}

/// Simulated GPU device
pub struct SimulatedGpu {
    inner: Mutex<Inner>,
    mode: RetireMode,
    memory_limit: Option<usize>,
}

impl SimulatedGpu {
    /// Create a device that retires work immediately
    pub fn new() -> Self {
        Self::with_mode(RetireMode::Immediate)
    }
    
    /// Create a device with the given retire mode
    pub fn with_mode(mode: RetireMode) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            mode,
            memory_limit: None,
        }
    }
    
    /// Limit total buffer memory
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
    
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    
    /// Retire the oldest pending submission
    pub fn retire_next(&self) -> bool {
        let mut inner = self.lock();
        match inner.pending.pop_front() {
            Some(submission) => {
                inner.execute(submission);
                true
            }
            None => false,
        }
    }
    
    /// Retire every pending submission, returning how many retired
    pub fn retire_all(&self) -> usize {
        let mut retired = 0;
        while self.retire_next() {
            retired += 1;
        }
        retired
    }
    
    /// Submissions not yet retired
    pub fn pending_submissions(&self) -> usize {
        self.lock().pending.len()
    }
    
    /// Submissions accepted so far
    pub fn submitted(&self) -> u64 {
        self.lock().submitted
    }
    
    /// Hazards recorded so far
    pub fn hazards(&self) -> Vec<Hazard> {
        self.lock().hazards.clone()
    }
    
    /// Number of live buffers
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }
    
    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> usize {
        self.lock().allocated_bytes
    }
    
    /// Copy of a buffer's contents
    pub fn read_buffer(&self, handle: GpuBufferHandle) -> Result<Vec<u8>, GpuError> {
        Ok(self.lock().buffer(handle)?.bytes.clone())
    }
    
    /// First `count` records of a buffer
    pub fn read_records<T: bytemuck::Pod>(&self, buffer: &GpuBuffer, count: usize) -> Result<Vec<T>, GpuError> {
        let bytes = self.read_buffer(buffer.handle)?;
        let record = std::mem::size_of::<T>();
        let size = count * record;
        check_range(0, size, bytes.len())?;
        Ok(bytes[..size].chunks_exact(record).map(bytemuck::pod_read_unaligned).collect())
    }
}

impl Default for SimulatedGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SimulatedGpu {
    fn create_buffer(&self, label: &str, capacity: usize, element_size: usize) -> Result<GpuBuffer, GpuError> {
        let size = capacity
            .checked_mul(element_size)
            .ok_or(GpuError::OutOfMemory { requested: usize::MAX })?;
        
        let mut inner = self.lock();
        if let Some(limit) = self.memory_limit {
            if inner.allocated_bytes + size > limit {
                return Err(GpuError::OutOfMemory { requested: size });
            }
        }
        inner.allocated_bytes += size;
        let handle = inner.buffers.insert(BufferData {
            label: label.to_string(),
            bytes: vec![0; size],
        });
        Ok(GpuBuffer { handle, capacity, element_size })
    }
    
    fn destroy_buffer(&self, handle: GpuBufferHandle) -> Result<(), GpuError> {
        let mut inner = self.lock();
        inner.buffer(handle)?;
        inner.record_if_read(handle, HazardKind::Destroy);
        if let Some(data) = inner.buffers.remove(handle) {
            inner.allocated_bytes -= data.bytes.len();
        }
        Ok(())
    }
    
    fn write_buffer(&self, handle: GpuBufferHandle, offset: usize, bytes: &[u8]) -> Result<(), GpuError> {
        let mut inner = self.lock();
        check_range(offset, bytes.len(), inner.buffer(handle)?.bytes.len())?;
        inner.record_if_read(handle, HazardKind::HostWrite);
        if let Some(data) = inner.buffers.get_mut(handle) {
            data.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }
    
    fn submit(&self, commands: CommandList, counter: &GpuCounter, signal_value: u64) -> Result<(), GpuError> {
        let mut inner = self.lock();
        for copy in commands.copies() {
            check_range(copy.src_offset, copy.size, inner.buffer(copy.src)?.bytes.len())?;
            check_range(copy.dst_offset, copy.size, inner.buffer(copy.dst)?.bytes.len())?;
        }
        for &read in commands.reads() {
            inner.buffer(read)?;
        }
        for copy in commands.copies() {
            inner.record_if_read(copy.dst, HazardKind::CopyWrite);
        }
        
        inner.submitted += 1;
        let submission = Submission { commands, counter: counter.clone(), signal_value };
        match self.mode {
            RetireMode::Immediate => inner.execute(submission),
            RetireMode::Manual => inner.pending.push_back(submission),
        }
        Ok(())
    }
}

/// Background thread retiring a [`RetireMode::Manual`] device with latency
pub struct RetireWorker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RetireWorker {
    /// Retire one submission every `latency`
    pub fn start(gpu: Arc<SimulatedGpu>, latency: Duration) -> Result<Self, std::io::Error> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("gpu-retire".to_string())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    if !gpu.retire_next() {
                        thread::yield_now();
                    }
                    thread::sleep(latency);
                }
                gpu.retire_all();
            })?;
        Ok(Self { running, thread: Some(thread) })
    }
}

impl Drop for RetireWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
