//! # Mesh Manager
//!
//! Owns the mesh table slots and drives mesh uploads.
//!
//! ## Lifecycle
//!
//! 1. [`MeshManager::register`] reserves a table slot and queues the upload
//! 2. [`MeshManager::update`] stages geometry and the table record; a mesh
//!    that cannot be staged is released and reported by
//!    [`MeshManager::take_failed`]
//! 3. [`MeshManager::commit_staged`] runs once those copies are submitted:
//!    it marks the meshes uploaded in the current batch and releases their
//!    CPU data
//! 4. [`MeshManager::remove`] queues a mesh whose last instance went away
//! 5. [`MeshManager::on_published`] parks queued removals until the
//!    renderer has stopped using the previous scene buffers
//! 6. [`MeshManager::flush_pending_remove`] frees their slots and buffers
//!
//! A mesh that never finished uploading is released right away; its
//! buffers are destroyed after this tick's copies retire.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::config::MeshConfig;
use crate::foundation::collections::{FreeSlotTable, MeshSlot};
use crate::foundation::logging::{debug, trace, warn};
use crate::gpu::{CommandList, GpuBuffer, GpuBufferHandle, GpuDevice, MeshGpu, UpdateResult, UploadBuffer, Vertex};
use super::mesh::{Mesh, MeshBuffers};
use super::SceneError;

/// Mesh table slot owner and upload queue
pub struct MeshManager {
    slots: Mutex<FreeSlotTable>,
    registered: Vec<Option<Arc<Mesh>>>,
    table: GpuBuffer,
    pending_add: Vec<Arc<Mesh>>,
    staged: Vec<Arc<Mesh>>,
    failed: Vec<(Arc<Mesh>, SceneError)>,
    pending_remove: Vec<Arc<Mesh>>,
    awaiting_fence: Vec<Arc<Mesh>>,
    uploaded: Vec<Arc<Mesh>>,
    deferred_destroy: Vec<GpuBufferHandle>,
}

fn position_of(list: &[Arc<Mesh>], mesh: &Arc<Mesh>) -> Option<usize> {
    list.iter().position(|candidate| Arc::ptr_eq(candidate, mesh))
}

impl MeshManager {
    /// Create the manager and its mesh table buffer
    pub fn new(device: &dyn GpuDevice, config: &MeshConfig) -> Result<Self, SceneError> {
        let table = device.create_buffer("mesh table", config.mesh_capacity, mem::size_of::<MeshGpu>())?;
        Ok(Self {
            slots: Mutex::new(FreeSlotTable::with_capacity(config.mesh_capacity)),
            registered: (0..config.mesh_capacity).map(|_| None).collect(),
            table,
            pending_add: Vec::new(),
            staged: Vec::new(),
            failed: Vec::new(),
            pending_remove: Vec::new(),
            awaiting_fence: Vec::new(),
            uploaded: Vec::new(),
            deferred_destroy: Vec::new(),
        })
    }
    
    /// Mesh table buffer, one [`MeshGpu`] record per slot
    pub fn mesh_table(&self) -> GpuBuffer {
        self.table
    }
    
    /// Number of meshes holding a table slot
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
    
    /// Check whether no mesh holds a slot
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    
    /// Meshes waiting for upload or for their staged copies to be submitted
    pub fn pending_uploads(&self) -> usize {
        self.pending_add.len() + self.staged.len()
    }
    
    /// Meshes waiting to be freed
    pub fn pending_removals(&self) -> usize {
        self.pending_remove.len() + self.awaiting_fence.len()
    }
    
    /// Mesh registered in `slot`
    pub fn mesh(&self, slot: MeshSlot) -> Option<&Arc<Mesh>> {
        self.registered.get(slot.index()).and_then(Option::as_ref)
    }
    
    /// Make `mesh` known to the GPU
    ///
    /// Registering a mesh that still holds a slot cancels a queued removal.
    pub fn register(&mut self, mesh: &Arc<Mesh>) -> Result<(), SceneError> {
        if mesh.slot().is_some() {
            if let Some(position) = position_of(&self.pending_remove, mesh) {
                self.pending_remove.swap_remove(position);
            }
            if let Some(position) = position_of(&self.awaiting_fence, mesh) {
                self.awaiting_fence.swap_remove(position);
            }
            return Ok(());
        }
        if !mesh.has_cpu_data() {
            return Err(SceneError::MeshDataReleased(mesh.name().to_string()));
        }
        
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let capacity = slots.capacity();
            slots
                .allocate()
                .map(MeshSlot::new)
                .ok_or(SceneError::CapacityExceeded { pool: "meshes", capacity })?
        };
        mesh.set_slot(Some(slot));
        self.registered[slot.index()] = Some(Arc::clone(mesh));
        self.pending_add.push(Arc::clone(mesh));
        trace!("Registered mesh '{}' in {slot}", mesh.name());
        Ok(())
    }
    
    /// Queue removal of a mesh that lost its last instance
    pub fn remove(&mut self, mesh: Arc<Mesh>) {
        let unfinished = match position_of(&self.pending_add, &mesh) {
            Some(position) => Some(self.pending_add.swap_remove(position)),
            None => position_of(&self.staged, &mesh).map(|position| self.staged.swap_remove(position)),
        };
        if unfinished.is_some() {
            let buffers = self.release(&mesh);
            self.deferred_destroy.extend(buffers);
            debug!("Dropped mesh '{}' before its upload finished", mesh.name());
            return;
        }
        if mesh.slot().is_some() && position_of(&self.pending_remove, &mesh).is_none() {
            self.pending_remove.push(mesh);
        }
    }
    
    /// Stage pending mesh uploads
    ///
    /// Fully staged meshes wait for [`MeshManager::commit_staged`]. A mesh
    /// that cannot be staged loses its slot, keeps its CPU data and is
    /// reported by [`MeshManager::take_failed`]; the other meshes go on.
    pub fn update(
        &mut self,
        device: &dyn GpuDevice,
        upload: &mut UploadBuffer,
        commands: &mut CommandList,
    ) -> Result<UpdateResult, SceneError> {
        if self.pending_add.is_empty() {
            return Ok(UpdateResult::NothingToDo);
        }
        
        while let Some(mesh) = self.pending_add.last().cloned() {
            match self.stage_mesh(&mesh, device, upload, commands) {
                Ok(true) => {
                    self.pending_add.pop();
                    self.staged.push(mesh);
                }
                Ok(false) => return Ok(UpdateResult::MoreWorkRemains),
                Err(e) => {
                    self.pending_add.pop();
                    warn!("Dropping upload of mesh '{}': {e}", mesh.name());
                    let buffers = self.release(&mesh);
                    self.deferred_destroy.extend(buffers);
                    self.failed.push((mesh, e));
                }
            }
        }
        Ok(UpdateResult::Updated)
    }
    
    /// Mark staged meshes uploaded in `batch` and drop their CPU data
    ///
    /// Only call once every copy recorded by [`MeshManager::update`] has
    /// been submitted. Returns the number of meshes committed.
    pub fn commit_staged(&mut self, batch: u32) -> usize {
        let count = self.staged.len();
        for mesh in self.staged.drain(..) {
            mesh.mark_uploaded(batch);
            *mesh.cpu_data() = None;
            trace!("Uploaded mesh '{}' in batch {batch}", mesh.name());
            self.uploaded.push(mesh);
        }
        count
    }
    
    /// Meshes uploaded since the last call
    pub fn take_uploaded(&mut self) -> Vec<Arc<Mesh>> {
        mem::take(&mut self.uploaded)
    }
    
    /// Meshes whose upload failed since the last call, with the cause
    pub fn take_failed(&mut self) -> Vec<(Arc<Mesh>, SceneError)> {
        mem::take(&mut self.failed)
    }
    
    /// Park queued removals until the next retired publish
    pub fn on_published(&mut self) {
        self.awaiting_fence.append(&mut self.pending_remove);
    }
    
    /// Free meshes parked by [`MeshManager::on_published`]
    ///
    /// Only call once the renderer's completion token for the publish that
    /// followed their removal has been reached. Meshes that regained
    /// instances are kept.
    pub fn flush_pending_remove(&mut self, device: &dyn GpuDevice) -> Result<usize, SceneError> {
        let mut freed = 0;
        for mesh in mem::take(&mut self.awaiting_fence) {
            if mesh.instance_count() > 0 {
                continue;
            }
            for handle in self.release(&mesh) {
                device.destroy_buffer(handle)?;
            }
            freed += 1;
        }
        if freed > 0 {
            debug!("Freed {freed} meshes");
        }
        Ok(freed)
    }
    
    /// Destroy buffers of meshes dropped before their upload finished
    ///
    /// Only call once this manager's own upload work has retired.
    pub fn flush_deferred(&mut self, device: &dyn GpuDevice) -> Result<usize, SceneError> {
        let count = self.deferred_destroy.len();
        for handle in self.deferred_destroy.drain(..) {
            device.destroy_buffer(handle)?;
        }
        Ok(count)
    }
    
    /// Release every mesh and the mesh table
    pub fn release_all(&mut self, device: &dyn GpuDevice) -> Result<(), SceneError> {
        self.flush_deferred(device)?;
        let meshes: Vec<Arc<Mesh>> = self.registered.iter().flatten().cloned().collect();
        for mesh in meshes {
            for handle in self.release(&mesh) {
                device.destroy_buffer(handle)?;
            }
        }
        self.pending_add.clear();
        self.staged.clear();
        self.failed.clear();
        self.pending_remove.clear();
        self.awaiting_fence.clear();
        self.uploaded.clear();
        device.destroy_buffer(self.table.handle)?;
        Ok(())
    }
    
    /// Free the slot of `mesh`, returning its buffers for destruction
    fn release(&mut self, mesh: &Arc<Mesh>) -> Vec<GpuBufferHandle> {
        if let Some(slot) = mesh.slot() {
            self.slots.lock().unwrap_or_else(PoisonError::into_inner).free(slot.index());
            self.registered[slot.index()] = None;
        }
        mesh.reset_gpu_state();
        mesh.buffers_mut()
            .take()
            .map(|buffers| vec![buffers.vertices.handle, buffers.indices.handle])
            .unwrap_or_default()
    }
    
    /// Stage what is left of one mesh upload, returning whether it finished
    fn stage_mesh(
        &self,
        mesh: &Mesh,
        device: &dyn GpuDevice,
        upload: &mut UploadBuffer,
        commands: &mut CommandList,
    ) -> Result<bool, SceneError> {
        let Some(slot) = mesh.slot() else { return Ok(true) };
        
        {
            let data = mesh.cpu_data();
            let Some(data) = data.as_ref() else {
                return Err(SceneError::MeshDataReleased(mesh.name().to_string()));
            };
            let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
            let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);
            for bytes in [vertex_bytes.len(), index_bytes.len()] {
                if !upload.can_ever_fit(bytes) {
                    return Err(SceneError::UploadTooLarge { bytes, capacity: upload.capacity() });
                }
            }
            
            let mut guard = mesh.buffers_mut();
            let mut buffers = match *guard {
                Some(buffers) => buffers,
                None => create_buffers(device, mesh.name(), data.vertices.len(), data.indices.len())?,
            };
            if !buffers.vertices_staged {
                buffers.vertices_staged = upload.stage(device, commands, vertex_bytes, buffers.vertices.handle, 0)?;
            }
            if buffers.vertices_staged && !buffers.indices_staged {
                buffers.indices_staged = upload.stage(device, commands, index_bytes, buffers.indices.handle, 0)?;
            }
            *guard = Some(buffers);
            if !(buffers.vertices_staged && buffers.indices_staged) {
                return Ok(false);
            }
        }
        
        let record = mesh.gpu_record();
        Ok(upload.stage(device, commands, bytemuck::bytes_of(&record), self.table.handle, self.table.offset_of(slot.index()))?)
    }
}

fn create_buffers(
    device: &dyn GpuDevice,
    name: &str,
    vertex_count: usize,
    index_count: usize,
) -> Result<MeshBuffers, SceneError> {
    let vertices = device.create_buffer(&format!("{name} vertices"), vertex_count.max(1), mem::size_of::<Vertex>())?;
    let indices = match device.create_buffer(&format!("{name} indices"), index_count.max(1), mem::size_of::<u32>()) {
        Ok(indices) => indices,
        Err(e) => {
            device.destroy_buffer(vertices.handle)?;
            return Err(e.into());
        }
    };
    Ok(MeshBuffers { vertices, indices, vertices_staged: false, indices_staged: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{RetireMode, SimulatedGpu};
    use crate::scene::mesh::{is_mesh_loaded, MeshData};
    use crate::sync::GpuCounter;
    
    fn manager(gpu: &SimulatedGpu, capacity: usize) -> MeshManager {
        MeshManager::new(gpu, &MeshConfig { mesh_capacity: capacity }).unwrap()
    }
    
    fn upload_all(meshes: &mut MeshManager, gpu: &SimulatedGpu, upload: &mut UploadBuffer, batch: u32) -> usize {
        let counter = GpuCounter::new();
        let mut rounds = 0;
        loop {
            let mut commands = CommandList::new();
            let result = meshes.update(gpu, upload, &mut commands).unwrap();
            rounds += 1;
            gpu.submit(commands, &counter, rounds as u64).unwrap();
            upload.reset();
            if !result.needs_retry() {
                meshes.commit_staged(batch);
                return rounds;
            }
        }
    }
    
    #[test]
    fn test_register_and_upload() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 8);
        let mut upload = UploadBuffer::new(&gpu, 64 * 1024).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        
        meshes.register(&cube).unwrap();
        meshes.register(&cube).unwrap();
        assert_eq!(meshes.pending_uploads(), 1);
        assert_eq!(cube.slot(), Some(MeshSlot::new(0)));
        
        assert_eq!(upload_all(&mut meshes, &gpu, &mut upload, 4), 1);
        assert!(!cube.has_cpu_data());
        assert_eq!(cube.added_in_batch(), Some(4));
        assert!(is_mesh_loaded(&cube, 5));
        assert_eq!(meshes.take_uploaded().len(), 1);
        assert!(meshes.take_uploaded().is_empty());
        
        let records: Vec<MeshGpu> = gpu.read_records(&meshes.mesh_table(), 1).unwrap();
        assert_eq!(records[0].index_count, 36);
        let buffers = cube.buffers().unwrap();
        let vertices: Vec<Vertex> = gpu.read_records(&buffers.vertices, 24).unwrap();
        assert_eq!(vertices[0], MeshData::unit_cube().vertices[0]);
    }
    
    #[test]
    fn test_upload_resumes_across_rounds() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 8);
        let mut upload = UploadBuffer::new(&gpu, 24 * mem::size_of::<Vertex>()).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        
        meshes.register(&cube).unwrap();
        assert_eq!(upload_all(&mut meshes, &gpu, &mut upload, 1), 2);
        
        let indices: Vec<u32> = gpu.read_records(&cube.buffers().unwrap().indices, 36).unwrap();
        assert_eq!(indices, MeshData::unit_cube().indices);
    }
    
    #[test]
    fn test_oversized_mesh_fails_without_blocking_others() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 8);
        let mut upload = UploadBuffer::new(&gpu, 512).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        let triangle = Mesh::new("triangle", MeshData::triangle());
        meshes.register(&triangle).unwrap();
        meshes.register(&cube).unwrap();
        
        let mut commands = CommandList::new();
        assert_eq!(meshes.update(&gpu, &mut upload, &mut commands).unwrap(), UpdateResult::Updated);
        let failed = meshes.take_failed();
        assert_eq!(failed.len(), 1);
        assert!(Arc::ptr_eq(&failed[0].0, &cube));
        assert!(matches!(failed[0].1, SceneError::UploadTooLarge { bytes: 768, capacity: 512 }));
        assert_eq!(cube.slot(), None);
        assert!(cube.has_cpu_data());
        
        // Nothing counts as uploaded before the copies are submitted
        assert_eq!(triangle.added_in_batch(), None);
        assert!(meshes.take_uploaded().is_empty());
        gpu.submit(commands, &GpuCounter::new(), 1).unwrap();
        assert_eq!(meshes.commit_staged(3), 1);
        assert_eq!(triangle.added_in_batch(), Some(3));
        assert_eq!(meshes.take_uploaded().len(), 1);
        
        let vertices: Vec<Vertex> = gpu.read_records(&triangle.buffers().unwrap().vertices, 3).unwrap();
        assert_eq!(vertices, MeshData::triangle().vertices);
        assert_eq!(meshes.len(), 1);
        // The size check runs before any buffer is created
        assert_eq!(meshes.flush_deferred(&gpu).unwrap(), 0);
    }
    
    #[test]
    fn test_capacity_exhausted() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 1);
        meshes.register(&Mesh::new("a", MeshData::unit_cube())).unwrap();
        
        let result = meshes.register(&Mesh::new("b", MeshData::unit_cube()));
        assert_eq!(result, Err(SceneError::CapacityExceeded { pool: "meshes", capacity: 1 }));
    }
    
    #[test]
    fn test_removal_waits_for_publish_and_flush() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 4);
        let mut upload = UploadBuffer::new(&gpu, 64 * 1024).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        meshes.register(&cube).unwrap();
        upload_all(&mut meshes, &gpu, &mut upload, 1);
        let live = gpu.live_buffers();
        
        meshes.remove(Arc::clone(&cube));
        assert_eq!(meshes.flush_pending_remove(&gpu).unwrap(), 0);
        assert!(cube.slot().is_some());
        
        meshes.on_published();
        assert_eq!(meshes.flush_pending_remove(&gpu).unwrap(), 1);
        assert_eq!(cube.slot(), None);
        assert_eq!(cube.added_in_batch(), None);
        assert!(cube.buffers().is_none());
        assert_eq!(gpu.live_buffers(), live - 2);
        assert!(meshes.is_empty());
    }
    
    #[test]
    fn test_register_cancels_pending_removal() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 4);
        let mut upload = UploadBuffer::new(&gpu, 64 * 1024).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        meshes.register(&cube).unwrap();
        upload_all(&mut meshes, &gpu, &mut upload, 1);
        
        meshes.remove(Arc::clone(&cube));
        meshes.on_published();
        meshes.register(&cube).unwrap();
        
        assert_eq!(meshes.pending_removals(), 0);
        assert_eq!(meshes.flush_pending_remove(&gpu).unwrap(), 0);
        assert_eq!(cube.slot(), Some(MeshSlot::new(0)));
    }
    
    #[test]
    fn test_freed_mesh_cannot_return_without_data() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 4);
        let mut upload = UploadBuffer::new(&gpu, 64 * 1024).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        meshes.register(&cube).unwrap();
        upload_all(&mut meshes, &gpu, &mut upload, 1);
        meshes.remove(Arc::clone(&cube));
        meshes.on_published();
        meshes.flush_pending_remove(&gpu).unwrap();
        
        assert_eq!(meshes.register(&cube), Err(SceneError::MeshDataReleased("cube".into())));
    }
    
    #[test]
    fn test_dropping_unuploaded_mesh_defers_buffer_destruction() {
        let gpu = SimulatedGpu::with_mode(RetireMode::Manual);
        let mut meshes = manager(&gpu, 4);
        let mut upload = UploadBuffer::new(&gpu, 24 * mem::size_of::<Vertex>()).unwrap();
        let cube = Mesh::new("cube", MeshData::unit_cube());
        meshes.register(&cube).unwrap();
        
        let mut commands = CommandList::new();
        let result = meshes.update(&gpu, &mut upload, &mut commands).unwrap();
        assert!(result.needs_retry());
        gpu.submit(commands, &GpuCounter::new(), 1).unwrap();
        
        meshes.remove(Arc::clone(&cube));
        assert_eq!(meshes.pending_uploads(), 0);
        assert_eq!(cube.slot(), None);
        
        gpu.retire_all();
        assert_eq!(meshes.flush_deferred(&gpu).unwrap(), 2);
        assert!(gpu.hazards().is_empty());
    }
    
    #[test]
    fn test_release_all_destroys_everything() {
        let gpu = SimulatedGpu::new();
        let mut meshes = manager(&gpu, 4);
        let mut upload = UploadBuffer::new(&gpu, 64 * 1024).unwrap();
        for name in ["a", "b", "c"] {
            meshes.register(&Mesh::new(name, MeshData::unit_cube())).unwrap();
        }
        upload_all(&mut meshes, &gpu, &mut upload, 1);
        
        meshes.release_all(&gpu).unwrap();
        upload.destroy(&gpu).unwrap();
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.allocated_bytes(), 0);
    }
}
