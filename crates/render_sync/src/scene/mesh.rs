//! Meshes and batch readiness
//!
//! A [`Mesh`] is shared between gameplay threads and the data manager. Its
//! GPU state (mesh table slot, instance count, upload batch) is atomic so
//! readers on any thread can ask whether the mesh is ready to render.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::foundation::collections::MeshSlot;
use crate::gpu::{GpuBuffer, MeshGpu, Vertex, INVALID_INDEX};

/// CPU-side geometry, released once uploaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertex list
    pub vertices: Vec<Vertex>,
    /// Triangle list indices
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Axis aligned cube of half extent 1 centered on the origin
    pub fn unit_cube() -> Self {
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        
        let mut data = MeshData::default();
        for (normal, u, v) in faces {
            let base = data.vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = [
                    normal[0] + u[0] * su + v[0] * sv,
                    normal[1] + u[1] * su + v[1] * sv,
                    normal[2] + u[2] * su + v[2] * sv,
                ];
                data.vertices.push(Vertex {
                    position,
                    normal,
                    uv: [(su + 1.0) * 0.5, (sv + 1.0) * 0.5],
                });
            }
            data.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        data
    }
    
    /// Single triangle in the XY plane
    pub fn triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        MeshData {
            vertices: vec![
                Vertex { position: [-1.0, -1.0, 0.0], normal, uv: [0.0, 0.0] },
                Vertex { position: [1.0, -1.0, 0.0], normal, uv: [1.0, 0.0] },
                Vertex { position: [0.0, 1.0, 0.0], normal, uv: [0.5, 1.0] },
            ],
            indices: vec![0, 1, 2],
        }
    }
    
    /// Radius of the sphere around the origin enclosing every vertex
    pub fn bounding_radius(&self) -> f32 {
        self.vertices
            .iter()
            .map(|v| (v.position[0].powi(2) + v.position[1].powi(2) + v.position[2].powi(2)).sqrt())
            .fold(0.0, f32::max)
    }
}

/// Per-mesh GPU buffers and their upload progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    /// Vertex buffer
    pub vertices: GpuBuffer,
    /// Index buffer
    pub indices: GpuBuffer,
    pub(crate) vertices_staged: bool,
    pub(crate) indices_staged: bool,
}

/// Renderable geometry shared by instances
#[derive(Debug)]
pub struct Mesh {
    name: String,
    radius: f32,
    max_draw_distance: f32,
    vertex_count: u32,
    index_count: u32,
    data: Mutex<Option<MeshData>>,
    buffers: Mutex<Option<MeshBuffers>>,
    slot: AtomicU32,
    instances: AtomicU32,
    added_in_batch: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Mesh {
    /// Create a mesh; the radius is derived from the geometry
    pub fn new(name: impl Into<String>, data: MeshData) -> Arc<Self> {
        let radius = data.bounding_radius();
        Self::with_radius(name, data, radius)
    }
    
    /// Create a mesh with an explicit bounding radius
    pub fn with_radius(name: impl Into<String>, data: MeshData, radius: f32) -> Arc<Self> {
        Self::build(name.into(), data, radius, 0.0)
    }
    
    /// Create a mesh culled beyond `max_draw_distance`
    pub fn with_draw_distance(name: impl Into<String>, data: MeshData, max_draw_distance: f32) -> Arc<Self> {
        let radius = data.bounding_radius();
        Self::build(name.into(), data, radius, max_draw_distance)
    }
    
    fn build(name: String, data: MeshData, radius: f32, max_draw_distance: f32) -> Arc<Self> {
        Arc::new(Self {
            name,
            radius,
            max_draw_distance,
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
            data: Mutex::new(Some(data)),
            buffers: Mutex::new(None),
            slot: AtomicU32::new(INVALID_INDEX),
            instances: AtomicU32::new(0),
            added_in_batch: AtomicU32::new(INVALID_INDEX),
        })
    }
    
    /// Mesh name
    pub fn name(&self) -> &str {
        &self.name
    }
    
    /// Object space bounding radius
    pub fn radius(&self) -> f32 {
        self.radius
    }
    
    /// Culling distance; zero or negative means unlimited
    pub fn max_draw_distance(&self) -> f32 {
        if self.max_draw_distance > 0.0 {
            self.max_draw_distance
        } else {
            f32::MAX
        }
    }
    
    /// Mesh table slot, if registered
    pub fn slot(&self) -> Option<MeshSlot> {
        match self.slot.load(Ordering::Acquire) {
            INVALID_INDEX => None,
            slot => Some(MeshSlot::new(slot as usize)),
        }
    }
    
    /// Number of scene instances using this mesh
    pub fn instance_count(&self) -> u32 {
        self.instances.load(Ordering::Acquire)
    }
    
    /// Batch in which the GPU data was uploaded
    pub fn added_in_batch(&self) -> Option<u32> {
        match self.added_in_batch.load(Ordering::Acquire) {
            INVALID_INDEX => None,
            batch => Some(batch),
        }
    }
    
    /// Check whether the CPU geometry is still held
    pub fn has_cpu_data(&self) -> bool {
        lock(&self.data).is_some()
    }
    
    /// GPU buffers, once created
    pub fn buffers(&self) -> Option<MeshBuffers> {
        *lock(&self.buffers)
    }
    
    /// Mesh table record
    pub fn gpu_record(&self) -> MeshGpu {
        MeshGpu {
            vertex_count: self.vertex_count,
            index_count: self.index_count,
            radius: self.radius,
            max_draw_distance: self.max_draw_distance().min(crate::gpu::layout::MAX_DRAW_DISTANCE),
        }
    }
    
    /// Record that the GPU data was uploaded in `batch`
    pub fn mark_uploaded(&self, batch: u32) {
        self.added_in_batch.store(batch, Ordering::Release);
    }
    
    pub(crate) fn set_slot(&self, slot: Option<MeshSlot>) {
        self.slot.store(slot.map_or(INVALID_INDEX, MeshSlot::raw), Ordering::Release);
    }
    
    pub(crate) fn add_instance(&self) -> u32 {
        self.instances.fetch_add(1, Ordering::AcqRel) + 1
    }
    
    pub(crate) fn remove_instance(&self) -> u32 {
        let previous = self.instances.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "mesh '{}' instance count underflow", self.name);
        previous - 1
    }
    
    pub(crate) fn cpu_data(&self) -> MutexGuard<'_, Option<MeshData>> {
        lock(&self.data)
    }
    
    pub(crate) fn buffers_mut(&self) -> MutexGuard<'_, Option<MeshBuffers>> {
        lock(&self.buffers)
    }
    
    /// Forget the mesh table slot and upload batch
    pub(crate) fn reset_gpu_state(&self) {
        self.set_slot(None);
        self.added_in_batch.store(INVALID_INDEX, Ordering::Release);
    }
}

/// Check whether `mesh` was uploaded in a batch older than `actual_batch`
pub fn is_mesh_loaded(mesh: &Mesh, actual_batch: u32) -> bool {
    mesh.added_in_batch().is_some_and(|batch| batch < actual_batch)
}

/// Monotonic batch counter advanced once per data manager tick
#[derive(Debug, Clone, Default)]
pub struct BatchClock(Arc<AtomicU32>);

impl BatchClock {
    /// Create a clock at batch zero
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Current batch
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
    
    /// Start a new batch and return its number
    pub fn advance(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
    
    /// Check whether `mesh` is ready to render at the current batch
    pub fn is_mesh_loaded(&self, mesh: &Mesh) -> bool {
        is_mesh_loaded(mesh, self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    
    #[test]
    fn test_batch_readiness() {
        let mesh = Mesh::new("cube", MeshData::unit_cube());
        assert!(!is_mesh_loaded(&mesh, 100));
        
        mesh.mark_uploaded(5);
        assert!(!is_mesh_loaded(&mesh, 4));
        assert!(!is_mesh_loaded(&mesh, 5));
        assert!(is_mesh_loaded(&mesh, 6));
    }
    
    #[test]
    fn test_clock_advances_readiness() {
        let clock = BatchClock::new();
        let mesh = Mesh::new("cube", MeshData::unit_cube());
        mesh.mark_uploaded(clock.advance());
        
        assert!(!clock.is_mesh_loaded(&mesh));
        clock.advance();
        assert!(clock.is_mesh_loaded(&mesh));
    }
    
    #[test]
    fn test_unit_cube_geometry() {
        let data = MeshData::unit_cube();
        assert_eq!(data.vertices.len(), 24);
        assert_eq!(data.indices.len(), 36);
        assert_relative_eq!(data.bounding_radius(), 3.0_f32.sqrt(), epsilon = 1e-6);
    }
    
    #[test]
    fn test_reset_forgets_gpu_state() {
        let mesh = Mesh::new("cube", MeshData::unit_cube());
        mesh.set_slot(Some(MeshSlot::new(3)));
        mesh.mark_uploaded(1);
        assert_eq!(mesh.slot(), Some(MeshSlot::new(3)));
        
        mesh.reset_gpu_state();
        assert_eq!(mesh.slot(), None);
        assert_eq!(mesh.added_in_batch(), None);
    }
}
