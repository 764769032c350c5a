//! # Scene
//!
//! CPU-side model of what the renderer draws: meshes, instances of those
//! meshes, and the spatial nodes instances are clustered into.
//!
//! ## Modules
//!
//! - **mesh**: shared mesh objects and the batch clock gating their use
//! - **instance**: instances and the thread-safe instance slot allocator
//! - **scene_manager**: node placement, compaction and GPU record upload
//! - **mesh_manager**: mesh slot lifecycle and mesh buffer upload
//!
//! Everything except [`InstanceAllocator`] and the mesh counters is owned
//! by the data manager thread.

pub mod mesh;
pub mod instance;
pub mod scene_manager;
pub mod mesh_manager;

use crate::gpu::GpuError;

pub use instance::{Instance, InstanceAllocator, Placement};
pub use mesh::{is_mesh_loaded, BatchClock, Mesh, MeshBuffers, MeshData};
pub use mesh_manager::MeshManager;
pub use scene_manager::{SceneManager, TWIN_SIDES};

/// Scene errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// A fixed-capacity pool ran out of slots
    #[error("{pool} pool exhausted ({capacity} slots)")]
    CapacityExceeded {
        /// Exhausted pool
        pool: &'static str,
        /// Pool capacity
        capacity: usize,
    },
    
    /// A single upload can never fit into the staging buffer
    #[error("upload of {bytes} bytes exceeds the {capacity} byte staging buffer")]
    UploadTooLarge {
        /// Size of the upload
        bytes: usize,
        /// Staging buffer size
        capacity: usize,
    },
    
    /// A mesh needs uploading but its CPU data was already released
    #[error("mesh '{0}' has no CPU data left to upload")]
    MeshDataReleased(String),
    
    /// GPU collaborator failure
    #[error(transparent)]
    Gpu(#[from] GpuError),
}
