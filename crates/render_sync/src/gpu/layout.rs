//! GPU record layouts
//!
//! Plain `#[repr(C)]` records written byte-for-byte into GPU buffers and
//! read by the culling kernels.

use crate::core::MAX_INSTANCES_PER_NODE;
use crate::foundation::math::{BoundingSphere, Mat4};

/// Marker for an unused index slot
pub const INVALID_INDEX: u32 = u32::MAX;

/// Largest encodable draw distance
pub const MAX_DRAW_DISTANCE: f32 = u16::MAX as f32;

/// Mesh vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vertex {
    /// Object space position
    pub position: [f32; 3],
    /// Object space normal
    pub normal: [f32; 3],
    /// Texture coordinates
    pub uv: [f32; 2],
}

/// Mesh table record
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeshGpu {
    /// Vertices in the mesh vertex buffer
    pub vertex_count: u32,
    /// Indices in the mesh index buffer
    pub index_count: u32,
    /// Object space bounding radius
    pub radius: f32,
    /// Distance beyond which the mesh is culled
    pub max_draw_distance: f32,
}

/// Spatial node record
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeGpu {
    /// Bounding sphere center
    pub center: [f32; 3],
    /// Bounding sphere radius
    pub radius: f32,
}

impl From<&BoundingSphere> for NodeGpu {
    fn from(bounds: &BoundingSphere) -> Self {
        Self {
            center: [bounds.center.x, bounds.center.y, bounds.center.z],
            radius: bounds.radius,
        }
    }
}

/// Instance list of one node, dense and padded with [`INVALID_INDEX`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeInstancesGpu {
    /// Instance pool indices
    pub instances: [u32; MAX_INSTANCES_PER_NODE],
}

impl Default for NodeInstancesGpu {
    fn default() -> Self {
        Self { instances: [INVALID_INDEX; MAX_INSTANCES_PER_NODE] }
    }
}

impl NodeInstancesGpu {
    /// Build a record from a dense list of instance indices
    pub fn from_slots(slots: impl IntoIterator<Item = u32>) -> Self {
        let mut record = Self::default();
        for (dst, index) in record.instances.iter_mut().zip(slots) {
            *dst = index;
        }
        record
    }
}

/// Instance record
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceGpu {
    /// Column-major model matrix
    pub model: [[f32; 4]; 4],
    /// Mesh table slot
    pub mesh_index: u32,
    /// World space bounding radius
    pub radius: f32,
    /// Culling distance, clamped to [`MAX_DRAW_DISTANCE`]
    pub max_draw_distance: f32,
    /// Keeps the record 16-byte sized
    pub _padding: u32,
}

impl InstanceGpu {
    /// Build a record from a model matrix
    pub fn new(model: &Mat4, mesh_index: u32, radius: f32, max_draw_distance: f32) -> Self {
        let mut columns = [[0.0; 4]; 4];
        for (col, dst) in columns.iter_mut().enumerate() {
            for (row, value) in dst.iter_mut().enumerate() {
                *value = model[(row, col)];
            }
        }
        Self {
            model: columns,
            mesh_index,
            radius,
            max_draw_distance: max_draw_distance.clamp(0.0, MAX_DRAW_DISTANCE),
            _padding: 0,
        }
    }
}

unsafe impl bytemuck::Pod for Vertex {}
unsafe impl bytemuck::Zeroable for Vertex {}

unsafe impl bytemuck::Pod for MeshGpu {}
unsafe impl bytemuck::Zeroable for MeshGpu {}

unsafe impl bytemuck::Pod for NodeGpu {}
unsafe impl bytemuck::Zeroable for NodeGpu {}

unsafe impl bytemuck::Pod for NodeInstancesGpu {}
unsafe impl bytemuck::Zeroable for NodeInstancesGpu {}

unsafe impl bytemuck::Pod for InstanceGpu {}
unsafe impl bytemuck::Zeroable for InstanceGpu {}
