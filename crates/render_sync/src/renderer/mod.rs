//! # Renderer
//!
//! The render actor consumes published scene buffers and keeps at most
//! [`FRAME_COUNT`] frames in flight on the GPU.
//!
//! The data manager never hands over a buffer it is still writing: it
//! publishes one side of its double-buffered scene through
//! [`RenderMessage::StaticBuffersReady`] and waits for the enclosed promise
//! before touching the side the renderer used before.

pub mod render_actor;

use std::sync::Arc;

use crate::gpu::GpuBuffer;
use crate::scene::Mesh;
use crate::sync::CompletionPromise;

pub use render_actor::{RenderActor, RendererStats};

/// Maximum number of frames in flight
pub const FRAME_COUNT: u64 = 2;

/// One published side of the scene
#[derive(Debug)]
pub struct StaticBuffers {
    /// Node bounding spheres
    pub nodes: GpuBuffer,
    /// Per-node instance lists
    pub node_instances: GpuBuffer,
    /// Instance records
    pub instances: GpuBuffer,
    /// Number of live nodes
    pub node_count: usize,
    /// Resolved with the completion token of the last frame that used the
    /// previous buffers
    pub promise: CompletionPromise,
}

/// Messages accepted by the render actor
#[derive(Debug)]
pub enum RenderMessage {
    /// The mesh table buffer
    MeshBufferReady(GpuBuffer),
    /// A new scene side to render from
    StaticBuffersReady(StaticBuffers),
    /// Meshes that finished uploading
    RegisterMeshes(Vec<Arc<Mesh>>),
    /// Toggle fullscreen, or force a mode
    SetFullscreen(Option<bool>),
}
