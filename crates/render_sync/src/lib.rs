//! # Render Sync
//!
//! Synchronization core of a multi-threaded real-time renderer.
//!
//! ## Features
//!
//! - **Actor Mailboxes**: Lock-free multi-producer, single-consumer queues
//! - **Actor Harness**: Named threads with a shared control plane
//! - **Spatial Clustering**: Instances grouped into bounded scene nodes
//! - **Fenced Publishing**: Double-buffered scene tables handed to the renderer
//!   only once the GPU is done with them
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use render_sync::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::start(RenderSyncConfig::default(), Arc::new(SimulatedGpu::new()))?;
//!     
//!     let cube = Mesh::new("cube", MeshData::unit_cube());
//!     let handle = MeshHandle::initialize(&engine.data_manager(), cube, Transform::identity())?;
//!     handle.update_transform(Transform::from_position(Vec3::new(0.0, 1.0, 0.0)))?;
//!     
//!     drop(handle);
//!     let summary = engine.stop()?;
//!     println!("rendered {} frames", summary.renderer.frames);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Shared configuration
pub mod core;
pub mod config;

pub mod foundation;
pub mod sync;
pub mod actor;
pub mod gpu;
pub mod scene;
pub mod render_data;
pub mod renderer;

mod engine;

pub use engine::{Engine, EngineError, EngineSummary};

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        Engine, EngineError, EngineSummary,
        actor::{Actor, ActorContext, ActorHandle, ActorHost, ControlBus, ControlMessage, GameState},
        core::config::{Config, RenderSyncConfig, SceneConfig},
        foundation::math::{Transform, Vec3},
        gpu::{GpuDevice, RetireMode, RetireWorker, SimulatedGpu},
        render_data::{DataManagerHandle, MeshHandle},
        scene::{Mesh, MeshData},
        sync::MailboxQueue,
    };
}
