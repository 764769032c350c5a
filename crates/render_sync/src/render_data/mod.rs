//! # Render Data
//!
//! The data manager actor owns the scene and mesh managers, uploads their
//! GPU records and publishes double-buffered scene tables to the renderer.
//!
//! ## Publish protocol
//!
//! ```text
//! data manager                               renderer
//!   write inactive side
//!   wait for own uploads
//!   flip, send StaticBuffersReady(promise) --> switch to new side
//!                                              resolve(promise, last frame token)
//!   ...next publish:
//!   wait future, wait token
//!   write the side freed by the renderer
//! ```
//!
//! Gameplay threads only hold [`MeshHandle`]s, which turn lifetime events
//! into [`DataMessage`]s.

pub mod handle;
pub mod published;
pub mod data_manager;

#[cfg(test)]
mod tests;

use crate::actor::ActorError;
use crate::gpu::GpuError;
use crate::scene::SceneError;
use crate::sync::SyncError;

pub use data_manager::{DataManager, DataManagerStats, TickWork};
pub use handle::{DataManagerHandle, DataMessage, MeshHandle};
pub use published::{PublishedScene, SceneBuffers};

/// Data manager errors
#[derive(thiserror::Error, Debug)]
pub enum DataManagerError {
    /// Scene or mesh bookkeeping failed
    #[error("scene error: {0}")]
    Scene(#[from] SceneError),
    
    /// GPU collaborator failure
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    
    /// A completion wait failed
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    
    /// The data manager or renderer is not running
    #[error("actor error: {0}")]
    Actor(#[from] ActorError),
    
    /// The handle was already cleaned up
    #[error("mesh handle is no longer valid")]
    InvalidHandle,
}

impl DataManagerError {
    /// Check whether the error only reports a shutdown in progress
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DataManagerError::Sync(SyncError::Cancelled))
    }
    
    /// Check whether the renderer dropped a publish without acknowledging it
    pub fn is_abandoned(&self) -> bool {
        matches!(self, DataManagerError::Sync(SyncError::Abandoned))
    }
}
