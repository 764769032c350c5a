//! # Core Module
//!
//! Shared configuration types used by every subsystem of the crate.

pub mod config;

pub use config::{
    ActorConfig,
    Config,
    ConfigError,
    MeshConfig,
    RenderSyncConfig,
    SceneConfig,
    UploadConfig,
    MAX_INSTANCES_PER_NODE,
};
