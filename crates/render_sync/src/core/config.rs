//! # Render Synchronization Configuration
//!
//! Pool capacities, placement tuning, upload staging size and actor timing
//! for the data manager and render actors.
//!
//! Every section carries `#[serde(default)]`, so a configuration file only
//! needs the values it overrides:
//!
//! ```toml
//! [scene]
//! instances_per_node = 16
//!
//! [actors]
//! data_manager_budget_us = 5000
//! ```

use serde::{Serialize, Deserialize};
use std::mem;
use std::time::Duration;

use crate::gpu::upload::UPLOAD_ALIGNMENT;
use crate::gpu::{NodeGpu, NodeInstancesGpu};

pub use crate::config::{Config, ConfigError};

/// Largest node capacity a `NodeInstancesGpu` record can hold
pub const MAX_INSTANCES_PER_NODE: usize = 32;

/// # Scene Configuration
///
/// Capacities of the instance pool and node table, and the clustering
/// policy used when placing instances into nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Number of instance slots in the scene pool
    pub instance_capacity: usize,
    /// Number of spatial nodes
    pub node_capacity: usize,
    /// Instance slots per node
    pub instances_per_node: usize,
    /// Nodes further than this multiple of the instance extent are rejected
    pub placement_distance_factor: f32,
    /// Accepted node radius range is `(extent / window, extent * window)`
    pub node_radius_window: f32,
}

impl SceneConfig {
    /// Set pool capacities
    pub fn with_capacities(mut self, instances: usize, nodes: usize) -> Self {
        self.instance_capacity = instances;
        self.node_capacity = nodes;
        self
    }
    
    /// Set the number of instance slots per node
    pub fn with_instances_per_node(mut self, per_node: usize) -> Self {
        self.instances_per_node = per_node;
        self
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            instance_capacity: 12 * 4096,
            node_capacity: 4096,
            instances_per_node: MAX_INSTANCES_PER_NODE,
            placement_distance_factor: 8.0,
            node_radius_window: 4.0,
        }
    }
}

/// Mesh table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Number of mesh slots
    pub mesh_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self { mesh_capacity: 4096 }
    }
}

/// Upload staging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Size of the staging buffer shared by all uploads of one submission
    pub upload_buffer_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { upload_buffer_bytes: 16 * 1024 * 1024 }
    }
}

/// # Actor Timing Configuration
///
/// Per-cycle mailbox drain budgets and polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Mailbox drain budget of the data manager, in microseconds
    pub data_manager_budget_us: u64,
    /// Mailbox drain budget of the render actor, in microseconds
    pub renderer_budget_us: u64,
    /// Sleep between completion counter polls, in microseconds
    pub fence_poll_interval_us: u64,
    /// Minimum time between two rendered frames, in microseconds
    pub renderer_frame_interval_us: u64,
    /// Blocks preallocated by each mailbox
    pub mailbox_initial_blocks: usize,
}

impl ActorConfig {
    /// Data manager drain budget
    pub fn data_manager_budget(&self) -> Duration {
        Duration::from_micros(self.data_manager_budget_us)
    }
    
    /// Render actor drain budget
    pub fn renderer_budget(&self) -> Duration {
        Duration::from_micros(self.renderer_budget_us)
    }
    
    /// Completion poll interval
    pub fn fence_poll_interval(&self) -> Duration {
        Duration::from_micros(self.fence_poll_interval_us)
    }
    
    /// Minimum frame interval
    pub fn renderer_frame_interval(&self) -> Duration {
        Duration::from_micros(self.renderer_frame_interval_us)
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            data_manager_budget_us: 7000,
            renderer_budget_us: 2000,
            fence_poll_interval_us: 100,
            renderer_frame_interval_us: 1000,
            mailbox_initial_blocks: 3,
        }
    }
}

/// Top-level configuration of the synchronization core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSyncConfig {
    /// Scene clustering
    pub scene: SceneConfig,
    /// Mesh table
    pub meshes: MeshConfig,
    /// Upload staging
    pub upload: UploadConfig,
    /// Actor timing
    pub actors: ActorConfig,
}

impl RenderSyncConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Replace the scene section
    pub fn with_scene(mut self, scene: SceneConfig) -> Self {
        self.scene = scene;
        self
    }
    
    /// Set the mesh table capacity
    pub fn with_mesh_capacity(mut self, capacity: usize) -> Self {
        self.meshes.mesh_capacity = capacity;
        self
    }
    
    /// Set the upload staging size
    pub fn with_upload_buffer_bytes(mut self, bytes: usize) -> Self {
        self.upload.upload_buffer_bytes = bytes;
        self
    }
    
    /// Replace the actor timing section
    pub fn with_actors(mut self, actors: ActorConfig) -> Self {
        self.actors = actors;
        self
    }
    
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));
        
        if self.scene.instance_capacity == 0 {
            return invalid("scene.instance_capacity must be greater than 0".into());
        }
        if self.scene.node_capacity == 0 {
            return invalid("scene.node_capacity must be greater than 0".into());
        }
        if !(1..=MAX_INSTANCES_PER_NODE).contains(&self.scene.instances_per_node) {
            return invalid(format!(
                "scene.instances_per_node must be within 1..={MAX_INSTANCES_PER_NODE}, got {}",
                self.scene.instances_per_node
            ));
        }
        if self.scene.placement_distance_factor <= 0.0 {
            return invalid("scene.placement_distance_factor must be positive".into());
        }
        if self.scene.node_radius_window <= 1.0 {
            return invalid("scene.node_radius_window must be greater than 1.0".into());
        }
        if self.scene.node_capacity.saturating_mul(self.scene.instances_per_node) < self.scene.instance_capacity {
            return invalid(format!(
                "scene nodes hold at most {} instances, instance_capacity is {}",
                self.scene.node_capacity.saturating_mul(self.scene.instances_per_node),
                self.scene.instance_capacity
            ));
        }
        if self.meshes.mesh_capacity == 0 {
            return invalid("meshes.mesh_capacity must be greater than 0".into());
        }
        if self.upload.upload_buffer_bytes == 0 {
            return invalid("upload.upload_buffer_bytes must be greater than 0".into());
        }
        let node_table_bytes = self
            .scene
            .node_capacity
            .saturating_mul(mem::size_of::<NodeGpu>() + mem::size_of::<NodeInstancesGpu>())
            .saturating_add(2 * UPLOAD_ALIGNMENT);
        if self.upload.upload_buffer_bytes < node_table_bytes {
            return invalid(format!(
                "upload.upload_buffer_bytes must hold the full node table ({node_table_bytes} bytes), got {}",
                self.upload.upload_buffer_bytes
            ));
        }
        if self.actors.mailbox_initial_blocks == 0 {
            return invalid("actors.mailbox_initial_blocks must be greater than 0".into());
        }
        Ok(())
    }
}

impl Config for RenderSyncConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_default_config_is_valid() {
        let config = RenderSyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.actors.data_manager_budget(), Duration::from_millis(7));
        assert_eq!(config.actors.mailbox_initial_blocks, 3);
    }
    
    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = "[scene]\ninstances_per_node = 16\n";
        let config = RenderSyncConfig::from_str_as(text, "render.toml").unwrap();
        
        assert_eq!(config.scene.instances_per_node, 16);
        assert_eq!(config.scene.node_capacity, SceneConfig::default().node_capacity);
        assert_eq!(config.meshes, MeshConfig::default());
    }
    
    #[test]
    fn test_ron_roundtrip_through_file() {
        let path = std::env::temp_dir().join(format!("render_sync_config_{}.ron", std::process::id()));
        let config = RenderSyncConfig::new().with_mesh_capacity(64);
        
        config.save_to_file(&path).unwrap();
        let loaded = RenderSyncConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        
        assert_eq!(loaded, config);
    }
    
    #[test]
    fn test_rejects_oversized_nodes() {
        let config = RenderSyncConfig::new()
            .with_scene(SceneConfig::default().with_instances_per_node(MAX_INSTANCES_PER_NODE + 1));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
    
    #[test]
    fn test_rejects_node_table_smaller_than_instance_pool() {
        let config = RenderSyncConfig::new().with_scene(SceneConfig::default().with_capacities(1000, 10));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        
        let config = RenderSyncConfig::new().with_scene(SceneConfig::default().with_capacities(320, 10));
        assert!(config.validate().is_ok());
    }
    
    #[test]
    fn test_rejects_upload_buffer_smaller_than_node_table() {
        let scene = SceneConfig::default().with_capacities(48, 3);
        let config = RenderSyncConfig::new().with_scene(scene.clone()).with_upload_buffer_bytes(3 * 144 + 31);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        
        let config = RenderSyncConfig::new().with_scene(scene).with_upload_buffer_bytes(3 * 144 + 32);
        assert!(config.validate().is_ok());
    }
    
    #[test]
    fn test_rejects_unknown_extension() {
        let result = RenderSyncConfig::load_from_file("render.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
