//! Engine wiring: starts the render actor and the data manager against one
//! GPU device and stops them in dependency order.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::actor::{ActorError, ActorHandle, ActorHost, ControlBus, ControlMessage, GameState};
use crate::config::ConfigError;
use crate::core::config::RenderSyncConfig;
use crate::gpu::GpuDevice;
use crate::render_data::{DataManager, DataManagerError, DataManagerHandle, DataManagerStats};
use crate::renderer::{RenderActor, RenderMessage, RendererStats};
use crate::sync::SyncError;

/// Longest wait for the renderer's last frame on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    
    /// An actor failed to start or stop
    #[error("actor error: {0}")]
    Actor(#[from] ActorError),
    
    /// The data manager could not be created or released
    #[error("data manager error: {0}")]
    DataManager(#[from] DataManagerError),
    
    /// The GPU did not go idle on shutdown
    #[error("shutdown wait failed: {0}")]
    Sync(#[from] SyncError),
}

/// Counters collected on shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSummary {
    /// Data manager counters
    pub data_manager: DataManagerStats,
    /// Render actor counters
    pub renderer: RendererStats,
    /// Instances still in the scene when the data manager stopped
    pub live_instances: usize,
}

/// Running render synchronization core
pub struct Engine {
    bus: ControlBus,
    data_manager: Option<ActorHost<DataManager>>,
    renderer: Option<ActorHost<RenderActor>>,
    data_handle: DataManagerHandle,
    renderer_handle: ActorHandle<RenderMessage>,
    poll_interval: Duration,
}

impl Engine {
    /// Validate `config` and start both actors on `device`
    pub fn start(config: RenderSyncConfig, device: Arc<dyn GpuDevice>) -> Result<Self, EngineError> {
        config.validate()?;
        log::info!("Starting render sync engine...");
        
        let bus = ControlBus::new();
        let blocks = config.actors.mailbox_initial_blocks;
        let poll_interval = config.actors.fence_poll_interval();
        
        let renderer = ActorHost::start(RenderActor::new(Arc::clone(&device), &config.actors), blocks, &bus)?;
        let renderer_handle = renderer.handle();
        
        let manager = DataManager::new(config, device, renderer.handle())?;
        let allocator = manager.instance_allocator();
        let data_manager = ActorHost::start(manager, blocks, &bus)?;
        let data_handle = DataManagerHandle::new(data_manager.handle(), allocator);
        
        Ok(Self {
            bus,
            data_manager: Some(data_manager),
            renderer: Some(renderer),
            data_handle,
            renderer_handle,
            poll_interval,
        })
    }
    
    /// Handle used by gameplay code to create mesh handles
    pub fn data_manager(&self) -> DataManagerHandle {
        self.data_handle.clone()
    }
    
    /// Handle to the render actor
    pub fn renderer(&self) -> ActorHandle<RenderMessage> {
        self.renderer_handle.clone()
    }
    
    /// Control plane shared by both actors
    pub fn control_bus(&self) -> &ControlBus {
        &self.bus
    }
    
    /// Broadcast a game state change
    pub fn set_state(&self, state: GameState) {
        self.bus.broadcast(ControlMessage::StateChange(state));
    }
    
    /// Stop the data manager, then the renderer, then release GPU resources
    pub fn stop(mut self) -> Result<EngineSummary, EngineError> {
        self.shutdown()
    }
    
    fn shutdown(&mut self) -> Result<EngineSummary, EngineError> {
        let mut summary = EngineSummary::default();
        let mut manager = self.data_manager.take().map(ActorHost::stop).transpose()?;
        let renderer = self.renderer.take().map(ActorHost::stop).transpose()?;
        
        if let Some(renderer) = &renderer {
            renderer.last_frame_token().wait_timeout(SHUTDOWN_TIMEOUT, self.poll_interval)?;
            summary.renderer = renderer.stats();
        }
        if let Some(manager) = manager.as_mut() {
            summary.data_manager = manager.stats();
            summary.live_instances = manager.scene().num_instances();
            manager.release_gpu_resources()?;
        }
        
        log::info!("Render sync engine stopped after {} frames", summary.renderer.frames);
        Ok(summary)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.data_manager.is_none() && self.renderer.is_none() {
            return;
        }
        if let Err(e) = self.shutdown() {
            log::error!("Engine shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SceneConfig;
    use crate::foundation::math::{Transform, Vec3};
    use crate::gpu::{RetireMode, RetireWorker, SimulatedGpu};
    use crate::render_data::MeshHandle;
    use crate::scene::{Mesh, MeshData};
    use std::thread;
    use std::time::Instant;
    
    fn test_config() -> RenderSyncConfig {
        RenderSyncConfig::new()
            .with_scene(SceneConfig::default().with_capacities(1024, 64).with_instances_per_node(16))
            .with_mesh_capacity(16)
            .with_upload_buffer_bytes(16 * 1024)
    }
    
    /// Wait until the renderer broadcast `count` more frames
    fn wait_frames(engine: &Engine, count: u64) {
        let frames = engine.control_bus().subscribe();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = 0;
        while seen < count {
            assert!(Instant::now() < deadline, "renderer stalled after {seen} frames");
            match frames.pop() {
                Some(ControlMessage::Frame { .. }) => seen += 1,
                Some(_) => {}
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
    
    #[test]
    fn test_start_rejects_invalid_config() {
        let config = RenderSyncConfig::new().with_mesh_capacity(0);
        let result = Engine::start(config, Arc::new(SimulatedGpu::new()));
        assert!(matches!(result, Err(EngineError::Config(ConfigError::Invalid(_)))));
    }
    
    #[test]
    fn test_engine_renders_and_releases_everything() {
        crate::foundation::logging::try_init();
        let gpu = Arc::new(SimulatedGpu::new());
        let engine = Engine::start(test_config(), Arc::clone(&gpu) as Arc<dyn GpuDevice>).unwrap();
        
        let cube = Mesh::new("cube", MeshData::unit_cube());
        let manager = engine.data_manager();
        let handles: Vec<MeshHandle> = (0..20)
            .map(|i| {
                let transform = Transform::from_position(Vec3::new(i as f32 * 2.0, 0.0, 0.0));
                MeshHandle::initialize(&manager, Arc::clone(&cube), transform).unwrap()
            })
            .collect();
        
        wait_frames(&engine, 20);
        let summary = engine.stop().unwrap();
        
        assert!(summary.renderer.frames >= 20);
        assert!(summary.data_manager.publishes >= 1);
        assert_eq!(summary.live_instances, 20);
        assert!(gpu.hazards().is_empty());
        assert_eq!(gpu.live_buffers(), 0);
        
        // Handles outliving the engine drop quietly
        drop(handles);
    }
    
    #[test]
    fn test_concurrent_gameplay_on_deferred_gpu_is_hazard_free() {
        crate::foundation::logging::try_init();
        let gpu = Arc::new(SimulatedGpu::with_mode(RetireMode::Manual));
        let retire = RetireWorker::start(Arc::clone(&gpu), Duration::from_micros(300)).unwrap();
        let engine = Engine::start(test_config(), Arc::clone(&gpu) as Arc<dyn GpuDevice>).unwrap();
        
        let meshes: Vec<_> = (0..4)
            .map(|i| Mesh::with_radius(format!("mesh {i}"), MeshData::unit_cube(), 1.0 + i as f32))
            .collect();
        
        thread::scope(|scope| {
            for worker in 0..4 {
                let manager = engine.data_manager();
                let meshes = &meshes;
                scope.spawn(move || {
                    let mut live = Vec::new();
                    for step in 0..200 {
                        let mesh = Arc::clone(&meshes[(worker + step) % meshes.len()]);
                        let position = Vec3::new((worker * 40) as f32, 0.0, step as f32);
                        live.push(MeshHandle::initialize(&manager, mesh, Transform::from_position(position)).unwrap());
                        
                        if step % 3 == 0 {
                            let moved = Transform::from_position(position + Vec3::new(5.0, 0.0, 0.0));
                            live[step / 2].update_transform(moved).unwrap();
                        }
                        if step % 4 == 0 {
                            live.swap_remove(step / 3);
                        }
                        if step % 25 == 0 {
                            thread::sleep(Duration::from_millis(2));
                        }
                    }
                });
            }
        });
        
        wait_frames(&engine, 30);
        engine.set_state(GameState::Background);
        engine.set_state(GameState::Playing);
        wait_frames(&engine, 10);
        let summary = engine.stop().unwrap();
        drop(retire);
        
        assert!(summary.data_manager.publishes >= 2);
        assert!(summary.data_manager.meshes_uploaded >= 4);
        assert!(gpu.hazards().is_empty(), "hazards: {:?}", gpu.hazards());
        assert_eq!(gpu.live_buffers(), 0);
    }
}
