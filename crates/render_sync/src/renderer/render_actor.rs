//! Render actor
//!
//! Each tick records one frame reading the active scene buffers, submits it
//! against the renderer's completion counter and broadcasts a
//! [`ControlMessage::Frame`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::actor::{Actor, ActorContext, ControlMessage, GameState};
use crate::core::config::ActorConfig;
use crate::foundation::logging::{debug, error, info, trace};
use crate::foundation::time::Timer;
use crate::gpu::{CommandList, GpuBuffer, GpuDevice};
use crate::scene::Mesh;
use crate::sync::{GpuCounter, SyncToken};
use super::{RenderMessage, StaticBuffers, FRAME_COUNT};

/// Scene side currently rendered
#[derive(Debug, Clone, Copy)]
struct ActiveScene {
    nodes: GpuBuffer,
    node_instances: GpuBuffer,
    instances: GpuBuffer,
    node_count: usize,
}

/// Render actor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    /// Frames submitted
    pub frames: u64,
    /// Scene sides received
    pub scene_swaps: u64,
    /// Nodes in the scene rendered last
    pub node_count: usize,
    /// Meshes currently registered
    pub registered_meshes: usize,
}

/// Actor that owns the frame loop
pub struct RenderActor {
    device: Arc<dyn GpuDevice>,
    counter: GpuCounter,
    frame: u64,
    mesh_table: Option<GpuBuffer>,
    scene: Option<ActiveScene>,
    meshes: Vec<Arc<Mesh>>,
    fullscreen: bool,
    paused: bool,
    timer: Timer,
    last_frame: Option<Instant>,
    frame_interval: Duration,
    message_budget: Duration,
    poll_interval: Duration,
    stats: RendererStats,
}

impl RenderActor {
    /// Create a render actor submitting to `device`
    pub fn new(device: Arc<dyn GpuDevice>, config: &ActorConfig) -> Self {
        Self {
            device,
            counter: GpuCounter::new(),
            frame: 0,
            mesh_table: None,
            scene: None,
            meshes: Vec::new(),
            fullscreen: false,
            paused: false,
            timer: Timer::new(),
            last_frame: None,
            frame_interval: config.renderer_frame_interval(),
            message_budget: config.renderer_budget(),
            poll_interval: config.fence_poll_interval(),
            stats: RendererStats::default(),
        }
    }
    
    /// Completion token of the last submitted frame
    pub fn last_frame_token(&self) -> SyncToken {
        self.counter.token(self.frame)
    }
    
    /// Renderer counters
    pub fn stats(&self) -> RendererStats {
        RendererStats { registered_meshes: self.meshes.len(), ..self.stats }
    }
    
    /// Check whether fullscreen is on
    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }
    
    fn swap_scene(&mut self, buffers: StaticBuffers) {
        let StaticBuffers { nodes, node_instances, instances, node_count, promise } = buffers;
        self.scene = Some(ActiveScene { nodes, node_instances, instances, node_count });
        self.stats.scene_swaps += 1;
        self.stats.node_count = node_count;
        
        // Frames recorded from now on use the new side; the previous one is
        // free once the last submitted frame retires.
        promise.resolve(self.counter.token(self.frame));
        trace!("Scene swapped to {node_count} nodes at frame {}", self.frame);
    }
    
    fn draw(&mut self, ctx: &ActorContext) {
        if self.paused || self.mesh_table.is_none() {
            return;
        }
        let Some(scene) = self.scene else { return };
        if self.last_frame.is_some_and(|last| last.elapsed() < self.frame_interval) {
            return;
        }
        
        let oldest = (self.frame + 1).saturating_sub(FRAME_COUNT);
        if oldest > 0 {
            if let Err(e) = self.counter.token(oldest).wait(ctx.open_flag(), self.poll_interval) {
                debug!("Frame {} not rendered: {e}", self.frame + 1);
                return;
            }
        }
        
        let mut commands = CommandList::new();
        commands.read(scene.nodes.handle);
        commands.read(scene.node_instances.handle);
        commands.read(scene.instances.handle);
        if let Err(e) = self.device.submit(commands, &self.counter, self.frame + 1) {
            error!("Failed to submit frame {}: {e}", self.frame + 1);
            return;
        }
        
        self.frame += 1;
        self.stats.frames += 1;
        self.timer.update();
        self.last_frame = Some(Instant::now());
        ctx.broadcast(ControlMessage::Frame { frame_id: self.frame, delta: self.timer.delta_time() });
    }
}

impl Actor for RenderActor {
    type Message = RenderMessage;
    
    fn name(&self) -> &str {
        "renderer"
    }
    
    fn message_budget(&self) -> Duration {
        self.message_budget
    }
    
    fn idle_sleep(&self) -> Duration {
        self.poll_interval
    }
    
    fn handle_message(&mut self, message: RenderMessage, _ctx: &ActorContext) {
        match message {
            RenderMessage::MeshBufferReady(table) => {
                debug!("Mesh table received ({} slots)", table.capacity);
                self.mesh_table = Some(table);
            }
            RenderMessage::StaticBuffersReady(buffers) => self.swap_scene(buffers),
            RenderMessage::RegisterMeshes(meshes) => {
                trace!("Registering {} meshes", meshes.len());
                self.meshes.extend(meshes);
            }
            RenderMessage::SetFullscreen(mode) => {
                self.fullscreen = mode.unwrap_or(!self.fullscreen);
                info!("Fullscreen {}", if self.fullscreen { "on" } else { "off" });
            }
        }
    }
    
    fn handle_control(&mut self, message: ControlMessage, _ctx: &ActorContext) {
        if let ControlMessage::StateChange(state) = message {
            self.paused = state == GameState::Background;
        }
    }
    
    fn tick(&mut self, ctx: &ActorContext) {
        self.meshes.retain(|mesh| mesh.slot().is_some());
        self.draw(ctx);
    }
    
    fn cleanup(&mut self, _ctx: &ActorContext) {
        info!("Renderer stopped after {} frames", self.stats.frames);
    }
}
