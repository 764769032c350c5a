//! Data manager scenarios driven on the test thread

mod handles;

use std::sync::Arc;

use crate::actor::{ActorContext, ActorHandle, ControlBus};
use crate::core::config::{RenderSyncConfig, SceneConfig};
use crate::gpu::{GpuDevice, SimulatedGpu};
use crate::renderer::{RenderMessage, StaticBuffers};
use crate::sync::{MailboxQueue, OpenFlag};
use super::DataManager;

struct Fixture {
    gpu: Arc<SimulatedGpu>,
    manager: DataManager,
    renderer: Arc<MailboxQueue<RenderMessage>>,
    ctx: ActorContext,
}

fn small_config() -> RenderSyncConfig {
    RenderSyncConfig::new()
        .with_scene(SceneConfig::default().with_capacities(128, 16).with_instances_per_node(16))
        .with_mesh_capacity(8)
        .with_upload_buffer_bytes(64 * 1024)
}

fn fixture(config: RenderSyncConfig) -> Fixture {
    let gpu = Arc::new(SimulatedGpu::new());
    let (renderer_handle, renderer) = ActorHandle::detached("renderer", 3);
    let manager = DataManager::new(config, Arc::clone(&gpu) as Arc<dyn GpuDevice>, renderer_handle).unwrap();
    let ctx = ActorContext::new("data_manager", OpenFlag::new(), ControlBus::new());
    Fixture { gpu, manager, renderer, ctx }
}

impl Fixture {
    fn messages(&self) -> Vec<RenderMessage> {
        std::iter::from_fn(|| self.renderer.pop()).collect()
    }
    
    /// Published scene sides found in the renderer mailbox, in order
    fn published(&self) -> Vec<StaticBuffers> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                RenderMessage::StaticBuffersReady(buffers) => Some(buffers),
                _ => None,
            })
            .collect()
    }
}
