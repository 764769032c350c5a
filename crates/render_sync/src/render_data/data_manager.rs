//! Data manager actor
//!
//! Owns the CPU scene model and everything the renderer reads from it. One
//! tick:
//!
//! 1. submit anything still recorded, wait for it, recycle the staging buffer
//! 2. free meshes whose removal the renderer has acknowledged
//! 3. advance the batch clock and place instances whose mesh became ready
//! 4. upload pending meshes, submit the copies and register the meshes with
//!    the renderer; instances of a mesh that failed to upload are rejected
//! 5. if the scene changed: wait for the inactive side, compact nodes,
//!    write the inactive side, flip and publish it

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crate::actor::{Actor, ActorContext, ActorError, ActorHandle, ControlMessage, ReloadKind};
use crate::core::config::RenderSyncConfig;
use crate::foundation::collections::InstanceId;
use crate::foundation::logging::{debug, error, info, trace, warn};
use crate::foundation::math::Transform;
use crate::gpu::{CommandList, GpuDevice, GpuError, UpdateResult, UploadBuffer};
use crate::renderer::{RenderMessage, StaticBuffers};
use crate::scene::{BatchClock, InstanceAllocator, Mesh, MeshManager, SceneError, SceneManager};
use crate::sync::{completion_pair, GpuCounter, OpenFlag, SyncToken};
use super::handle::DataMessage;
use super::published::PublishedScene;
use super::DataManagerError;

/// Longest wait for in-flight uploads when releasing GPU resources
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

bitflags::bitflags! {
    /// Work performed by one data manager tick
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TickWork: u8 {
        /// Pending instances were placed into nodes
        const INSTANCES_PLACED = 1 << 0;
        /// Meshes finished uploading
        const MESHES_UPLOADED = 1 << 1;
        /// Meshes were freed after the renderer released them
        const MESHES_FREED = 1 << 2;
        /// A new scene side was handed to the renderer
        const SCENE_PUBLISHED = 1 << 3;
        /// Instances were rejected because their mesh failed to upload
        const INSTANCES_REJECTED = 1 << 4;
    }
}

/// Data manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataManagerStats {
    /// Ticks that ran to completion or failed
    pub batches: u64,
    /// Scene sides published
    pub publishes: u64,
    /// Meshes uploaded
    pub meshes_uploaded: u64,
    /// Instances placed out of the pending list
    pub instances_placed: u64,
    /// Upload submissions
    pub upload_submissions: u64,
    /// Components rejected on arrival or after a failed mesh upload
    pub rejected_components: u64,
}

/// Staging buffer plus the command list and counter it is flushed with
struct UploadQueue {
    device: Arc<dyn GpuDevice>,
    upload: UploadBuffer,
    commands: CommandList,
    counter: GpuCounter,
    submitted: u64,
}

impl UploadQueue {
    fn flush(&mut self) -> Result<bool, GpuError> {
        let commands = mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(false);
        }
        let value = self.submitted + 1;
        self.device.submit(commands, &self.counter, value)?;
        self.submitted = value;
        Ok(true)
    }
    
    fn token(&self) -> SyncToken {
        self.counter.token(self.submitted)
    }
    
    /// Submit recorded copies, wait for every submission and recycle the
    /// staging buffer
    fn drain(&mut self, open: &OpenFlag, poll_interval: Duration) -> Result<(), DataManagerError> {
        self.flush()?;
        self.token().wait(open, poll_interval)?;
        self.upload.reset();
        Ok(())
    }
    
    /// Run `record` until it stops asking for room, draining in between
    fn record_all(
        &mut self,
        open: &OpenFlag,
        poll_interval: Duration,
        mut record: impl FnMut(&dyn GpuDevice, &mut UploadBuffer, &mut CommandList) -> Result<UpdateResult, SceneError>,
    ) -> Result<UpdateResult, DataManagerError> {
        let mut outcome = UpdateResult::NothingToDo;
        loop {
            let result = record(&*self.device, &mut self.upload, &mut self.commands)?;
            if result != UpdateResult::NothingToDo {
                outcome = UpdateResult::Updated;
            }
            if !result.needs_retry() {
                return Ok(outcome);
            }
            self.drain(open, poll_interval)?;
        }
    }
}

struct GpuResources {
    queue: UploadQueue,
    meshes: MeshManager,
    published: PublishedScene,
}

/// Actor owning the scene, the mesh manager and the published buffers
pub struct DataManager {
    config: RenderSyncConfig,
    renderer: ActorHandle<RenderMessage>,
    allocator: InstanceAllocator,
    clock: BatchClock,
    scene: SceneManager,
    resources: Option<GpuResources>,
    rejected: HashSet<InstanceId>,
    renderer_lost: bool,
    stats: DataManagerStats,
}

impl DataManager {
    /// Allocate the GPU resources of a data manager
    pub fn new(
        config: RenderSyncConfig,
        device: Arc<dyn GpuDevice>,
        renderer: ActorHandle<RenderMessage>,
    ) -> Result<Self, DataManagerError> {
        let upload = UploadBuffer::new(&*device, config.upload.upload_buffer_bytes)?;
        let meshes = MeshManager::new(&*device, &config.meshes)?;
        let published = PublishedScene::new(&*device, &config.scene)?;
        
        let clock = BatchClock::new();
        let mut scene = SceneManager::new(&config.scene, clock.clone());
        // The renderer needs a first, possibly empty, scene
        scene.mark_dirty();
        
        Ok(Self {
            allocator: InstanceAllocator::new(config.scene.instance_capacity),
            renderer,
            clock,
            scene,
            resources: Some(GpuResources {
                queue: UploadQueue {
                    device,
                    upload,
                    commands: CommandList::new(),
                    counter: GpuCounter::new(),
                    submitted: 0,
                },
                meshes,
                published,
            }),
            rejected: HashSet::new(),
            renderer_lost: false,
            stats: DataManagerStats::default(),
            config,
        })
    }
    
    /// Allocator shared with gameplay handles
    pub fn instance_allocator(&self) -> InstanceAllocator {
        self.allocator.clone()
    }
    
    /// Batch clock gating mesh use
    pub fn batch_clock(&self) -> &BatchClock {
        &self.clock
    }
    
    /// Scene model
    pub fn scene(&self) -> &SceneManager {
        &self.scene
    }
    
    /// Mesh manager, until GPU resources are released
    pub fn meshes(&self) -> Option<&MeshManager> {
        self.resources.as_ref().map(|gpu| &gpu.meshes)
    }
    
    /// Published scene sides, until GPU resources are released
    pub fn published(&self) -> Option<&PublishedScene> {
        self.resources.as_ref().map(|gpu| &gpu.published)
    }
    
    /// Counters
    pub fn stats(&self) -> DataManagerStats {
        let mut stats = self.stats;
        if let Some(gpu) = &self.resources {
            stats.upload_submissions = gpu.queue.submitted;
        }
        stats
    }
    
    /// Run one tick, reporting the work done
    pub fn step(&mut self, ctx: &ActorContext) -> Result<TickWork, DataManagerError> {
        let open = ctx.open_flag();
        let poll = self.config.actors.fence_poll_interval();
        let Some(GpuResources { queue, meshes, published }) = self.resources.as_mut() else {
            return Ok(TickWork::empty());
        };
        let mut work = TickWork::empty();
        self.stats.batches += 1;
        
        queue.drain(open, poll)?;
        meshes.flush_deferred(&*queue.device)?;
        if published.take_retired() && meshes.flush_pending_remove(&*queue.device)? > 0 {
            work |= TickWork::MESHES_FREED;
        }
        
        let batch = self.clock.advance();
        let placed = self.scene.add_pending_instances();
        if placed > 0 {
            self.stats.instances_placed += placed as u64;
            work |= TickWork::INSTANCES_PLACED;
        }
        
        queue.record_all(open, poll, |device, upload, commands| meshes.update(device, upload, commands))?;
        queue.flush()?;
        meshes.commit_staged(batch);
        
        for (mesh, e) in meshes.take_failed() {
            let ids = self.scene.pending_instances_of(&mesh);
            error!("Rejecting {} instances of mesh '{}': {e}", ids.len(), mesh.name());
            for id in ids {
                self.scene.remove_and_free(id);
                self.rejected.insert(id);
                self.stats.rejected_components += 1;
                work |= TickWork::INSTANCES_REJECTED;
            }
        }
        
        let uploaded = meshes.take_uploaded();
        if !uploaded.is_empty() {
            self.stats.meshes_uploaded += uploaded.len() as u64;
            work |= TickWork::MESHES_UPLOADED;
            self.renderer.enqueue_msg(RenderMessage::RegisterMeshes(uploaded))?;
        }
        
        if !self.scene.needs_nodes_update() {
            return Ok(work);
        }
        
        if published.wait_until_inactive_free(open, poll)? && meshes.flush_pending_remove(&*queue.device)? > 0 {
            work |= TickWork::MESHES_FREED;
        }
        self.scene.compact_nodes();
        
        let side = published.inactive_index();
        let target = published.inactive();
        let scene = &mut self.scene;
        queue.record_all(open, poll, |device, upload, commands| {
            scene.update_nodes(device, upload, commands, &target.nodes, &target.node_instances)
        })?;
        queue.record_all(open, poll, |device, upload, commands| {
            scene.update_instances_buffer(side, device, upload, commands, &target.instances)
        })?;
        queue.flush()?;
        queue.token().wait(open, poll)?;
        
        let (promise, future) = completion_pair();
        let node_count = self.scene.num_nodes();
        self.renderer.enqueue_msg(RenderMessage::StaticBuffersReady(StaticBuffers {
            nodes: target.nodes,
            node_instances: target.node_instances,
            instances: target.instances,
            node_count,
            promise,
        }))?;
        published.publish(future);
        meshes.on_published();
        self.scene.set_up_to_date();
        
        self.stats.publishes += 1;
        trace!("Published side {side} with {node_count} nodes in batch {batch}");
        Ok(work | TickWork::SCENE_PUBLISHED)
    }
    
    /// Release every GPU resource once the renderer has stopped
    pub fn release_gpu_resources(&mut self) -> Result<(), DataManagerError> {
        let Some(GpuResources { queue, mut meshes, published }) = self.resources.take() else {
            return Ok(());
        };
        let poll = self.config.actors.fence_poll_interval();
        self.stats.upload_submissions = queue.submitted;
        queue.token().wait_timeout(SHUTDOWN_TIMEOUT, poll)?;
        
        let released = self.scene.clear();
        debug!("Scene cleared, releasing {} meshes ({} lost their last instance)", meshes.len(), released.len());
        meshes.release_all(&*queue.device)?;
        published.destroy(&*queue.device)?;
        queue.upload.destroy(&*queue.device)?;
        Ok(())
    }
    
    fn add_component(&mut self, id: InstanceId, mesh: Arc<Mesh>, transform: Transform) {
        let Some(gpu) = self.resources.as_mut() else { return };
        if let Err(e) = gpu.meshes.register(&mesh) {
            error!("Rejecting {id} of mesh '{}': {e}", mesh.name());
            self.rejected.insert(id);
            self.stats.rejected_components += 1;
            return;
        }
        if let Err(e) = self.scene.add(id, mesh, transform) {
            warn!("{id} left pending: {e}");
        }
    }
    
    fn update_transform(&mut self, id: InstanceId, transform: Transform) {
        if self.rejected.contains(&id) {
            return;
        }
        if self.scene.instance(id).is_none() {
            warn!("Transform update for unknown {id}");
            return;
        }
        if let Err(e) = self.scene.update_transform(id, transform) {
            warn!("{id} left pending after move: {e}");
        }
    }
    
    fn remove_component(&mut self, id: InstanceId) {
        if self.rejected.remove(&id) {
            self.allocator.release(id);
            return;
        }
        if self.scene.instance(id).is_none() {
            warn!("Removal of unknown {id}");
            return;
        }
        if let Some(mesh) = self.scene.remove_and_free(id) {
            if let Some(gpu) = self.resources.as_mut() {
                gpu.meshes.remove(mesh);
            }
        }
        self.allocator.release(id);
    }
}

impl Actor for DataManager {
    type Message = DataMessage;
    
    fn name(&self) -> &str {
        "data_manager"
    }
    
    fn message_budget(&self) -> Duration {
        self.config.actors.data_manager_budget()
    }
    
    fn initialize(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        if let Some(gpu) = &self.resources {
            self.renderer.enqueue_msg(RenderMessage::MeshBufferReady(gpu.meshes.mesh_table()))?;
        }
        info!(
            "Data manager ready: {} instances, {} nodes, {} meshes",
            self.config.scene.instance_capacity, self.config.scene.node_capacity, self.config.meshes.mesh_capacity
        );
        Ok(())
    }
    
    fn handle_message(&mut self, message: DataMessage, _ctx: &ActorContext) {
        match message {
            DataMessage::AddComponent { id, mesh, transform } => self.add_component(id, mesh, transform),
            DataMessage::UpdateTransform { id, transform } => self.update_transform(id, transform),
            DataMessage::RemoveComponent { id } => self.remove_component(id),
        }
    }
    
    fn handle_control(&mut self, message: ControlMessage, _ctx: &ActorContext) {
        if let ControlMessage::Reload { kind: ReloadKind::Asset, before: false } = message {
            debug!("Assets reloaded, republishing scene");
            self.scene.mark_dirty();
        }
    }
    
    fn tick(&mut self, ctx: &ActorContext) {
        match self.step(ctx) {
            Ok(work) if !work.is_empty() => trace!("Data manager tick: {work:?}"),
            Ok(_) => {}
            Err(e) if e.is_cancelled() => debug!("Data manager tick cancelled"),
            Err(e) if e.is_abandoned() => {
                if !self.renderer_lost {
                    warn!("Renderer dropped a published scene, publishing stopped");
                    self.renderer_lost = true;
                }
            }
            Err(e) => error!("Data manager tick failed: {e}"),
        }
    }
    
    fn cleanup(&mut self, _ctx: &ActorContext) {
        info!(
            "Data manager stopped: {} publishes, {} meshes uploaded, {} instances live",
            self.stats.publishes,
            self.stats.meshes_uploaded,
            self.scene.num_instances()
        );
    }
}
