//! Double-buffered scene tables and the outstanding publish future

use std::mem;
use std::time::Duration;

use crate::core::config::SceneConfig;
use crate::gpu::{GpuBuffer, GpuDevice, GpuError, InstanceGpu, NodeGpu, NodeInstancesGpu};
use crate::sync::{CompletionFuture, OpenFlag, SyncError, Twins};

/// One side of the published scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneBuffers {
    /// Node bounding spheres
    pub nodes: GpuBuffer,
    /// Per-node instance lists
    pub node_instances: GpuBuffer,
    /// Instance records
    pub instances: GpuBuffer,
}

impl SceneBuffers {
    /// Allocate one side sized for `config`
    pub fn create(device: &dyn GpuDevice, config: &SceneConfig, side: usize) -> Result<Self, GpuError> {
        let suffix = if side == 0 { "A" } else { "B" };
        let nodes = device.create_buffer(&format!("nodes {suffix}"), config.node_capacity, mem::size_of::<NodeGpu>())?;
        let node_instances = device.create_buffer(
            &format!("node instances {suffix}"),
            config.node_capacity,
            mem::size_of::<NodeInstancesGpu>(),
        )?;
        let instances = device.create_buffer(
            &format!("instances {suffix}"),
            config.instance_capacity,
            mem::size_of::<InstanceGpu>(),
        )?;
        Ok(Self { nodes, node_instances, instances })
    }
    
    /// Release the three buffers
    pub fn destroy(&self, device: &dyn GpuDevice) -> Result<(), GpuError> {
        device.destroy_buffer(self.nodes.handle)?;
        device.destroy_buffer(self.node_instances.handle)?;
        device.destroy_buffer(self.instances.handle)
    }
}

/// Both scene sides plus the future of the last publish
///
/// The renderer reads the active side. The inactive side may be written
/// once the future of the last publish has resolved and its token retired.
/// A future whose promise was dropped proves nothing, so it stays
/// outstanding and the inactive side stays blocked.
#[derive(Debug)]
pub struct PublishedScene {
    sides: Twins<SceneBuffers>,
    outstanding: Option<CompletionFuture>,
}

impl PublishedScene {
    /// Allocate both sides
    pub fn new(device: &dyn GpuDevice, config: &SceneConfig) -> Result<Self, GpuError> {
        let first = SceneBuffers::create(device, config, 0)?;
        let second = SceneBuffers::create(device, config, 1)?;
        Ok(Self { sides: Twins::new(first, second), outstanding: None })
    }
    
    /// Side last handed to the renderer
    pub fn active(&self) -> SceneBuffers {
        *self.sides.active()
    }
    
    /// Side the next publish writes
    pub fn inactive(&self) -> SceneBuffers {
        *self.sides.inactive()
    }
    
    /// Index of the inactive side
    pub fn inactive_index(&self) -> usize {
        self.sides.inactive_index()
    }
    
    /// Check whether a publish has not been acknowledged yet
    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }
    
    /// Check whether the last publish was dropped without acknowledgement
    pub fn is_abandoned(&self) -> bool {
        self.outstanding
            .as_ref()
            .is_some_and(|future| matches!(future.try_get(), Err(SyncError::Abandoned)))
    }
    
    /// Consume the outstanding future if it resolved and its token retired
    ///
    /// Never blocks. Returns whether a future was consumed; an abandoned
    /// future is never consumed.
    pub fn take_retired(&mut self) -> bool {
        let Some(future) = &self.outstanding else { return false };
        match future.try_get() {
            Ok(Some(token)) if token.is_complete() => {
                self.outstanding = None;
                true
            }
            Ok(_) | Err(_) => false,
        }
    }
    
    /// Block until the inactive side is no longer read by the GPU
    ///
    /// Returns whether an outstanding future was consumed. A cancelled or
    /// abandoned wait keeps the future, so the side stays blocked.
    pub fn wait_until_inactive_free(&mut self, open: &OpenFlag, poll_interval: Duration) -> Result<bool, SyncError> {
        let Some(future) = &self.outstanding else { return Ok(false) };
        future.wait_complete(open, poll_interval)?;
        self.outstanding = None;
        Ok(true)
    }
    
    /// Flip sides after handing the inactive one to the renderer
    ///
    /// # Panics
    /// Panics if the previous publish future was never consumed.
    pub fn publish(&mut self, future: CompletionFuture) {
        assert!(self.outstanding.is_none(), "publish with an unconsumed completion future");
        self.sides.flip();
        self.outstanding = Some(future);
    }
    
    /// Release both sides
    pub fn destroy(self, device: &dyn GpuDevice) -> Result<(), GpuError> {
        for side in self.sides.both() {
            side.destroy(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SimulatedGpu;
    use crate::sync::{completion_pair, GpuCounter, SyncToken};
    
    fn published(gpu: &SimulatedGpu) -> PublishedScene {
        PublishedScene::new(gpu, &SceneConfig::default().with_capacities(16, 4)).unwrap()
    }
    
    #[test]
    fn test_publish_flips_sides() {
        let gpu = SimulatedGpu::new();
        let mut scene = published(&gpu);
        let written = scene.inactive();
        
        let (_promise, future) = completion_pair();
        scene.publish(future);
        
        assert_eq!(scene.active(), written);
        assert_ne!(scene.inactive(), written);
        assert!(scene.has_outstanding());
    }
    
    #[test]
    #[should_panic(expected = "unconsumed completion future")]
    fn test_publish_twice_without_wait_panics() {
        let gpu = SimulatedGpu::new();
        let mut scene = published(&gpu);
        let (_first_promise, first) = completion_pair();
        let (_second_promise, second) = completion_pair();
        scene.publish(first);
        scene.publish(second);
    }
    
    #[test]
    fn test_take_retired_needs_resolved_and_complete_token() {
        let gpu = SimulatedGpu::new();
        let mut scene = published(&gpu);
        let counter = GpuCounter::new();
        let (promise, future) = completion_pair();
        scene.publish(future);
        
        assert!(!scene.take_retired());
        promise.resolve(counter.token(4));
        assert!(!scene.take_retired());
        counter.signal(4);
        assert!(scene.take_retired());
        assert!(!scene.has_outstanding());
    }
    
    #[test]
    fn test_abandoned_publish_keeps_inactive_side_blocked() {
        let gpu = SimulatedGpu::new();
        let mut scene = published(&gpu);
        let (promise, future) = completion_pair();
        scene.publish(future);
        drop(promise);
        
        assert!(scene.is_abandoned());
        assert!(!scene.take_retired());
        let open = OpenFlag::new();
        assert_eq!(scene.wait_until_inactive_free(&open, Duration::ZERO), Err(SyncError::Abandoned));
        assert_eq!(scene.wait_until_inactive_free(&open, Duration::ZERO), Err(SyncError::Abandoned));
        assert!(scene.has_outstanding());
    }
    
    #[test]
    fn test_cancelled_wait_keeps_future() {
        let gpu = SimulatedGpu::new();
        let mut scene = published(&gpu);
        let (promise, future) = completion_pair();
        scene.publish(future);
        
        let closed = OpenFlag::new();
        closed.close();
        assert_eq!(scene.wait_until_inactive_free(&closed, Duration::ZERO), Err(SyncError::Cancelled));
        assert!(scene.has_outstanding());
        
        promise.resolve(SyncToken::completed());
        assert_eq!(scene.wait_until_inactive_free(&OpenFlag::new(), Duration::ZERO), Ok(true));
        assert_eq!(scene.wait_until_inactive_free(&OpenFlag::new(), Duration::ZERO), Ok(false));
    }
    
    #[test]
    fn test_destroy_releases_both_sides() {
        let gpu = SimulatedGpu::new();
        let scene = published(&gpu);
        assert_eq!(gpu.live_buffers(), 6);
        scene.destroy(&gpu).unwrap();
        assert_eq!(gpu.live_buffers(), 0);
    }
}
