//! # Scene Manager
//!
//! Spatial clustering of instances into bounded nodes.
//!
//! Nodes are a coarse pre-filter for GPU culling: each holds a bounding
//! sphere and up to `instances_per_node` instances. Live nodes always occupy
//! the contiguous range `[0, num_nodes)`; a node emptied by a removal is
//! freed and the highest live node is moved into the hole.
//!
//! Instances whose mesh is not yet GPU-ready wait in a pending list and are
//! placed by [`SceneManager::add_pending_instances`] once the mesh is loaded.
//!
//! ## Placement
//!
//! A new instance joins the closest node that has a free slot, lies within
//! `placement_distance_factor * extent` and whose radius is within the
//! `node_radius_window` of the instance extent. Without such a node a new
//! one is seeded at the instance. When the node table is full the closest
//! node with any free slot is used regardless of distance.

use std::sync::Arc;

use crate::core::config::SceneConfig;
use crate::foundation::collections::{FreeSlotTable, InstanceId, NodeId};
use crate::foundation::logging::{debug, trace, warn};
use crate::foundation::math::{BoundingSphere, Transform, Vec3};
use crate::gpu::upload::UPLOAD_ALIGNMENT;
use crate::gpu::{
    CommandList, GpuBuffer, GpuDevice, InstanceGpu, NodeGpu, NodeInstancesGpu, UpdateResult, UploadBuffer,
    INVALID_INDEX,
};
use super::instance::{Instance, Placement};
use super::mesh::{BatchClock, Mesh};
use super::SceneError;

/// Number of sides of a double-buffered instance table
pub const TWIN_SIDES: usize = 2;

#[derive(Debug, Clone)]
struct SpatialNode {
    bounds: BoundingSphere,
    instances: Vec<InstanceId>,
}

impl SpatialNode {
    fn empty() -> Self {
        Self {
            bounds: BoundingSphere::new(Vec3::zeros(), 0.0),
            instances: Vec::new(),
        }
    }
}

/// Spatial clustering of scene instances
pub struct SceneManager {
    instances: Vec<Option<Instance>>,
    nodes: Vec<SpatialNode>,
    node_slots: FreeSlotTable,
    num_nodes: usize,
    pending: Vec<InstanceId>,
    /// Instances whose GPU record is out of date, per twin side
    stale: [Vec<InstanceId>; TWIN_SIDES],
    live: usize,
    dirty: bool,
    instances_per_node: usize,
    distance_factor: f32,
    radius_window: f32,
    clock: BatchClock,
}

impl SceneManager {
    /// Create an empty scene
    pub fn new(config: &SceneConfig, clock: BatchClock) -> Self {
        Self {
            instances: (0..config.instance_capacity).map(|_| None).collect(),
            nodes: (0..config.node_capacity).map(|_| SpatialNode::empty()).collect(),
            node_slots: FreeSlotTable::with_capacity(config.node_capacity),
            num_nodes: 0,
            pending: Vec::new(),
            stale: [Vec::new(), Vec::new()],
            live: 0,
            dirty: false,
            instances_per_node: config.instances_per_node,
            distance_factor: config.placement_distance_factor,
            radius_window: config.node_radius_window,
            clock,
        }
    }
    
    /// Register an instance in slot `id`
    ///
    /// The instance is placed right away when its mesh is loaded, otherwise
    /// it waits in the pending list. If placement fails for lack of node
    /// space the instance stays pending and the error is returned.
    ///
    /// # Panics
    /// Panics if `id` is outside the pool or already in use.
    pub fn add(&mut self, id: InstanceId, mesh: Arc<Mesh>, transform: Transform) -> Result<(), SceneError> {
        let index = id.index();
        assert!(index < self.instances.len(), "{id} outside the instance pool");
        assert!(self.instances[index].is_none(), "{id} added twice");
        
        let ready = self.clock.is_mesh_loaded(&mesh);
        mesh.add_instance();
        self.instances[index] = Some(Instance::new(mesh, transform));
        self.live += 1;
        
        if !ready {
            self.pending.push(id);
            return Ok(());
        }
        self.place(id).inspect_err(|_| self.pending.push(id))
    }
    
    /// Place every pending instance whose mesh became ready
    ///
    /// Returns the number of instances placed.
    pub fn add_pending_instances(&mut self) -> usize {
        let mut placed = 0;
        let mut cursor = 0;
        while cursor < self.pending.len() {
            let id = self.pending[cursor];
            let ready = self.instances[id.index()]
                .as_ref()
                .is_some_and(|instance| self.clock.is_mesh_loaded(&instance.mesh));
            
            if ready {
                match self.place(id) {
                    Ok(()) => {
                        self.pending.swap_remove(cursor);
                        placed += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("{} pending instances left unplaced: {e}", self.pending.len());
                        break;
                    }
                }
            }
            cursor += 1;
        }
        
        if placed > 0 {
            debug!("Placed {placed} pending instances, {} still pending", self.pending.len());
        }
        placed
    }
    
    /// Remove an instance and release its slot data
    ///
    /// Returns the mesh when this was its last instance; the caller owns the
    /// mesh teardown.
    ///
    /// # Panics
    /// Panics if `id` is not a live instance.
    pub fn remove_and_free(&mut self, id: InstanceId) -> Option<Arc<Mesh>> {
        let placement = self
            .instances
            .get(id.index())
            .and_then(Option::as_ref)
            .map(Instance::placement)
            .unwrap_or_else(|| panic!("removing unknown {id}"));
        
        match placement {
            Placement::Placed { .. } => self.unplace(id),
            Placement::Pending => {
                let position = self
                    .pending
                    .iter()
                    .position(|&pending| pending == id)
                    .unwrap_or_else(|| panic!("{id} is neither placed nor pending"));
                self.pending.swap_remove(position);
            }
        }
        
        let instance = self.instances[id.index()].take()?;
        self.live -= 1;
        (instance.mesh.remove_instance() == 0).then_some(instance.mesh)
    }
    
    /// Pending instances of `mesh`
    pub fn pending_instances_of(&self, mesh: &Arc<Mesh>) -> Vec<InstanceId> {
        self.pending
            .iter()
            .copied()
            .filter(|id| {
                self.instances[id.index()]
                    .as_ref()
                    .is_some_and(|instance| Arc::ptr_eq(&instance.mesh, mesh))
            })
            .collect()
    }
    
    /// Move an instance, re-running placement if it was placed
    pub fn update_transform(&mut self, id: InstanceId, transform: Transform) -> Result<(), SceneError> {
        let placed = matches!(
            self.instance(id).unwrap_or_else(|| panic!("moving unknown {id}")).placement,
            Placement::Placed { .. }
        );
        
        if placed {
            self.unplace(id);
        }
        if let Some(instance) = self.instances[id.index()].as_mut() {
            instance.transform = transform;
        }
        if placed {
            return self.place(id).inspect_err(|_| self.pending.push(id));
        }
        Ok(())
    }
    
    /// Move the highest live nodes into holes until `[0, num_nodes)` is dense
    ///
    /// Returns the number of nodes moved.
    pub fn compact_nodes(&mut self) -> usize {
        let mut moved = 0;
        while let Some(hole) = self.node_slots.find_first_free() {
            if hole >= self.num_nodes {
                break;
            }
            let Some(taken) = self.node_slots.find_last_taken() else { break };
            debug_assert!(taken >= self.num_nodes);
            
            let reused = self.node_slots.allocate();
            debug_assert_eq!(reused, Some(hole));
            self.nodes.swap(hole, taken);
            self.node_slots.free(taken);
            self.nodes[taken].instances.clear();
            
            let node = NodeId::new(hole);
            for &id in &self.nodes[hole].instances {
                if let Some(Instance { placement: Placement::Placed { node: owner, .. }, .. }) =
                    self.instances[id.index()].as_mut()
                {
                    *owner = node;
                }
            }
            trace!("Compacted node {taken} into {hole}");
            moved += 1;
            self.dirty = true;
        }
        moved
    }
    
    /// Record the node table and node instance lists into the given buffers
    pub fn update_nodes(
        &self,
        device: &dyn GpuDevice,
        upload: &mut UploadBuffer,
        commands: &mut CommandList,
        nodes_buffer: &GpuBuffer,
        node_instances_buffer: &GpuBuffer,
    ) -> Result<UpdateResult, SceneError> {
        if self.num_nodes == 0 {
            return Ok(UpdateResult::NothingToDo);
        }
        debug_assert_eq!(self.node_slots.len(), self.num_nodes, "compact_nodes must run first");
        
        let live = &self.nodes[..self.num_nodes];
        let bounds: Vec<NodeGpu> = live.iter().map(|node| NodeGpu::from(&node.bounds)).collect();
        let lists: Vec<NodeInstancesGpu> = live
            .iter()
            .map(|node| NodeInstancesGpu::from_slots(node.instances.iter().map(|id| id.raw())))
            .collect();
        let bounds_bytes: &[u8] = bytemuck::cast_slice(&bounds);
        let list_bytes: &[u8] = bytemuck::cast_slice(&lists);
        
        let needed = bounds_bytes.len() + list_bytes.len() + UPLOAD_ALIGNMENT;
        if !upload.can_ever_fit(needed) {
            return Err(SceneError::UploadTooLarge { bytes: needed, capacity: upload.capacity() });
        }
        
        if !upload.stage(device, commands, bounds_bytes, nodes_buffer.handle, 0)?
            || !upload.stage(device, commands, list_bytes, node_instances_buffer.handle, 0)?
        {
            return Ok(UpdateResult::MoreWorkRemains);
        }
        Ok(UpdateResult::Updated)
    }
    
    /// Record out-of-date instance records for twin side `side`
    ///
    /// Progress is kept across calls: after `MoreWorkRemains` the caller
    /// flushes, resets the upload buffer and calls again.
    pub fn update_instances_buffer(
        &mut self,
        side: usize,
        device: &dyn GpuDevice,
        upload: &mut UploadBuffer,
        commands: &mut CommandList,
        instances_buffer: &GpuBuffer,
    ) -> Result<UpdateResult, SceneError> {
        if self.stale[side].is_empty() {
            return Ok(UpdateResult::NothingToDo);
        }
        let record_size = std::mem::size_of::<InstanceGpu>();
        if !upload.can_ever_fit(record_size) {
            return Err(SceneError::UploadTooLarge { bytes: record_size, capacity: upload.capacity() });
        }
        
        let bit = 1u8 << side;
        while let Some(&id) = self.stale[side].last() {
            if let Some(instance) = self.instances[id.index()].as_mut().filter(|i| i.stale_sides & bit != 0) {
                let record = instance_record(instance);
                let offset = instances_buffer.offset_of(id.index());
                if !upload.stage(device, commands, bytemuck::bytes_of(&record), instances_buffer.handle, offset)? {
                    return Ok(UpdateResult::MoreWorkRemains);
                }
                instance.stale_sides &= !bit;
            }
            self.stale[side].pop();
        }
        Ok(UpdateResult::Updated)
    }
    
    /// Drop every instance and node
    ///
    /// Returns the meshes whose last instance was removed.
    pub fn clear(&mut self) -> Vec<Arc<Mesh>> {
        let mut released = Vec::new();
        for slot in &mut self.instances {
            if let Some(instance) = slot.take() {
                if instance.mesh.remove_instance() == 0 {
                    released.push(instance.mesh);
                }
            }
        }
        for node in &mut self.nodes[..self.num_nodes] {
            node.instances.clear();
        }
        self.node_slots.clear();
        self.num_nodes = 0;
        self.pending.clear();
        self.stale.iter_mut().for_each(Vec::clear);
        self.live = 0;
        self.dirty = true;
        released
    }
    
    /// Number of live nodes
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }
    
    /// Number of live instances, placed or pending
    pub fn num_instances(&self) -> usize {
        self.live
    }
    
    /// Number of instances waiting for their mesh
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
    
    /// Instances whose record on twin `side` is out of date
    pub fn num_stale_records(&self, side: usize) -> usize {
        self.stale[side].len()
    }
    
    /// Check whether nodes changed since the last publish
    pub fn needs_nodes_update(&self) -> bool {
        self.dirty
    }
    
    /// Mark the current node layout as published
    pub fn set_up_to_date(&mut self) {
        self.dirty = false;
    }
    
    /// Force a publish of the current layout
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
    
    /// Live instance in slot `id`
    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(id.index()).and_then(Option::as_ref)
    }
    
    /// Instances stored in `node`
    pub fn node_instances(&self, node: NodeId) -> &[InstanceId] {
        &self.nodes[node.index()].instances
    }
    
    /// Bounding sphere of `node`
    pub fn node_bounds(&self, node: NodeId) -> BoundingSphere {
        self.nodes[node.index()].bounds
    }
    
    /// Verify the structural invariants of the scene
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.node_slots.len() != self.num_nodes {
            return Err(format!("{} node slots taken for {} nodes", self.node_slots.len(), self.num_nodes));
        }
        if let Some(hole) = self.node_slots.find_first_free().filter(|&hole| hole < self.num_nodes) {
            return Err(format!("hole at node {hole} below {}", self.num_nodes));
        }
        
        for (node_index, node) in self.nodes[..self.num_nodes].iter().enumerate() {
            if node.instances.is_empty() || node.instances.len() > self.instances_per_node {
                return Err(format!("node {node_index} holds {} instances", node.instances.len()));
            }
            for (slot, &id) in node.instances.iter().enumerate() {
                let instance = self.instance(id).ok_or(format!("node {node_index} lists dead {id}"))?;
                let expected = Placement::Placed { node: NodeId::new(node_index), slot };
                if instance.placement != expected {
                    return Err(format!("{id} is {:?}, node {node_index} holds it at {slot}", instance.placement));
                }
                let sphere = instance.bounding_sphere();
                let reach = (sphere.center - node.bounds.center).norm() + sphere.radius;
                if reach > node.bounds.radius + 1e-3 * node.bounds.radius.max(1.0) {
                    return Err(format!("{id} sticks out of node {node_index}"));
                }
            }
        }
        
        let mut live = 0;
        for (index, instance) in self.instances.iter().enumerate() {
            let Some(instance) = instance else { continue };
            live += 1;
            let id = InstanceId::new(index);
            match instance.placement {
                Placement::Pending if !self.pending.contains(&id) => {
                    return Err(format!("{id} pending but not queued"));
                }
                Placement::Placed { node, slot } if self.nodes[node.index()].instances.get(slot) != Some(&id) => {
                    return Err(format!("{id} claims {node} slot {slot}"));
                }
                Placement::Placed { node, .. } if node.index() >= self.num_nodes => {
                    return Err(format!("{id} placed in dead {node}"));
                }
                _ => {}
            }
        }
        if live != self.live {
            return Err(format!("{live} instances found, {} counted", self.live));
        }
        Ok(())
    }
    
    fn place(&mut self, id: InstanceId) -> Result<(), SceneError> {
        let sphere = self.instances[id.index()]
            .as_ref()
            .map(Instance::bounding_sphere)
            .unwrap_or_else(|| panic!("placing unknown {id}"));
        
        let extent = sphere.radius;
        let max_distance = self.distance_factor * extent;
        let max_distance_sq = max_distance * max_distance;
        let (min_radius, max_radius) = (extent / self.radius_window, extent * self.radius_window);
        
        let mut best: Option<(usize, f32)> = None;
        let mut fallback: Option<(usize, f32)> = None;
        for (node_index, node) in self.nodes[..self.num_nodes].iter().enumerate() {
            if node.instances.len() >= self.instances_per_node {
                continue;
            }
            let distance_sq = node.bounds.center_distance_sq(&sphere.center);
            if fallback.map_or(true, |(_, closest)| distance_sq < closest) {
                fallback = Some((node_index, distance_sq));
            }
            let good = distance_sq < max_distance_sq
                && node.bounds.radius > min_radius
                && node.bounds.radius < max_radius;
            if good && best.map_or(true, |(_, closest)| distance_sq < closest) {
                best = Some((node_index, distance_sq));
            }
        }
        
        let node_index = match best {
            Some((node_index, _)) => node_index,
            None => match self.node_slots.allocate() {
                Some(node_index) => {
                    debug_assert_eq!(node_index, self.num_nodes);
                    self.num_nodes += 1;
                    self.nodes[node_index].instances.clear();
                    node_index
                }
                None => {
                    let capacity = self.node_slots.capacity();
                    fallback
                        .map(|(node_index, _)| node_index)
                        .ok_or(SceneError::CapacityExceeded { pool: "scene nodes", capacity })?
                }
            },
        };
        
        let node = &mut self.nodes[node_index];
        node.bounds = if node.instances.is_empty() { sphere } else { node.bounds.merged(&sphere) };
        let slot = node.instances.len();
        node.instances.push(id);
        
        if let Some(instance) = self.instances[id.index()].as_mut() {
            instance.placement = Placement::Placed { node: NodeId::new(node_index), slot };
        }
        self.mark_stale(id);
        self.dirty = true;
        Ok(())
    }
    
    fn unplace(&mut self, id: InstanceId) {
        let Some(Placement::Placed { node, slot }) = self.instance(id).map(Instance::placement) else {
            return;
        };
        
        let list = &mut self.nodes[node.index()].instances;
        assert_eq!(list.get(slot), Some(&id), "{id} missing from {node}");
        list.swap_remove(slot);
        if let Some(&moved) = list.get(slot) {
            if let Some(instance) = self.instances[moved.index()].as_mut() {
                instance.placement = Placement::Placed { node, slot };
            }
        }
        if let Some(instance) = self.instances[id.index()].as_mut() {
            instance.placement = Placement::Pending;
        }
        self.dirty = true;
        
        if self.nodes[node.index()].instances.is_empty() {
            self.node_slots.free(node.index());
            self.num_nodes -= 1;
            self.compact_nodes();
        } else {
            self.recompute_bounds(node.index());
        }
    }
    
    fn recompute_bounds(&mut self, node_index: usize) {
        let bounds = self.nodes[node_index]
            .instances
            .iter()
            .filter_map(|id| self.instance(*id).map(Instance::bounding_sphere))
            .reduce(|merged, sphere| merged.merged(&sphere));
        if let Some(bounds) = bounds {
            self.nodes[node_index].bounds = bounds;
        }
    }
    
    fn mark_stale(&mut self, id: InstanceId) {
        let Some(instance) = self.instances[id.index()].as_mut() else { return };
        for (side, list) in self.stale.iter_mut().enumerate() {
            let bit = 1u8 << side;
            if instance.stale_sides & bit == 0 {
                instance.stale_sides |= bit;
                list.push(id);
            }
        }
    }
}

fn instance_record(instance: &Instance) -> InstanceGpu {
    let mesh_index = instance.mesh.slot().map_or(INVALID_INDEX, |slot| slot.raw());
    InstanceGpu::new(
        &instance.transform.to_matrix(),
        mesh_index,
        instance.bounding_sphere().radius,
        instance.mesh.max_draw_distance(),
    )
}
