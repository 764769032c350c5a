//! Scene instances and the shared instance slot allocator

use std::sync::{Arc, Mutex, PoisonError};

use crate::foundation::collections::{FreeSlotTable, InstanceId, NodeId};
use crate::foundation::math::{BoundingSphere, Transform};
use super::mesh::Mesh;
use super::SceneError;

/// Where an instance currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Waiting for its mesh to become GPU-ready
    Pending,
    /// Stored in `node` at position `slot` of its instance list
    Placed {
        /// Owning node
        node: NodeId,
        /// Position in the node's instance list
        slot: usize,
    },
}

/// One renderable instance of a mesh
#[derive(Debug, Clone)]
pub struct Instance {
    /// Rendered mesh
    pub mesh: Arc<Mesh>,
    /// World transform
    pub transform: Transform,
    pub(crate) placement: Placement,
    /// Twin sides whose instance record is out of date, one bit per side
    pub(crate) stale_sides: u8,
}

impl Instance {
    pub(crate) fn new(mesh: Arc<Mesh>, transform: Transform) -> Self {
        Self { mesh, transform, placement: Placement::Pending, stale_sides: 0 }
    }
    
    /// Current placement
    pub fn placement(&self) -> Placement {
        self.placement
    }
    
    /// Node holding this instance, if placed
    pub fn node(&self) -> Option<NodeId> {
        match self.placement {
            Placement::Placed { node, .. } => Some(node),
            Placement::Pending => None,
        }
    }
    
    /// World space bounding sphere
    pub fn bounding_sphere(&self) -> BoundingSphere {
        BoundingSphere::new(self.transform.position, self.mesh.radius() * self.transform.max_scale())
    }
}

/// Thread-safe allocator of instance pool slots
///
/// Gameplay threads reserve a slot when they create a handle; everything
/// else about the pool stays on the data manager thread.
#[derive(Debug, Clone)]
pub struct InstanceAllocator {
    table: Arc<Mutex<FreeSlotTable>>,
}

impl InstanceAllocator {
    /// Create an allocator for `capacity` instances
    pub fn new(capacity: usize) -> Self {
        Self { table: Arc::new(Mutex::new(FreeSlotTable::with_capacity(capacity))) }
    }
    
    /// Reserve the lowest free instance slot
    pub fn allocate(&self) -> Result<InstanceId, SceneError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .allocate()
            .map(InstanceId::new)
            .ok_or(SceneError::CapacityExceeded { pool: "instances", capacity: table.capacity() })
    }
    
    /// Return a slot to the pool
    pub fn release(&self, id: InstanceId) {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).free(id.index());
    }
    
    /// Number of reserved slots
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
    
    /// Check whether no slot is reserved
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    
    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    
    #[test]
    fn test_allocator_reports_capacity() {
        let allocator = InstanceAllocator::new(2);
        assert_eq!(allocator.allocate().unwrap(), InstanceId::new(0));
        assert_eq!(allocator.allocate().unwrap(), InstanceId::new(1));
        assert!(matches!(
            allocator.allocate(),
            Err(SceneError::CapacityExceeded { pool: "instances", capacity: 2 })
        ));
        
        allocator.release(InstanceId::new(0));
        assert_eq!(allocator.allocate().unwrap(), InstanceId::new(0));
    }
    
    #[test]
    fn test_concurrent_allocations_are_unique() {
        let allocator = InstanceAllocator::new(400);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                thread::spawn(move || (0..100).map(|_| allocator.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        
        let mut ids: Vec<InstanceId> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
        assert_eq!(allocator.len(), 400);
    }
}
