//! Gameplay-side handles to the data manager

use std::sync::Arc;

use crate::actor::{ActorError, ActorHandle};
use crate::foundation::collections::InstanceId;
use crate::foundation::logging::debug;
use crate::foundation::math::Transform;
use crate::scene::{InstanceAllocator, Mesh};
use super::DataManagerError;

/// Messages accepted by the data manager
#[derive(Debug)]
pub enum DataMessage {
    /// Add an instance of `mesh` in the reserved slot `id`
    AddComponent {
        /// Reserved instance slot
        id: InstanceId,
        /// Rendered mesh
        mesh: Arc<Mesh>,
        /// Initial transform
        transform: Transform,
    },
    /// Move an instance
    UpdateTransform {
        /// Instance slot
        id: InstanceId,
        /// New transform
        transform: Transform,
    },
    /// Remove an instance and release its slot
    RemoveComponent {
        /// Instance slot
        id: InstanceId,
    },
}

/// Cloneable entry point to a running data manager
#[derive(Debug, Clone)]
pub struct DataManagerHandle {
    actor: ActorHandle<DataMessage>,
    instances: InstanceAllocator,
}

impl DataManagerHandle {
    /// Pair an actor handle with the instance allocator it serves
    pub fn new(actor: ActorHandle<DataMessage>, instances: InstanceAllocator) -> Self {
        Self { actor, instances }
    }
    
    /// Queue a raw message
    pub fn enqueue(&self, message: DataMessage) -> Result<(), ActorError> {
        self.actor.enqueue_msg(message)
    }
    
    /// Instance slot allocator
    pub fn instances(&self) -> &InstanceAllocator {
        &self.instances
    }
    
    /// Check whether the data manager still accepts messages
    pub fn is_open(&self) -> bool {
        self.actor.is_open()
    }
}

/// Owner of one scene instance
///
/// Dropping the handle removes the instance.
#[derive(Debug)]
pub struct MeshHandle {
    id: Option<InstanceId>,
    manager: DataManagerHandle,
}

impl MeshHandle {
    /// Reserve an instance slot and ask the data manager to add the instance
    pub fn initialize(
        manager: &DataManagerHandle,
        mesh: Arc<Mesh>,
        transform: Transform,
    ) -> Result<Self, DataManagerError> {
        let id = manager.instances.allocate()?;
        if let Err(e) = manager.enqueue(DataMessage::AddComponent { id, mesh, transform }) {
            manager.instances.release(id);
            return Err(e.into());
        }
        Ok(Self { id: Some(id), manager: manager.clone() })
    }
    
    /// Move the instance
    pub fn update_transform(&self, transform: Transform) -> Result<(), DataManagerError> {
        let id = self.id.ok_or(DataManagerError::InvalidHandle)?;
        self.manager.enqueue(DataMessage::UpdateTransform { id, transform })?;
        Ok(())
    }
    
    /// Remove the instance; later calls do nothing
    pub fn cleanup(&mut self) {
        let Some(id) = self.id.take() else { return };
        if let Err(e) = self.manager.enqueue(DataMessage::RemoveComponent { id }) {
            debug!("Dropping {id} without removal: {e}");
        }
    }
    
    /// Check whether the handle still owns an instance
    pub fn is_valid(&self) -> bool {
        self.id.is_some()
    }
    
    /// Owned instance slot
    pub fn id(&self) -> Option<InstanceId> {
        self.id
    }
}

impl Drop for MeshHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}
