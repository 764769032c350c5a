use std::sync::Arc;

use crate::actor::ActorHandle;
use crate::foundation::math::{Transform, Vec3};
use crate::render_data::{DataManagerError, DataManagerHandle, DataMessage, MeshHandle};
use crate::scene::{InstanceAllocator, Mesh, MeshData, SceneError};
use crate::sync::MailboxQueue;

fn detached(capacity: usize) -> (DataManagerHandle, Arc<MailboxQueue<DataMessage>>) {
    let (actor, mailbox) = ActorHandle::detached("data_manager", 3);
    (DataManagerHandle::new(actor, InstanceAllocator::new(capacity)), mailbox)
}

#[test]
fn test_handle_lifecycle_messages() {
    let (manager, mailbox) = detached(8);
    let cube = Mesh::new("cube", MeshData::unit_cube());
    
    let mut handle = MeshHandle::initialize(&manager, Arc::clone(&cube), Transform::identity()).unwrap();
    let id = handle.id().unwrap();
    assert!(handle.is_valid());
    assert_eq!(manager.instances().len(), 1);
    
    handle.update_transform(Transform::from_position(Vec3::new(1.0, 2.0, 3.0))).unwrap();
    handle.cleanup();
    handle.cleanup();
    assert!(!handle.is_valid());
    assert!(matches!(handle.update_transform(Transform::identity()), Err(DataManagerError::InvalidHandle)));
    drop(handle);
    
    assert!(matches!(mailbox.pop(), Some(DataMessage::AddComponent { id: added, .. }) if added == id));
    assert!(matches!(
        mailbox.pop(),
        Some(DataMessage::UpdateTransform { id: moved, transform }) if moved == id && transform.position.z == 3.0
    ));
    assert!(matches!(mailbox.pop(), Some(DataMessage::RemoveComponent { id: removed }) if removed == id));
    assert!(mailbox.pop().is_none());
    
    // The slot is returned by the data manager, not by the handle
    assert_eq!(manager.instances().len(), 1);
}

#[test]
fn test_drop_removes_instance() {
    let (manager, mailbox) = detached(8);
    let handle = MeshHandle::initialize(&manager, Mesh::new("cube", MeshData::unit_cube()), Transform::identity()).unwrap();
    drop(handle);
    
    assert!(matches!(mailbox.pop(), Some(DataMessage::AddComponent { .. })));
    assert!(matches!(mailbox.pop(), Some(DataMessage::RemoveComponent { .. })));
}

#[test]
fn test_initialize_fails_when_pool_is_full() {
    let (manager, mailbox) = detached(1);
    let cube = Mesh::new("cube", MeshData::unit_cube());
    let _first = MeshHandle::initialize(&manager, Arc::clone(&cube), Transform::identity()).unwrap();
    
    let second = MeshHandle::initialize(&manager, cube, Transform::identity());
    assert!(matches!(
        second,
        Err(DataManagerError::Scene(SceneError::CapacityExceeded { pool: "instances", capacity: 1 }))
    ));
    assert_eq!(mailbox.len(), 1);
}
