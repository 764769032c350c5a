//! Control plane shared by all actors
//!
//! Low-frequency notifications (frame ticks, game state changes, reloads)
//! broadcast to every subscribed actor. Each subscriber owns a dedicated
//! control mailbox drained at the start of its cycle.

use std::sync::{Arc, RwLock, Weak, PoisonError};

use crate::sync::MailboxQueue;

/// High level state of the game session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    /// Gameplay running
    Playing,
    /// Loading screen
    Loading,
    /// Pause menu over a running session
    InGameMenu,
    /// Front-end menu
    MainMenu,
    /// Application lost focus
    Background,
}

/// What is being hot-reloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// Configuration files
    Config,
    /// Game code
    Code,
    /// Asset data
    Asset,
}

/// Message broadcast to every actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMessage {
    /// A frame finished on the render actor
    Frame {
        /// Monotonic frame number
        frame_id: u64,
        /// Seconds since the previous frame
        delta: f32,
    },
    /// Game state transition
    StateChange(GameState),
    /// Hot reload notification, sent once before and once after the reload
    Reload {
        /// Reloaded resource
        kind: ReloadKind,
        /// `true` before the reload starts
        before: bool,
    },
}

/// Control mailbox of one subscriber
pub type ControlMailbox = MailboxQueue<ControlMessage>;

/// Broadcast hub for [`ControlMessage`]s
///
/// Holds weak references so a stopped actor's mailbox is released with it.
#[derive(Debug, Clone, Default)]
pub struct ControlBus {
    subscribers: Arc<RwLock<Vec<Weak<ControlMailbox>>>>,
}

impl ControlBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Register a new control mailbox
    pub fn subscribe(&self) -> Arc<ControlMailbox> {
        let mailbox = Arc::new(ControlMailbox::new(1));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&mailbox));
        mailbox
    }
    
    /// Deliver `message` to every live subscriber
    pub fn broadcast(&self, message: ControlMessage) {
        let mut stale = false;
        {
            let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            for subscriber in subscribers.iter() {
                match subscriber.upgrade() {
                    Some(mailbox) => mailbox.enqueue(message),
                    None => stale = true,
                }
            }
        }
        
        if stale {
            self.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|subscriber| subscriber.strong_count() > 0);
        }
    }
    
    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|subscriber| subscriber.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_broadcast_reaches_every_subscriber() {
        let bus = ControlBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();
        
        bus.broadcast(ControlMessage::StateChange(GameState::Loading));
        
        assert_eq!(first.pop(), Some(ControlMessage::StateChange(GameState::Loading)));
        assert_eq!(second.pop(), Some(ControlMessage::StateChange(GameState::Loading)));
    }
    
    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = ControlBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        
        bus.broadcast(ControlMessage::Reload { kind: ReloadKind::Asset, before: true });
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.len(), 1);
    }
}
