//! # Synchronization Primitives
//!
//! Building blocks shared by the actors:
//!
//! - **Mailbox**: lock-free MPSC queue feeding each actor
//! - **Completion**: GPU counters, completion tokens and the single-assignment
//!   future used by the publish protocol
//! - **Twins**: A/B container for double-buffered resources

pub mod mailbox;
pub mod completion;
pub mod twins;

pub use mailbox::MailboxQueue;
pub use completion::{
    completion_pair,
    CompletionFuture,
    CompletionPromise,
    GpuCounter,
    OpenFlag,
    SyncError,
    SyncToken,
};
pub use twins::Twins;
