//! sitesync Sync Engine
//!
//! Keeps a local workspace and a remote FTP/SFTP tree in step:
//! - Path mapping and ignore rules
//! - Debounced change handling for watcher events and saves
//! - A serialized upload queue with bounded retries
//! - One connection session with automatic reconnect
//! - Remote → local tree synchronization
//! - A command service tying the pieces together

pub mod coalescer;
pub mod engine;
pub mod events;
pub mod gate;
pub mod policy;
pub mod queue;
pub mod service;
pub mod session;

// Re-export main types
pub use coalescer::{ChangeCoalescer, ChangeKind, WatchEvent, DEBOUNCE};
pub use engine::{
    decide, LocalEntry, SyncAction, SyncDecision, SyncReport, TreeSyncEngine, MTIME_TOLERANCE,
};
pub use events::{ConnectionStatus, SyncEvent};
pub use gate::{OperationGate, OperationGuard};
pub use policy::{relative_path, should_ignore, to_remote_path, IgnoreRules, PathPolicy};
pub use queue::{EnqueueOutcome, TransferQueue, TransferTask, MAX_RETRIES, RETRY_DELAY};
pub use service::{Command, Response, ServiceHandle, ServiceStatus, SyncService};
pub use session::{classify, ConnectionSession, ErrorClass, SessionState, RECONNECT_DELAY};
