//! Remote transport abstraction for sitesync.
//!
//! This module provides a trait-based interface over the file-transfer
//! protocols a site can be reached with (FTP, SFTP) and a transport registry
//! for protocol-based resolution.
//!
//! # Design Principles
//! - Protocol isolation: No protocol-specific logic in the sync engine
//! - Async operations: All I/O operations are async
//! - Unified error semantics: Missing remote paths are always `NotFound`,
//!   dead connections are always `Network`

pub mod ftp;
pub mod memory;
pub mod registry;
#[cfg(feature = "sftp")]
pub mod sftp;
pub mod transport;

pub use ftp::FtpTransport;
pub use memory::{MemoryTransport, Operation};
pub use registry::{create_default_registry, TransportFactory, TransportRegistry};
#[cfg(feature = "sftp")]
pub use sftp::SftpTransport;
pub use transport::{EntryKind, RemoteEntry, Transport};
