//! Common utilities and types shared across sitesync modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the shared error type, the forward-slash remote path type and the site
//! configuration every component is constructed from.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Credentials, Protocol, SiteConfig, WatcherConfig, CONFIG_FILE_NAME};
pub use error::{Error, Result};
pub use types::RemotePath;
