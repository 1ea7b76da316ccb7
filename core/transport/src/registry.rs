//! Transport registry for protocol-based transport resolution.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ftp::FtpTransport;
use crate::transport::Transport;
use sitesync_common::{Error, Protocol, Result, SiteConfig};

/// Factory function type for creating transports.
pub type TransportFactory =
    Box<dyn Fn(&SiteConfig) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Registry of transport factories keyed by protocol.
pub struct TransportRegistry {
    factories: HashMap<Protocol, TransportFactory>,
}

impl TransportRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a transport factory.
    ///
    /// # Errors
    /// - Returns error if the protocol is already registered
    pub fn register(&mut self, protocol: Protocol, factory: TransportFactory) -> Result<()> {
        if self.factories.contains_key(&protocol) {
            return Err(Error::InvalidInput(format!(
                "Transport for '{}' is already registered",
                protocol
            )));
        }
        self.factories.insert(protocol, factory);
        Ok(())
    }

    /// Create a transport for the configured protocol.
    ///
    /// # Errors
    /// - `Unsupported` if no transport is registered for the protocol
    pub fn resolve(&self, config: &SiteConfig) -> Result<Arc<dyn Transport>> {
        let factory = self.factories.get(&config.protocol).ok_or_else(|| {
            Error::Unsupported(format!(
                "No transport for protocol '{}' in this build",
                config.protocol
            ))
        })?;
        factory(config)
    }

    /// Check if a protocol is registered.
    pub fn has_protocol(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with all transports compiled into this build.
pub fn create_default_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();

    // Fresh registry, registration cannot collide.
    let _ = registry.register(
        Protocol::Ftp,
        Box::new(|_config| Ok(Arc::new(FtpTransport::new()) as Arc<dyn Transport>)),
    );

    #[cfg(feature = "sftp")]
    let _ = registry.register(
        Protocol::Sftp,
        Box::new(|_config| {
            Ok(Arc::new(crate::sftp::SftpTransport::new()) as Arc<dyn Transport>)
        }),
    );

    registry
}
