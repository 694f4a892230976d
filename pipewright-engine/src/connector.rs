//! Connector boundary
//!
//! Connectors are open handles to databases or object stores. The engine
//! only caches them by logical name; opening and using them belongs to the
//! factory and the components.

use anyhow::Result;
use async_trait::async_trait;
use pipewright_core::ConnectionDetails;
use std::sync::Arc;

/// An open connection shared by every step that names it
pub trait Connector: Send + Sync {
    /// Logical connection name from the definition
    fn logical_name(&self) -> &str;

    /// Connection type, e.g. `oracle` or `s3`
    fn connection_type(&self) -> &str;
}

/// Opens connectors on demand
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Opens the connection described by `details`
    ///
    /// # Arguments
    /// * `name` - The connection's key in the definition
    /// * `details` - The connection details
    async fn open(&self, name: &str, details: &ConnectionDetails) -> Result<Arc<dyn Connector>>;
}

/// Factory used when none is configured; every open fails
pub struct UnsupportedConnectorFactory;

#[async_trait]
impl ConnectorFactory for UnsupportedConnectorFactory {
    async fn open(&self, name: &str, details: &ConnectionDetails) -> Result<Arc<dyn Connector>> {
        anyhow::bail!(
            "No connector factory configured for connection '{}' of type '{}'",
            name,
            details.connection_type
        )
    }
}
