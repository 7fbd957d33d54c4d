//! Per-session options.

use crate::config::PersistenceLevel;
use crate::custom_action::CustomActionFactory;
use crate::datamodel::DataModelHandlerFactory;
use crate::error::EngineError;
use crate::io::ExternalCommunication;
use crate::logger::{Logger, TracingLogger};
use async_trait::async_trait;
use chartd_core::Value;
use chartd_storage::{NullStorageProvider, StorageProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Loads chart documents and other resources named by URI.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, uri: &str) -> Result<String, EngineError>;
}

/// Reads local files. Accepts plain paths and `file://` URIs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileResourceLoader;

#[async_trait]
impl ResourceLoader for FileResourceLoader {
    async fn load(&self, uri: &str) -> Result<String, EngineError> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::Resource {
                uri: uri.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Everything a session needs besides its chart.
#[derive(Clone)]
pub struct InterpreterOptions {
    pub data_model_factories: Vec<Arc<dyn DataModelHandlerFactory>>,
    pub custom_action_factories: Vec<Arc<dyn CustomActionFactory>>,
    /// Free-form settings handed to data-model handlers.
    pub configuration: HashMap<String, String>,
    /// Initial values for top-level data items of the same name.
    pub arguments: Value,
    pub persistence_level: PersistenceLevel,
    pub storage_provider: Arc<dyn StorageProvider>,
    pub resource_loader: Arc<dyn ResourceLoader>,
    pub logger: Arc<dyn Logger>,
    /// `None` runs the session detached from any host.
    pub external_communication: Option<Arc<dyn ExternalCommunication>>,
    /// Idle time after which a persisted session suspends itself.
    pub suspend_idle: Option<Duration>,
    pub stop_token: CancellationToken,
    pub suspend_token: CancellationToken,
    pub destroy_token: CancellationToken,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            data_model_factories: Vec::new(),
            custom_action_factories: Vec::new(),
            configuration: HashMap::new(),
            arguments: Value::Undefined,
            persistence_level: PersistenceLevel::None,
            storage_provider: Arc::new(NullStorageProvider),
            resource_loader: Arc::new(FileResourceLoader),
            logger: Arc::new(TracingLogger),
            external_communication: None,
            suspend_idle: None,
            stop_token: CancellationToken::new(),
            suspend_token: CancellationToken::new(),
            destroy_token: CancellationToken::new(),
        }
    }
}

impl InterpreterOptions {
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_persistence(
        mut self,
        level: PersistenceLevel,
        provider: Arc<dyn StorageProvider>,
    ) -> Self {
        self.persistence_level = level;
        self.storage_provider = provider;
        self
    }

    pub fn with_suspend_idle(mut self, period: Duration) -> Self {
        self.suspend_idle = Some(period);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence_level != PersistenceLevel::None
    }
}

impl std::fmt::Debug for InterpreterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterOptions")
            .field("persistence_level", &self.persistence_level)
            .field("suspend_idle", &self.suspend_idle)
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_resource_loader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chart.json");
        std::fs::write(&path, "{}").unwrap();

        let loader = FileResourceLoader;
        assert_eq!(loader.load(path.to_str().unwrap()).await.unwrap(), "{}");
        let uri = format!("file://{}", path.display());
        assert_eq!(loader.load(&uri).await.unwrap(), "{}");
        assert!(matches!(
            loader.load("/definitely/not/here.json").await,
            Err(EngineError::Resource { .. })
        ));
    }

    #[test]
    fn test_defaults() {
        let options = InterpreterOptions::default();
        assert!(!options.is_persistent());
        assert!(options.arguments.is_undefined());
        assert!(!options.stop_token.is_cancelled());
    }
}
