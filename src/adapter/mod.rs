//! AN-010: Resource adapters — describe / create / delete one kind of resource.
//!
//! Adapters classify their own outcomes. The engine never inspects error
//! messages; it only sees `Transient` vs `Permanent`, and `AlreadyExists`
//! is a success variant rather than an error.

pub mod script;

use crate::core::types::{Parameters, ProvisionConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new resource with this provider id
    Created(String),
    /// The provider already had it; id when the provider reported one
    AlreadyExists(Option<String>),
}

/// Successful delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Classified adapter failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Retryable: throttling, propagation delay, timeouts
    #[error("transient: {0}")]
    Transient(String),

    /// Not retryable. The default for anything an adapter can't classify.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// One kind of external resource.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Look the resource up by its parameters. `Ok(None)` means not found.
    async fn describe(&self, params: &Parameters) -> Result<Option<String>, AdapterError>;

    async fn create(&self, params: &Parameters) -> Result<CreateOutcome, AdapterError>;

    async fn delete(
        &self,
        external_id: &str,
        params: &Parameters,
    ) -> Result<DeleteOutcome, AdapterError>;
}

/// Resource kind → adapter instance.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ResourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script adapters for every kind declared in the plan file.
    pub fn from_config(config: &ProvisionConfig) -> Self {
        let mut registry = Self::new();
        for (kind, adapter) in &config.adapters {
            registry.register(kind, Arc::new(script::ScriptAdapter::new(kind, adapter.clone())));
        }
        registry
    }

    /// Register an adapter, replacing any previous one for `kind`.
    pub fn register(
        &mut self,
        kind: &str,
        adapter: Arc<dyn ResourceAdapter>,
    ) -> Option<Arc<dyn ResourceAdapter>> {
        self.adapters.insert(kind.to_string(), adapter)
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockAdapter;
    use super::*;

    #[test]
    fn test_an010_registry_lookup() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.register("queue", Arc::new(MockAdapter::new())).is_none());
        registry.register("bucket", Arc::new(MockAdapter::new()));
        assert!(registry.contains("queue"));
        assert!(registry.get("topic").is_none());
        assert_eq!(registry.kinds(), vec!["bucket", "queue"]);
        assert!(registry.register("queue", Arc::new(MockAdapter::new())).is_some());
    }

    #[test]
    fn test_an010_registry_from_config() {
        let yaml = r#"
version: "1.0"
name: s3-stack
adapters:
  bucket:
    describe: "true"
    create: "echo b-1"
    delete: "true"
resources:
  logs:
    kind: bucket
"#;
        let config: ProvisionConfig = serde_yaml_ng::from_str(yaml).unwrap();
        let registry = AdapterRegistry::from_config(&config);
        assert_eq!(registry.kinds(), vec!["bucket"]);
    }

    #[test]
    fn test_an010_error_classification() {
        let t = AdapterError::Transient("throttled".into());
        let p = AdapterError::Permanent("denied".into());
        assert!(t.is_transient());
        assert!(!p.is_transient());
        assert_eq!(p.message(), "denied");
        assert_eq!(t.to_string(), "transient: throttled");
    }

    #[tokio::test]
    async fn test_an010_mock_defaults_and_queue() {
        let mock = MockAdapter::new().on_create(
            "a",
            vec![Err(AdapterError::Transient("slow".into()))],
        );
        let mut params = Parameters::new();
        params.insert("name".into(), serde_yaml_ng::Value::String("a".into()));

        assert!(mock.create(&params).await.is_err());
        assert_eq!(
            mock.create(&params).await.unwrap(),
            CreateOutcome::Created("id-a".into())
        );
        assert_eq!(mock.describe(&params).await.unwrap(), Some("id-a".into()));
        assert_eq!(mock.create_calls(), vec!["a", "a"]);
        assert_eq!(
            mock.delete("id-a", &params).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert!(!mock.exists("a"));
    }
}
