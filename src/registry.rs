//! Repository lookup and the per-repository aggregation switch.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AggregatorSettings;
use crate::store::{ArtifactStore, FsStore};

/// Capability property naming the repository an aggregator configuration belongs to.
pub const REPOSITORY_PROPERTY: &str = "repository";

/// Resolves repository identifiers to their stores.
pub trait RepositoryRegistry: Send + Sync {
    fn repository(&self, id: &str) -> Option<Arc<dyn ArtifactStore>>;

    /// Identifiers of every known repository, sorted.
    fn repository_ids(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct StoreRegistry {
    stores: RwLock<BTreeMap<String, Arc<dyn ArtifactStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One filesystem store per configured repository.
    pub fn from_settings(settings: &AggregatorSettings) -> Self {
        let registry = Self::new();
        for repository in &settings.repositories {
            registry.register(Arc::new(FsStore::new(
                repository.id.clone(),
                repository.path.clone(),
            )));
        }
        registry
    }

    /// Adds or replaces the store registered under the store's own id.
    pub fn register(&self, store: Arc<dyn ArtifactStore>) {
        let id = store.id().to_string();
        debug!(repository = %id, "registered repository");
        self.stores.write().insert(id, store);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn ArtifactStore>> {
        self.stores.write().remove(id)
    }
}

impl RepositoryRegistry for StoreRegistry {
    fn repository(&self, id: &str) -> Option<Arc<dyn ArtifactStore>> {
        self.stores.read().get(id).cloned()
    }

    fn repository_ids(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }
}

/// Aggregation enabled for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfiguration {
    pub repository_id: String,
    pub properties: BTreeMap<String, String>,
}

impl AggregatorConfiguration {
    pub fn new(repository_id: impl Into<String>) -> Self {
        let repository_id = repository_id.into();
        let mut properties = BTreeMap::new();
        properties.insert(REPOSITORY_PROPERTY.to_string(), repository_id.clone());
        Self {
            repository_id,
            properties,
        }
    }

    /// Builds a configuration from capability properties; `repository` is required.
    pub fn from_properties(properties: BTreeMap<String, String>) -> Result<Self> {
        let repository_id = properties
            .get(REPOSITORY_PROPERTY)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("aggregator capability is missing the [{REPOSITORY_PROPERTY}] property")
            })?;
        Ok(Self {
            repository_id,
            properties,
        })
    }

    /// Configurations for every repository with `aggregate` set.
    pub fn from_settings(settings: &AggregatorSettings) -> Result<Vec<Self>> {
        settings
            .repositories
            .iter()
            .filter(|repository| repository.aggregate)
            .map(|repository| {
                let mut properties = repository.properties.clone();
                properties.insert(REPOSITORY_PROPERTY.to_string(), repository.id.clone());
                Self::from_properties(properties)
            })
            .collect()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// The set of repositories aggregation is currently enabled for.
#[derive(Debug, Default)]
pub struct AggregatorConfigurations {
    enabled: RwLock<BTreeMap<String, AggregatorConfiguration>>,
}

impl AggregatorConfigurations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the configuration it replaced, if any.
    pub fn enable(&self, configuration: AggregatorConfiguration) -> Option<AggregatorConfiguration> {
        info!(repository = %configuration.repository_id, "aggregation enabled");
        self.enabled
            .write()
            .insert(configuration.repository_id.clone(), configuration)
    }

    pub fn disable(&self, repository_id: &str) -> Option<AggregatorConfiguration> {
        let removed = self.enabled.write().remove(repository_id);
        if removed.is_some() {
            info!(repository = %repository_id, "aggregation disabled");
        }
        removed
    }

    pub fn is_enabled(&self, repository_id: &str) -> bool {
        self.enabled.read().contains_key(repository_id)
    }

    pub fn get(&self, repository_id: &str) -> Option<AggregatorConfiguration> {
        self.enabled.read().get(repository_id).cloned()
    }

    /// Enabled repository ids in lexicographic order.
    pub fn repository_ids(&self) -> Vec<String> {
        self.enabled.read().keys().cloned().collect()
    }
}
