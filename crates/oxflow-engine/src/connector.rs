//! The contract a source connector satisfies, and the factory registry the
//! host uses to resolve connector names.
//!
//! The engine never instantiates connectors by reflection: the host registers
//! a factory per connector name in a [`ConnectorRegistry`], and the engine
//! resolves the configured `connector.class` value against it.

use crate::error::Result;
use crate::offsets::OffsetStore;
use async_trait::async_trait;
use oxflow_core::{Offset, Partition, SourceRecord};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration handed to connectors and tasks: a flat properties map.
pub type ConnectorConfig = HashMap<String, String>;

/// Read access to previously committed source positions, handed to tasks at
/// start so they can resume where the last run left off.
#[async_trait]
pub trait OffsetReader: Send + Sync {
    /// Committed offsets for the given partitions. Partitions with no
    /// committed offset are absent from the result.
    async fn offsets_for(&self, partitions: &[Partition]) -> Result<HashMap<Partition, Offset>>;

    /// Committed offset for a single partition.
    async fn offset_for(&self, partition: &Partition) -> Result<Option<Offset>> {
        let mut found = self.offsets_for(std::slice::from_ref(partition)).await?;
        Ok(found.remove(partition))
    }
}

/// An [`OffsetReader`] over an [`OffsetStore`].
pub struct StoreOffsetReader {
    store: Arc<dyn OffsetStore>,
}

impl StoreOffsetReader {
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OffsetReader for StoreOffsetReader {
    async fn offsets_for(&self, partitions: &[Partition]) -> Result<HashMap<Partition, Offset>> {
        let committed = self.store.load().await?;
        Ok(partitions
            .iter()
            .filter_map(|p| committed.get(p).map(|o| (p.clone(), o.clone())))
            .collect())
    }
}

/// A source task: the poll-driven worker half of a connector.
#[async_trait]
pub trait SourceTask: Send {
    /// Start the task. Prior positions are available through `offsets`.
    async fn start(&mut self, config: &ConnectorConfig, offsets: Arc<dyn OffsetReader>)
        -> Result<()>;

    /// Return the next batch of records. May block briefly or return an
    /// empty batch when idle.
    async fn poll(&mut self) -> Result<Vec<SourceRecord>>;

    /// Hook invoked after a record has been safely enqueued.
    async fn commit_record(&mut self, _record: &SourceRecord) -> Result<()> {
        Ok(())
    }

    /// Request the task to halt. Must be safe to call more than once.
    async fn stop(&mut self) -> Result<()>;
}

/// A source connector: validates configuration and produces tasks.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Connector name, used in logs.
    fn name(&self) -> &str;

    /// Validate the configuration and return one configuration per task.
    /// The embedded engine runs exactly one task and uses the first.
    async fn initialize(&mut self, config: &ConnectorConfig) -> Result<Vec<ConnectorConfig>>;

    /// Create a task instance.
    fn create_task(&self) -> Box<dyn SourceTask>;

    /// Release connector resources.
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory producing connector instances.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self) -> Box<dyn SourceConnector>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Box<dyn SourceConnector> + Send + Sync,
{
    fn create(&self) -> Box<dyn SourceConnector> {
        self()
    }
}

/// Host-supplied mapping from connector names to factories.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, Arc<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a connector name.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Register a closure factory under a connector name.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn SourceConnector> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Look up a factory.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ConnectorFactory>> {
        self.factories.get(name)
    }

    /// Registered connector names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::MemoryOffsetStore;
    use serde_json::json;

    struct NoopTask;

    #[async_trait]
    impl SourceTask for NoopTask {
        async fn start(&mut self, _: &ConnectorConfig, _: Arc<dyn OffsetReader>) -> Result<()> {
            Ok(())
        }

        async fn poll(&mut self) -> Result<Vec<SourceRecord>> {
            Ok(Vec::new())
        }

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopConnector;

    #[async_trait]
    impl SourceConnector for NoopConnector {
        fn name(&self) -> &str {
            "noop"
        }

        async fn initialize(&mut self, config: &ConnectorConfig) -> Result<Vec<ConnectorConfig>> {
            Ok(vec![config.clone()])
        }

        fn create_task(&self) -> Box<dyn SourceTask> {
            Box::new(NoopTask)
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = ConnectorRegistry::new();
        registry.register_fn("noop", || Box::new(NoopConnector));

        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["noop"]);

        let connector = registry.get("noop").unwrap().create();
        assert_eq!(connector.name(), "noop");
    }

    #[tokio::test]
    async fn test_store_offset_reader() {
        let store = Arc::new(MemoryOffsetStore::new());

        let mut partition = Partition::new();
        partition.insert("server".into(), "db1".into());
        let mut offset = Offset::new();
        offset.insert("pos".into(), json!(100));

        store.stage(partition.clone(), offset.clone());
        store.flush(std::time::Duration::from_secs(1)).await;

        let reader = StoreOffsetReader::new(store as Arc<dyn OffsetStore>);
        assert_eq!(reader.offset_for(&partition).await.unwrap(), Some(offset));

        let mut unknown = Partition::new();
        unknown.insert("server".into(), "other".into());
        assert_eq!(reader.offset_for(&unknown).await.unwrap(), None);
    }
}
