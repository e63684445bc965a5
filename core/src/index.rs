//! Secondary index hooks.
//!
//! Search, vector and graph indexes live above the storage core. They
//! register here so their caches and state are flushed at every outermost
//! batch boundary and at checkpoints.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::ArborResult;

#[async_trait]
pub trait IndexManager: Send + Sync {
    fn name(&self) -> &str;

    /// Write buffered index entries into index structures.
    async fn flush_cache(&self) -> ArborResult<()>;

    /// Persist index structures.
    async fn flush(&self) -> ArborResult<()>;
}

#[derive(Default)]
pub struct IndexRegistry {
    managers: RwLock<Vec<Arc<dyn IndexManager>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manager: Arc<dyn IndexManager>) {
        tracing::debug!("Registered index manager '{}'", manager.name());
        self.managers.write().push(manager);
    }

    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.managers
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Every manager's `flush_cache`, then every manager's `flush`.
    ///
    /// A failing manager does not stop the others; the first error is
    /// returned once all have run.
    pub async fn flush_all(&self) -> ArborResult<()> {
        let managers: Vec<_> = self.managers.read().clone();
        let mut first_err = None;

        for manager in &managers {
            if let Err(e) = manager.flush_cache().await {
                tracing::error!("Index '{}' failed to flush its cache: {}", manager.name(), e);
                first_err.get_or_insert(e);
            }
        }
        for manager in &managers {
            if let Err(e) = manager.flush().await {
                tracing::error!("Index '{}' failed to flush: {}", manager.name(), e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArborError;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_cache: bool,
    }

    #[async_trait]
    impl IndexManager for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn flush_cache(&self) -> ArborResult<()> {
            self.log.lock().push(format!("{}:cache", self.name));
            if self.fail_cache {
                return Err(ArborError::Index(format!("{} cache broken", self.name)));
            }
            Ok(())
        }

        async fn flush(&self) -> ArborResult<()> {
            self.log.lock().push(format!("{}:flush", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_caches_flush_before_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = IndexRegistry::new();
        for (name, fail_cache) in [("search", true), ("vector", false)] {
            registry.register(Arc::new(Recorder {
                name,
                log: log.clone(),
                fail_cache,
            }));
        }

        let err = registry.flush_all().await.unwrap_err();
        assert_eq!(err.kind(), "index_error");
        assert_eq!(
            *log.lock(),
            vec!["search:cache", "vector:cache", "search:flush", "vector:flush"]
        );
        assert_eq!(registry.names(), vec!["search", "vector"]);
    }
}
