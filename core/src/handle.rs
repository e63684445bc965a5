//! Typed handles onto stored structures.
//!
//! A handle pairs a pointer with the capabilities the structure layer
//! grants for it. The facade operations below check for the capability
//! they need and fail with [`ArborError::InvalidHandle`] when it is absent.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;

use crate::codec::Value;
use crate::error::{ArborError, ArborResult};
use crate::storage::engine::Database;
use crate::storage::layout::TypeTag;
use crate::storage::pointer::SmartPointer;

/// Size and footprint of a structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub entries: usize,
    pub blocks: usize,
    pub bytes: usize,
}

pub type Entry = (Value, Value);

/// Read access to a structure's contents.
#[async_trait]
pub trait HandleReader: Send + Sync {
    async fn size(&self) -> ArborResult<usize>;

    async fn stats(&self) -> ArborResult<HandleStats>;

    async fn keys(&self) -> ArborResult<Vec<Value>>;

    async fn values(&self) -> ArborResult<Vec<Value>>;

    async fn entries(&self) -> ArborResult<Vec<Entry>>;

    /// Entries with `start <= key < end`; open bounds are `None`.
    async fn range(&self, start: Option<&Value>, end: Option<&Value>) -> ArborResult<Vec<Entry>>;

    fn stream_entries(&self) -> BoxStream<'_, ArborResult<Entry>>;
}

/// Structural mutation.
#[async_trait]
pub trait HandleWriter: Send + Sync {
    async fn create_map(&self, key: &str) -> ArborResult<Handle>;

    async fn create_list(&self, key: &str) -> ArborResult<Handle>;

    async fn create_object(&self, key: &str, value: Value) -> ArborResult<Handle>;

    /// Rewrite the structure into the fewest blocks.
    async fn compact(&self) -> ArborResult<()>;
}

/// Key lookup without materializing values.
#[async_trait]
pub trait HandleNavigator: Send + Sync {
    async fn has(&self, key: &Value) -> ArborResult<bool>;
}

#[derive(Clone)]
pub struct Handle {
    pointer: SmartPointer,
    reader: Option<Arc<dyn HandleReader>>,
    writer: Option<Arc<dyn HandleWriter>>,
    navigator: Option<Arc<dyn HandleNavigator>>,
}

impl Handle {
    /// Handle with no capabilities.
    pub fn new(pointer: SmartPointer) -> Self {
        Self {
            pointer,
            reader: None,
            writer: None,
            navigator: None,
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn HandleReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn HandleWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn HandleNavigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn pointer(&self) -> &SmartPointer {
        &self.pointer
    }

    pub fn type_tag(&self) -> TypeTag {
        self.pointer.type_tag
    }

    pub fn reader(&self) -> ArborResult<&Arc<dyn HandleReader>> {
        self.reader.as_ref().ok_or(ArborError::InvalidHandle("reader"))
    }

    pub fn writer(&self) -> ArborResult<&Arc<dyn HandleWriter>> {
        self.writer.as_ref().ok_or(ArborError::InvalidHandle("writer"))
    }

    pub fn navigator(&self) -> ArborResult<&Arc<dyn HandleNavigator>> {
        self.navigator
            .as_ref()
            .ok_or(ArborError::InvalidHandle("navigator"))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("pointer", &self.pointer)
            .field("reader", &self.reader.is_some())
            .field("writer", &self.writer.is_some())
            .field("navigator", &self.navigator.is_some())
            .finish()
    }
}

// Facade operations

impl Database {
    pub async fn create_map(&self, handle: &Handle, key: &str) -> ArborResult<Handle> {
        let writer = handle.writer()?;
        self.execute(|| writer.create_map(key)).await
    }

    pub async fn create_list(&self, handle: &Handle, key: &str) -> ArborResult<Handle> {
        let writer = handle.writer()?;
        self.execute(|| writer.create_list(key)).await
    }

    pub async fn create_object(&self, handle: &Handle, key: &str, value: Value) -> ArborResult<Handle> {
        let writer = handle.writer()?;
        self.execute(|| writer.create_object(key, value)).await
    }

    pub async fn compact(&self, handle: &Handle) -> ArborResult<()> {
        let writer = handle.writer()?;
        self.batch(|| writer.compact()).await
    }

    pub async fn has(&self, handle: &Handle, key: &Value) -> ArborResult<bool> {
        let navigator = handle.navigator()?;
        self.run_read(|| navigator.has(key)).await
    }

    pub async fn size(&self, handle: &Handle) -> ArborResult<usize> {
        let reader = handle.reader()?;
        self.run_read(|| reader.size()).await
    }

    pub async fn handle_stats(&self, handle: &Handle) -> ArborResult<HandleStats> {
        let reader = handle.reader()?;
        self.run_read(|| reader.stats()).await
    }

    pub async fn keys(&self, handle: &Handle) -> ArborResult<Vec<Value>> {
        let reader = handle.reader()?;
        self.run_read(|| reader.keys()).await
    }

    pub async fn values(&self, handle: &Handle) -> ArborResult<Vec<Value>> {
        let reader = handle.reader()?;
        self.run_read(|| reader.values()).await
    }

    pub async fn entries(&self, handle: &Handle) -> ArborResult<Vec<Entry>> {
        let reader = handle.reader()?;
        self.run_read(|| reader.entries()).await
    }

    pub async fn range(
        &self,
        handle: &Handle,
        start: Option<&Value>,
        end: Option<&Value>,
    ) -> ArborResult<Vec<Entry>> {
        let reader = handle.reader()?;
        self.run_read(|| reader.range(start, end)).await
    }

    /// Streams are not coordinated; each item is read when polled.
    pub fn stream_entries<'a>(
        &self,
        handle: &'a Handle,
    ) -> ArborResult<BoxStream<'a, ArborResult<Entry>>> {
        Ok(handle.reader()?.stream_entries())
    }

    pub fn stream_keys<'a>(&self, handle: &'a Handle) -> ArborResult<BoxStream<'a, ArborResult<Value>>> {
        let entries = handle.reader()?.stream_entries();
        Ok(Box::pin(entries.map_ok(|(key, _)| key)))
    }

    pub fn stream_values<'a>(
        &self,
        handle: &'a Handle,
    ) -> ArborResult<BoxStream<'a, ArborResult<Value>>> {
        let entries = handle.reader()?.stream_entries();
        Ok(Box::pin(entries.map_ok(|(_, value)| value)))
    }
}
