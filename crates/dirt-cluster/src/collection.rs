//! Watched collections
//!
//! A [`WatchedCollection`] pairs a [`PathChildrenCache`] with a pure
//! converter. Snapshots hold one cache generation and convert lazily, so
//! iterating never blocks on I/O and never observes a half-applied update.

use crate::cache::{ChildData, ChildMap, PathChildrenCache};
use crate::error::Result;
use crate::node::{decode_attributes, Container};
use crate::paths;
use std::collections::btree_map;
use std::sync::Arc;
use tracing::warn;

/// Converts cached children into domain values
pub trait ChildConverter: Send + Sync + 'static {
    type Output;

    fn convert(&self, child: &ChildData) -> Result<Self::Output>;
}

/// Container id from the node name, attributes from the node data
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerConverter;

impl ChildConverter for ContainerConverter {
    type Output = Container;

    fn convert(&self, child: &ChildData) -> Result<Container> {
        Ok(Container {
            id: paths::strip_path(&child.path).to_string(),
            attributes: decode_attributes(&child.data)?,
        })
    }
}

/// Identity conversion
#[derive(Debug, Clone, Copy, Default)]
pub struct RawConverter;

impl ChildConverter for RawConverter {
    type Output = ChildData;

    fn convert(&self, child: &ChildData) -> Result<ChildData> {
        Ok(child.clone())
    }
}

/// A cache with a converter applied at read time
pub struct WatchedCollection<C> {
    cache: Arc<PathChildrenCache>,
    converter: Arc<C>,
}

impl<C: ChildConverter> WatchedCollection<C> {
    pub fn new(cache: Arc<PathChildrenCache>, converter: C) -> Self {
        Self {
            cache,
            converter: Arc::new(converter),
        }
    }

    pub fn cache(&self) -> &Arc<PathChildrenCache> {
        &self.cache
    }

    pub fn path(&self) -> &str {
        self.cache.path()
    }

    /// Sequence over the current generation
    pub fn snapshot(&self) -> Snapshot<C> {
        Snapshot {
            generation: self.cache.current_data(),
            converter: Some(self.converter.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn close(&self) {
        self.cache.close();
    }
}

impl<C> std::fmt::Debug for WatchedCollection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedCollection")
            .field("cache", &self.cache)
            .finish()
    }
}

/// Immutable view of one cache generation. Every call to [`iter`](Self::iter)
/// starts over and converts elements as they are reached.
pub struct Snapshot<C> {
    generation: Arc<ChildMap>,
    converter: Option<Arc<C>>,
}

impl<C> Clone for Snapshot<C> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation.clone(),
            converter: self.converter.clone(),
        }
    }
}

impl<C: ChildConverter> Snapshot<C> {
    pub fn empty() -> Self {
        Self {
            generation: Arc::new(ChildMap::new()),
            converter: None,
        }
    }

    /// Raw children in this generation (conversion failures included)
    pub fn len(&self) -> usize {
        self.generation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generation.is_empty()
    }

    pub fn iter(&self) -> SnapshotIter<'_, C> {
        SnapshotIter {
            children: self.generation.values(),
            converter: self.converter.as_deref(),
        }
    }
}

impl<'a, C: ChildConverter> IntoIterator for &'a Snapshot<C> {
    type Item = C::Output;
    type IntoIter = SnapshotIter<'a, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`Snapshot`]; elements that fail conversion are logged
/// and skipped
pub struct SnapshotIter<'a, C> {
    children: btree_map::Values<'a, String, ChildData>,
    converter: Option<&'a C>,
}

impl<C: ChildConverter> Iterator for SnapshotIter<'_, C> {
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        let converter = self.converter?;
        for child in self.children.by_ref() {
            match converter.convert(child) {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(path = %child.path, error = %e, "Skipping unconvertible child");
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.converter {
            Some(_) => (0, Some(self.children.len())),
            None => (0, Some(0)),
        }
    }
}
