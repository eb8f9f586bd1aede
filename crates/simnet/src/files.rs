//! File extraction rules and their decoded results.
//!
//! A [`FileMapper`] names a file inside every node and a function decoding
//! its content. The simulation runs each mapper once per node after the
//! round, before the fleet is torn down, and stores the decoded values in
//! [`FileValues`] under the mapper's [`FilesKey`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type Decoded = Box<dyn Any + Send + Sync>;

type MapFn = dyn Fn(&[u8]) -> anyhow::Result<Decoded> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilesKey(String);

impl FilesKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct FileMapper {
    pub path: String,
    mapper: Arc<MapFn>,
}

impl FileMapper {
    pub fn new<T, F>(path: impl Into<String>, mapper: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&[u8]) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            mapper: Arc::new(move |bytes| mapper(bytes).map(|v| Box::new(v) as Decoded)),
        }
    }

    pub fn decode(&self, content: &[u8]) -> anyhow::Result<Decoded> {
        (self.mapper)(content)
    }
}

impl fmt::Debug for FileMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapper")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Decoded values per key, then per node name.
#[derive(Default)]
pub struct FileValues {
    values: HashMap<FilesKey, BTreeMap<String, Decoded>>,
}

impl FileValues {
    pub fn insert(&mut self, key: FilesKey, node: impl Into<String>, value: Decoded) {
        self.values.entry(key).or_default().insert(node.into(), value);
    }

    /// Value decoded from `node` for `key`, if present and of type `T`.
    pub fn get<T: Any>(&self, key: &FilesKey, node: &str) -> Option<&T> {
        self.values.get(key)?.get(node)?.downcast_ref()
    }

    /// All values of type `T` decoded for `key`, by node name.
    pub fn all<T: Any>(&self, key: &FilesKey) -> BTreeMap<&str, &T> {
        self.values
            .get(key)
            .map(|by_node| {
                by_node
                    .iter()
                    .filter_map(|(node, value)| Some((node.as_str(), value.downcast_ref()?)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FileValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.values
                    .iter()
                    .map(|(key, by_node)| (key.as_str(), by_node.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}
