use crate::{
    error::{error_validation, Error},
    utils, DEFAULT_MAX_NODE_SIZE,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Smallest supported node capacity, a split needs at least one entry on each side.
pub(crate) const MIN_MAX_NODE_SIZE: usize = 2;

/// Options for a [crate::BTree]
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TreeOptions {
    /// Capacity of the in-memory node cache, measured in entries (each node weighs its number
    /// of entries plus one).
    ///
    /// The cache only avoids storage loads, a node evicted from it is transparently reloaded.
    /// Setting it to `0` disables caching (the root node is still kept in memory).
    ///
    /// Default: `65536`
    pub node_cache_size: usize,
}

impl TreeOptions {
    /// A new default TreeOptions
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_cache_size: 64 * 1024,
        }
    }
}

/// Options for a [crate::FileStorage]
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FileStorageOptions {
    pub(crate) path: PathBuf,
    /// Maximum number of entries per node. Fixed when the storage is created,
    /// reopening with a different value returns an error.
    ///
    /// Default: `64`
    pub max_node_size: usize,
    /// Disables all calls to `fsync`.
    ///
    /// Use cases include speeding up tests or throw away trees.
    ///
    /// Default: `false`
    pub disable_fsync: bool,
    /// Whether to verify record checksums on every node read. Checksums are always verified
    /// when the log is replayed on open.
    ///
    /// Default: `false`
    pub use_checksums: bool,
    /// How long to wait when acquiring the directory file lock.
    ///
    /// Default: `5 seconds`
    pub file_lock_timeout: Duration,
}

/// The subset of [FileStorageOptions] that is fixed at creation time.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) struct StoredOptions {
    pub max_node_size: usize,
}

impl FileStorageOptions {
    /// Creates new Options at the specified directory path. The storage will be initialized if it doesn't exists.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            disable_fsync: false,
            use_checksums: false,
            file_lock_timeout: Duration::from_secs(5),
        }
    }

    /// The storage directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        validate_max_node_size(self.max_node_size)
    }

    pub(crate) fn stored(&self) -> StoredOptions {
        StoredOptions {
            max_node_size: self.max_node_size,
        }
    }
}

pub(crate) fn validate_max_node_size(max_node_size: usize) -> Result<(), Error> {
    if max_node_size < MIN_MAX_NODE_SIZE || max_node_size > u32::MAX as usize {
        return Err(error_validation!(
            "max_node_size ({max_node_size}) must be between {MIN_MAX_NODE_SIZE} and {}",
            u32::MAX
        ));
    }
    Ok(())
}

impl StoredOptions {
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub(crate) fn read_from_folder(path: &Path) -> Result<Option<Self>, Error> {
        let path = path.join("OPTIONS");
        if path.exists() {
            Self::from_bytes(&std::fs::read(path)?).map(Some)
        } else {
            Ok(None)
        }
    }

    pub(crate) fn write_to_folder(&self, folder: &Path) -> Result<bool, Error> {
        let path = folder.join("OPTIONS");
        let bytes = self.to_bytes()?;
        if path.exists() && std::fs::read(&path)? == bytes {
            return Ok(false);
        }
        utils::atomic_file_write(&path, &bytes)?;
        utils::sync_dir(folder)?;
        Ok(true)
    }

    pub(crate) fn validate_existing(&self, existing: &Self) -> Result<(), Error> {
        if self.max_node_size != existing.max_node_size {
            return Err(error_validation!(
                "max_node_size doesn't match options {} existing {}",
                self.max_node_size,
                existing.max_node_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_options_round_trip_through_folder() {
        let f = tempfile::tempdir().unwrap();
        let stored = FileStorageOptions::new(f.path()).stored();
        assert_eq!(StoredOptions::read_from_folder(f.path()).unwrap(), None);
        assert!(stored.write_to_folder(f.path()).unwrap());
        assert!(!stored.write_to_folder(f.path()).unwrap());
        let read = StoredOptions::read_from_folder(f.path()).unwrap().unwrap();
        assert_eq!(read, stored);

        let other = StoredOptions { max_node_size: 8 };
        assert!(matches!(other.validate_existing(&read), Err(Error::Validation(_))));
    }

    #[test]
    fn max_node_size_bounds() {
        assert!(validate_max_node_size(1).is_err());
        assert!(validate_max_node_size(2).is_ok());
        let mut opts = FileStorageOptions::new("unused");
        opts.max_node_size = 0;
        assert!(opts.validate().is_err());
    }
}
