use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cas::eviction::RandomEvictionSet;
use crate::cas::ContentAddressableStorage;
use crate::digest::{Digest, DigestKeyer};
use crate::error::Result;
use crate::types::{Command, Directory, Tree};

/// memoizes parsed directory objects
///
/// holds at most `max_directories` entries; a random one is dropped to make
/// room. the lock is not held while fetching, so two concurrent misses for the
/// same digest may both hit the base store.
pub struct DirectoryCachingContentAddressableStorage {
    base: Arc<dyn ContentAddressableStorage>,
    keyer: DigestKeyer,
    max_directories: usize,
    directories: Mutex<RandomEvictionSet<Directory>>,
}

impl DirectoryCachingContentAddressableStorage {
    pub fn new(
        base: Arc<dyn ContentAddressableStorage>,
        keyer: DigestKeyer,
        max_directories: usize,
    ) -> Self {
        Self {
            base,
            keyer,
            max_directories,
            directories: Mutex::new(RandomEvictionSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.directories.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.lock().is_empty()
    }
}

impl ContentAddressableStorage for DirectoryCachingContentAddressableStorage {
    fn get_command(&self, instance: &str, digest: &Digest) -> Result<Command> {
        self.base.get_command(instance, digest)
    }

    fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Directory> {
        let key = self.keyer.key(instance, digest)?;
        if let Some(directory) = self.directories.lock().get(&key) {
            return Ok(directory.clone());
        }

        let directory = self.base.get_directory(instance, digest)?;

        let mut directories = self.directories.lock();
        while !directories.is_empty() && directories.len() >= self.max_directories {
            directories.remove_random();
        }
        if self.max_directories > 0 {
            directories.insert(key, directory.clone());
        }
        Ok(directory)
    }

    fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        path: &Path,
        is_executable: bool,
    ) -> Result<()> {
        self.base.get_file(instance, digest, path, is_executable)
    }

    fn put_file(&self, instance: &str, path: &Path) -> Result<(Digest, bool)> {
        self.base.put_file(instance, path)
    }

    fn put_tree(&self, instance: &str, tree: &Tree) -> Result<Digest> {
        self.base.put_tree(instance, tree)
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }
}
