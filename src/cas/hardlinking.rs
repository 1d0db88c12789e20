use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cas::eviction::RandomEvictionSet;
use crate::cas::ContentAddressableStorage;
use crate::digest::{Digest, DigestKeyer};
use crate::error::{Error, Result};
use crate::fs::{clear_directory, create_hardlink};
use crate::hash::Hash;
use crate::types::{Command, Directory, Tree};

/// materializes each input file once and hardlinks it into later builds
///
/// cached copies live in `cache_directory`, one file per
/// `(digest, instance, executable)` key, named by the hash of that key so
/// instance names never become path components. before a new entry is added, random
/// entries are evicted until the cache fits `max_files` and `max_size_bytes`.
///
/// one lock covers bookkeeping, materialization and linking, so an entry
/// cannot be evicted between being found and being linked.
pub struct HardlinkingContentAddressableStorage {
    base: Arc<dyn ContentAddressableStorage>,
    keyer: DigestKeyer,
    cache_directory: PathBuf,
    max_files: usize,
    max_size_bytes: u64,
    state: Mutex<CacheState>,
}

struct CacheState {
    entries: RandomEvictionSet<u64>,
    total_size: u64,
}

impl HardlinkingContentAddressableStorage {
    /// create the cache, discarding whatever a previous process left behind
    pub fn new(
        base: Arc<dyn ContentAddressableStorage>,
        keyer: DigestKeyer,
        cache_directory: impl Into<PathBuf>,
        max_files: usize,
        max_size_bytes: u64,
    ) -> Result<Self> {
        let cache_directory = cache_directory.into();
        clear_directory(&cache_directory)?;
        Ok(Self {
            base,
            keyer,
            cache_directory,
            max_files,
            max_size_bytes,
            state: Mutex::new(CacheState {
                entries: RandomEvictionSet::new(),
                total_size: 0,
            }),
        })
    }

    /// number of cached files
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// total bytes held by cached files
    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_directory.join(Hash::of(key.as_bytes()).to_hex())
    }

    fn make_space(&self, state: &mut CacheState, size: u64) -> Result<()> {
        while !state.entries.is_empty()
            && (state.entries.len() >= self.max_files
                || state.total_size + size > self.max_size_bytes)
        {
            let Some((key, evicted_size)) = state.entries.remove_random() else {
                break;
            };
            state.total_size -= evicted_size;
            let path = self.cache_path(&key);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::Io { path, source: e });
                }
            }
            tracing::debug!(key = %key, size = evicted_size, "evicted cached input file");
        }
        Ok(())
    }
}

impl ContentAddressableStorage for HardlinkingContentAddressableStorage {
    fn get_command(&self, instance: &str, digest: &Digest) -> Result<Command> {
        self.base.get_command(instance, digest)
    }

    fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Directory> {
        self.base.get_directory(instance, digest)
    }

    fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        path: &Path,
        is_executable: bool,
    ) -> Result<()> {
        let mut key = self.keyer.key(instance, digest)?;
        key.push_str(if is_executable { "+x" } else { "-x" });
        let cache_path = self.cache_path(&key);

        let mut state = self.state.lock();
        if !state.entries.contains(&key) {
            let size = digest.size();
            self.make_space(&mut state, size)?;
            self.base.get_file(instance, digest, &cache_path, is_executable)?;
            state.entries.insert(key, size);
            state.total_size += size;
        }
        create_hardlink(&cache_path, path)
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blobstore::{put_bytes, MemoryBlobAccess, MerkleBlobAccess};
    use crate::cas::BlobAccessContentAddressableStorage;
    use std::os::unix::fs::MetadataExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// CAS that counts how often files are materialized
    pub(crate) struct CountingCas {
        pub inner: BlobAccessContentAddressableStorage,
        pub get_file_calls: AtomicUsize,
        pub get_directory_calls: AtomicUsize,
    }

    impl CountingCas {
        pub fn new(blob_access: Arc<MemoryBlobAccess>) -> Self {
            Self {
                inner: BlobAccessContentAddressableStorage::new(Arc::new(MerkleBlobAccess::new(
                    blob_access,
                ))),
                get_file_calls: AtomicUsize::new(0),
                get_directory_calls: AtomicUsize::new(0),
            }
        }
    }

    impl ContentAddressableStorage for CountingCas {
        fn get_command(&self, instance: &str, digest: &Digest) -> Result<Command> {
            self.inner.get_command(instance, digest)
        }

        fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Directory> {
            self.get_directory_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_directory(instance, digest)
        }

        fn get_file(
            &self,
            instance: &str,
            digest: &Digest,
            path: &Path,
            is_executable: bool,
        ) -> Result<()> {
            self.get_file_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_file(instance, digest, path, is_executable)
        }

        fn put_file(&self, instance: &str, path: &Path) -> Result<(Digest, bool)> {
            self.inner.put_file(instance, path)
        }

        fn put_tree(&self, instance: &str, tree: &Tree) -> Result<Digest> {
            self.inner.put_tree(instance, tree)
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    fn store(blobs: &MemoryBlobAccess, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(data);
        put_bytes(blobs, "", &digest, data.to_vec()).unwrap();
        digest
    }

    #[test]
    fn test_same_key_materialized_once() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let digest = store(&blobs, b"input");
        let counting = Arc::new(CountingCas::new(blobs));
        let cas = HardlinkingContentAddressableStorage::new(
            counting.clone(),
            DigestKeyer::WithoutInstance,
            dir.path().join("cache"),
            10,
            1 << 20,
        )
        .unwrap();

        let first = dir.path().join("first");
        let second = dir.path().join("second");
        cas.get_file("", &digest, &first, false).unwrap();
        cas.get_file("", &digest, &second, false).unwrap();

        assert_eq!(counting.get_file_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&second).unwrap(), b"input");
        assert_eq!(
            fs::metadata(&first).unwrap().ino(),
            fs::metadata(&second).unwrap().ino()
        );

        // the executable bit is part of the key
        cas.get_file("", &digest, &dir.path().join("third"), true).unwrap();
        assert_eq!(counting.get_file_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cas.len(), 2);
    }

    #[test]
    fn test_file_count_bound() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let digests: Vec<Digest> = (0..5)
            .map(|i| store(&blobs, format!("file {}", i).as_bytes()))
            .collect();
        let cache_dir = dir.path().join("cache");
        let cas = HardlinkingContentAddressableStorage::new(
            Arc::new(CountingCas::new(blobs)),
            DigestKeyer::WithoutInstance,
            &cache_dir,
            3,
            1 << 20,
        )
        .unwrap();

        for (i, digest) in digests.iter().enumerate() {
            cas.get_file("", digest, &dir.path().join(format!("out{}", i)), false)
                .unwrap();
            assert!(cas.len() <= 3);
        }
        assert_eq!(cas.len(), 3);
        assert_eq!(fs::read_dir(&cache_dir).unwrap().count(), 3);

        // linked outputs survive eviction of their cache entry
        for i in 0..5 {
            assert_eq!(
                fs::read(dir.path().join(format!("out{}", i))).unwrap(),
                format!("file {}", i).as_bytes()
            );
        }
    }

    #[test]
    fn test_size_bound() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let a = store(&blobs, b"aaaaaaaa");
        let b = store(&blobs, b"bbbbbbbb");
        let cas = HardlinkingContentAddressableStorage::new(
            Arc::new(CountingCas::new(blobs)),
            DigestKeyer::WithoutInstance,
            dir.path().join("cache"),
            100,
            12,
        )
        .unwrap();

        cas.get_file("", &a, &dir.path().join("a"), false).unwrap();
        cas.get_file("", &b, &dir.path().join("b"), false).unwrap();
        assert_eq!(cas.len(), 1);
        assert_eq!(cas.total_size(), 8);
    }

    #[test]
    fn test_failed_materialization_is_not_cached() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let cas = HardlinkingContentAddressableStorage::new(
            Arc::new(CountingCas::new(blobs)),
            DigestKeyer::WithoutInstance,
            dir.path().join("cache"),
            10,
            1 << 20,
        )
        .unwrap();

        let missing = Digest::of_bytes(b"missing");
        assert!(cas
            .get_file("", &missing, &dir.path().join("out"), false)
            .is_err());
        assert!(cas.is_empty());
        assert_eq!(cas.total_size(), 0);
    }

    #[test]
    fn test_instance_with_slash_stays_flat() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let digest = store(&blobs, b"scoped input");
        let cache_dir = dir.path().join("cache");
        let cas = HardlinkingContentAddressableStorage::new(
            Arc::new(CountingCas::new(blobs)),
            DigestKeyer::WithInstance,
            &cache_dir,
            10,
            1 << 20,
        )
        .unwrap();

        let out = dir.path().join("out");
        cas.get_file("a/b", &digest, &out, false).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"scoped input");

        let entries: Vec<fs::DirEntry> = fs::read_dir(&cache_dir)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].file_type().unwrap().is_file());
        assert_eq!(entries[0].file_name().len(), 64);
    }
}
