//! Content cache of resource pack bytes.
//!
//! Packs are keyed by uuid. A pack becomes available either because negotiation
//! finished downloading it ([`PackCache::put`]), because a capture container bundles
//! it ([`PackCache::load_directory`]) or because an earlier session persisted it to the
//! on-disk cache directory ([`PackCache::open`]). Bundled and persisted packs are only
//! registered up front; their bytes are read on the first [`PackCache::get`].
//!
//! The map is sharded (`DashMap`), so concurrent `get`/`put` calls need no external
//! locking and each record update is atomic.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

use super::{PackRecord, ResourcePack};
use crate::capture::CaptureArchive;
use crate::{RelayError, Result};

const PACK_EXTENSION: &str = "pack";
const KEY_EXTENSION: &str = "key";

#[derive(Debug, Clone)]
enum PackSource {
    Memory(Bytes),
    Archive { path: PathBuf, offset: u64, len: u64 },
    Disk(PathBuf),
}

#[derive(Debug)]
struct CacheEntry {
    record: PackRecord,
    source: PackSource,
}

/// Resource pack store shared by one session's negotiation and its consumers.
#[derive(Debug, Default)]
pub struct PackCache {
    entries: DashMap<String, CacheEntry>,
    directory: Option<PathBuf>,
}

impl PackCache {
    /// Create an in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache persisted under `directory`, registering the packs already there.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)
            .map_err(|e| RelayError::file_error(directory.clone(), e))?;

        let cache = Self { entries: DashMap::new(), directory: Some(directory.clone()) };

        let listing =
            std::fs::read_dir(&directory).map_err(|e| RelayError::file_error(directory.clone(), e))?;
        // A uuid left behind in several versions resolves to the most recently written file.
        let mut newest: HashMap<String, (Option<SystemTime>, String, u64, PathBuf)> =
            HashMap::new();
        for item in listing.flatten() {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PACK_EXTENSION) {
                continue;
            }
            let Some((uuid, version)) = parse_pack_file_name(&path) else {
                trace!("Ignoring unrecognised cache file {}", path.display());
                continue;
            };
            let size = match item.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Skipping cached pack {}: {}", path.display(), e);
                    continue;
                }
            };
            let modified = item.metadata().and_then(|meta| meta.modified()).ok();
            if let Some(previous) = newest.get(&uuid) {
                if previous.0 >= modified {
                    debug!("Ignoring older cached version {} of {}", version, uuid);
                    continue;
                }
            }
            newest.insert(uuid.clone(), (modified, version, size, path));
        }

        for (uuid, (_, version, size, path)) in newest {
            let content_key = std::fs::read_to_string(path.with_extension(KEY_EXTENSION)).ok();
            let record = PackRecord::complete(uuid.clone(), version, content_key, size);
            cache.entries.insert(uuid, CacheEntry { record, source: PackSource::Disk(path) });
        }

        debug!("Pack cache at {} holds {} packs", directory.display(), cache.entries.len());
        Ok(cache)
    }

    /// Insert or overwrite a pack whose bytes are fully available.
    pub fn put(
        &self,
        uuid: &str,
        version: &str,
        content_key: Option<String>,
        data: Bytes,
    ) -> PackRecord {
        let record = PackRecord::complete(uuid, version, content_key, data.len() as u64);
        self.persist(&record, &data);

        self.entries.insert(
            uuid.to_string(),
            CacheEntry { record: record.clone(), source: PackSource::Memory(data) },
        );
        debug!(uuid = %uuid, version = %version, size = record.declared_size, "Pack cached");
        record
    }

    /// Pack bytes for `uuid`, reading them from their backing file on first access.
    pub fn get(&self, uuid: &str) -> Result<Bytes> {
        let (source, declared) = self
            .entries
            .get(uuid)
            .map(|entry| (entry.source.clone(), entry.record.declared_size))
            .ok_or_else(|| RelayError::PackNotFound { uuid: uuid.to_string() })?;

        let data = match source {
            PackSource::Memory(data) => return Ok(data),
            PackSource::Archive { path, offset, len } => read_range(&path, offset, len)?,
            PackSource::Disk(path) => {
                Bytes::from(std::fs::read(&path).map_err(|e| RelayError::file_error(path, e))?)
            }
        };

        if data.len() as u64 != declared {
            return Err(RelayError::SizeMismatch {
                uuid: uuid.to_string(),
                declared,
                received: data.len() as u64,
            });
        }

        if let Some(mut entry) = self.entries.get_mut(uuid) {
            entry.source = PackSource::Memory(data.clone());
        }
        trace!(uuid = %uuid, size = data.len(), "Pack bytes materialised");
        Ok(data)
    }

    /// Resolve a cached pack into the form exposed to connection consumers.
    pub fn resolve(&self, uuid: &str) -> Result<ResourcePack> {
        let record =
            self.record(uuid).ok_or_else(|| RelayError::PackNotFound { uuid: uuid.to_string() })?;
        let data = self.get(uuid)?;
        Ok(ResourcePack::new(record.uuid, record.version, record.content_key, data))
    }

    /// Register every pack bundled in a capture container without reading its bytes.
    pub fn load_directory(&self, archive: &CaptureArchive) -> usize {
        for entry in archive.pack_entries() {
            let content_key = Some(entry.content_key.clone());
            let record = PackRecord::complete(&entry.uuid, &entry.version, content_key, entry.size);
            let source = PackSource::Archive {
                path: archive.path().to_path_buf(),
                offset: entry.offset,
                len: entry.size,
            };
            self.entries.insert(entry.uuid.clone(), CacheEntry { record, source });
        }
        debug!(
            "Registered {} bundled packs from {}",
            archive.pack_entries().len(),
            archive.path().display()
        );
        archive.pack_entries().len()
    }

    /// Snapshot of every record.
    pub fn list(&self) -> Vec<PackRecord> {
        let mut records: Vec<PackRecord> =
            self.entries.iter().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        records
    }

    pub fn record(&self, uuid: &str) -> Option<PackRecord> {
        self.entries.get(uuid).map(|entry| entry.record.clone())
    }

    /// Whether `uuid` at exactly `version` is available without downloading.
    pub fn is_complete(&self, uuid: &str, version: &str) -> bool {
        self.entries
            .get(uuid)
            .is_some_and(|entry| entry.record.is_complete() && entry.record.version == version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write a finished pack into the cache directory. Failures only cost a re-download.
    fn persist(&self, record: &PackRecord, data: &Bytes) {
        let Some(directory) = &self.directory else {
            return;
        };
        if !is_safe_file_component(&record.uuid) || !is_safe_version(&record.version) {
            warn!(
                "Not persisting pack {:?} version {:?}: unsafe file name",
                record.uuid, record.version
            );
            return;
        }
        let path = directory.join(pack_file_name(&record.uuid, &record.version));
        if path.parent() != Some(directory.as_path()) {
            warn!("Not persisting pack {}: {} escapes the cache", record.uuid, path.display());
            return;
        }

        if let Err(e) = std::fs::write(&path, data) {
            warn!("Failed to persist pack {} to {}: {}", record.uuid, path.display(), e);
            return;
        }
        let key_path = path.with_extension(KEY_EXTENSION);
        match &record.content_key {
            Some(key) => {
                if let Err(e) = std::fs::write(&key_path, key) {
                    warn!("Failed to persist content key for {}: {}", record.uuid, e);
                }
            }
            None => {
                let _ = std::fs::remove_file(&key_path);
            }
        }
        self.remove_stale_versions(directory, record);
    }

    /// Delete files of other versions of `record.uuid` so one version survives per pack.
    fn remove_stale_versions(&self, directory: &Path, record: &PackRecord) {
        let Ok(listing) = std::fs::read_dir(directory) else {
            return;
        };
        for item in listing.flatten() {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PACK_EXTENSION) {
                continue;
            }
            let Some((uuid, version)) = parse_pack_file_name(&path) else {
                continue;
            };
            if uuid != record.uuid || version == record.version {
                continue;
            }
            debug!("Removing superseded version {} of {}", version, uuid);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
            let _ = std::fs::remove_file(path.with_extension(KEY_EXTENSION));
        }
    }
}

fn pack_file_name(uuid: &str, version: &str) -> String {
    format!("{uuid}_{version}.{PACK_EXTENSION}")
}

/// Plain file name characters only; no separators, no leading dot.
fn is_safe_file_component(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Versions additionally exclude `_`, which separates them from the uuid on disk.
fn is_safe_version(version: &str) -> bool {
    is_safe_file_component(version) && !version.contains('_')
}

/// `<uuid>_<version>.pack` → (uuid, version). Versions never contain `_`.
fn parse_pack_file_name(path: &Path) -> Option<(String, String)> {
    let stem = path.file_stem()?.to_str()?;
    let (uuid, version) = stem.rsplit_once('_')?;
    if uuid.is_empty() || version.is_empty() {
        return None;
    }
    Some((uuid.to_string(), version.to_string()))
}

fn read_range(path: &Path, offset: u64, len: u64) -> Result<Bytes> {
    let mut file = File::open(path).map_err(|e| RelayError::file_error(path.to_path_buf(), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| RelayError::file_error(path.to_path_buf(), e))?;

    let mut data = vec![0u8; len as usize];
    file.read_exact(&mut data).map_err(|e| RelayError::file_error(path.to_path_buf(), e))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packs::PackState;
    use std::sync::Arc;

    #[test]
    fn put_then_get_returns_the_bytes() {
        let cache = PackCache::new();
        let record = cache.put("pack-a", "1.0.0", None, Bytes::from_static(b"abc"));

        assert_eq!(record.state, PackState::Complete);
        assert_eq!(record.received_bytes, 3);
        assert_eq!(cache.get("pack-a").unwrap(), Bytes::from_static(b"abc"));
        assert!(cache.is_complete("pack-a", "1.0.0"));
        assert!(!cache.is_complete("pack-a", "2.0.0"));
    }

    #[test]
    fn put_is_idempotent_and_overwrites() {
        let cache = PackCache::new();
        cache.put("pack-a", "1.0.0", None, Bytes::from_static(b"old"));
        cache.put("pack-a", "1.0.0", None, Bytes::from_static(b"newer"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("pack-a").unwrap(), Bytes::from_static(b"newer"));
        assert_eq!(cache.record("pack-a").unwrap().declared_size, 5);
    }

    #[test]
    fn missing_packs_are_not_found() {
        let cache = PackCache::new();
        assert!(matches!(cache.get("nope"), Err(RelayError::PackNotFound { .. })));
    }

    #[test]
    fn list_is_a_sorted_snapshot() {
        let cache = PackCache::new();
        cache.put("b", "1", None, Bytes::new());
        cache.put("a", "1", Some("key".into()), Bytes::new());

        let uuids: Vec<_> = cache.list().into_iter().map(|r| r.uuid).collect();
        assert_eq!(uuids, vec!["a", "b"]);
        assert!(cache.resolve("a").unwrap().encrypted());
    }

    #[test]
    fn concurrent_puts_and_gets_do_not_interfere() {
        let cache = Arc::new(PackCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let uuid = format!("pack-{i}");
                    cache.put(&uuid, "1.0.0", None, Bytes::from(vec![i as u8; 64]));
                    cache.get(&uuid).unwrap()
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), Bytes::from(vec![i as u8; 64]));
        }
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn disk_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = PackCache::open(dir.path()).unwrap();
            cache.put("pack-a", "1.2.3", Some("secret".into()), Bytes::from_static(b"payload"));
        }

        let reopened = PackCache::open(dir.path()).unwrap();
        let record = reopened.record("pack-a").expect("persisted record");
        assert_eq!(record.version, "1.2.3");
        assert_eq!(record.content_key.as_deref(), Some("secret"));
        assert_eq!(reopened.get("pack-a").unwrap(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn unsafe_names_stay_in_memory_and_off_disk() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("packs");
        let cache = PackCache::open(&dir).unwrap();

        cache.put("../escaped", "1.0.0", Some("key".into()), Bytes::from_static(b"data"));
        cache.put("pack-b", "../../up", None, Bytes::from_static(b"data"));
        cache.put("/abs/pack", "1.0.0", None, Bytes::from_static(b"data"));

        assert!(!root.path().join("escaped_1.0.0.pack").exists());
        assert!(!root.path().join("escaped_1.0.0.key").exists());
        assert!(!root.path().join("up.pack").exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        assert_eq!(cache.get("../escaped").unwrap(), Bytes::from_static(b"data"));
        assert_eq!(cache.get("pack-b").unwrap(), Bytes::from_static(b"data"));
    }

    #[test]
    fn file_name_components_are_checked() {
        assert!(is_safe_file_component("0f5c-77aa_pack.v2"));
        assert!(!is_safe_file_component(""));
        assert!(!is_safe_file_component(".."));
        assert!(!is_safe_file_component(".hidden"));
        assert!(!is_safe_file_component("a/b"));
        assert!(!is_safe_file_component("a\\b"));
        assert!(is_safe_version("1.0.0"));
        assert!(!is_safe_version("1_0"));
    }

    #[test]
    fn newer_version_replaces_the_older_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = PackCache::open(dir.path()).unwrap();
            cache.put("pack-a", "1.0.0", Some("old".into()), Bytes::from_static(b"v1"));
            cache.put("pack-a", "2.0.0", None, Bytes::from_static(b"v2!"));
        }

        assert!(!dir.path().join("pack-a_1.0.0.pack").exists());
        assert!(!dir.path().join("pack-a_1.0.0.key").exists());
        let reopened = PackCache::open(dir.path()).unwrap();
        assert!(reopened.is_complete("pack-a", "2.0.0"));
        assert_eq!(reopened.get("pack-a").unwrap(), Bytes::from_static(b"v2!"));
    }

    #[test]
    fn reopening_with_several_versions_keeps_the_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("pack-a_9.0.0.pack");
        let newer = dir.path().join("pack-a_1.0.0.pack");
        std::fs::write(&older, b"old").unwrap();
        std::fs::write(&newer, b"newer").unwrap();
        let now = SystemTime::now();
        File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(now - std::time::Duration::from_secs(3600))
            .unwrap();
        File::options().write(true).open(&newer).unwrap().set_modified(now).unwrap();

        for _ in 0..3 {
            let cache = PackCache::open(dir.path()).unwrap();
            assert_eq!(cache.len(), 1);
            assert!(cache.is_complete("pack-a", "1.0.0"));
            assert_eq!(cache.get("pack-a").unwrap(), Bytes::from_static(b"newer"));
        }
    }

    #[test]
    fn pack_file_names_split_on_the_last_underscore() {
        let parsed = parse_pack_file_name(Path::new("/c/my_pack_1.0.0.pack"));
        assert_eq!(parsed, Some(("my_pack".to_string(), "1.0.0".to_string())));
        assert_eq!(parse_pack_file_name(Path::new("/c/nounderscore.pack")), None);
    }
}
