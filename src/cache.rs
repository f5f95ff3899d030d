use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::LabelResult;
use crate::key::LocationKey;
use crate::label::LocationLabel;

/// Disk-backed label cache, one JSON entry per key. Strictly a performance
/// layer: every failure mode degrades to a miss and resolution proceeds
/// without it.
pub struct LabelCacheStore {
    dir: PathBuf,
}

impl LabelCacheStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> LabelResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Returns the cached label, or `None` on absence, unreadable bytes, or
    /// a malformed entry. Corrupt entries are deleted on first failed read
    /// so they cannot poison later lookups.
    pub fn get(&self, key: &LocationKey) -> Option<LocationLabel> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(?err, key = key.as_str(), "cache entry unreadable; treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<LocationLabel>(&bytes) {
            Ok(label) if label.is_well_formed() => Some(label),
            Ok(_) => {
                self.heal(&path, key, "entry failed validation");
                None
            }
            Err(err) => {
                self.heal(&path, key, &format!("entry failed to parse: {err}"));
                None
            }
        }
    }

    /// Atomic write-temp-then-rename so concurrent readers of this key never
    /// observe partial content. Write failures log and degrade; a retried
    /// write to the same key simply supersedes the previous entry.
    pub fn set(&self, key: &LocationKey, label: &LocationLabel) {
        if let Err(err) = self.write_atomic(key, label) {
            warn!(?err, key = key.as_str(), "failed to persist cache entry");
        }
    }

    pub fn entry_path(&self, key: &LocationKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn write_atomic(&self, key: &LocationKey, label: &LocationLabel) -> LabelResult<()> {
        let encoded = serde_json::to_vec(label)?;
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        staged.write_all(&encoded)?;
        staged.flush()?;
        staged
            .persist(self.entry_path(key))
            .map_err(|err| err.error)?;
        debug!(key = key.as_str(), "cache entry written");
        Ok(())
    }

    fn heal(&self, path: &Path, key: &LocationKey, reason: &str) {
        warn!(key = key.as_str(), reason, "deleting corrupt cache entry");
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?err, key = key.as_str(), "failed to delete corrupt cache entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::key::Coordinate;
    use crate::label::LabelTier;

    use super::*;

    fn sample_key() -> LocationKey {
        LocationKey::derive(Coordinate::new(37.422, -122.084), "en-US", 1, 3)
    }

    #[test]
    fn round_trips_a_label() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        let key = sample_key();
        let label = LocationLabel::new("Shoreline Park", LabelTier::Poi, 0.92);

        store.set(&key, &label);
        let loaded = store.get(&key).unwrap();
        assert_eq!(loaded.name, "Shoreline Park");
        assert_eq!(loaded.tier, LabelTier::Poi);
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        assert!(store.get(&sample_key()).is_none());
    }

    #[test]
    fn corrupt_bytes_self_heal() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        let key = sample_key();
        fs::write(store.entry_path(&key), b"{not json").unwrap();

        assert!(store.get(&key).is_none());
        assert!(!store.entry_path(&key).exists());
    }

    #[test]
    fn truncated_entry_self_heals() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        let key = sample_key();
        fs::write(store.entry_path(&key), b"").unwrap();

        assert!(store.get(&key).is_none());
        assert!(!store.entry_path(&key).exists());
    }

    #[test]
    fn out_of_range_confidence_invalidates_entry() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        let key = sample_key();
        fs::write(
            store.entry_path(&key),
            br#"{"name":"X","tier":"poi","confidence":3.5,"updatedAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(store.get(&key).is_none());
        assert!(!store.entry_path(&key).exists());
    }

    #[test]
    fn unknown_tier_invalidates_entry() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        let key = sample_key();
        fs::write(
            store.entry_path(&key),
            br#"{"name":"X","tier":"city","confidence":0.5,"updatedAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(store.get(&key).is_none());
        assert!(!store.entry_path(&key).exists());
    }

    #[test]
    fn rewrite_supersedes_previous_entry() {
        let dir = tempdir().unwrap();
        let store = LabelCacheStore::new(dir.path()).unwrap();
        let key = sample_key();
        store.set(&key, &LocationLabel::new("Old Name", LabelTier::Area, 0.3));
        store.set(&key, &LocationLabel::new("New Name", LabelTier::Street, 0.7));

        let loaded = store.get(&key).unwrap();
        assert_eq!(loaded.name, "New Name");
        assert_eq!(loaded.tier, LabelTier::Street);
    }
}
