use crate::error::{FxError, FxResult};
use crate::models::CacheEntry;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Rate tables keyed by base currency, mirrored to a JSON file.
pub struct RateStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    // serialises file writes; both share one temp path
    write_lock: Mutex<()>,
}

impl RateStore {
    /// Opens the store at `path`. A missing or unreadable file yields an empty
    /// store; individual corrupt entries are dropped.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load_cache(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable rate cache");
                HashMap::new()
            }
        };
        debug!(path = %path.display(), bases = entries.len(), "Rate cache loaded");

        Self {
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the entry for `base` regardless of staleness. Corrupt entries
    /// are evicted and reported as absent.
    pub fn get(&self, base: &str) -> Option<CacheEntry> {
        let entry = self.entries.read().get(base).cloned()?;
        match entry.validate() {
            Ok(()) => Some(entry),
            Err(reason) => {
                warn!(base, %reason, "Discarding corrupt cache entry");
                self.entries.write().remove(base);
                None
            }
        }
    }

    /// Stores `entry` and rewrites the cache file.
    pub fn put(&self, entry: CacheEntry) -> FxResult<()> {
        let _guard = self.write_lock.lock();
        let snapshot = {
            let mut entries = self.entries.write();
            entries.insert(entry.base.clone(), entry);
            entries.clone()
        };
        save_cache(&self.path, &snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Writes to a sibling temp file and renames it over the target so readers
/// never see a partial document.
pub fn save_cache(path: &Path, cache: &HashMap<String, CacheEntry>) -> FxResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path(path);
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, cache)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    debug!(path = %path.display(), bases = cache.len(), "Rate cache written");
    Ok(())
}

/// Loads the cache file, dropping entries that fail validation.
pub fn load_cache(path: &Path) -> FxResult<HashMap<String, CacheEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let reader = BufReader::new(file);
    let raw: HashMap<String, serde_json::Value> = serde_json::from_reader(reader)
        .map_err(|e| FxError::CorruptCache(e.to_string()))?;

    let mut cache = HashMap::with_capacity(raw.len());
    for (base, value) in raw {
        match parse_entry(&base, value) {
            Ok(entry) => {
                cache.insert(base, entry);
            }
            Err(e) => warn!(base = %base, error = %e, "Dropping cache entry"),
        }
    }
    Ok(cache)
}

fn parse_entry(base: &str, value: serde_json::Value) -> FxResult<CacheEntry> {
    let entry: CacheEntry =
        serde_json::from_value(value).map_err(|e| FxError::CorruptCache(e.to_string()))?;
    if entry.base != base {
        return Err(FxError::CorruptCache(format!(
            "entry keyed {} claims base {}",
            base, entry.base
        )));
    }
    entry.validate().map_err(FxError::CorruptCache)?;
    Ok(entry)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
