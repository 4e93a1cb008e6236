//! Per-file on-disk cache of conversion results.
//!
//! Each source file owns one cache folder named `<basename> <pathHash>`
//! holding `convresult.json`, `info.json`, `log.txt` and any `*.artifact`
//! files the converter produced. Staleness is decided from the file's
//! modification time recorded in the info file; anything unreadable or
//! half-written counts as stale, never as an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cadbridge_shared::{CadBridgeError, ConvResult, Result, file_etag, root_id_for_path};

/// Name of the conversion result file inside a cache folder.
pub const CONV_RESULT_FILE: &str = "convresult.json";

/// Name of the staleness info file inside a cache folder.
pub const INFO_FILE: &str = "info.json";

/// Name of the per-file converter log inside a cache folder.
pub const LOG_FILE: &str = "log.txt";

/// Deterministic cache location for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Document-graph node id of the file.
    pub root_id: String,
    /// Folder holding all cached state for the file.
    pub folder: PathBuf,
    /// Path of the persisted conversion result.
    pub result_file: PathBuf,
    /// Path of the staleness info file.
    pub info_file: PathBuf,
}

impl CacheEntry {
    /// Per-file converter log path.
    pub fn log_file(&self) -> PathBuf {
        self.folder.join(LOG_FILE)
    }
}

/// Contents of `info.json`, written after a successful conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    pub etag: i64,
    pub filepath: PathBuf,
    pub rootid: String,
}

/// Cache of conversion results under a single root folder.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the cache locations for a source file. Pure function of the
    /// path: same path → same entry, distinct paths → distinct entries.
    pub fn entry_for(&self, path: &Path) -> CacheEntry {
        let root_id = root_id_for_path(path);
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // root_id is "hash_" + encoded digest; the folder keeps the digest only.
        let folder = self
            .root
            .join(format!("{basename} {}", &root_id["hash_".len()..]));
        CacheEntry {
            root_id,
            result_file: folder.join(CONV_RESULT_FILE),
            info_file: folder.join(INFO_FILE),
            folder,
        }
    }

    /// Decide whether the cached state for `path` can be reused.
    ///
    /// Stale when the info file is missing or unparsable, when the recorded
    /// etag or filepath no longer matches, when the result file is absent,
    /// or when the result parses to an empty object (interrupted run).
    pub fn is_stale(&self, path: &Path, entry: &CacheEntry) -> bool {
        let info = match std::fs::read_to_string(&entry.info_file)
            .ok()
            .and_then(|s| serde_json::from_str::<CacheInfo>(&s).ok())
        {
            Some(info) => info,
            None => return true,
        };
        let current_etag = match file_etag(path) {
            Ok(etag) => etag,
            Err(_) => return true,
        };
        if info.etag != current_etag || info.filepath != path {
            return true;
        }
        if !entry.result_file.is_file() {
            return true;
        }
        match self.load_result(entry) {
            Some(result) => result.is_empty(),
            None => true,
        }
    }

    /// Delete every file in the cache folder, keeping the folder itself.
    /// Idempotent; a missing folder is fine.
    pub fn clear_entry(&self, entry: &CacheEntry) -> Result<()> {
        let Ok(read) = std::fs::read_dir(&entry.folder) else {
            return Ok(());
        };
        for child in read.flatten() {
            let path = child.path();
            if path.is_file() {
                std::fs::remove_file(&path).map_err(|e| CadBridgeError::io(&path, e))?;
            }
        }
        debug!(folder = %entry.folder.display(), "cleared cache entry");
        Ok(())
    }

    /// Load the persisted conversion result, or `None` when it is missing
    /// or unparsable (both treated as "needs reprocessing" by callers).
    pub fn load_result(&self, entry: &CacheEntry) -> Option<ConvResult> {
        let content = std::fs::read_to_string(&entry.result_file).ok()?;
        match serde_json::from_str(&content) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    file = %entry.result_file.display(),
                    error = %e,
                    "unreadable cached result"
                );
                None
            }
        }
    }

    /// Persist a (possibly rewritten) conversion result back to the cache.
    pub fn store_result(&self, entry: &CacheEntry, result: &ConvResult) -> Result<()> {
        std::fs::create_dir_all(&entry.folder).map_err(|e| CadBridgeError::io(&entry.folder, e))?;
        let content =
            serde_json::to_string(result).map_err(|e| CadBridgeError::validation(e.to_string()))?;
        std::fs::write(&entry.result_file, content)
            .map_err(|e| CadBridgeError::io(&entry.result_file, e))?;
        Ok(())
    }

    /// Write the info file that marks the cache entry as current.
    pub fn write_info(&self, entry: &CacheEntry, path: &Path) -> Result<()> {
        let info = CacheInfo {
            etag: file_etag(path)?,
            filepath: path.to_path_buf(),
            rootid: entry.root_id.clone(),
        };
        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| CadBridgeError::validation(e.to_string()))?;
        std::fs::write(&entry.info_file, content)
            .map_err(|e| CadBridgeError::io(&entry.info_file, e))?;
        Ok(())
    }

    /// Delete the result file of every cache entry whose persisted result
    /// recorded errors, forcing those files to reconvert on the next pass.
    pub fn clear_error_entries(&self) -> Result<usize> {
        let mut cleared = 0usize;
        let Ok(read) = std::fs::read_dir(&self.root) else {
            return Ok(0);
        };
        for child in read.flatten() {
            let folder = child.path();
            let result_file = folder.join(CONV_RESULT_FILE);
            if !result_file.is_file() {
                continue;
            }
            let Some(result) = std::fs::read_to_string(&result_file)
                .ok()
                .and_then(|s| serde_json::from_str::<ConvResult>(&s).ok())
            else {
                continue;
            };
            if result.errors.is_empty() {
                continue;
            }
            let source = std::fs::read_to_string(folder.join(INFO_FILE))
                .ok()
                .and_then(|s| serde_json::from_str::<CacheInfo>(&s).ok())
                .map(|i| i.filepath.display().to_string())
                .unwrap_or_else(|| folder.display().to_string());
            info!(source = %source, "forcing reprocess of errored cache entry");
            std::fs::remove_file(&result_file).map_err(|e| CadBridgeError::io(&result_file, e))?;
            cleared += 1;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadbridge_shared::{ConvInfos, Document, StructureDoc};

    fn sample_result(root_id: &str) -> ConvResult {
        ConvResult {
            docs: vec![Document::Structure(StructureDoc {
                id: root_id.to_string(),
                ts: Some(1),
                ..Default::default()
            })],
            infos: Some(ConvInfos {
                ts: 1,
                extra: Default::default(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn entry_for_is_deterministic_and_injective() {
        let store = CacheStore::new("/tmp/cadbridge-test-cache");
        let a1 = store.entry_for(Path::new("/data/a/Assembly.catproduct"));
        let a2 = store.entry_for(Path::new("/data/a/Assembly.catproduct"));
        let b = store.entry_for(Path::new("/data/b/Assembly.catproduct"));

        assert_eq!(a1, a2);
        assert_ne!(a1.folder, b.folder);
        assert_ne!(a1.root_id, b.root_id);
        assert!(a1
            .folder
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Assembly.catproduct "));
    }

    #[test]
    fn missing_info_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Part.jt");
        std::fs::write(&source, b"part").unwrap();

        let store = CacheStore::new(dir.path().join("cache"));
        let entry = store.entry_for(&source);
        assert!(store.is_stale(&source, &entry));
    }

    #[test]
    fn fresh_entry_is_not_stale_until_touched() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Part.jt");
        std::fs::write(&source, b"part").unwrap();

        let store = CacheStore::new(dir.path().join("cache"));
        let entry = store.entry_for(&source);
        store.store_result(&entry, &sample_result(&entry.root_id)).unwrap();
        store.write_info(&entry, &source).unwrap();

        assert!(!store.is_stale(&source, &entry));

        // Recorded etag mismatch → stale again.
        let mut info: CacheInfo = serde_json::from_str(
            &std::fs::read_to_string(&entry.info_file).unwrap(),
        )
        .unwrap();
        info.etag -= 10;
        std::fs::write(&entry.info_file, serde_json::to_string(&info).unwrap()).unwrap();
        assert!(store.is_stale(&source, &entry));
    }

    #[test]
    fn empty_result_object_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Part.jt");
        std::fs::write(&source, b"part").unwrap();

        let store = CacheStore::new(dir.path().join("cache"));
        let entry = store.entry_for(&source);
        std::fs::create_dir_all(&entry.folder).unwrap();
        std::fs::write(&entry.result_file, "{}").unwrap();
        store.write_info(&entry, &source).unwrap();

        assert!(store.is_stale(&source, &entry));
    }

    #[test]
    fn clear_entry_removes_files_but_keeps_folder() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Part.jt");
        std::fs::write(&source, b"part").unwrap();

        let store = CacheStore::new(dir.path().join("cache"));
        let entry = store.entry_for(&source);
        store.store_result(&entry, &sample_result(&entry.root_id)).unwrap();
        store.write_info(&entry, &source).unwrap();
        std::fs::write(entry.folder.join("g1.artifact"), b"mesh").unwrap();

        store.clear_entry(&entry).unwrap();
        assert!(entry.folder.is_dir());
        assert!(!entry.result_file.exists());
        assert!(!entry.info_file.exists());
        assert!(!entry.folder.join("g1.artifact").exists());

        // Clearing again is a no-op.
        store.clear_entry(&entry).unwrap();
    }

    #[test]
    fn clear_error_entries_removes_only_errored_results() {
        let dir = tempfile::tempdir().unwrap();
        let good_src = dir.path().join("Good.jt");
        let bad_src = dir.path().join("Bad.jt");
        std::fs::write(&good_src, b"good").unwrap();
        std::fs::write(&bad_src, b"bad").unwrap();

        let store = CacheStore::new(dir.path().join("cache"));
        let good = store.entry_for(&good_src);
        let bad = store.entry_for(&bad_src);

        store.store_result(&good, &sample_result(&good.root_id)).unwrap();
        store.write_info(&good, &good_src).unwrap();

        let mut errored = sample_result(&bad.root_id);
        errored.push_error("root document is missing from converter result");
        store.store_result(&bad, &errored).unwrap();
        store.write_info(&bad, &bad_src).unwrap();

        let cleared = store.clear_error_entries().unwrap();
        assert_eq!(cleared, 1);
        assert!(good.result_file.is_file());
        assert!(!bad.result_file.exists());
    }
}
