//! Extension-filtered index of candidate xref targets under a base directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use cadbridge_shared::{CadBridgeError, Result};

/// basename → [(relative path, size in bytes)], built from one directory walk.
///
/// The index can be persisted as JSON and is reused while the persisted file
/// is newer than the base directory itself.
#[derive(Debug, Clone)]
pub struct FileIndex {
    base_dir: PathBuf,
    entries: BTreeMap<String, Vec<(String, u64)>>,
}

impl FileIndex {
    /// Walk `base_dir` and index every file whose extension is in
    /// `extensions` (entries like `".jt"`, compared case-insensitively).
    pub fn build(base_dir: &Path, extensions: &[String]) -> Result<Self> {
        info!(base_dir = %base_dir.display(), "indexing xref targets");

        let allowed: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
        let mut entries: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        let mut count = 0usize;

        for entry in WalkDir::new(base_dir) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let ext = match path.extension() {
                Some(ext) => format!(".{}", ext.to_string_lossy().to_lowercase()),
                None => continue,
            };
            if !allowed.contains(&ext) {
                continue;
            }

            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let rel = normalize_relative(path, base_dir);
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            entries.entry(name).or_default().push((rel, size));
            count += 1;
        }

        info!(files = count, "file index ready");
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            entries,
        })
    }

    /// Build the index, reusing `cache_file` when it is newer than the base
    /// directory; a fresh build is persisted back to `cache_file`.
    pub fn load_or_build(
        base_dir: &Path,
        extensions: &[String],
        cache_file: Option<&Path>,
    ) -> Result<Self> {
        if let Some(cache) = cache_file {
            if cache_is_current(base_dir, cache) {
                info!(
                    base_dir = %base_dir.display(),
                    cache = %cache.display(),
                    "loading file index from cache"
                );
                let content =
                    std::fs::read_to_string(cache).map_err(|e| CadBridgeError::io(cache, e))?;
                let entries: BTreeMap<String, Vec<(String, u64)>> = serde_json::from_str(&content)
                    .map_err(|e| {
                        CadBridgeError::validation(format!(
                            "invalid file index cache {}: {e}",
                            cache.display()
                        ))
                    })?;
                return Ok(Self {
                    base_dir: base_dir.to_path_buf(),
                    entries,
                });
            }
        }

        let index = Self::build(base_dir, extensions)?;
        if let Some(cache) = cache_file {
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CadBridgeError::io(parent, e))?;
            }
            let content = serde_json::to_string_pretty(&index.entries)
                .map_err(|e| CadBridgeError::validation(e.to_string()))?;
            std::fs::write(cache, content).map_err(|e| CadBridgeError::io(cache, e))?;
            debug!(cache = %cache.display(), "persisted file index");
        }
        Ok(index)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Candidate (relative path, size) pairs for a basename.
    pub fn candidates(&self, basename: &str) -> Option<&[(String, u64)]> {
        self.entries.get(basename).map(Vec::as_slice)
    }

    /// Number of indexed files.
    pub fn file_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Lazy, restartable iterator over all indexed absolute paths.
    pub fn iter_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.entries
            .values()
            .flatten()
            .map(|(rel, _)| self.base_dir.join(rel))
    }
}

/// Relative path with `/` separators; empty string for the base itself.
fn normalize_relative(path: &Path, base_dir: &Path) -> String {
    match path.strip_prefix(base_dir) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().replace('\\', "/"),
    }
}

/// True when the persisted index is strictly newer than the base directory.
fn cache_is_current(base_dir: &Path, cache: &Path) -> bool {
    let (Ok(base_meta), Ok(cache_meta)) = (base_dir.metadata(), cache.metadata()) else {
        return false;
    };
    match (base_meta.modified(), cache_meta.modified()) {
        (Ok(base_mtime), Ok(cache_mtime)) => base_mtime < cache_mtime,
        _ => false,
    }
}

pub(crate) fn relative_dir_of(file: &Path, base_dir: &Path) -> Option<String> {
    let parent = file.parent()?;
    let rel = parent.strip_prefix(base_dir).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec![".jt".into(), ".catproduct".into()]
    }

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::create_dir_all(root.join("x/b")).unwrap();
        std::fs::write(root.join("a/Assembly.catproduct"), b"assembly").unwrap();
        std::fs::write(root.join("a/b/Part.jt"), b"part-one").unwrap();
        std::fs::write(root.join("x/b/Part.jt"), b"part-two-longer").unwrap();
        std::fs::write(root.join("a/readme.txt"), b"ignored").unwrap();
    }

    #[test]
    fn build_indexes_by_basename_with_extension_filter() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let index = FileIndex::build(dir.path(), &exts()).unwrap();
        assert_eq!(index.file_count(), 3);

        let parts = index.candidates("Part.jt").unwrap();
        assert_eq!(parts.len(), 2);
        let rels: Vec<&str> = parts.iter().map(|(p, _)| p.as_str()).collect();
        assert!(rels.contains(&"a/b/Part.jt"));
        assert!(rels.contains(&"x/b/Part.jt"));
        let sizes: Vec<u64> = parts.iter().map(|(_, s)| *s).collect();
        assert!(sizes.contains(&8));

        assert!(index.candidates("readme.txt").is_none());
    }

    #[test]
    fn iter_paths_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let index = FileIndex::build(dir.path(), &exts()).unwrap();

        let first: Vec<PathBuf> = index.iter_paths().collect();
        let second: Vec<PathBuf> = index.iter_paths().collect();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(first.iter().all(|p| p.is_absolute() || p.starts_with(dir.path())));
    }

    #[test]
    fn persisted_index_is_reused_while_newer_than_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ps");
        make_tree(&base);
        let cache = dir.path().join("fileindex.json");

        let built = FileIndex::load_or_build(&base, &exts(), Some(&cache)).unwrap();
        assert!(cache.is_file());

        // The persisted file is newer than the base dir now, so a reload
        // must come from the cache even if we hand it a bogus allow-list.
        let reloaded = FileIndex::load_or_build(&base, &[".nope".into()], Some(&cache)).unwrap();
        assert_eq!(reloaded.file_count(), built.file_count());
    }

    #[test]
    fn stale_cache_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ps");
        let cache = dir.path().join("fileindex.json");
        std::fs::write(&cache, "{}").unwrap();
        // Base dir created after the cache file → cache is stale.
        make_tree(&base);

        let index = FileIndex::load_or_build(&base, &exts(), Some(&cache)).unwrap();
        assert_eq!(index.file_count(), 3);
    }
}
