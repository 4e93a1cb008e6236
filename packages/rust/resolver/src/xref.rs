//! Heuristic resolution of textual cross-references.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::FileIndex;
use crate::index::relative_dir_of;

/// Resolves raw xref strings against a [`FileIndex`].
///
/// First non-empty match set wins: same-subtree preference, then longest
/// common suffix, then every candidate sharing the basename. With more than
/// one final candidate the first is taken — which one is implementation
/// defined, and a warning is emitted.
#[derive(Debug, Clone)]
pub struct XRefResolver {
    index: FileIndex,
}

impl XRefResolver {
    pub fn new(index: FileIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    /// Resolve `raw_xref` found in `parent_file` to an absolute path and
    /// file size, or `None` when no indexed file shares its basename.
    pub fn resolve(&self, parent_file: &Path, raw_xref: &str) -> Option<(PathBuf, u64)> {
        let mut xref = raw_xref.replace('\\', "/");
        let parent_rel = relative_dir_of(parent_file, self.index.base_dir());

        // A leading ./ anchors the reference at the parent's directory.
        if let (Some(rest), Some(rel)) = (xref.strip_prefix("./").map(str::to_owned), &parent_rel)
        {
            xref = if rel.is_empty() {
                rest
            } else {
                format!("{rel}/{rest}")
            };
        }
        let basename = xref.rsplit('/').next().unwrap_or(&xref).to_string();

        let Some(candidates) = self.index.candidates(&basename) else {
            warn!(xref = %xref, "failed to resolve xref: unknown file");
            return None;
        };

        // 1. Prefer candidates inside the parent's subtree whose relative
        //    path is a suffix of the xref.
        let mut matches: Vec<&(String, u64)> = match &parent_rel {
            Some(rel) => candidates
                .iter()
                .filter(|(p, _)| p.starts_with(rel.as_str()) && xref.ends_with(p))
                .collect(),
            None => Vec::new(),
        };

        // 2. Longest common suffix with the xref, ties kept.
        if matches.is_empty() {
            matches = longest_suffix_matches(candidates, &xref, basename.len());
        }

        // 3. Fall back to every candidate for this basename.
        if matches.is_empty() {
            matches = candidates.iter().collect();
        }

        if matches.len() > 1 {
            warn!(xref = %xref, candidates = matches.len(), "multiple path match for xref, choosing one");
        }
        let (rel, size) = matches[0];
        debug!(
            xref = %raw_xref,
            resolved = %rel,
            parent = %parent_file.display(),
            "resolved xref"
        );
        Some((self.index.base_dir().join(rel), *size))
    }
}

/// All candidates whose longest suffix shared with `xref` is maximal, for
/// suffix lengths strictly greater than the basename length (every
/// candidate trivially shares the basename).
fn longest_suffix_matches<'a>(
    candidates: &'a [(String, u64)],
    xref: &str,
    basename_len: usize,
) -> Vec<&'a (String, u64)> {
    let xref_bytes = xref.as_bytes();
    let mut best_len = basename_len;
    let mut matches: Vec<&(String, u64)> = Vec::new();

    for cand in candidates {
        let p = cand.0.as_bytes();
        let mut shared = 0usize;
        let mut i = p.len().min(xref_bytes.len());
        while i > basename_len {
            if xref_bytes.ends_with(&p[p.len() - i..]) {
                shared = i;
                break;
            }
            i -= 1;
        }
        if shared == 0 {
            continue;
        }
        if shared > best_len {
            matches.clear();
            best_len = shared;
            matches.push(cand);
        } else if shared == best_len {
            matches.push(cand);
        }
    }
    matches
}
