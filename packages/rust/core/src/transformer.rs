//! Rewrites raw conversion results into the final document set.
//!
//! Three passes over a [`ConvResult`]:
//! 1. [`apply_customizer`] — customization hook plus timestamp stamping.
//! 2. [`synthesize_geometry`] — placeholder geometry documents for
//!    structure nodes referencing a geometry id the converter never
//!    emitted.
//! 3. [`rewrite_graph`] — xref resolution, link-metadata spawning and
//!    artifact registration; also run for cache-fresh results so frontier
//!    discovery works from cache alone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::warn;

use cadbridge_resolver::XRefResolver;
use cadbridge_shared::{
    ChildLink, ConvResult, Document, GeometryDoc, GeometrySettings, JsonMap, MetadataDoc,
    PUSHED_FILES_SOURCER, UNRESOLVED_REF, root_id_for_path,
};

use crate::customizer::Customizer;

/// Filename extension of geometry artifacts in the cache.
pub const ARTIFACT_EXT: &str = ".artifact";

/// Run the customizer hook over an id-indexed view of the result, then
/// stamp timestamps: documents lacking a ts receive `ts`; with
/// `increment_ts` every ts is bumped by one to signal a revision.
///
/// Returns `false` when the root document is missing before or after the
/// hook — recorded as an error on the result; the caller must not expand
/// the file's subtree.
pub fn apply_customizer(
    result: &mut ConvResult,
    root_id: &str,
    source_file: &Path,
    ts: i64,
    increment_ts: bool,
    customizer: &dyn Customizer,
) -> bool {
    let mut indexed: BTreeMap<String, Document> = std::mem::take(&mut result.docs)
        .into_iter()
        .map(|doc| (doc.id().to_string(), doc))
        .collect();

    if !indexed.contains_key(root_id) {
        result.push_error("root document is missing from converter result");
        result.docs = indexed.into_values().collect();
        return false;
    }

    customizer.process_result(&mut indexed, root_id, source_file);

    if !indexed.contains_key(root_id) {
        result.push_error("root document was removed by customizer");
        result.docs = indexed.into_values().collect();
        return false;
    }

    for doc in indexed.values_mut() {
        let stamped = doc.ts().unwrap_or(ts);
        doc.set_ts(Some(if increment_ts { stamped + 1 } else { stamped }));
    }
    result.docs = indexed.into_values().collect();
    true
}

/// Synthesize a placeholder geometry document for every structure doc
/// whose `geometry` id has no geometry document in the result. The
/// placeholder points at a cache-relative artifact path.
pub fn synthesize_geometry(result: &mut ConvResult, root_id: &str, result_etag: Option<String>) {
    let mut known: HashSet<String> = result
        .docs
        .iter()
        .filter(|d| matches!(d, Document::Geometry(_)))
        .map(|d| d.id().to_string())
        .collect();

    let mut synthesized = Vec::new();
    for doc in &result.docs {
        let Document::Structure(s) = doc else {
            continue;
        };
        let Some(geometry_id) = &s.geometry else {
            continue;
        };
        if known.contains(geometry_id) {
            continue;
        }
        known.insert(geometry_id.clone());
        synthesized.push(Document::Geometry(GeometryDoc {
            id: geometry_id.clone(),
            ts: None,
            geometrysettings: GeometrySettings {
                path: format!("{geometry_id}{ARTIFACT_EXT}"),
                sourcer: PUSHED_FILES_SOURCER.to_string(),
                etag: result_etag.clone(),
                loginfo: Some(format!("geometry of {root_id}")),
                extra: JsonMap::new(),
            },
            extra: JsonMap::new(),
        }));
    }
    result.docs.extend(synthesized);
}

/// Outcome of one graph-rewriting pass.
#[derive(Debug, Default)]
pub struct GraphAnalysis {
    /// Resolved xref targets with their frontier weight (file size).
    pub discovered: HashMap<PathBuf, f64>,
    /// Document copies ready for upload (raw xref markers stripped).
    pub sink_docs: Vec<Document>,
    /// Geometry artifacts this result contributes: relpath → local file.
    pub artifacts: Vec<(String, PathBuf)>,
}

/// Resolve raw xrefs, spawn link-metadata siblings and register geometry
/// artifacts. Mutates `result` in place — the resolved refs, renamed link
/// keys, `hasmetadata` flags and spawned documents are all persisted back
/// to cache by the caller, while the raw markers are retained there and
/// only stripped from the upload copies.
pub fn rewrite_graph(
    result: &mut ConvResult,
    parent_file: &Path,
    cache_folder: &Path,
    resolver: Option<&XRefResolver>,
) -> GraphAnalysis {
    let mut analysis = GraphAnalysis::default();
    let mut spawned: Vec<Document> = Vec::new();

    for doc in &mut result.docs {
        match doc {
            Document::Structure(s) => {
                let children = std::mem::take(&mut s.children);
                let mut rekeyed: BTreeMap<String, ChildLink> = BTreeMap::new();

                for (link_id, mut child) in children {
                    if let Some(raw) = child.raw_xref.clone() {
                        match resolver.and_then(|r| r.resolve(parent_file, &raw)) {
                            Some((target, size)) => {
                                child.target = Some(root_id_for_path(&target));
                                analysis.discovered.insert(target, size as f64);
                            }
                            None => {
                                warn!(
                                    xref = %raw,
                                    parent = %parent_file.display(),
                                    "unresolved xref, writing sentinel ref"
                                );
                                child.target = Some(UNRESOLVED_REF.to_string());
                            }
                        }
                    }

                    let mut key = link_id.clone();
                    if let Some(md) = child.xref_metadata.clone() {
                        if !child.has_metadata {
                            child.has_metadata = true;
                            let linkmd_id = format!("{}_link_{}", s.id, link_id);
                            spawned.push(Document::LinkMetadata(MetadataDoc {
                                id: linkmd_id.clone(),
                                ts: s.ts,
                                metadata: md,
                                extra: JsonMap::new(),
                            }));
                            key = linkmd_id;
                        }
                    }
                    rekeyed.insert(key, child);
                }
                s.children = rekeyed;

                let mut upload = s.clone();
                for child in upload.children.values_mut() {
                    child.raw_xref = None;
                    child.xref_metadata = None;
                }
                analysis.sink_docs.push(Document::Structure(upload));
            }
            Document::Geometry(g) => {
                if g.geometrysettings.sourcer == PUSHED_FILES_SOURCER {
                    analysis.artifacts.push((
                        g.geometrysettings.path.clone(),
                        cache_folder.join(&g.geometrysettings.path),
                    ));
                }
                analysis.sink_docs.push(Document::Geometry(g.clone()));
            }
            other => analysis.sink_docs.push(other.clone()),
        }
    }

    analysis.sink_docs.extend(spawned.iter().cloned());
    result.docs.extend(spawned);
    analysis
}
