//! The worklist engine: frontier-driven, incremental conversion.
//!
//! One [`Orchestrator`] value owns all run state — frontier, visited set,
//! potential roots, artifact registry, metadata key registry — for exactly
//! one invocation of [`Orchestrator::run`]. Nothing here is shared across
//! concurrent runs; the per-project advisory lock forbids them anyway.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use cadbridge_cache::{CacheEntry, CacheStore};
use cadbridge_converter::{ConversionJob, ConverterBackend};
use cadbridge_resolver::XRefResolver;
use cadbridge_shared::{
    AppConfig, CadBridgeError, ChildLink, ConvResult, Document, Result, StructureDoc, file_etag,
    root_id_for_path,
};
use cadbridge_sink::{ProjectLock, ServerCapabilities, SinkClient};

use crate::customizer::Customizer;
use crate::transformer;

/// Run state owned by one orchestrator invocation.
#[derive(Default)]
struct RunState {
    /// Files discovered but not yet analyzed, with their priority weight.
    frontier: HashMap<PathBuf, f64>,
    /// Every file ever scheduled this run; terminates cyclic references.
    visited: HashSet<PathBuf>,
    /// Caller roots minus every file proven referenced by another file.
    potential_roots: HashSet<PathBuf>,
    /// Geometry artifacts to upload at the end: relpath → local file.
    files_to_push: HashMap<String, PathBuf>,
    /// Diagnostic registry: metadata key → observed JSON value types.
    metadata_keys: BTreeMap<String, BTreeSet<&'static str>>,
}

/// Drives the convert/analyze loop for one project.
pub struct Orchestrator {
    config: AppConfig,
    cache: CacheStore,
    sink: SinkClient,
    resolver: Option<XRefResolver>,
    backends: Vec<Box<dyn ConverterBackend>>,
    customizer: Box<dyn Customizer>,
}

impl Orchestrator {
    /// Assemble an orchestrator. Pass `resolver: None` for root-only mode
    /// (no xrefs are ever resolved) and an ordered backend list — the
    /// first backend accepting a job owns it.
    pub fn new(
        config: AppConfig,
        sink: SinkClient,
        resolver: Option<XRefResolver>,
        backends: Vec<Box<dyn ConverterBackend>>,
        customizer: Box<dyn Customizer>,
    ) -> Result<Self> {
        config.validate()?;
        let cache_root = PathBuf::from(&config.cache.folder);
        std::fs::create_dir_all(&cache_root).map_err(|e| CadBridgeError::io(&cache_root, e))?;
        Ok(Self {
            cache: CacheStore::new(cache_root),
            config,
            sink,
            resolver,
            backends,
            customizer,
        })
    }

    /// Process the given root files to a fixpoint and return the final
    /// root-id set.
    ///
    /// The whole run holds the project's update lock: on success pending
    /// documents are flushed, the index is synced and the project returns
    /// to `idle`; on any error the project is marked `connectorerror`.
    /// When `generate_top_node` is set and more than one potential root
    /// remains, a synthetic `root` structure document aggregates them.
    #[instrument(skip_all, fields(roots = root_files.len()))]
    pub async fn run(
        &mut self,
        root_files: &[PathBuf],
        generate_top_node: bool,
    ) -> Result<Vec<String>> {
        let lock = ProjectLock::acquire(
            &self.sink,
            Duration::from_secs(self.config.lock.timeout_secs),
            Duration::from_millis(self.config.lock.retry_interval_ms),
        )
        .await?;

        match self.run_locked(root_files, generate_top_node).await {
            Ok(root_ids) => {
                lock.release(&self.sink).await?;
                Ok(root_ids)
            }
            Err(e) => {
                if let Err(mark) = lock.fail(&self.sink).await {
                    warn!(error = %mark, "failed to mark the project errored");
                }
                Err(e)
            }
        }
    }

    async fn run_locked(
        &mut self,
        root_files: &[PathBuf],
        generate_top_node: bool,
    ) -> Result<Vec<String>> {
        if self.config.cache.clear_index {
            info!("clearing connector documents from the index");
            self.sink.remove_documents().await?;
        }
        if self.config.cache.reprocess_errors {
            let cleared = self.cache.clear_error_entries()?;
            info!(cleared, "cleared errored cache entries");
        }

        let root_ids = self.convert_files(root_files, generate_top_node).await?;

        self.sink.upload_batch().await?;
        self.sink.sync_index().await?;
        Ok(root_ids)
    }

    /// The worklist loop: ANALYZE → CONVERT → RESULT until the frontier
    /// stays empty.
    async fn convert_files(
        &mut self,
        root_files: &[PathBuf],
        generate_top_node: bool,
    ) -> Result<Vec<String>> {
        let mut state = RunState::default();
        for root in root_files {
            let abs = std::path::absolute(root).map_err(|e| CadBridgeError::io(root, e))?;
            state.frontier.insert(abs.clone(), 0.0);
            state.visited.insert(abs.clone());
            state.potential_roots.insert(abs);
        }
        info!(roots = root_files.len(), "start processing");

        loop {
            // ANALYZE: drain the frontier (it may regrow while cached
            // results are analyzed), deferring stale files as jobs.
            let mut jobs: Vec<ConversionJob> = Vec::new();
            let mut analyzed = 0usize;
            while !state.frontier.is_empty() {
                let mut batch: Vec<(PathBuf, f64)> = state.frontier.drain().collect();
                batch.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                analyzed += batch.len();

                for (file, _weight) in batch {
                    if !file.is_file() {
                        warn!(file = %file.display(), "missing file");
                        continue;
                    }
                    let entry = self.cache.entry_for(&file);
                    std::fs::create_dir_all(&entry.folder)
                        .map_err(|e| CadBridgeError::io(&entry.folder, e))?;

                    if self.cache.is_stale(&file, &entry) {
                        self.cache.clear_entry(&entry)?;
                        jobs.push(self.make_job(&file, &entry));
                    } else {
                        self.analyze_cached(&mut state, &file, &entry).await?;
                    }
                }
            }
            info!(analyzed, outdated = jobs.len(), "analysis pass complete");
            if jobs.is_empty() {
                break;
            }

            // CONVERT: first backend accepting a job owns it.
            for job in &jobs {
                let mut accepted = false;
                for backend in self.backends.iter_mut() {
                    if backend.push_job(job) {
                        accepted = true;
                        break;
                    }
                }
                if !accepted {
                    warn!(file = %job.file.display(), "no converter accepted the job");
                }
            }
            for backend in self.backends.iter_mut() {
                backend.convert().await?;
            }

            // RESULT: reload, transform, persist, analyze.
            for job in &jobs {
                self.process_result(&mut state, job).await?;
            }
        }

        // TERMINAL
        self.sink.push_artifacts(&state.files_to_push).await?;
        self.report_metadata_keys(&state);

        let mut root_ids: Vec<String> = state
            .potential_roots
            .iter()
            .map(|p| root_id_for_path(p))
            .collect();
        root_ids.sort();

        if generate_top_node && state.potential_roots.len() > 1 {
            let mut children = BTreeMap::new();
            for id in &root_ids {
                children.insert(
                    format!("root_{id}"),
                    ChildLink {
                        target: Some(id.clone()),
                        ..Default::default()
                    },
                );
            }
            let mut extra = cadbridge_shared::JsonMap::new();
            extra.insert("partmdid".into(), serde_json::json!("partmd_root"));
            let top = Document::Structure(StructureDoc {
                id: "root".into(),
                ts: None,
                children,
                geometry: None,
                extra,
            });
            self.sink.add_document(&top).await?;
            info!(roots = root_ids.len(), "emitted synthetic top node");
            root_ids.insert(0, "root".to_string());
        }

        Ok(root_ids)
    }

    fn make_job(&self, file: &Path, entry: &CacheEntry) -> ConversionJob {
        ConversionJob {
            file: file.to_path_buf(),
            root_id: entry.root_id.clone(),
            output_folder: entry.folder.clone(),
            result_file: entry.result_file.clone(),
            log_file: entry.log_file(),
            copy_before_load: self
                .config
                .cache
                .copy_before_load
                .then(|| self.cache.root().to_path_buf()),
            extract_options: self.customizer.extract_settings(file),
        }
    }

    /// Cache-fresh path: optionally re-run the transformer (bumping ts),
    /// then analyze the cached result to regrow the frontier.
    async fn analyze_cached(
        &mut self,
        state: &mut RunState,
        file: &Path,
        entry: &CacheEntry,
    ) -> Result<()> {
        let Some(mut result) = self.cache.load_result(entry) else {
            // is_stale() guarantees a readable result here; a racing writer
            // is the documented shared-cache limitation.
            warn!(file = %file.display(), "cached result vanished, skipping");
            return Ok(());
        };

        if self.config.cache.reprocess_from_cache {
            let ts = result.infos.as_ref().map(|i| i.ts).unwrap_or(0);
            transformer::apply_customizer(
                &mut result,
                &entry.root_id,
                file,
                ts,
                true,
                self.customizer.as_ref(),
            );
            self.cache.store_result(entry, &result)?;
        }

        self.analyze_result(state, file, entry, &mut result).await
    }

    /// RESULT phase for one converted job.
    async fn process_result(&mut self, state: &mut RunState, job: &ConversionJob) -> Result<()> {
        let entry = self.cache.entry_for(&job.file);
        if !entry.result_file.is_file() {
            error!(
                file = %job.file.display(),
                root_id = %entry.root_id,
                "failed to retrieve conversion result"
            );
            return Ok(());
        }
        let mut result = self.cache.load_result(&entry).unwrap_or_default();

        let result_etag = file_etag(&entry.result_file).ok().map(|e| e.to_string());
        transformer::synthesize_geometry(&mut result, &entry.root_id, result_etag);

        let ts = result
            .infos
            .as_ref()
            .map(|i| i.ts)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let root_ok = transformer::apply_customizer(
            &mut result,
            &entry.root_id,
            &job.file,
            ts,
            false,
            self.customizer.as_ref(),
        );

        if root_ok {
            self.analyze_result(state, &job.file, &entry, &mut result)
                .await?;
        } else {
            error!(
                file = %job.file.display(),
                root_id = %entry.root_id,
                "root document unavailable, subtree not analyzed"
            );
        }

        self.cache.store_result(&entry, &result)?;
        self.cache.write_info(&entry, &job.file)?;
        Ok(())
    }

    /// Graph analysis: rewrite, upload, and feed discoveries back into the
    /// frontier/visited/potential-root state.
    async fn analyze_result(
        &mut self,
        state: &mut RunState,
        file: &Path,
        entry: &CacheEntry,
        result: &mut ConvResult,
    ) -> Result<()> {
        for e in &result.errors {
            error!(root_id = %entry.root_id, error = %e, "conversion error");
        }
        for w in &result.warnings {
            warn!(root_id = %entry.root_id, warning = %w, "conversion warning");
        }

        let analysis =
            transformer::rewrite_graph(result, file, &entry.folder, self.resolver.as_ref());

        for (relpath, local) in analysis.artifacts {
            if state.files_to_push.contains_key(&relpath) {
                return Err(CadBridgeError::ArtifactConflict { path: relpath });
            }
            state.files_to_push.insert(relpath, local);
        }

        for doc in &analysis.sink_docs {
            if let Document::PartMetadata(d)
            | Document::LinkMetadata(d)
            | Document::InstanceMetadata(d) = doc
            {
                for (key, value) in &d.metadata {
                    state
                        .metadata_keys
                        .entry(key.clone())
                        .or_default()
                        .insert(json_type_name(value));
                }
            }
            self.sink.add_document(doc).await?;
        }

        for (target, weight) in analysis.discovered {
            state.potential_roots.remove(&target);
            if state.visited.insert(target.clone()) {
                state.frontier.insert(target, weight);
            }
        }
        Ok(())
    }

    /// End-of-run schema diagnostic: every metadata key and the value
    /// types observed under it, warned about past the configured ceiling.
    fn report_metadata_keys(&self, state: &RunState) {
        if state.metadata_keys.is_empty() {
            return;
        }
        let mut dump = String::new();
        for (key, types) in &state.metadata_keys {
            let types: Vec<&str> = types.iter().copied().collect();
            dump.push_str(&format!("\n\t{key} = {}", types.join(", ")));
        }
        info!(
            keys = state.metadata_keys.len(),
            "metadata keys observed this run:{dump}"
        );
        if state.metadata_keys.len() > self.config.cache.metadata_key_warn_threshold {
            warn!(
                keys = state.metadata_keys.len(),
                threshold = self.config.cache.metadata_key_warn_threshold,
                "distinct metadata key count exceeds threshold; the index schema may be growing without bound"
            );
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Build-parameters project document sized from the service's capacity:
/// 2 GB per build worker, worker count bounded by the cpu count and by
/// 80% of available RAM.
pub fn default_build_parameters(caps: &ServerCapabilities) -> serde_json::Value {
    let ram_mb = caps.ram_quantity_bytes / (1024 * 1024);
    let ram_limit_mb: u64 = 2048;
    let by_ram = ((ram_mb as f64 * 0.8) / ram_limit_mb as f64).floor() as usize;
    let worker_count = caps.cpu_count.min(by_ram).max(1);

    serde_json::json!({
        "id": "com.cadbridge:buildparameters",
        "ts": 0,
        "type": "projectdocument",
        "subtype": "buildparameters",
        "buildparameters": {
            "sourcers": {
                cadbridge_shared::PUSHED_FILES_SOURCER: {
                    "baseurl": "$LOCAL$",
                    "type": "FileSystemSourcer"
                }
            },
            "workertimeoutsec": 900,
            "workermemorylimitMB": ram_limit_mb,
            "workercount": worker_count
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parameters_respect_ram_and_cpu_bounds() {
        // 8 GiB, 16 cpus → RAM-bound: floor(8192×0.8 / 2048) = 3 workers.
        let caps = ServerCapabilities {
            cpu_count: 16,
            ram_quantity_bytes: 8 * 1024 * 1024 * 1024,
        };
        let params = default_build_parameters(&caps);
        assert_eq!(params["buildparameters"]["workercount"], 3);

        // Tiny box never goes below one worker.
        let caps = ServerCapabilities {
            cpu_count: 1,
            ram_quantity_bytes: 512 * 1024 * 1024,
        };
        let params = default_build_parameters(&caps);
        assert_eq!(params["buildparameters"]["workercount"], 1);
        assert_eq!(params["type"], "projectdocument");
    }

    #[test]
    fn json_type_names_cover_all_variants() {
        assert_eq!(json_type_name(&serde_json::json!(null)), "null");
        assert_eq!(json_type_name(&serde_json::json!(true)), "boolean");
        assert_eq!(json_type_name(&serde_json::json!(1.5)), "number");
        assert_eq!(json_type_name(&serde_json::json!("x")), "string");
        assert_eq!(json_type_name(&serde_json::json!([1])), "array");
        assert_eq!(json_type_name(&serde_json::json!({})), "object");
    }
}
