//! End-to-end worklist tests: a scripted in-process converter backend plus
//! a mock index service drive the full convert/analyze loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cadbridge_cache::CacheStore;
use cadbridge_converter::{ConversionJob, ConverterBackend};
use cadbridge_core::{DefaultCustomizer, Orchestrator};
use cadbridge_resolver::{FileIndex, XRefResolver};
use cadbridge_shared::{AppConfig, ConvResult, Document, Result, root_id_for_path};
use cadbridge_sink::SinkClient;

/// Writes canned conversion results: assemblies reference `./sub/Part.jt`,
/// parts carry a geometry id plus some metadata.
struct ScriptedBackend {
    jobs: Vec<ConversionJob>,
    converted: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    fn new(converted: Arc<AtomicUsize>) -> Self {
        Self {
            jobs: Vec::new(),
            converted,
        }
    }
}

#[async_trait]
impl ConverterBackend for ScriptedBackend {
    fn push_job(&mut self, job: &ConversionJob) -> bool {
        self.jobs.push(job.clone());
        true
    }

    async fn convert(&mut self) -> Result<()> {
        for job in self.jobs.drain(..) {
            self.converted.fetch_add(1, Ordering::SeqCst);
            let is_assembly = job
                .file
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case("catproduct"))
                .unwrap_or(false);

            let docs = if is_assembly {
                serde_json::json!([{
                    "id": job.root_id,
                    "type": "structure",
                    "children": {
                        "link0": { "shapeconv:xref": "./sub/Part.jt" }
                    }
                }])
            } else {
                serde_json::json!([
                    {
                        "id": job.root_id,
                        "type": "structure",
                        "geometry": "geom_b"
                    },
                    {
                        "id": "partmd_b",
                        "type": "partmetadata",
                        "metadata": { "Mass (kg)": 2.5, "PLM::Owner": "amy" }
                    }
                ])
            };
            let result = serde_json::json!({ "docs": docs, "infos": { "ts": 1000 } });
            std::fs::write(&job.result_file, serde_json::to_string(&result).unwrap()).unwrap();
            if !is_assembly {
                std::fs::write(job.output_folder.join("geom_b.artifact"), b"mesh").unwrap();
            }
        }
        Ok(())
    }
}

async fn mock_sink_service() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/manage/project/prj_0001/status"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/index/prj_0001_connector/bulk"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "errors": false, "items": [{}] })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/index/prj_0001_connector/flush"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/manage/project/prj_0001/pushfile"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "geom_b.artifact": false })),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/manage/project/prj_0001/pushfile"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    server
}

fn config_for(server: &MockServer, cache_folder: &Path) -> AppConfig {
    let host = server.uri().trim_start_matches("http://").to_string();
    let mut config = AppConfig::default();
    config.sink.api_url = format!("http://login:pwd@{host}/api");
    config.sink.project_id = "prj_0001".into();
    config.cache.folder = cache_folder.to_string_lossy().into_owned();
    config.lock.retry_interval_ms = 5;
    config
}

fn make_source_tree(root: &Path) -> (PathBuf, PathBuf) {
    std::fs::create_dir_all(root.join("sub")).unwrap();
    let assembly = root.join("Assembly.catproduct");
    let part = root.join("sub/Part.jt");
    std::fs::write(&assembly, b"assembly-data").unwrap();
    std::fs::write(&part, b"part-data").unwrap();
    (assembly, part)
}

fn resolver_for(base: &Path) -> XRefResolver {
    XRefResolver::new(
        FileIndex::build(base, &[".jt".into(), ".catproduct".into()]).unwrap(),
    )
}

async fn run_once(
    config: &AppConfig,
    base: &Path,
    roots: &[PathBuf],
    converted: Arc<AtomicUsize>,
    top_node: bool,
) -> Vec<String> {
    let sink = SinkClient::new(&config.sink, &config.cache.folder).unwrap();
    let backend = ScriptedBackend::new(converted);
    let mut orchestrator = Orchestrator::new(
        config.clone(),
        sink,
        Some(resolver_for(base)),
        vec![Box::new(backend)],
        Box::new(DefaultCustomizer::new()),
    )
    .unwrap();
    orchestrator.run(roots, top_node).await.unwrap()
}

#[tokio::test]
async fn assembly_and_component_converge_to_a_single_root() {
    let server = mock_sink_service().await;
    let dir = tempfile::tempdir().unwrap();
    let ps = dir.path().join("ps");
    let cache_folder = dir.path().join("cache");
    let (assembly, part) = make_source_tree(&ps);

    let config = config_for(&server, &cache_folder);
    let converted = Arc::new(AtomicUsize::new(0));

    let root_ids = run_once(
        &config,
        &ps,
        std::slice::from_ref(&assembly),
        converted.clone(),
        true,
    )
    .await;

    // Both files were converted exactly once.
    assert_eq!(converted.load(Ordering::SeqCst), 2);

    // B is referenced by R, so the final root set is {RootId(R)} — no
    // synthetic top node for a single root.
    assert_eq!(root_ids, vec![root_id_for_path(&assembly)]);

    // Two cache folders with persisted results.
    let cache_dirs: Vec<_> = std::fs::read_dir(&cache_folder)
        .unwrap()
        .flatten()
        .filter(|e| e.path().join("convresult.json").is_file())
        .collect();
    assert_eq!(cache_dirs.len(), 2);

    // R's persisted structure doc carries the resolved child ref and
    // still holds the raw marker for later replays.
    let store = CacheStore::new(&cache_folder);
    let entry = store.entry_for(&assembly);
    let cached: ConvResult = serde_json::from_str(
        &std::fs::read_to_string(&entry.result_file).unwrap(),
    )
    .unwrap();
    let Document::Structure(s) = &cached.docs[0] else {
        panic!("expected structure doc first");
    };
    let child = &s.children["link0"];
    assert_eq!(child.target.as_deref(), Some(root_id_for_path(&part).as_str()));
    assert_eq!(child.raw_xref.as_deref(), Some("./sub/Part.jt"));

    // B's persisted result: synthesized geometry + normalized metadata.
    let part_entry = store.entry_for(&part);
    let cached: ConvResult = serde_json::from_str(
        &std::fs::read_to_string(&part_entry.result_file).unwrap(),
    )
    .unwrap();
    let geometry = cached
        .docs
        .iter()
        .find_map(|d| match d {
            Document::Geometry(g) => Some(g),
            _ => None,
        })
        .expect("synthesized geometry doc");
    assert_eq!(geometry.geometrysettings.path, "geom_b.artifact");
    let partmd = cached
        .docs
        .iter()
        .find_map(|d| match d {
            Document::PartMetadata(m) => Some(m),
            _ => None,
        })
        .expect("part metadata doc");
    assert_eq!(partmd.ts, Some(1000));
    assert_eq!(partmd.metadata["MassProperties"]["Mass (kg)"], 2.5);
    assert_eq!(partmd.metadata["SpecificMd"][0]["name"], "PLM");
}

#[tokio::test]
async fn unchanged_tree_reconverts_nothing_on_the_second_run() {
    let server = mock_sink_service().await;
    let dir = tempfile::tempdir().unwrap();
    let ps = dir.path().join("ps");
    let cache_folder = dir.path().join("cache");
    let (assembly, _part) = make_source_tree(&ps);

    let config = config_for(&server, &cache_folder);
    let converted = Arc::new(AtomicUsize::new(0));

    let first = run_once(
        &config,
        &ps,
        std::slice::from_ref(&assembly),
        converted.clone(),
        true,
    )
    .await;
    assert_eq!(converted.load(Ordering::SeqCst), 2);

    let second = run_once(
        &config,
        &ps,
        std::slice::from_ref(&assembly),
        converted.clone(),
        true,
    )
    .await;

    // Idempotence: zero new conversion jobs, identical root-id set.
    assert_eq!(converted.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn touched_source_file_is_reconverted() {
    let server = mock_sink_service().await;
    let dir = tempfile::tempdir().unwrap();
    let ps = dir.path().join("ps");
    let cache_folder = dir.path().join("cache");
    let (assembly, part) = make_source_tree(&ps);

    let config = config_for(&server, &cache_folder);
    let converted = Arc::new(AtomicUsize::new(0));

    run_once(
        &config,
        &ps,
        std::slice::from_ref(&assembly),
        converted.clone(),
        true,
    )
    .await;
    assert_eq!(converted.load(Ordering::SeqCst), 2);

    // Rewrite the component with a different mtime; only it reconverts.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    std::fs::write(&part, b"part-data-v2").unwrap();

    run_once(
        &config,
        &ps,
        std::slice::from_ref(&assembly),
        converted.clone(),
        true,
    )
    .await;
    assert_eq!(converted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn multiple_roots_aggregate_under_a_synthetic_top_node() {
    let server = mock_sink_service().await;
    let dir = tempfile::tempdir().unwrap();
    let ps = dir.path().join("ps");
    let cache_folder = dir.path().join("cache");
    let (assembly_a, _part) = make_source_tree(&ps);
    let assembly_b = ps.join("Second.catproduct");
    std::fs::write(&assembly_b, b"assembly-two").unwrap();

    let config = config_for(&server, &cache_folder);
    let converted = Arc::new(AtomicUsize::new(0));

    let roots = vec![assembly_a.clone(), assembly_b.clone()];
    let root_ids = run_once(&config, &ps, &roots, converted.clone(), true).await;

    // Both assemblies reference the shared part; it converts once.
    assert_eq!(converted.load(Ordering::SeqCst), 3);

    let mut expected = vec![
        root_id_for_path(&assembly_a),
        root_id_for_path(&assembly_b),
    ];
    expected.sort();
    expected.insert(0, "root".to_string());
    assert_eq!(root_ids, expected);
}
