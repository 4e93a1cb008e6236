//! Backend driving the external `shapeconv` executable.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use cadbridge_shared::{CadBridgeError, ConverterConfig, Result};

use crate::{ConversionJob, ConverterBackend};

/// Converter log file name under the cache root.
const CONVERTER_LOG: &str = "shapeconv.log";

/// System block of a shapeconv task file.
#[derive(Debug, Clone, Serialize)]
struct SystemBlock {
    workercount: usize,
    maxramperworkermb: u64,
    maxtimeperworkersec: u64,
    directoryurl: String,
    verify_ssl_peer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_proxy: Option<String>,
}

/// One task handed to the executable: all accepted jobs plus runtime limits.
#[derive(Debug, Serialize)]
struct Task<'a> {
    jobs: &'a [ConversionJob],
    system: &'a SystemBlock,
}

/// Accepts every job and batches them into a single external invocation
/// per [`ConverterBackend::convert`] call.
pub struct ShapeConvBackend {
    exe: PathBuf,
    cache_root: PathBuf,
    system: SystemBlock,
    jobs: Vec<ConversionJob>,
    task_counter: u32,
}

impl ShapeConvBackend {
    pub fn new(
        config: &ConverterConfig,
        cache_root: impl Into<PathBuf>,
        verify_ssl: bool,
        http_proxy: Option<String>,
    ) -> Self {
        Self {
            exe: PathBuf::from(&config.exe),
            cache_root: cache_root.into(),
            system: SystemBlock {
                workercount: config.worker_count,
                maxramperworkermb: config.max_ram_per_worker_mb,
                maxtimeperworkersec: config.max_time_per_worker_sec,
                directoryurl: config.directory_url.clone(),
                verify_ssl_peer: verify_ssl,
                http_proxy,
            },
            jobs: Vec::new(),
            task_counter: 0,
        }
    }

    /// Jobs accepted since the last `convert()`.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl ConverterBackend for ShapeConvBackend {
    fn push_job(&mut self, job: &ConversionJob) -> bool {
        self.jobs.push(job.clone());
        true
    }

    async fn convert(&mut self) -> Result<()> {
        if self.jobs.is_empty() {
            return Ok(());
        }

        self.task_counter += 1;
        let task_file = self.cache_root.join(format!("{}.json", self.task_counter));
        let task = Task {
            jobs: &self.jobs,
            system: &self.system,
        };
        let content =
            serde_json::to_string(&task).map_err(|e| CadBridgeError::validation(e.to_string()))?;
        std::fs::write(&task_file, content).map_err(|e| CadBridgeError::io(&task_file, e))?;

        let log_path = self.cache_root.join(CONVERTER_LOG);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| CadBridgeError::io(&log_path, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| CadBridgeError::io(&log_path, e))?;

        info!(
            jobs = self.jobs.len(),
            task = %task_file.display(),
            "running shapeconv"
        );

        let mut command = tokio::process::Command::new(&self.exe);
        command
            .arg("-convert")
            .arg(&task_file)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(dir) = self.exe.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let status = command.status().await.map_err(|e| {
            CadBridgeError::Backend(format!(
                "failed to run {}: {e}",
                self.exe.display()
            ))
        })?;

        if !status.success() {
            return Err(CadBridgeError::Backend(format!(
                "{} exited with {status} for task {}",
                self.exe.display(),
                task_file.display()
            )));
        }

        debug!(task = %task_file.display(), "shapeconv batch done");
        self.jobs.clear();
        Ok(())
    }
}
