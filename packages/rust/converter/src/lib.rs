//! Conversion jobs and pluggable converter backends.
//!
//! The orchestrator owns jobs until a backend accepts them via
//! [`ConverterBackend::push_job`]; one [`ConverterBackend::convert`] call per
//! round then runs everything the backend accepted. After `convert()`
//! returns, every accepted job must have produced its declared result file
//! or is considered failed by the caller.

mod shapeconv;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use cadbridge_shared::{JsonMap, Result};

pub use shapeconv::ShapeConvBackend;

/// One file to convert, with every path the backend needs.
///
/// The customizer-supplied extract options are flattened into the job at
/// the wire level so the external converter sees them as plain job fields.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionJob {
    /// Absolute path of the source file.
    pub file: PathBuf,

    /// Document-graph node id of the source file.
    #[serde(rename = "rootid")]
    pub root_id: String,

    /// Cache folder the converter writes artifacts into.
    #[serde(rename = "outputfolder")]
    pub output_folder: PathBuf,

    /// Where the converter must write its result JSON.
    #[serde(rename = "convresult")]
    pub result_file: PathBuf,

    /// Per-file converter log.
    #[serde(rename = "logfile")]
    pub log_file: PathBuf,

    /// Staging folder to copy the source into before loading, when set.
    #[serde(rename = "copybeforeload", skip_serializing_if = "Option::is_none")]
    pub copy_before_load: Option<PathBuf>,

    /// Customizer-supplied extract options.
    #[serde(flatten)]
    pub extract_options: JsonMap,
}

/// A conversion backend the orchestrator can offer jobs to.
#[async_trait]
pub trait ConverterBackend: Send {
    /// Offer a job; `true` means the backend owns it from now on.
    /// Accept/reject is all-or-nothing — no partial accept.
    fn push_job(&mut self, job: &ConversionJob) -> bool;

    /// Convert every accepted job. A failure here aborts the whole run.
    async fn convert(&mut self) -> Result<()>;
}
