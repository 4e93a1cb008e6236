//! Shared types, error model, and configuration for CadBridge.
//!
//! This crate is the foundation depended on by all other CadBridge crates.
//! It provides:
//! - [`CadBridgeError`] — the unified error type
//! - The document data model ([`Document`], [`ConvResult`], [`ChildLink`])
//! - Deterministic file identity ([`root_id_for_path`], [`file_etag`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, ConverterConfig, IndexConfig, LockConfig, SinkConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{CadBridgeError, Result};
pub use types::{
    AnnotationDoc, CONNECTOR_DOC_TYPES, ChildLink, ConvInfos, ConvResult, Document, GeometryDoc,
    GeometrySettings, JsonMap, MetadataDoc, PUSHED_FILES_SOURCER, ProjectDoc, StructureDoc,
    UNRESOLVED_REF, file_etag, root_id_for_path,
};
