//! Core domain types: the document graph model and deterministic file identity.
//!
//! Documents are the unit exchanged between the external converter, the
//! transformer, the on-disk cache and the index service. The converter
//! emits loosely-structured JSON; every variant therefore carries a
//! flattened `extra` map so unknown converter fields round-trip through
//! cache rewrites untouched.

use std::path::Path;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CadBridgeError, Result};

/// Flattened JSON object map used for loosely-typed converter payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Sentinel `ref` value written when an xref cannot be resolved.
pub const UNRESOLVED_REF: &str = "unresolved";

/// Sourcer name identifying geometry artifacts uploaded by this connector.
pub const PUSHED_FILES_SOURCER: &str = "cadbridge_pushedfiles";

/// Document types owned by the connector in the index (used by delete-by-type).
pub const CONNECTOR_DOC_TYPES: &[&str] = &[
    "structure",
    "partmetadata",
    "linkmetadata",
    "annotation",
    "geometry",
    "instancemetadata",
    "projectdocument",
];

// ---------------------------------------------------------------------------
// File identity
// ---------------------------------------------------------------------------

/// Derive the deterministic document-graph node id for a source file.
///
/// A pure function of the absolute path: `hash_` + base64(SHA-256(path))
/// with `/` mapped to `_` so the id is safe inside cache folder names.
pub fn root_id_for_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    format!("hash_{}", digest.replace('/', "_"))
}

/// Staleness fingerprint for a source file: integer seconds of mtime.
pub fn file_etag(path: &Path) -> Result<i64> {
    let meta = std::fs::metadata(path).map_err(|e| CadBridgeError::io(path, e))?;
    let modified = meta.modified().map_err(|e| CadBridgeError::io(path, e))?;
    let secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    Ok(secs.round() as i64)
}

// ---------------------------------------------------------------------------
// Document variants
// ---------------------------------------------------------------------------

/// One child slot of a structure document.
///
/// Fresh converter output carries the raw xref marker; graph rewriting adds
/// the resolved `ref`. The persisted cache copy keeps both so a cached
/// result can be re-resolved on later runs; the marker fields are stripped
/// from the copy uploaded to the sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildLink {
    /// Resolved target node id (or the `unresolved` sentinel).
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Raw textual cross-reference as emitted by the converter.
    #[serde(rename = "shapeconv:xref", skip_serializing_if = "Option::is_none")]
    pub raw_xref: Option<String>,

    /// Inline per-instance metadata attached to the link by the converter.
    #[serde(
        rename = "shapeconv:xrefmetadata",
        skip_serializing_if = "Option::is_none"
    )]
    pub xref_metadata: Option<JsonMap>,

    /// Set once a sibling linkmetadata document has been spawned for this link.
    #[serde(rename = "hasmetadata", default)]
    pub has_metadata: bool,

    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Assembly structure node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    /// linkId → child link.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub children: std::collections::BTreeMap<String, ChildLink>,
    /// Geometry document id this node renders with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Settings block of a geometry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeometrySettings {
    pub path: String,
    pub sourcer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loginfo: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Geometry artifact reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeometryDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    pub geometrysettings: GeometrySettings,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Part/link/instance metadata payload: a flat string → scalar map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Annotation document (PMI, markups); opaque to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Project-level document (build parameters, scripts, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// A document of the graph, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Document {
    #[serde(rename = "structure")]
    Structure(StructureDoc),
    #[serde(rename = "geometry")]
    Geometry(GeometryDoc),
    #[serde(rename = "partmetadata")]
    PartMetadata(MetadataDoc),
    #[serde(rename = "linkmetadata")]
    LinkMetadata(MetadataDoc),
    #[serde(rename = "instancemetadata")]
    InstanceMetadata(MetadataDoc),
    #[serde(rename = "annotation")]
    Annotation(AnnotationDoc),
    #[serde(rename = "projectdocument")]
    ProjectDocument(ProjectDoc),
}

// A hand-written Deserialize keeps the `type` tag out of the flattened
// `extra` maps (the derive for internally tagged enums re-feeds the tag to
// the variant struct, where `flatten` would capture it and duplicate the
// key on the next serialize).
impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        let mut value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| D::Error::custom("document must be a JSON object"))?;
        let tag = obj
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| D::Error::custom("document is missing its `type` field"))?;

        let doc = match tag.as_str() {
            "structure" => Document::Structure(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            "geometry" => Document::Geometry(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            "partmetadata" => Document::PartMetadata(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            "linkmetadata" => Document::LinkMetadata(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            "instancemetadata" => Document::InstanceMetadata(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            "annotation" => Document::Annotation(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            "projectdocument" => Document::ProjectDocument(
                serde_json::from_value(value).map_err(D::Error::custom)?,
            ),
            other => {
                return Err(D::Error::custom(format!(
                    "unknown document type `{other}`"
                )));
            }
        };
        Ok(doc)
    }
}

impl Document {
    /// Document id (unique across the graph).
    pub fn id(&self) -> &str {
        match self {
            Self::Structure(d) => &d.id,
            Self::Geometry(d) => &d.id,
            Self::PartMetadata(d) | Self::LinkMetadata(d) | Self::InstanceMetadata(d) => &d.id,
            Self::Annotation(d) => &d.id,
            Self::ProjectDocument(d) => &d.id,
        }
    }

    /// Wire name of the document type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Structure(_) => "structure",
            Self::Geometry(_) => "geometry",
            Self::PartMetadata(_) => "partmetadata",
            Self::LinkMetadata(_) => "linkmetadata",
            Self::InstanceMetadata(_) => "instancemetadata",
            Self::Annotation(_) => "annotation",
            Self::ProjectDocument(_) => "projectdocument",
        }
    }

    pub fn ts(&self) -> Option<i64> {
        match self {
            Self::Structure(d) => d.ts,
            Self::Geometry(d) => d.ts,
            Self::PartMetadata(d) | Self::LinkMetadata(d) | Self::InstanceMetadata(d) => d.ts,
            Self::Annotation(d) => d.ts,
            Self::ProjectDocument(d) => d.ts,
        }
    }

    pub fn set_ts(&mut self, ts: Option<i64>) {
        match self {
            Self::Structure(d) => d.ts = ts,
            Self::Geometry(d) => d.ts = ts,
            Self::PartMetadata(d) | Self::LinkMetadata(d) | Self::InstanceMetadata(d) => {
                d.ts = ts;
            }
            Self::Annotation(d) => d.ts = ts,
            Self::ProjectDocument(d) => d.ts = ts,
        }
    }
}

// ---------------------------------------------------------------------------
// ConvResult
// ---------------------------------------------------------------------------

/// The `infos` block of a conversion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvInfos {
    /// Conversion timestamp; default ts stamped onto documents lacking one.
    pub ts: i64,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// A per-file conversion result, as persisted in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvResult {
    #[serde(default)]
    pub docs: Vec<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infos: Option<ConvInfos>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl ConvResult {
    /// An empty object on disk signals an interrupted prior run.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.infos.is_none() && self.extra.is_empty()
    }

    pub fn push_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }
}
