//! Customization hook over converter output.
//!
//! A [`Customizer`] decides per-file extract options for conversion jobs
//! and may freely rewrite the id-indexed document set before it is
//! persisted and uploaded. [`DefaultCustomizer`] normalizes the flat
//! metadata maps most CAD kernels emit: well-known numeric properties are
//! grouped into named sub-objects and `Namespace::Property` composite keys
//! are folded into a `SpecificMd` list.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use cadbridge_shared::{Document, JsonMap};

/// Pluggable conversion customization.
pub trait Customizer: Send + Sync {
    /// Extract options for one file, flattened into its conversion job.
    /// Must be a pure function of the file name/extension.
    fn extract_settings(&self, file: &Path) -> JsonMap;

    /// Rewrite the id-indexed document set of one conversion result in
    /// place. Removing the root id truncates the file's subtree.
    fn process_result(
        &self,
        docs: &mut BTreeMap<String, Document>,
        root_id: &str,
        source_file: &Path,
    );
}

// ---------------------------------------------------------------------------
// DefaultCustomizer
// ---------------------------------------------------------------------------

/// Mass-properties keys grouped under `MassProperties` (default 0.0 each).
const MASS_PROPERTY_KEYS: &[&str] = &[
    "Area (m2)",
    "Volume (m3)",
    "Mass (kg)",
    "Length (m)",
    "GX (m)",
    "GY (m)",
    "GZ (m)",
    "First Inertia Moment (kg/m2)",
    "Second Inertia Moment (kg/m2)",
    "Third Inertia Moment (kg/m2)",
    "Inertia Matrix Ixx (kg/m2)",
    "Inertia Matrix Iyy (kg/m2)",
    "Inertia Matrix Izz (kg/m2)",
    "Inertia Matrix Ixy (kg/m2)",
    "Inertia Matrix Iyz (kg/m2)",
    "Inertia Matrix Izx (kg/m2)",
    "First Inertia Axis Xx",
    "First Inertia Axis Xy",
    "First Inertia Axis Xz",
    "Second Inertia Axis Yx",
    "Second Inertia Axis Yy",
    "Second Inertia Axis Yz",
    "Third Inertia Axis Zx",
    "Third Inertia Axis Zy",
    "Third Inertia Axis Zz",
    "Xmin (m)",
    "Ymin (m)",
    "Zmin (m)",
    "Xmax (m)",
    "Ymax (m)",
    "Zmax (m)",
];

/// Source-unit keys grouped under `OriginalUnits` (default 1.0 each — a
/// unit scale of 1 means no conversion happened).
const ORIGINAL_UNIT_KEYS: &[&str] = &[
    "Original mass unit (kg)",
    "Original length unit (m)",
    "Original time unit (s)",
];

/// Density keys grouped under `Density` (default 0.0 each).
const DENSITY_KEYS: &[&str] = &[
    "Volume Density (kg/m3)",
    "Surface Density (kg/m2)",
    "Linear Density (kg/m)",
];

/// Default customizer: metadata grouping and composite-key folding.
pub struct DefaultCustomizer {
    specific_re: Regex,
}

impl DefaultCustomizer {
    pub fn new() -> Self {
        Self {
            specific_re: Regex::new(r"^(.*)::(.+)$").expect("static regex"),
        }
    }

    fn normalize_metadata(&self, md: &mut JsonMap) {
        regroup_values(md, MASS_PROPERTY_KEYS, "MassProperties", 0.0);
        regroup_values(md, ORIGINAL_UNIT_KEYS, "OriginalUnits", 1.0);
        regroup_values(md, DENSITY_KEYS, "Density", 0.0);

        // Fold Namespace::Property keys into a SpecificMd list.
        let mut specific: BTreeMap<String, JsonMap> = BTreeMap::new();
        let composite_keys: Vec<String> = md
            .keys()
            .filter(|k| self.specific_re.is_match(k))
            .cloned()
            .collect();
        for key in composite_keys {
            let Some(caps) = self.specific_re.captures(&key) else {
                continue;
            };
            let namespace = caps[1].to_string();
            let property = caps[2].to_string();
            if let Some(value) = md.remove(&key) {
                specific.entry(namespace).or_default().insert(property, value);
            }
        }
        if !specific.is_empty() {
            let list: Vec<Value> = specific
                .into_iter()
                .map(|(name, values)| {
                    serde_json::json!({ "name": name, "values": Value::Object(values) })
                })
                .collect();
            md.insert("SpecificMd".to_string(), Value::Array(list));
        }
    }
}

impl Default for DefaultCustomizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Customizer for DefaultCustomizer {
    fn extract_settings(&self, file: &Path) -> JsonMap {
        let is_product = file
            .extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case("catproduct"))
            .unwrap_or(false);

        let mut options = JsonMap::new();
        options.insert("extractannot".into(), Value::Bool(true));
        options.insert("extractannotoriginaldata".into(), Value::Bool(false));
        options.insert("extractmetadata".into(), Value::Bool(true));
        options.insert("extractlinkmetadata".into(), Value::Bool(true));
        options.insert("extracthiddenobjects".into(), Value::Bool(is_product));
        options.insert("subpartlevel".into(), serde_json::json!(["root"]));
        options
    }

    fn process_result(
        &self,
        docs: &mut BTreeMap<String, Document>,
        _root_id: &str,
        _source_file: &Path,
    ) {
        for doc in docs.values_mut() {
            match doc {
                Document::PartMetadata(d) | Document::LinkMetadata(d) => {
                    self.normalize_metadata(&mut d.metadata);
                }
                _ => {}
            }
        }
    }
}

/// Move `keys` present in `md` into a `dst` sub-object. The group is
/// dropped entirely (keys removed, no sub-object) when every member equals
/// `default`.
fn regroup_values(md: &mut JsonMap, keys: &[&str], dst: &str, default: f64) {
    let mut group = JsonMap::new();
    for key in keys {
        if let Some(value) = md.remove(*key) {
            group.insert((*key).to_string(), value);
        }
    }
    if group.is_empty() {
        return;
    }
    let all_default = group
        .values()
        .all(|v| v.as_f64().map(|n| n == default).unwrap_or(false));
    if !all_default {
        md.insert(dst.to_string(), Value::Object(group));
    }
}
