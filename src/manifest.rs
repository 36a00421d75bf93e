//! The static variant manifest consumed by the web application.
//!
//! Written unconditionally on every run: the manifest is deterministic from
//! configuration, so there is nothing worth protecting from overwrite. Keys
//! are camelCase because the consumer is JavaScript.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;

/// Schema version stamped into the manifest.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// One deployable model variant.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub name: String,

    /// Web path of the artifact, relative to the site root.
    pub path: String,

    pub description: String,

    /// Spatial input size in pixels (inputs are square).
    pub input_size: usize,

    /// Web path of the labels file.
    pub labels_path: String,
}

/// The document written to `model_config.json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelManifest {
    pub models: Vec<ModelEntry>,
    pub version: String,
    pub last_updated: String,
}

/// Errors from [`write_manifest`].
#[derive(Debug)]
pub enum ManifestError {
    /// Serializing the manifest failed.
    Json(serde_json::Error),

    /// Writing the file failed.
    Io(io::Error),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Json(err) => write!(f, "manifest encoding failed: {}", err),
            ManifestError::Io(err) => write!(f, "failed to write manifest: {}", err),
        }
    }
}

impl Error for ManifestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ManifestError::Json(err) => Some(err),
            ManifestError::Io(err) => Some(err),
        }
    }
}

fn web_path(file_name: &str) -> String {
    format!("/models/{}", file_name)
}

/// Assemble the manifest for both variants of the configured model.
///
/// Both variants are always listed, whether or not their files exist yet;
/// the consumer probes availability at load time.
pub fn build_manifest(config: &PipelineConfig) -> ModelManifest {
    let labels_path = web_path(config.labels_file());
    let models = vec![
        ModelEntry {
            name: config.model_name.clone(),
            path: web_path(&config.model_file()),
            description: format!("{} image classification model", config.model_name),
            input_size: config.input_spec.height,
            labels_path: labels_path.clone(),
        },
        ModelEntry {
            name: format!("{}-simplified", config.model_name),
            path: web_path(&config.simplified_file()),
            description: format!("Simplified {} model", config.model_name),
            input_size: config.input_spec.height,
            labels_path,
        },
    ];
    ModelManifest {
        models,
        version: MANIFEST_VERSION.to_string(),
        last_updated: chrono::Utc::now().format("%Y-%m-%d").to_string(),
    }
}

/// Build and write the manifest, overwriting any existing file.
pub fn write_manifest(config: &PipelineConfig) -> Result<ModelManifest, ManifestError> {
    let manifest = build_manifest(config);
    let json = serde_json::to_vec_pretty(&manifest).map_err(ManifestError::Json)?;
    fs::write(config.manifest_path(), json).map_err(ManifestError::Io)?;
    Ok(manifest)
}
