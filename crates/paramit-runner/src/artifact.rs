//! Canonical configuration artifact: the TOML document written next to a
//! script, into every run directory, and accepted back as a run target.
//!
//! ```toml
//! [meta]
//! schema_version = "paramit_config_v1"
//! script_reference = "/abs/path/train.py"
//! manifest_path = "/abs/path/requirements.txt"   # optional
//! batch_index = 0                                 # run snapshots only
//!
//! [parameters]
//! num_apples = 100
//! apple_price = [1.0, 2.0]                        # unexpanded grid request
//! ```
//!
//! Serialization is deterministic: meta keys in fixed order, parameters in
//! declaration order.

use crate::error::ConfigError;
use crate::expand::RunConfig;
use crate::synth::ParameterSet;
use paramit_core::atomic_write_bytes;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: &str = "paramit_config_v1";

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigArtifact {
    pub schema_version: String,
    pub script_reference: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub batch_index: Option<usize>,
    /// Raw parameter values in document order; interpreted against a
    /// schema by the synthesizer.
    pub parameters: toml::Table,
}

impl ConfigArtifact {
    pub fn from_parameter_set(params: &ParameterSet) -> Self {
        let mut parameters = toml::Table::new();
        for entry in &params.entries {
            let value = if entry.multi {
                toml::Value::Array(entry.candidates.iter().map(|v| v.to_toml()).collect())
            } else {
                match entry.candidates.first() {
                    Some(v) => v.to_toml(),
                    None => toml::Value::Array(Vec::new()),
                }
            };
            parameters.insert(entry.name.clone(), value);
        }
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            script_reference: params.script_reference.clone(),
            manifest_path: params.manifest_path.clone(),
            batch_index: params.batch_index,
            parameters,
        }
    }

    pub fn from_run_config(run: &RunConfig) -> Self {
        let mut parameters = toml::Table::new();
        for binding in &run.bindings {
            parameters.insert(binding.name.clone(), binding.value.to_toml());
        }
        Self {
            schema_version: run.schema_version.clone(),
            script_reference: run.script_reference.clone(),
            manifest_path: run.manifest_path.clone(),
            batch_index: Some(run.batch_index),
            parameters,
        }
    }

    pub fn to_toml_string(&self) -> String {
        let mut meta = toml::Table::new();
        meta.insert(
            "schema_version".to_string(),
            toml::Value::String(self.schema_version.clone()),
        );
        meta.insert(
            "script_reference".to_string(),
            toml::Value::String(self.script_reference.to_string_lossy().to_string()),
        );
        if let Some(manifest) = &self.manifest_path {
            meta.insert(
                "manifest_path".to_string(),
                toml::Value::String(manifest.to_string_lossy().to_string()),
            );
        }
        if let Some(index) = self.batch_index {
            meta.insert(
                "batch_index".to_string(),
                toml::Value::Integer(index as i64),
            );
        }
        let mut doc = toml::Table::new();
        doc.insert("meta".to_string(), toml::Value::Table(meta));
        doc.insert(
            "parameters".to_string(),
            toml::Value::Table(self.parameters.clone()),
        );
        doc.to_string()
    }

    /// Parse artifact text; `path` only labels errors.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let malformed = |detail: String| ConfigError::MalformedArtifact {
            path: path.to_path_buf(),
            detail,
        };
        let mut doc: toml::Table = text.parse().map_err(|e: toml::de::Error| malformed(e.to_string()))?;

        let meta = match doc.remove("meta") {
            Some(toml::Value::Table(meta)) => meta,
            Some(_) => return Err(malformed("[meta] must be a table".to_string())),
            None => return Err(malformed("missing [meta] table".to_string())),
        };
        let parameters = match doc.remove("parameters") {
            Some(toml::Value::Table(parameters)) => parameters,
            Some(_) => return Err(malformed("[parameters] must be a table".to_string())),
            None => toml::Table::new(),
        };
        if let Some(extra) = doc.keys().next() {
            return Err(malformed(format!("unexpected top-level key `{extra}`")));
        }

        let schema_version = match meta.get("schema_version") {
            Some(toml::Value::String(s)) => s.clone(),
            _ => return Err(malformed("meta.schema_version must be a string".to_string())),
        };
        if schema_version != CONFIG_SCHEMA_VERSION {
            return Err(malformed(format!(
                "unsupported schema_version `{schema_version}` (expected {CONFIG_SCHEMA_VERSION})"
            )));
        }
        let script_reference = match meta.get("script_reference") {
            Some(toml::Value::String(s)) if !s.is_empty() => PathBuf::from(s),
            _ => {
                return Err(malformed(
                    "meta.script_reference must be a non-empty string".to_string(),
                ))
            }
        };
        let manifest_path = match meta.get("manifest_path") {
            None => None,
            Some(toml::Value::String(s)) if s.is_empty() => None,
            Some(toml::Value::String(s)) => Some(PathBuf::from(s)),
            Some(_) => return Err(malformed("meta.manifest_path must be a string".to_string())),
        };
        let batch_index = match meta.get("batch_index") {
            None => None,
            Some(toml::Value::Integer(i)) if *i >= 0 => Some(*i as usize),
            Some(_) => {
                return Err(malformed(
                    "meta.batch_index must be a non-negative integer".to_string(),
                ))
            }
        };

        Ok(Self {
            schema_version,
            script_reference,
            manifest_path,
            batch_index,
            parameters,
        })
    }

    /// Load from disk. Relative references are resolved against the
    /// artifact's own directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ArtifactIo {
            path: path.to_path_buf(),
            source,
        })?;
        let mut artifact = Self::parse(&text, path)?;
        let base = path.parent().unwrap_or(Path::new("."));
        if artifact.script_reference.is_relative() {
            artifact.script_reference = base.join(&artifact.script_reference);
        }
        if let Some(manifest) = artifact.manifest_path.as_mut() {
            if manifest.is_relative() {
                *manifest = base.join(&*manifest);
            }
        }
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        atomic_write_bytes(path, self.to_toml_string().as_bytes()).map_err(|source| {
            ConfigError::ArtifactIo {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[meta]
schema_version = "paramit_config_v1"
script_reference = "/work/apples.py"
batch_index = 3

[parameters]
num_apples = 30
apple_price = [1.0, 2.0]
label = "green"
"#;

    #[test]
    fn parse_keeps_document_order() {
        let artifact = ConfigArtifact::parse(SAMPLE, Path::new("a.toml")).expect("parse");
        assert_eq!(artifact.script_reference, PathBuf::from("/work/apples.py"));
        assert_eq!(artifact.batch_index, Some(3));
        assert_eq!(artifact.manifest_path, None);
        let keys: Vec<_> = artifact.parameters.keys().cloned().collect();
        assert_eq!(keys, vec!["num_apples", "apple_price", "label"]);
    }

    #[test]
    fn serialization_is_stable() {
        let artifact = ConfigArtifact::parse(SAMPLE, Path::new("a.toml")).expect("parse");
        let once = artifact.to_toml_string();
        let again = ConfigArtifact::parse(&once, Path::new("a.toml"))
            .expect("reparse")
            .to_toml_string();
        assert_eq!(once, again);
        assert!(once.starts_with("[meta]\n"));
    }

    #[test]
    fn rejects_malformed_documents() {
        let cases = [
            ("not toml = = 1", "a.toml"),
            ("[parameters]\nx = 1\n", "missing [meta]"),
            (
                "[meta]\nschema_version = \"v0\"\nscript_reference = \"s.py\"\n",
                "unsupported schema_version",
            ),
            (
                "[meta]\nschema_version = \"paramit_config_v1\"\n",
                "script_reference",
            ),
            (
                "[meta]\nschema_version = \"paramit_config_v1\"\nscript_reference = \"s.py\"\nbatch_index = -1\n",
                "batch_index",
            ),
            (
                "extra = 1\n[meta]\nschema_version = \"paramit_config_v1\"\nscript_reference = \"s.py\"\n",
                "unexpected top-level key",
            ),
        ];
        for (text, needle) in cases {
            let err = ConfigArtifact::parse(text, Path::new("a.toml")).expect_err(text);
            assert!(matches!(err, ConfigError::MalformedArtifact { .. }));
            assert!(err.to_string().contains(needle), "{text:?} -> {err}");
        }
    }

    #[test]
    fn load_resolves_relative_references() {
        let root = std::env::temp_dir().join(format!(
            "paramit_artifact_{}",
            paramit_core::scratch_suffix()
        ));
        let path = root.join("exp.toml");
        let text = "[meta]\nschema_version = \"paramit_config_v1\"\nscript_reference = \"exp.py\"\nmanifest_path = \"requirements.txt\"\n";
        paramit_core::atomic_write_bytes(&path, text.as_bytes()).expect("write");
        let artifact = ConfigArtifact::load(&path).expect("load");
        assert_eq!(artifact.script_reference, root.join("exp.py"));
        assert_eq!(artifact.manifest_path, Some(root.join("requirements.txt")));
        let _ = fs::remove_dir_all(root);
    }
}
