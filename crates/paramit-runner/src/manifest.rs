//! Dependency manifest discovery and normalisation.

use crate::error::EnvironmentError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_NAMES: &[&str] = &["requirements.txt", "pyproject.toml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    Requirements,
    Project,
    /// No manifest: the environment holds the bare interpreter.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyManifest {
    pub path: Option<PathBuf>,
    pub kind: ManifestKind,
    pub content: String,
}

impl DependencyManifest {
    pub fn empty() -> Self {
        Self {
            path: None,
            kind: ManifestKind::Empty,
            content: String::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, EnvironmentError> {
        let content = fs::read_to_string(path).map_err(|e| EnvironmentError::InvalidManifest {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let kind = match path.file_name().and_then(|n| n.to_str()) {
            Some("pyproject.toml") => {
                content
                    .parse::<toml::Table>()
                    .map_err(|e| EnvironmentError::InvalidManifest {
                        path: path.to_path_buf(),
                        detail: e.to_string(),
                    })?;
                ManifestKind::Project
            }
            _ => ManifestKind::Requirements,
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            kind,
            content,
        })
    }

    /// Search `start` and its ancestors, stopping at the enclosing git
    /// work tree root. `None` when nothing is found.
    pub fn discover(start: &Path) -> Result<Option<Self>, EnvironmentError> {
        let mut dir = Some(start);
        while let Some(current) = dir {
            for name in MANIFEST_NAMES {
                let candidate = current.join(name);
                if candidate.is_file() {
                    return Self::load(&candidate).map(Some);
                }
            }
            if current.join(".git").exists() {
                break;
            }
            dir = current.parent();
        }
        Ok(None)
    }

    /// Resolve the manifest for a script: an explicit path wins, then
    /// discovery, then the empty manifest.
    pub fn resolve(explicit: Option<&Path>, script_dir: &Path) -> Result<Self, EnvironmentError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::discover(script_dir)? {
            Some(found) => Ok(found),
            None => {
                tracing::warn!(
                    dir = %script_dir.display(),
                    "no dependency manifest found; using the bare interpreter"
                );
                Ok(Self::empty())
            }
        }
    }

    /// Content with formatting noise removed: lines trimmed, blanks and
    /// comment lines dropped, the rest sorted. Requirement order carries no
    /// meaning, so two manifests differing only in these respects share one
    /// environment.
    pub fn normalized(&self) -> String {
        let mut lines: Vec<&str> = self
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        lines.sort_unstable();
        lines.join("\n")
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path
            .as_deref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "paramit_manifest_{label}_{}",
            paramit_core::scratch_suffix()
        ))
    }

    fn requirements(content: &str) -> DependencyManifest {
        DependencyManifest {
            path: None,
            kind: ManifestKind::Requirements,
            content: content.to_string(),
        }
    }

    #[test]
    fn normalization_ignores_formatting() {
        let a = requirements("numpy==1.26\n\n  pandas>=2 \n# plotting\nmatplotlib\n");
        let b = requirements("matplotlib\npandas>=2\r\nnumpy==1.26");
        assert_eq!(a.normalized(), b.normalized());
        assert_eq!(a.normalized(), "matplotlib\nnumpy==1.26\npandas>=2");
        assert_ne!(a.normalized(), requirements("numpy==1.25").normalized());
    }

    #[test]
    fn discovery_walks_up_to_git_root() {
        let root = scratch("discover");
        let nested = root.join("repo").join("src").join("exp");
        paramit_core::ensure_dir(&nested).expect("dirs");
        fs::create_dir(root.join("repo").join(".git")).expect("git");
        fs::write(root.join("repo").join("requirements.txt"), "numpy\n").expect("write");
        fs::write(root.join("requirements.txt"), "outside\n").expect("write");

        let found = DependencyManifest::discover(&nested)
            .expect("discover")
            .expect("manifest");
        assert_eq!(found.content, "numpy\n");
        assert_eq!(found.kind, ManifestKind::Requirements);

        fs::remove_file(root.join("repo").join("requirements.txt")).expect("rm");
        assert!(DependencyManifest::discover(&nested).expect("discover").is_none());
        let fallback = DependencyManifest::resolve(None, &nested).expect("resolve");
        assert_eq!(fallback.kind, ManifestKind::Empty);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invalid_pyproject_is_rejected() {
        let root = scratch("pyproject");
        paramit_core::ensure_dir(&root).expect("dir");
        let path = root.join("pyproject.toml");
        fs::write(&path, "[project\nname = ").expect("write");
        let err = DependencyManifest::load(&path).expect_err("invalid");
        assert!(matches!(err, EnvironmentError::InvalidManifest { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
