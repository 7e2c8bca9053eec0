//! Environment provisioning collaborator.

use crate::manifest::{DependencyManifest, ManifestKind};
use crate::toolchain::Interpreter;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Populates a staging directory with an environment satisfying a
/// manifest. The cache publishes the directory only when this returns `Ok`.
pub trait Provisioner: Send + Sync {
    fn provision(&self, manifest: &DependencyManifest, staging: &Path) -> Result<()>;
}

/// Interpreter inside an environment directory.
pub fn interpreter_in(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

/// Builds a virtual environment with the configured interpreter and
/// installs the manifest into it with pip.
#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    interpreter: Interpreter,
}

impl VenvProvisioner {
    pub fn new(interpreter: Interpreter) -> Self {
        Self { interpreter }
    }
}

impl Provisioner for VenvProvisioner {
    fn provision(&self, manifest: &DependencyManifest, staging: &Path) -> Result<()> {
        let output = Command::new(&self.interpreter.program)
            .arg("-m")
            .arg("venv")
            .arg(staging)
            .output()
            .with_context(|| format!("failed to start {}", self.interpreter.program))?;
        check("venv creation", &output)?;

        let python = interpreter_in(staging);
        let Some(manifest_path) = manifest.path.as_deref() else {
            return Ok(());
        };
        let manifest_dir = manifest_path.parent().unwrap_or(Path::new("."));
        let mut pip = Command::new(&python);
        pip.arg("-m")
            .arg("pip")
            .arg("install")
            .arg("--disable-pip-version-check")
            .current_dir(manifest_dir);
        match manifest.kind {
            ManifestKind::Requirements => {
                pip.arg("-r").arg(manifest_path);
            }
            ManifestKind::Project => {
                pip.arg(manifest_dir);
            }
            ManifestKind::Empty => return Ok(()),
        }
        tracing::info!(manifest = %manifest_path.display(), "installing dependencies");
        let output = pip
            .output()
            .with_context(|| format!("failed to start {}", python.display()))?;
        check("dependency installation", &output)
    }
}

fn check(step: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    bail!("{step} exited with {}:\n{}", output.status, tail.join("\n"))
}
