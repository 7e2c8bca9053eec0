//! Interpreter selection and version probes.

use crate::error::EnvironmentError;
use std::process::Command;

/// Replaces the configured interpreter when set.
pub const PYTHON_ENV_VAR: &str = "PARAMIT_PYTHON";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: String,
}

impl Interpreter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `$PARAMIT_PYTHON` if set and non-empty, else `configured`.
    pub fn resolve(configured: &str) -> Self {
        match std::env::var(PYTHON_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => Self::new(value.trim()),
            _ => Self::new(configured),
        }
    }

    /// Version pin used in environment keys, e.g. `3.11.4`.
    pub fn version_pin(&self) -> Result<String, EnvironmentError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .map_err(|e| EnvironmentError::Interpreter {
                program: self.program.clone(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(EnvironmentError::Interpreter {
                program: self.program.clone(),
                detail: format!("`--version` exited with {}", output.status),
            });
        }
        // Older interpreters print the version on stderr.
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_python_version(&text).ok_or_else(|| EnvironmentError::Interpreter {
            program: self.program.clone(),
            detail: format!("unrecognised version output: {}", text.trim()),
        })
    }
}

pub fn parse_python_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Python ")?;
        let version = rest.split_whitespace().next()?;
        version
            .chars()
            .next()
            .filter(char::is_ascii_digit)
            .map(|_| version.to_string())
    })
}

/// CUDA toolkit release reported by `nvcc`, if one is installed.
pub fn probe_cuda_version() -> Option<String> {
    let output = Command::new("nvcc").arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nvcc_release(&String::from_utf8_lossy(&output.stdout))
}

/// Extract `X.Y` from nvcc's `..., release X.Y, V...` line.
pub fn parse_nvcc_release(output: &str) -> Option<String> {
    let (_, tail) = output.split_once("release ")?;
    let (release, _) = tail.split_once(',')?;
    let release = release.trim();
    if release.is_empty() || release.contains(char::is_whitespace) {
        return None;
    }
    Some(release.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_python_version_lines() {
        assert_eq!(parse_python_version("Python 3.11.4\n"), Some("3.11.4".into()));
        assert_eq!(
            parse_python_version("Python 3.13.0rc1 (main)\n"),
            Some("3.13.0rc1".into())
        );
        assert_eq!(parse_python_version("python: not found"), None);
    }

    #[test]
    fn parses_nvcc_release() {
        let sample = "nvcc: NVIDIA (R) Cuda compiler driver\n\
                      Copyright (c) 2005-2023 NVIDIA Corporation\n\
                      Cuda compilation tools, release 12.2, V12.2.140\n";
        assert_eq!(parse_nvcc_release(sample), Some("12.2".into()));
        assert_eq!(parse_nvcc_release("no toolkit here"), None);
    }

    #[test]
    fn missing_interpreter_is_environment_error() {
        let err = Interpreter::new("paramit-no-such-python")
            .version_pin()
            .expect_err("missing");
        assert!(matches!(err, EnvironmentError::Interpreter { .. }));
    }
}
