//! Notebook input: code cells linearised into a percent-format script.

use crate::error::AnalysisError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct NotebookFile {
    cells: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    cell_type: String,
    #[serde(default)]
    source: CellSource,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CellSource {
    Lines(Vec<String>),
    Text(String),
}

impl Default for CellSource {
    fn default() -> Self {
        CellSource::Text(String::new())
    }
}

impl CellSource {
    fn text(&self) -> String {
        match self {
            CellSource::Lines(lines) => lines.concat(),
            CellSource::Text(text) => text.clone(),
        }
    }
}

pub fn is_notebook(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("ipynb")
}

/// Join the notebook's cells in order. Code cells are kept verbatim except
/// for IPython magics and shell escapes, which are commented out; markdown
/// cells become comments.
pub fn linearize(raw: &str, path: &Path) -> Result<String, AnalysisError> {
    let notebook: NotebookFile =
        serde_json::from_str(raw).map_err(|err| AnalysisError::Notebook {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?;

    let mut out = String::new();
    for cell in &notebook.cells {
        let text = cell.source.text();
        match cell.cell_type.as_str() {
            "code" => {
                out.push_str("# %%\n");
                for line in text.lines() {
                    let trimmed = line.trim_start();
                    if trimmed.starts_with('%') || trimmed.starts_with('!') {
                        out.push_str("# ");
                    }
                    out.push_str(line);
                    out.push('\n');
                }
            }
            "markdown" => {
                out.push_str("# %% [markdown]\n");
                for line in text.lines() {
                    if line.is_empty() {
                        out.push_str("#\n");
                    } else {
                        out.push_str("# ");
                        out.push_str(line);
                        out.push('\n');
                    }
                }
            }
            _ => {}
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_source;
    use crate::kind::ParamValue;

    #[test]
    fn code_cells_are_linearised_in_order() {
        let raw = r##"{
          "cells": [
            {"cell_type": "markdown", "source": ["# Title\n", "\n", "notes"]},
            {"cell_type": "code", "source": ["%matplotlib inline\n", "lr = 0.01\n"]},
            {"cell_type": "code", "source": "!pip install numpy\nepochs = 5"},
            {"cell_type": "raw", "source": "ignored = 1"}
          ],
          "metadata": {}, "nbformat": 4, "nbformat_minor": 5
        }"##;
        let text = linearize(raw, Path::new("nb.ipynb")).expect("linearize");
        assert!(text.contains("# %matplotlib inline\n"));
        assert!(text.contains("# !pip install numpy\n"));
        assert!(!text.contains("ignored"));

        let analysis = analyze_source(&text, "nb.ipynb").expect("analyze");
        let names: Vec<_> = analysis.schema.names().collect();
        assert_eq!(names, vec!["lr", "epochs"]);
        assert_eq!(
            analysis.schema.get("epochs").expect("epochs").default,
            ParamValue::Integer(5)
        );
    }

    #[test]
    fn malformed_notebook_is_an_analysis_error() {
        let err = linearize("{\"cells\": 3}", Path::new("bad.ipynb")).expect_err("bad");
        assert!(matches!(err, AnalysisError::Notebook { .. }));
    }
}
