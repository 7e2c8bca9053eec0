//! Cartesian expansion of a parameter set into concrete runs.

use crate::artifact::CONFIG_SCHEMA_VERSION;
use crate::error::ConfigError;
use crate::kind::ParamValue;
use crate::synth::ParameterSet;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    pub name: String,
    pub value: ParamValue,
}

/// One fully bound execution. Holds exactly one binding per schema
/// parameter, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub schema_version: String,
    pub script_reference: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub batch_index: usize,
    pub bindings: Vec<ParameterBinding>,
}

impl RunConfig {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.bindings
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.value)
    }

    pub fn iter_bindings(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.bindings.iter().map(|b| (b.name.as_str(), &b.value))
    }

    /// Directory-name fragment built from the values of grid axes, e.g.
    /// `num_apples-30_apple_price-1.0`. Empty when nothing varies.
    pub fn slug(&self, axes: &[String]) -> String {
        let parts: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| axes.contains(&b.name))
            .map(|b| format!("{}-{}", b.name, b.value.slug_fragment()))
            .collect();
        let mut slug = parts.join("_");
        if slug.len() > 80 {
            let mut cut = 80;
            while !slug.is_char_boundary(cut) {
                cut -= 1;
            }
            slug.truncate(cut);
        }
        slug
    }

    /// Bindings as a JSON object keyed by parameter name.
    pub fn bindings_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for binding in &self.bindings {
            map.insert(binding.name.clone(), binding.value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentBatch {
    pub runs: Vec<RunConfig>,
    /// Names of parameters requested with several candidates.
    pub axes: Vec<String>,
}

impl ExperimentBatch {
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AxisSummary {
    pub name: String,
    pub candidates: usize,
}

/// Enumerate every combination, last-declared parameter varying fastest.
/// A set loaded from a single run's snapshot keeps its `batch_index` when
/// it expands to exactly one run.
pub fn expand(params: &ParameterSet) -> Result<ExperimentBatch, ConfigError> {
    for entry in &params.entries {
        if entry.candidates.is_empty() {
            return Err(ConfigError::NoValues {
                name: entry.name.clone(),
            });
        }
    }
    let total = params.run_count().ok_or(ConfigError::ExpansionOverflow)?;
    let axes: Vec<String> = params
        .entries
        .iter()
        .filter(|e| e.multi)
        .map(|e| e.name.clone())
        .collect();

    let mut runs = Vec::with_capacity(total);
    let mut odometer = vec![0usize; params.entries.len()];
    for batch_index in 0..total {
        let bindings = params
            .entries
            .iter()
            .zip(&odometer)
            .map(|(entry, &i)| ParameterBinding {
                name: entry.name.clone(),
                value: entry.candidates[i].clone(),
            })
            .collect();
        runs.push(RunConfig {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            script_reference: params.script_reference.clone(),
            manifest_path: params.manifest_path.clone(),
            batch_index: match (total, params.batch_index) {
                (1, Some(kept)) => kept,
                _ => batch_index,
            },
            bindings,
        });

        for (slot, entry) in odometer.iter_mut().zip(&params.entries).rev() {
            *slot += 1;
            if *slot < entry.candidates.len() {
                break;
            }
            *slot = 0;
        }
    }

    Ok(ExperimentBatch { runs, axes })
}

pub fn axis_summary(params: &ParameterSet) -> Vec<AxisSummary> {
    params
        .entries
        .iter()
        .map(|e| AxisSummary {
            name: e.name.clone(),
            candidates: e.candidates.len(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::ParamKind;
    use crate::synth::ParamEntry;

    fn entry(name: &str, values: &[i64]) -> ParamEntry {
        ParamEntry {
            name: name.to_string(),
            kind: ParamKind::Integer,
            candidates: values.iter().map(|v| ParamValue::Integer(*v)).collect(),
            multi: values.len() > 1,
        }
    }

    fn set(entries: Vec<ParamEntry>) -> ParameterSet {
        ParameterSet {
            script_reference: PathBuf::from("/w/s.py"),
            manifest_path: None,
            batch_index: None,
            entries,
        }
    }

    fn values(run: &RunConfig) -> Vec<i64> {
        run.bindings
            .iter()
            .map(|b| match b.value {
                ParamValue::Integer(i) => i,
                _ => panic!("not an integer"),
            })
            .collect()
    }

    #[test]
    fn last_parameter_varies_fastest() {
        let batch = expand(&set(vec![entry("a", &[1, 2]), entry("b", &[10, 20, 30])]))
            .expect("expand");
        let combos: Vec<_> = batch.runs.iter().map(values).collect();
        assert_eq!(
            combos,
            vec![
                vec![1, 10],
                vec![1, 20],
                vec![1, 30],
                vec![2, 10],
                vec![2, 20],
                vec![2, 30]
            ]
        );
        let indices: Vec<_> = batch.runs.iter().map(|r| r.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(batch.axes, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn count_is_product_of_lengths() {
        let batch = expand(&set(vec![
            entry("a", &[1, 2]),
            entry("b", &[1, 2, 3]),
            entry("c", &[1, 2, 3, 4]),
        ]))
        .expect("expand");
        assert_eq!(batch.len(), 24);
        let distinct: std::collections::BTreeSet<_> = batch.runs.iter().map(values).collect();
        assert_eq!(distinct.len(), 24);
    }

    #[test]
    fn single_run_is_identity() {
        let params = set(vec![entry("a", &[5]), entry("b", &[6])]);
        let batch = expand(&params).expect("expand");
        assert_eq!(batch.len(), 1);
        assert!(batch.axes.is_empty());
        assert_eq!(values(&batch.runs[0]), vec![5, 6]);
        assert_eq!(batch.runs[0].slug(&batch.axes), "");
    }

    #[test]
    fn snapshot_keeps_its_batch_index() {
        let mut params = set(vec![entry("a", &[5])]);
        params.batch_index = Some(3);
        let batch = expand(&params).expect("expand");
        assert_eq!(batch.runs[0].batch_index, 3);
    }

    #[test]
    fn empty_candidates_fail() {
        let err = expand(&set(vec![entry("a", &[1]), entry("b", &[])])).expect_err("empty");
        assert!(matches!(err, ConfigError::NoValues { ref name } if name == "b"));
    }

    #[test]
    fn slug_names_grid_axes_only() {
        let batch = expand(&set(vec![entry("a", &[1, 2]), entry("b", &[7])])).expect("expand");
        assert_eq!(batch.runs[1].slug(&batch.axes), "a-2");
    }
}
