//! Merge analyzer defaults, a persisted artifact and command-line overrides
//! into one canonical parameter set.
//!
//! Precedence, highest first: override, persisted value, analyzer default.
//! A persisted value only loses to the default when its parameter vanished
//! from the script, in which case it is dropped with a warning.

use crate::analyzer::{Parameter, Schema};
use crate::artifact::ConfigArtifact;
use crate::error::ConfigError;
use crate::kind::{split_top_level, strip_quotes, ParamKind, ParamValue};
use std::path::{Path, PathBuf};

/// One `--name value` request after argument parsing. `raw` may still hold
/// several comma-separated candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub name: String,
    pub raw: String,
}

/// Override names use dashes or underscores interchangeably.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().replace('-', "_")
}

/// Parse trailing command-line arguments into overrides.
///
/// Accepts `--name value`, `--name=value`, `--name v1,v2` and
/// `--name v1 v2` (space-separated values join into one multi-value
/// request). A repeated flag replaces the earlier one.
pub fn parse_override_args(args: &[String]) -> Result<Vec<Override>, ConfigError> {
    let mut out: Vec<Override> = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    fn finish(out: &mut Vec<Override>, name: String, values: Vec<String>) -> Result<(), ConfigError> {
        if values.is_empty() {
            return Err(ConfigError::NoValues { name });
        }
        let raw = values.join(",");
        out.retain(|o| o.name != name);
        out.push(Override { name, raw });
        Ok(())
    }

    for arg in args {
        if let Some(flag) = arg.strip_prefix("--").filter(|f| !f.is_empty()) {
            if let Some((name, values)) = current.take() {
                finish(&mut out, name, values)?;
            }
            match flag.split_once('=') {
                Some((name, value)) => {
                    finish(&mut out, normalize_name(name), vec![value.to_string()])?;
                }
                None => current = Some((normalize_name(flag), Vec::new())),
            }
            continue;
        }
        match current.as_mut() {
            Some((_, values)) => values.push(arg.clone()),
            None => return Err(ConfigError::UnexpectedArgument { arg: arg.clone() }),
        }
    }
    if let Some((name, values)) = current.take() {
        finish(&mut out, name, values)?;
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub name: String,
    pub kind: ParamKind,
    /// Candidate values in request order. Exactly one unless `multi`.
    pub candidates: Vec<ParamValue>,
    /// Whether this parameter was requested as a grid axis. Kept separately
    /// from the candidate count so a one-element grid survives a round trip.
    pub multi: bool,
}

/// Canonical parameter set: every schema parameter, in declaration order,
/// with its candidate values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub script_reference: PathBuf,
    pub manifest_path: Option<PathBuf>,
    /// Present when the set was loaded from a single run's snapshot.
    pub batch_index: Option<usize>,
    pub entries: Vec<ParamEntry>,
}

impl ParameterSet {
    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Number of runs the set expands to; `None` on overflow.
    pub fn run_count(&self) -> Option<usize> {
        self.entries
            .iter()
            .try_fold(1usize, |acc, e| acc.checked_mul(e.candidates.len()))
    }

    pub fn to_artifact(&self) -> ConfigArtifact {
        ConfigArtifact::from_parameter_set(self)
    }
}

pub fn synthesize(
    schema: &Schema,
    script_reference: &Path,
    persisted: Option<&ConfigArtifact>,
    overrides: &[Override],
) -> Result<ParameterSet, ConfigError> {
    for o in overrides {
        if schema.get(&o.name).is_none() {
            return Err(ConfigError::UnknownParameter {
                name: o.name.clone(),
            });
        }
    }

    if let Some(artifact) = persisted {
        for name in artifact.parameters.keys() {
            if schema.get(name).is_none() {
                tracing::warn!(
                    parameter = %name,
                    "persisted parameter no longer present in the script; dropping it"
                );
            }
        }
    }

    let mut entries = Vec::with_capacity(schema.len());
    for param in schema.parameters() {
        let requested = overrides.iter().rev().find(|o| o.name == param.name);
        let persisted_value = persisted.and_then(|a| a.parameters.get(&param.name));
        let entry = match (requested, persisted_value) {
            (Some(o), _) => entry_from_override(param, &o.raw)?,
            (None, Some(value)) => entry_from_persisted(param, value)?,
            (None, None) => ParamEntry {
                name: param.name.clone(),
                kind: param.kind.clone(),
                candidates: vec![param.default.clone()],
                multi: false,
            },
        };
        entries.push(entry);
    }

    Ok(ParameterSet {
        script_reference: script_reference.to_path_buf(),
        manifest_path: persisted.and_then(|a| a.manifest_path.clone()),
        batch_index: persisted.and_then(|a| a.batch_index),
        entries,
    })
}

fn entry_from_override(param: &Parameter, raw: &str) -> Result<ParamEntry, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::NoValues {
            name: param.name.clone(),
        });
    }
    let pieces = split_top_level(raw);
    let multi = pieces.len() > 1;
    let mut candidates = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let piece = piece.trim();
        let text = match param.kind {
            ParamKind::String => strip_quotes(piece),
            _ => piece,
        };
        let value = if piece.is_empty() {
            None
        } else {
            param.kind.coerce(text)
        };
        match value {
            Some(v) => candidates.push(v),
            None => {
                return Err(ConfigError::InvalidValue {
                    name: param.name.clone(),
                    value: piece.to_string(),
                    expected: param.kind.clone(),
                })
            }
        }
    }
    Ok(ParamEntry {
        name: param.name.clone(),
        kind: param.kind.clone(),
        candidates,
        multi,
    })
}

/// A persisted value either fits the parameter's kind directly, or is an
/// array of values that each fit it (an unexpanded grid request).
fn entry_from_persisted(param: &Parameter, value: &toml::Value) -> Result<ParamEntry, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: param.name.clone(),
        value: value.to_string(),
        expected: param.kind.clone(),
    };
    let parsed = ParamValue::from_toml(value).ok_or_else(invalid)?;

    if let Some(single) = parsed.conform(&param.kind) {
        return Ok(ParamEntry {
            name: param.name.clone(),
            kind: param.kind.clone(),
            candidates: vec![single],
            multi: false,
        });
    }
    let ParamValue::List(items) = parsed else {
        return Err(invalid());
    };
    if items.is_empty() {
        return Err(ConfigError::NoValues {
            name: param.name.clone(),
        });
    }
    let candidates = items
        .iter()
        .map(|item| item.conform(&param.kind))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(invalid)?;
    Ok(ParamEntry {
        name: param.name.clone(),
        kind: param.kind.clone(),
        candidates,
        multi: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_source;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn apples() -> Schema {
        analyze_source(
            "num_apples = 100\napple_price = 3.0\nlabel = \"red\"\nlayers = [64, 32]\n",
            "apples.py",
        )
        .expect("analyze")
        .schema
    }

    #[test]
    fn override_syntax_variants() {
        let parsed = parse_override_args(&args(&[
            "--num-apples",
            "30",
            "60",
            "--apple_price=1.0,2.0",
            "--label",
            "green",
        ]))
        .expect("parse");
        assert_eq!(
            parsed,
            vec![
                Override { name: "num_apples".into(), raw: "30,60".into() },
                Override { name: "apple_price".into(), raw: "1.0,2.0".into() },
                Override { name: "label".into(), raw: "green".into() },
            ]
        );
    }

    #[test]
    fn override_syntax_errors() {
        let err = parse_override_args(&args(&["30"])).expect_err("bare value");
        assert!(matches!(err, ConfigError::UnexpectedArgument { .. }));
        let err = parse_override_args(&args(&["--lr"])).expect_err("no value");
        assert!(matches!(err, ConfigError::NoValues { ref name } if name == "lr"));
    }

    #[test]
    fn repeated_flag_replaces_earlier() {
        let parsed = parse_override_args(&args(&["--x", "1", "--y", "2", "--x", "3"])).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], Override { name: "x".into(), raw: "3".into() });
    }

    #[test]
    fn defaults_without_overrides() {
        let set = synthesize(&apples(), Path::new("apples.py"), None, &[]).expect("synth");
        assert_eq!(set.run_count(), Some(1));
        let names: Vec<_> = set.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["num_apples", "apple_price", "label", "layers"]);
        assert!(set.entries.iter().all(|e| !e.multi));
    }

    #[test]
    fn overrides_split_and_coerce() {
        let overrides = parse_override_args(&args(&[
            "--num_apples=30,60",
            "--apple_price",
            "1",
            "--layers",
            "[8,8],[16]",
            "--label",
            "'a,b',c",
        ]))
        .expect("parse");
        let set = synthesize(&apples(), Path::new("apples.py"), None, &overrides).expect("synth");
        let apples = set.get("num_apples").expect("num_apples");
        assert!(apples.multi);
        assert_eq!(
            apples.candidates,
            vec![ParamValue::Integer(30), ParamValue::Integer(60)]
        );
        let price = set.get("apple_price").expect("apple_price");
        assert!(!price.multi);
        assert_eq!(price.candidates, vec![ParamValue::Float(1.0)]);
        assert_eq!(set.get("layers").expect("layers").candidates.len(), 2);
        assert_eq!(
            set.get("label").expect("label").candidates,
            vec![ParamValue::String("a,b".into()), ParamValue::String("c".into())]
        );
        assert_eq!(set.run_count(), Some(8));
    }

    #[test]
    fn invalid_value_names_parameter_and_value() {
        let overrides = vec![Override { name: "num_apples".into(), raw: "abc".into() }];
        let err = synthesize(&apples(), Path::new("apples.py"), None, &overrides).expect_err("abc");
        match &err {
            ConfigError::InvalidValue { name, value, expected } => {
                assert_eq!(name, "num_apples");
                assert_eq!(value, "abc");
                assert_eq!(*expected, ParamKind::Integer);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("num_apples"));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn empty_candidate_is_invalid() {
        let overrides = vec![Override { name: "num_apples".into(), raw: "1,,2".into() }];
        let err = synthesize(&apples(), Path::new("apples.py"), None, &overrides).expect_err("gap");
        assert!(matches!(err, ConfigError::InvalidValue { ref value, .. } if value.is_empty()));
    }

    #[test]
    fn unknown_override_is_rejected() {
        let overrides = vec![Override { name: "num_pears".into(), raw: "1".into() }];
        let err = synthesize(&apples(), Path::new("apples.py"), None, &overrides).expect_err("pears");
        assert!(matches!(err, ConfigError::UnknownParameter { ref name } if name == "num_pears"));
    }

    #[test]
    fn persisted_values_sit_between_default_and_override() {
        let text = r#"[meta]
schema_version = "paramit_config_v1"
script_reference = "apples.py"

[parameters]
num_apples = 7
apple_price = [1, 2.5]
retired = true
"#;
        let artifact = ConfigArtifact::parse(text, Path::new("apples.toml")).expect("parse");
        let overrides = vec![Override { name: "num_apples".into(), raw: "9".into() }];
        let set = synthesize(&apples(), Path::new("apples.py"), Some(&artifact), &overrides)
            .expect("synth");
        assert_eq!(set.get("num_apples").expect("n").candidates, vec![ParamValue::Integer(9)]);
        let price = set.get("apple_price").expect("price");
        assert!(price.multi);
        assert_eq!(price.candidates, vec![ParamValue::Float(1.0), ParamValue::Float(2.5)]);
        assert_eq!(
            set.get("label").expect("label").candidates,
            vec![ParamValue::String("red".into())]
        );
        assert!(set.get("retired").is_none());
    }

    #[test]
    fn persisted_list_kind_is_a_single_value() {
        let text = "[meta]\nschema_version = \"paramit_config_v1\"\nscript_reference = \"a.py\"\n\n[parameters]\nlayers = [1, 2]\n";
        let artifact = ConfigArtifact::parse(text, Path::new("a.toml")).expect("parse");
        let set = synthesize(&apples(), Path::new("a.py"), Some(&artifact), &[]).expect("synth");
        let layers = set.get("layers").expect("layers");
        assert!(!layers.multi);
        assert_eq!(layers.candidates.len(), 1);
    }

    #[test]
    fn trailing_comma_is_an_empty_candidate() {
        let overrides = vec![Override { name: "num_apples".into(), raw: "1,".into() }];
        let err = synthesize(&apples(), Path::new("apples.py"), None, &overrides).expect_err("1,");
        assert!(matches!(err, ConfigError::InvalidValue { ref value, .. } if value.is_empty()));
    }

    #[test]
    fn persisted_one_element_array_stays_a_grid() {
        let text = "[meta]\nschema_version = \"paramit_config_v1\"\nscript_reference = \"/w/apples.py\"\n\n[parameters]\nnum_apples = [7]\n";
        let artifact = ConfigArtifact::parse(text, Path::new("a.toml")).expect("parse");
        let set = synthesize(&apples(), Path::new("/w/apples.py"), Some(&artifact), &[]).expect("synth");
        let apples_entry = set.get("num_apples").expect("num_apples");
        assert!(apples_entry.multi);
        assert_eq!(apples_entry.candidates, vec![ParamValue::Integer(7)]);
        assert!(set.to_artifact().to_toml_string().contains("num_apples = [7]"));
    }

    #[test]
    fn persisted_type_mismatch_is_config_error() {
        let text = "[meta]\nschema_version = \"paramit_config_v1\"\nscript_reference = \"a.py\"\n\n[parameters]\nnum_apples = \"many\"\n";
        let artifact = ConfigArtifact::parse(text, Path::new("a.toml")).expect("parse");
        let err = synthesize(&apples(), Path::new("a.py"), Some(&artifact), &[]).expect_err("mismatch");
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "num_apples"));
    }

    #[test]
    fn artifact_round_trip_is_byte_exact() {
        let overrides = vec![Override { name: "num_apples".into(), raw: "30,60".into() }];
        let set = synthesize(&apples(), Path::new("/w/apples.py"), None, &overrides).expect("synth");
        let first = set.to_artifact().to_toml_string();
        let reloaded = ConfigArtifact::parse(&first, Path::new("x.toml")).expect("parse");
        let again = synthesize(&apples(), &reloaded.script_reference, Some(&reloaded), &[])
            .expect("resynth")
            .to_artifact()
            .to_toml_string();
        assert_eq!(first, again);
    }
}
