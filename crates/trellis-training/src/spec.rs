//! Declarative session spec document.
//!
//! ```json
//! {
//!   "initialize": {
//!     "definitions": [{"group": "models", "name": "encoder", "spec": {"class": "..."}}],
//!     "pipelines": {"main": {"nodes": [{"name": "encoder", "model": "encoder", ...}]}}
//!   },
//!   "train": {"stages": [...], "settings": {...}}
//! }
//! ```

use crate::config::TrainingSettings;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Object categories a definition can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum ObjectGroup {
    Datasets,
    Splits,
    Preprocessors,
    Collators,
    Models,
    Optimizers,
    BatchAdapters,
    Losses,
    Metrics,
}

impl ObjectGroup {
    pub const ALL: [Self; 9] = [
        Self::Datasets,
        Self::Splits,
        Self::Preprocessors,
        Self::Collators,
        Self::Models,
        Self::Optimizers,
        Self::BatchAdapters,
        Self::Losses,
        Self::Metrics,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Datasets => "datasets",
            Self::Splits => "splits",
            Self::Preprocessors => "preprocessors",
            Self::Collators => "collators",
            Self::Models => "models",
            Self::Optimizers => "optimizers",
            Self::BatchAdapters => "batch_adapters",
            Self::Losses => "losses",
            Self::Metrics => "metrics",
        }
    }

    /// Groups whose state is written once at session creation rather than per checkpoint.
    #[must_use]
    pub fn is_static(self) -> bool {
        !matches!(self, Self::Models | Self::Optimizers)
    }
}

impl fmt::Display for ObjectGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectGroup {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|g| g.as_str() == s).ok_or_else(|| {
            let valid: Vec<&str> = Self::ALL.iter().map(|g| g.as_str()).collect();
            TrainingError::InvalidSpec(format!("unknown group `{s}`; must be one of [{}]", valid.join(", ")))
        })
    }
}

impl TryFrom<String> for ObjectGroup {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map_err(|e: TrainingError| e.to_string())
    }
}

/// Constructor description of a single object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectSpec {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Constructor keyword -> attribute published earlier in the same build.
    #[serde(default)]
    pub dynamic_kwargs: BTreeMap<String, String>,
    /// Dataset reference a preprocessor is fitted against.
    #[serde(default)]
    pub fit: Option<String>,
    /// Dataset a splitter partitions.
    #[serde(default)]
    pub dataset_name: Option<String>,
    /// Attributes published for later `dynamic_kwargs`.
    #[serde(default, alias = "expose_attributes")]
    pub expose: Vec<String>,
    /// Lookup-table names fed to a loss or metric.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Registered function applied to loss/metric arguments.
    #[serde(default)]
    pub transform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Definition {
    pub group: ObjectGroup,
    pub name: String,
    pub spec: ObjectSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub optimizer: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitializeSpec {
    #[serde(default)]
    pub definitions: Vec<Definition>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub pipeline: String,
    pub train_dataset: String,
    #[serde(default)]
    pub val_dataset: Option<String>,
    #[serde(default)]
    pub preprocessors: Vec<String>,
    pub collator: String,
    #[serde(default)]
    pub batch_adapter: Option<String>,
    pub loss: String,
    #[serde(default)]
    pub metrics: Vec<String>,
    pub epochs: usize,
    /// Nodes whose optimizers step in this stage; all nodes when absent.
    #[serde(default)]
    pub trainable: Option<Vec<String>>,
    /// Partial settings merged onto `train.settings`.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl StageSpec {
    /// The declared name, or `stage_<idx>` for an unnamed stage.
    #[must_use]
    pub fn resolved_name(&self, idx: usize) -> String {
        self.name.clone().unwrap_or_else(|| default_stage_name(idx))
    }
}

#[must_use]
pub fn default_stage_name(idx: usize) -> String {
    format!("stage_{idx}")
}

/// Names end up as file names under the session directory.
fn check_file_name(kind: &str, name: &str) -> TrainingResult<()> {
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(TrainingError::InvalidSpec(format!(
            "{kind} name `{name}` must not contain path separators or be `.`/`..`"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainSpec {
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub settings: TrainingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSpec {
    pub initialize: InitializeSpec,
    pub train: TrainSpec,
    /// Where the CLI creates the session when no directory is given.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
}

impl SessionSpec {
    pub fn from_value(document: &Value) -> TrainingResult<Self> {
        let spec: Self = serde_json::from_value(document.clone())
            .map_err(|e| TrainingError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        let mut seen = BTreeSet::new();
        // Static records share one directory, keyed by object name alone.
        let mut static_names = BTreeMap::new();
        for d in &self.initialize.definitions {
            if d.name.trim().is_empty() {
                return Err(TrainingError::InvalidSpec(format!("a {} definition has an empty name", d.group)));
            }
            check_file_name(&d.group.to_string(), &d.name)?;
            if !seen.insert((d.group, d.name.as_str())) {
                return Err(TrainingError::InvalidSpec(format!(
                    "duplicate name `{}` in group `{}`",
                    d.name, d.group
                )));
            }
            if d.group.is_static()
                && let Some(other) = static_names.insert(d.name.as_str(), d.group)
            {
                return Err(TrainingError::InvalidSpec(format!(
                    "name `{}` is used by both `{other}` and `{}`; static objects need distinct names",
                    d.name, d.group
                )));
            }
        }

        for (name, pipeline) in &self.initialize.pipelines {
            if pipeline.nodes.is_empty() {
                return Err(TrainingError::InvalidSpec(format!("pipeline `{name}` has no nodes")));
            }
            let mut nodes = BTreeSet::new();
            for node in &pipeline.nodes {
                if !nodes.insert(node.name.as_str()) {
                    return Err(TrainingError::InvalidSpec(format!(
                        "duplicate node `{}` in pipeline `{name}`",
                        node.name
                    )));
                }
            }
        }

        self.train.settings.validate()?;
        for (idx, stage) in self.train.stages.iter().enumerate() {
            check_file_name("stage", &stage.resolved_name(idx))?;
            if stage.epochs == 0 {
                return Err(TrainingError::InvalidSpec(format!("stage {idx} must train for at least one epoch")));
            }
        }
        Ok(())
    }
}

/// List key -> identity fields used to match records when merging lists.
pub type Keyring = BTreeMap<String, Vec<String>>;

/// Keyring for session spec documents.
#[must_use]
pub fn default_keyring() -> Keyring {
    let mut keyring = Keyring::new();
    keyring.insert("definitions".to_string(), vec!["group".to_string(), "name".to_string()]);
    keyring.insert("nodes".to_string(), vec!["name".to_string()]);
    keyring.insert("stages".to_string(), vec!["name".to_string()]);
    keyring
}

/// Merge an override document onto a session spec with [`default_keyring`].
///
/// Unnamed stages on either side are first given their positional default
/// name, so an unnamed override stage merges into the base stage at the same
/// position instead of being appended.
#[must_use]
pub fn override_session_spec(base: &Value, overrides: &Value) -> Value {
    let (mut base, mut overrides) = (base.clone(), overrides.clone());
    name_unnamed_stages(&mut base);
    name_unnamed_stages(&mut overrides);
    override_spec(&base, &overrides, &default_keyring())
}

fn name_unnamed_stages(document: &mut Value) {
    let Some(stages) = document.pointer_mut("/train/stages").and_then(Value::as_array_mut) else {
        return;
    };
    for (idx, stage) in stages.iter_mut().enumerate() {
        if let Some(stage) = stage.as_object_mut()
            && stage.get("name").is_none_or(Value::is_null)
        {
            stage.insert("name".to_string(), Value::String(default_stage_name(idx)));
        }
    }
}

/// Merge `overrides` onto `base`.
///
/// Mappings merge per key, recursively. Lists whose key is in `keyring` merge
/// record-by-record: records with equal identity fields are merged, unmatched
/// override records are appended and unmatched base records kept. Anything
/// else present in `overrides` replaces the base value.
#[must_use]
pub fn override_spec(base: &Value, overrides: &Value, keyring: &Keyring) -> Value {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => merge_maps(base, overrides, keyring),
        _ => overrides.clone(),
    }
}

fn merge_maps(base: &Map<String, Value>, overrides: &Map<String, Value>, keyring: &Keyring) -> Value {
    let mut merged = base.clone();
    for (key, value) in overrides {
        let next = match (merged.get(key), value) {
            (Some(existing @ Value::Object(_)), Value::Object(_)) => override_spec(existing, value, keyring),
            (Some(Value::Array(existing)), Value::Array(items)) => match keyring.get(key) {
                Some(id_fields) => merge_records(existing, items, id_fields, keyring),
                None => value.clone(),
            },
            _ => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    Value::Object(merged)
}

fn merge_records(base: &[Value], overrides: &[Value], id_fields: &[String], keyring: &Keyring) -> Value {
    let mut merged = base.to_vec();
    for item in overrides {
        match merged.iter().position(|candidate| same_identity(candidate, item, id_fields)) {
            Some(pos) => {
                let updated = override_spec(&merged[pos], item, keyring);
                merged[pos] = updated;
            }
            None => merged.push(item.clone()),
        }
    }
    Value::Array(merged)
}

fn same_identity(a: &Value, b: &Value, id_fields: &[String]) -> bool {
    !id_fields.is_empty()
        && id_fields.iter().all(|field| match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_override_empty_and_flat_mappings() {
        let none = Keyring::new();
        assert_eq!(override_spec(&json!({}), &json!({}), &none), json!({}));

        let d = json!({"a": 1, "b": 2});
        assert_eq!(override_spec(&d, &json!({}), &none), d);
        assert_eq!(override_spec(&json!({}), &d, &none), d);

        let merged = override_spec(&json!({"a": 1, "b": 2}), &json!({"a": 10, "c": 15}), &none);
        assert_eq!(merged, json!({"a": 10, "b": 2, "c": 15}));
    }

    #[test]
    fn test_override_nested_mappings_merge_per_key() {
        let base = json!({"a": 1, "b": 2, "nested_dict": {"x": 0, "y": 1}});
        let overrides = json!({"a": 10, "nested_dict": {"x": 100, "t": 50}});
        let expected = json!({"a": 10, "b": 2, "nested_dict": {"x": 100, "y": 1, "t": 50}});
        assert_eq!(override_spec(&base, &overrides, &Keyring::new()), expected);
    }

    #[test]
    fn test_override_record_lists_by_identity_key() {
        let base = json!({"a": 1, "b": 2, "alist": [{"id": 12, "x": 0}, {"id": 15, "y": 10}]});
        let overrides = json!({"a": 10, "alist": [{"id": 12, "x": 40}, {"id": 100, "c": 128}]});
        let mut keyring = Keyring::new();
        keyring.insert("alist".to_string(), vec!["id".to_string()]);

        let expected = json!({
            "a": 10,
            "b": 2,
            "alist": [{"id": 12, "x": 40}, {"id": 15, "y": 10}, {"id": 100, "c": 128}]
        });
        assert_eq!(override_spec(&base, &overrides, &keyring), expected);
    }

    #[test]
    fn test_lists_without_keyring_entry_are_replaced() {
        let merged = override_spec(&json!({"l": [1, 2]}), &json!({"l": [3]}), &Keyring::new());
        assert_eq!(merged, json!({"l": [3]}));
    }

    #[test]
    fn test_default_keyring_matches_definitions_by_group_and_name() {
        let base = json!({"definitions": [
            {"group": "models", "name": "enc", "spec": {"class": "A", "kwargs": {"h": 8}}},
            {"group": "optimizers", "name": "enc", "spec": {"class": "Sgd"}}
        ]});
        let overrides = json!({"definitions": [
            {"group": "models", "name": "enc", "spec": {"kwargs": {"h": 32}}}
        ]});
        let merged = override_spec(&base, &overrides, &default_keyring());
        assert_eq!(merged["definitions"][0]["spec"], json!({"class": "A", "kwargs": {"h": 32}}));
        assert_eq!(merged["definitions"][1]["spec"], json!({"class": "Sgd"}));
    }

    #[test]
    fn test_unknown_group_lists_valid_groups() {
        let err = "neural_maps".parse::<ObjectGroup>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("neural_maps"));
        assert!(msg.contains("batch_adapters"));
    }

    #[test]
    fn test_spec_rejects_unknown_keys_and_duplicates() {
        let doc = json!({
            "initialize": {"definitions": [{"group": "models", "name": "m", "spec": {"class": "X", "klass": 1}}]},
            "train": {"stages": []}
        });
        assert!(matches!(SessionSpec::from_value(&doc), Err(TrainingError::InvalidSpec(_))));

        let doc = json!({
            "initialize": {"definitions": [
                {"group": "models", "name": "m", "spec": {"class": "X"}},
                {"group": "models", "name": "m", "spec": {"class": "Y"}}
            ]},
            "train": {"stages": []}
        });
        let err = SessionSpec::from_value(&doc).unwrap_err();
        assert!(err.to_string().contains("duplicate name `m`"));
    }

    #[test]
    fn test_static_objects_need_distinct_names() {
        let doc = json!({
            "initialize": {"definitions": [
                {"group": "datasets", "name": "text", "spec": {"class": "X"}},
                {"group": "preprocessors", "name": "text", "spec": {"class": "Y"}}
            ]},
            "train": {"stages": []}
        });
        let err = SessionSpec::from_value(&doc).unwrap_err();
        assert!(err.to_string().contains("static objects need distinct names"));

        let doc = json!({
            "initialize": {"definitions": [
                {"group": "models", "name": "enc", "spec": {"class": "X"}},
                {"group": "optimizers", "name": "enc", "spec": {"class": "Y"}}
            ]},
            "train": {"stages": []}
        });
        assert!(SessionSpec::from_value(&doc).is_ok());
    }

    #[test]
    fn test_spec_parses_group_names() {
        let doc = json!({
            "initialize": {"definitions": [{"group": "batch_adapters", "name": "a", "spec": {"class": "X"}}]},
            "train": {"stages": []}
        });
        let spec = SessionSpec::from_value(&doc).unwrap();
        assert_eq!(spec.initialize.definitions[0].group, ObjectGroup::BatchAdapters);
    }

    fn stage(name: Option<&str>) -> Value {
        let mut stage = json!({"pipeline": "p", "train_dataset": "d", "collator": "c", "loss": "l", "epochs": 1});
        if let Some(name) = name {
            stage["name"] = json!(name);
        }
        stage
    }

    #[test]
    fn test_names_must_be_safe_file_names() {
        let doc = json!({"initialize": {}, "train": {"stages": [stage(Some("../escape"))]}});
        let err = SessionSpec::from_value(&doc).unwrap_err();
        assert!(err.to_string().contains("stage name `../escape`"));

        let doc = json!({
            "initialize": {"definitions": [{"group": "preprocessors", "name": "a/b", "spec": {"class": "X"}}]},
            "train": {"stages": []}
        });
        assert!(SessionSpec::from_value(&doc).is_err());

        let doc = json!({"initialize": {}, "train": {"stages": [stage(Some(".."))]}});
        assert!(SessionSpec::from_value(&doc).is_err());
    }

    #[test]
    fn test_session_override_merges_unnamed_stages_by_position() {
        let base = json!({"initialize": {}, "train": {"stages": [stage(None), stage(Some("tune"))]}});
        let overrides = json!({"train": {"stages": [{"epochs": 5}, {"name": "tune", "epochs": 2}, {"epochs": 7}]}});

        let merged = override_session_spec(&base, &overrides);
        let stages = merged["train"]["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0]["name"], json!("stage_0"));
        assert_eq!(stages[0]["epochs"], json!(5));
        assert_eq!(stages[0]["pipeline"], json!("p"));
        assert_eq!(stages[1]["epochs"], json!(2));
        assert_eq!(stages[2], json!({"name": "stage_2", "epochs": 7}));
    }
}
