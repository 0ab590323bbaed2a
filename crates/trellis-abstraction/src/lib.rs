//! Component abstraction layer for Trellis.
//!
//! This crate defines the contracts through which the training core talks to
//! pluggable units: datasets, preprocessors, collators, batch adapters,
//! networks, optimizers, losses and metrics. Tensor math never happens here;
//! it is delegated to whatever `Backend` the units are written against.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Serialized state of a component (weights, fitted vocabularies, permutations, ...).
pub type StateRecord = Value;

/// A single raw example produced by a dataset.
pub type Example = Value;

/// Tensors keyed by variable name.
pub type TensorMap<T> = BTreeMap<String, T>;

/// Represents an error raised by a pluggable component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    /// A constructor argument is missing or has the wrong shape.
    #[error("Invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Positional index or keyword name.
        name: String,
        /// Why the argument was rejected.
        reason: String,
    },

    /// An index was outside of a dataset's bounds.
    #[error("Index {index} out of bounds for dataset of length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// A persisted state record could not be applied.
    #[error("Invalid state record: {0}")]
    InvalidState(String),

    /// The component has persisted state but no way to restore it.
    #[error("Component carries a persisted state record but does not implement restoration")]
    StateNotRestorable,

    /// The computation backend reported a failure.
    #[error("Compute Error: {0}")]
    Compute(String),

    /// Other unexpected errors.
    #[error("Other Component Error: {0}")]
    Other(String),
}

/// Returns true for records that carry no state (`null` or `{}`).
#[must_use]
pub fn is_empty_record(state: &StateRecord) -> bool {
    match state {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// The differentiable-computation library a set of components is written against.
///
/// The core only moves tensors around by name; it needs exactly three things
/// from the backend: reading a scalar, back-propagating a loss and running a
/// closure with gradient tracking disabled.
pub trait Backend: 'static {
    /// Opaque tensor handle.
    type Tensor: Clone + fmt::Debug;

    /// Extract a scalar value (loss, metric) from a tensor.
    fn to_scalar(tensor: &Self::Tensor) -> Result<f64, ComponentError>;

    /// Back-propagate from a scalar loss tensor.
    fn backward(loss: &Self::Tensor) -> Result<(), ComponentError>;

    /// Run `f` without recording gradients.
    fn without_grad<R>(f: impl FnOnce() -> R) -> R {
        f()
    }
}

/// Base contract shared by every component stored in a session.
///
/// The defaults describe a stateless helper: it persists nothing and accepts
/// an empty record on restore. A non-empty record handed to a component that
/// never overrode `load_state_dict` is reported, not dropped.
pub trait Component {
    /// Serializable state, `None` when the component is stateless.
    fn state_dict(&self) -> Option<StateRecord> {
        None
    }

    /// Restore from a record previously produced by `state_dict`.
    fn load_state_dict(&mut self, state: StateRecord) -> Result<(), ComponentError> {
        if is_empty_record(&state) {
            Ok(())
        } else {
            Err(ComponentError::StateNotRestorable)
        }
    }

    /// Named attribute published to later constructors (e.g. a vocabulary size).
    fn attribute(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }
}

/// Random-access collection of raw examples.
pub trait Dataset: Component + Send + Sync {
    /// Number of examples.
    fn len(&self) -> usize;

    /// Fetch the example at `index`.
    fn get(&self, index: usize) -> Result<Example, ComponentError>;

    /// Whether the dataset has no examples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-example transformation fitted against a dataset.
pub trait Preprocessor: Component {
    /// Learn whatever the preprocessor needs from `dataset`.
    fn fit(&mut self, dataset: &dyn Dataset) -> Result<(), ComponentError>;

    /// Transform a single example.
    fn process(&self, example: Example) -> Result<Example, ComponentError>;
}

/// Turns a list of examples into a batch of tensors.
pub trait Collator<B: Backend>: Component {
    fn collate(&self, examples: Vec<Example>) -> Result<Batch<B::Tensor>, ComponentError>;
}

/// Reshapes a collated batch into the layout the pipeline expects.
pub trait BatchAdapter<B: Backend>: Component {
    fn adapt(&self, batch: Batch<B::Tensor>) -> Result<Batch<B::Tensor>, ComponentError>;
}

/// A sub-model of a pipeline.
pub trait Network<B: Backend>: Component {
    /// Run the forward pass; inputs and outputs are ordered as declared in the pipeline.
    fn forward(&mut self, inputs: Vec<B::Tensor>) -> Result<Vec<B::Tensor>, ComponentError>;

    /// Switch between training and evaluation behavior.
    fn set_training(&mut self, training: bool) {
        let _ = training;
    }
}

/// Parameter update rule bound to one network.
pub trait Optimizer<B: Backend>: Component {
    fn zero_grad(&mut self, network: &mut dyn Network<B>) -> Result<(), ComponentError>;

    fn step(&mut self, network: &mut dyn Network<B>) -> Result<(), ComponentError>;
}

/// Loss function producing a differentiable scalar.
pub trait Criterion<B: Backend>: Component {
    fn compute(&self, args: &[B::Tensor]) -> Result<B::Tensor, ComponentError>;
}

/// Evaluation metric producing a plain scalar.
pub trait Metric<B: Backend>: Component {
    fn compute(&self, args: &[B::Tensor]) -> Result<f64, ComponentError>;
}

/// An already-batched set of examples.
///
/// `inputs` is keyed by pipeline node name, then by variable name; `targets`
/// is keyed by variable name.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub inputs: BTreeMap<String, TensorMap<T>>,
    pub targets: TensorMap<T>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self { inputs: BTreeMap::new(), targets: BTreeMap::new() }
    }
}

impl<T> Batch<T> {
    /// Add an input variable for a node.
    #[must_use]
    pub fn with_input(mut self, node: &str, name: &str, value: T) -> Self {
        self.inputs.entry(node.to_string()).or_default().insert(name.to_string(), value);
        self
    }

    /// Add a target variable.
    #[must_use]
    pub fn with_target(mut self, name: &str, value: T) -> Self {
        self.targets.insert(name.to_string(), value);
        self
    }
}

/// Positional and keyword arguments passed to a registered constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstructorArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ConstructorArgs {
    #[must_use]
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ComponentError> {
        let value = self.args.get(index).ok_or_else(|| ComponentError::InvalidArgument {
            name: index.to_string(),
            reason: format!("only {} positional arguments given", self.args.len()),
        })?;
        decode(&index.to_string(), value)
    }

    /// Deserialize the keyword argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, ComponentError> {
        let value = self.kwargs.get(name).ok_or_else(|| ComponentError::InvalidArgument {
            name: name.to_string(),
            reason: "missing keyword argument".to_string(),
        })?;
        decode(name, value)
    }

    /// Deserialize the keyword argument `name`, falling back to `default`.
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, ComponentError> {
        match self.kwargs.get(name) {
            Some(value) => decode(name, value),
            None => Ok(default),
        }
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, ComponentError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ComponentError::InvalidArgument { name: name.to_string(), reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Stateless;
    impl Component for Stateless {}

    #[test]
    fn test_stateless_component_accepts_empty_record() {
        let mut c = Stateless;
        assert!(c.state_dict().is_none());
        assert!(c.load_state_dict(json!({})).is_ok());
        assert!(c.load_state_dict(Value::Null).is_ok());
    }

    #[test]
    fn test_stateless_component_rejects_real_state() {
        let mut c = Stateless;
        let err = c.load_state_dict(json!({"vocab": ["a"]})).unwrap_err();
        assert_eq!(err, ComponentError::StateNotRestorable);
    }

    #[test]
    fn test_constructor_args_decoding() {
        let mut kwargs = Map::new();
        kwargs.insert("hidden".to_string(), json!(16));
        let args = ConstructorArgs::new(vec![json!("gru")], kwargs);

        assert_eq!(args.arg::<String>(0).unwrap(), "gru");
        assert_eq!(args.kwarg::<usize>("hidden").unwrap(), 16);
        assert_eq!(args.kwarg_or::<f64>("dropout", 0.1).unwrap(), 0.1);
        assert!(args.arg::<String>(1).is_err());
        assert!(args.kwarg::<String>("hidden").is_err());
    }

    #[test]
    fn test_batch_builders() {
        let batch = Batch::default().with_input("encoder", "x", 1).with_target("y", 2);
        assert_eq!(batch.inputs["encoder"]["x"], 1);
        assert_eq!(batch.targets["y"], 2);
    }
}
