//! Toy backend and components for exercising the training core without a
//! tensor library. Tensors are plain `Vec<f64>`.

use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::ClassRegistry;
use crate::TrainingResult;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Mutex;
use trellis_abstraction::{
    is_empty_record, Backend, Batch, BatchAdapter, Collator, Component, ComponentError, ConstructorArgs, Criterion,
    Dataset, Example, Metric, Network, Optimizer, Preprocessor, StateRecord,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ToyBackend;

impl Backend for ToyBackend {
    type Tensor = Vec<f64>;

    fn to_scalar(tensor: &Self::Tensor) -> Result<f64, ComponentError> {
        if tensor.is_empty() {
            return Err(ComponentError::Compute("empty tensor has no scalar value".to_string()));
        }
        Ok(tensor.iter().sum::<f64>() / tensor.len() as f64)
    }

    fn backward(_loss: &Self::Tensor) -> Result<(), ComponentError> {
        Ok(())
    }
}

fn invalid_state(e: impl std::fmt::Display) -> ComponentError {
    ComponentError::InvalidState(e.to_string())
}

/// `y = weight * (x_1 + ... + x_n) + bias`, element-wise over its inputs.
#[derive(Debug, Clone)]
pub struct Affine {
    weight: f64,
    bias: f64,
    width: Option<usize>,
    training: bool,
}

impl Affine {
    pub fn from_args(args: &ConstructorArgs) -> TrainingResult<Self> {
        Ok(Self {
            weight: args.kwarg_or("weight", 1.0)?,
            bias: args.kwarg_or("bias", 0.0)?,
            width: args.kwarg_or("width", None)?,
            training: true,
        })
    }
}

impl Component for Affine {
    fn state_dict(&self) -> Option<StateRecord> {
        Some(json!({"weight": self.weight, "bias": self.bias}))
    }

    fn load_state_dict(&mut self, state: StateRecord) -> Result<(), ComponentError> {
        if is_empty_record(&state) {
            return Ok(());
        }
        self.weight = state["weight"].as_f64().ok_or_else(|| invalid_state("missing weight"))?;
        self.bias = state["bias"].as_f64().ok_or_else(|| invalid_state("missing bias"))?;
        Ok(())
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "width" => self.width.map(|w| json!(w)),
            "training" => Some(json!(self.training)),
            _ => None,
        }
    }
}

impl Network<ToyBackend> for Affine {
    fn forward(&mut self, inputs: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, ComponentError> {
        let len = inputs.first().map_or(0, Vec::len);
        if inputs.iter().any(|t| t.len() != len) {
            return Err(ComponentError::Compute("inputs have different lengths".to_string()));
        }
        let out = (0..len).map(|i| self.weight * inputs.iter().map(|t| t[i]).sum::<f64>() + self.bias).collect();
        Ok(vec![out])
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Moves every parameter down by `lr` per step.
#[derive(Debug, Clone)]
pub struct ToySgd {
    lr: f64,
    steps: u64,
}

impl ToySgd {
    pub fn from_args(args: &ConstructorArgs) -> TrainingResult<Self> {
        Ok(Self { lr: args.kwarg_or("lr", 0.01)?, steps: 0 })
    }
}

impl Component for ToySgd {
    fn state_dict(&self) -> Option<StateRecord> {
        Some(json!({"lr": self.lr, "steps": self.steps}))
    }

    fn load_state_dict(&mut self, state: StateRecord) -> Result<(), ComponentError> {
        if is_empty_record(&state) {
            return Ok(());
        }
        self.lr = state["lr"].as_f64().ok_or_else(|| invalid_state("missing lr"))?;
        self.steps = state["steps"].as_u64().ok_or_else(|| invalid_state("missing steps"))?;
        Ok(())
    }
}

impl Optimizer<ToyBackend> for ToySgd {
    fn zero_grad(&mut self, _network: &mut dyn Network<ToyBackend>) -> Result<(), ComponentError> {
        Ok(())
    }

    fn step(&mut self, network: &mut dyn Network<ToyBackend>) -> Result<(), ComponentError> {
        let Some(Value::Object(mut params)) = network.state_dict() else {
            return Ok(());
        };
        for value in params.values_mut() {
            if let Some(v) = value.as_f64() {
                *value = json!(v - self.lr);
            }
        }
        network.load_state_dict(Value::Object(params))?;
        self.steps += 1;
        Ok(())
    }
}

/// Mean of `(prediction - target)^2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl Component for SquaredError {}

fn pair(args: &[Vec<f64>]) -> Result<(&[f64], &[f64]), ComponentError> {
    match args {
        [a, b] if a.len() == b.len() => Ok((a, b)),
        _ => Err(ComponentError::Compute(format!("expected two tensors of equal length, got {}", args.len()))),
    }
}

impl Criterion<ToyBackend> for SquaredError {
    fn compute(&self, args: &[Vec<f64>]) -> Result<Vec<f64>, ComponentError> {
        let (prediction, target) = pair(args)?;
        Ok(prediction.iter().zip(target).map(|(p, t)| (p - t).powi(2)).collect())
    }
}

/// Mean of `|prediction - target|`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Component for MeanAbsoluteError {}

impl Metric<ToyBackend> for MeanAbsoluteError {
    fn compute(&self, args: &[Vec<f64>]) -> Result<f64, ComponentError> {
        let (prediction, target) = pair(args)?;
        if prediction.is_empty() {
            return Ok(0.0);
        }
        Ok(prediction.iter().zip(target).map(|(p, t)| (p - t).abs()).sum::<f64>() / prediction.len() as f64)
    }
}

/// Counts the distinct `x` values of the dataset it is fitted on.
#[derive(Debug, Clone, Default)]
pub struct VocabularyCounter {
    vocab_size: usize,
}

impl Component for VocabularyCounter {
    fn state_dict(&self) -> Option<StateRecord> {
        Some(json!({"vocab_size": self.vocab_size}))
    }

    fn load_state_dict(&mut self, state: StateRecord) -> Result<(), ComponentError> {
        if is_empty_record(&state) {
            return Ok(());
        }
        let size = state["vocab_size"].as_u64().ok_or_else(|| invalid_state("missing vocab_size"))?;
        self.vocab_size = usize::try_from(size).map_err(invalid_state)?;
        Ok(())
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        (name == "vocab_size").then(|| json!(self.vocab_size))
    }
}

impl Preprocessor for VocabularyCounter {
    fn fit(&mut self, dataset: &dyn Dataset) -> Result<(), ComponentError> {
        let mut seen = BTreeSet::new();
        for i in 0..dataset.len() {
            seen.insert(dataset.get(i)?["x"].to_string());
        }
        self.vocab_size = seen.len();
        Ok(())
    }

    fn process(&self, example: Example) -> Result<Example, ComponentError> {
        Ok(example)
    }
}

/// Collates `{"x": number, "y": number}` examples into `inputs[node]["x"]`
/// and `targets["y"]`.
#[derive(Debug, Clone)]
pub struct ScalarCollator {
    node: String,
}

impl ScalarCollator {
    #[must_use]
    pub fn new(node: &str) -> Self {
        Self { node: node.to_string() }
    }

    pub fn from_args(args: &ConstructorArgs) -> TrainingResult<Self> {
        Ok(Self { node: args.kwarg("node")? })
    }
}

impl Component for ScalarCollator {}

impl Collator<ToyBackend> for ScalarCollator {
    fn collate(&self, examples: Vec<Example>) -> Result<Batch<Vec<f64>>, ComponentError> {
        let field = |example: &Example, key: &str| {
            example[key]
                .as_f64()
                .ok_or_else(|| ComponentError::Other(format!("example {example} has no numeric `{key}`")))
        };
        let x = examples.iter().map(|e| field(e, "x")).collect::<Result<Vec<_>, _>>()?;
        let y = examples.iter().map(|e| field(e, "y")).collect::<Result<Vec<_>, _>>()?;
        Ok(Batch::default().with_input(&self.node, "x", x).with_target("y", y))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Component for PassThrough {}

impl BatchAdapter<ToyBackend> for PassThrough {
    fn adapt(&self, batch: Batch<Vec<f64>>) -> Result<Batch<Vec<f64>>, ComponentError> {
        Ok(batch)
    }
}

/// Registry with the builtins and every toy class and function.
#[must_use]
pub fn toy_registry() -> ClassRegistry<ToyBackend> {
    let mut registry: ClassRegistry<ToyBackend> = ClassRegistry::new();
    registry
        .register_model("toy.Affine", Affine::from_args)
        .register_optimizer("toy.Sgd", ToySgd::from_args)
        .register_loss("toy.SquaredError", |_| Ok(SquaredError))
        .register_metric("toy.MeanAbsoluteError", |_| Ok(MeanAbsoluteError))
        .register_preprocessor("toy.VocabularyCounter", |_| Ok(VocabularyCounter::default()))
        .register_collator("toy.ScalarCollator", ScalarCollator::from_args)
        .register_batch_adapter("toy.PassThrough", |_| Ok(PassThrough))
        .register_function("toy.swap", |mut args| {
            args.reverse();
            Ok(args)
        });
    registry
}

/// A two-stage session over ten `y = 2x + 1` points.
#[must_use]
pub fn toy_spec() -> Value {
    let examples: Vec<Value> = (0..10).map(|x| json!({"x": x, "y": 2 * x + 1})).collect();
    json!({
        "initialize": {
            "definitions": [
                {"group": "datasets", "name": "points",
                 "spec": {"class": "trellis.InMemoryDataset", "kwargs": {"examples": examples}}},
                {"group": "splits", "name": "holdout",
                 "spec": {"class": "trellis.MultiSplitter", "dataset_name": "points",
                          "kwargs": {"ratio": [0.8, 0.2], "shuffle": true, "seed": 7}}},
                {"group": "preprocessors", "name": "vocab",
                 "spec": {"class": "toy.VocabularyCounter", "fit": "holdout.train", "expose": ["vocab_size"]}},
                {"group": "collators", "name": "scalars",
                 "spec": {"class": "toy.ScalarCollator", "kwargs": {"node": "affine"}}},
                {"group": "batch_adapters", "name": "identity", "spec": {"class": "toy.PassThrough"}},
                {"group": "models", "name": "affine",
                 "spec": {"class": "toy.Affine", "kwargs": {"weight": 1.0, "bias": 0.0},
                          "dynamic_kwargs": {"width": "vocab_size"}}},
                {"group": "optimizers", "name": "sgd", "spec": {"class": "toy.Sgd", "kwargs": {"lr": 0.01}}},
                {"group": "losses", "name": "mse",
                 "spec": {"class": "toy.SquaredError", "inputs": ["y_hat", "y"]}},
                {"group": "metrics", "name": "mae",
                 "spec": {"class": "toy.MeanAbsoluteError", "inputs": ["y", "y_hat"], "transform": "toy.swap"}}
            ],
            "pipelines": {
                "main": {"nodes": [
                    {"name": "affine", "model": "affine", "optimizer": "sgd", "inputs": ["x"], "outputs": ["y_hat"]}
                ]}
            }
        },
        "train": {
            "settings": {"batch_size": 4, "report_interval": 2, "seed": 3},
            "stages": [
                {"name": "warmup", "pipeline": "main", "train_dataset": "holdout.train",
                 "val_dataset": "holdout.val", "preprocessors": ["vocab"], "collator": "scalars",
                 "batch_adapter": "identity", "loss": "mse", "metrics": ["mae"], "epochs": 2,
                 "settings": {"batch_size": 2}},
                {"name": "finetune", "pipeline": "main", "train_dataset": "holdout.train",
                 "collator": "scalars", "loss": "mse", "epochs": 1, "trainable": ["affine"]}
            ]
        }
    })
}

/// Collects every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_forward_and_sgd_step() {
        let mut model = Affine { weight: 2.0, bias: 1.0, width: None, training: true };
        let out = model.forward(vec![vec![1.0, 2.0], vec![0.5, 0.5]]).unwrap();
        assert_eq!(out, vec![vec![4.0, 6.0]]);

        let mut sgd = ToySgd { lr: 0.5, steps: 0 };
        sgd.step(&mut model).unwrap();
        assert_eq!(model.state_dict(), Some(json!({"weight": 1.5, "bias": 0.5})));
        assert_eq!(sgd.state_dict(), Some(json!({"lr": 0.5, "steps": 1})));
    }

    #[test]
    fn test_loss_and_metric() {
        let args = vec![vec![1.0, 3.0], vec![2.0, 1.0]];
        assert_eq!(SquaredError.compute(&args).unwrap(), vec![1.0, 4.0]);
        assert_eq!(MeanAbsoluteError.compute(&args).unwrap(), 1.5);
        assert_eq!(ToyBackend::to_scalar(&vec![1.0, 4.0]).unwrap(), 2.5);
        assert!(SquaredError.compute(&args[..1]).is_err());
    }
}
