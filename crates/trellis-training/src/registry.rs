//! Class registry: maps class paths from the spec to constructors.
//!
//! Classes are registered in code per object group. A spec naming a class
//! that was never registered fails with `ClassImport`, listing what the group
//! does offer.

use crate::datasets::{InMemoryDataset, JsonlDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::spec::ObjectGroup;
use crate::splitter::MultiSplitter;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use trellis_abstraction::{
    Backend, BatchAdapter, Collator, ConstructorArgs, Criterion, Dataset, Metric, Network, Optimizer, Preprocessor,
};

type Factory<T> = Box<dyn Fn(&ConstructorArgs) -> TrainingResult<T>>;

/// Function applied to loss/metric arguments before the call.
pub type TransformFn<B> =
    Arc<dyn Fn(Vec<<B as Backend>::Tensor>) -> TrainingResult<Vec<<B as Backend>::Tensor>>>;

pub const MULTI_SPLITTER: &str = "trellis.MultiSplitter";
pub const IN_MEMORY_DATASET: &str = "trellis.InMemoryDataset";
pub const JSONL_DATASET: &str = "trellis.JsonlDataset";

pub struct ClassRegistry<B: Backend> {
    datasets: BTreeMap<String, Factory<Box<dyn Dataset>>>,
    splits: BTreeMap<String, Factory<MultiSplitter>>,
    preprocessors: BTreeMap<String, Factory<Box<dyn Preprocessor>>>,
    collators: BTreeMap<String, Factory<Box<dyn Collator<B>>>>,
    models: BTreeMap<String, Factory<Box<dyn Network<B>>>>,
    optimizers: BTreeMap<String, Factory<Box<dyn Optimizer<B>>>>,
    batch_adapters: BTreeMap<String, Factory<Box<dyn BatchAdapter<B>>>>,
    losses: BTreeMap<String, Factory<Box<dyn Criterion<B>>>>,
    metrics: BTreeMap<String, Factory<Box<dyn Metric<B>>>>,
    functions: BTreeMap<String, TransformFn<B>>,
}

impl<B: Backend> fmt::Debug for ClassRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ClassRegistry");
        for group in ObjectGroup::ALL {
            s.field(group.as_str(), &self.classes(group));
        }
        s.field("functions", &self.functions.keys().collect::<Vec<_>>()).finish()
    }
}

impl<B: Backend> Default for ClassRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ClassRegistry<B> {
    /// Registry with the builtin splitter and datasets.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .register_splitter(MULTI_SPLITTER, MultiSplitter::from_args)
            .register_dataset(IN_MEMORY_DATASET, InMemoryDataset::from_args)
            .register_dataset(JSONL_DATASET, JsonlDataset::from_args);
        registry
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            datasets: BTreeMap::new(),
            splits: BTreeMap::new(),
            preprocessors: BTreeMap::new(),
            collators: BTreeMap::new(),
            models: BTreeMap::new(),
            optimizers: BTreeMap::new(),
            batch_adapters: BTreeMap::new(),
            losses: BTreeMap::new(),
            metrics: BTreeMap::new(),
            functions: BTreeMap::new(),
        }
    }

    pub fn register_dataset<D, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        D: Dataset + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<D> + 'static,
    {
        self.datasets.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_splitter<F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        F: Fn(&ConstructorArgs) -> TrainingResult<MultiSplitter> + 'static,
    {
        self.splits.insert(class.to_string(), Box::new(factory));
        self
    }

    pub fn register_preprocessor<P, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        P: Preprocessor + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<P> + 'static,
    {
        self.preprocessors.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_collator<C, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        C: Collator<B> + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<C> + 'static,
    {
        self.collators.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_model<N, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        N: Network<B> + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<N> + 'static,
    {
        self.models.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_optimizer<O, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        O: Optimizer<B> + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<O> + 'static,
    {
        self.optimizers.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_batch_adapter<A, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        A: BatchAdapter<B> + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<A> + 'static,
    {
        self.batch_adapters.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_loss<L, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        L: Criterion<B> + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<L> + 'static,
    {
        self.losses.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_metric<M, F>(&mut self, class: &str, factory: F) -> &mut Self
    where
        M: Metric<B> + 'static,
        F: Fn(&ConstructorArgs) -> TrainingResult<M> + 'static,
    {
        self.metrics.insert(class.to_string(), Box::new(move |args| Ok(Box::new(factory(args)?))));
        self
    }

    pub fn register_function<F>(&mut self, name: &str, function: F) -> &mut Self
    where
        F: Fn(Vec<B::Tensor>) -> TrainingResult<Vec<B::Tensor>> + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }

    /// Class paths registered for `group`.
    #[must_use]
    pub fn classes(&self, group: ObjectGroup) -> Vec<String> {
        match group {
            ObjectGroup::Datasets => keys(&self.datasets),
            ObjectGroup::Splits => keys(&self.splits),
            ObjectGroup::Preprocessors => keys(&self.preprocessors),
            ObjectGroup::Collators => keys(&self.collators),
            ObjectGroup::Models => keys(&self.models),
            ObjectGroup::Optimizers => keys(&self.optimizers),
            ObjectGroup::BatchAdapters => keys(&self.batch_adapters),
            ObjectGroup::Losses => keys(&self.losses),
            ObjectGroup::Metrics => keys(&self.metrics),
        }
    }

    pub fn function(&self, name: &str) -> TrainingResult<TransformFn<B>> {
        self.functions.get(name).cloned().ok_or_else(|| TrainingError::FunctionImport {
            name: name.to_string(),
            available: keys(&self.functions),
        })
    }

    pub fn dataset(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Dataset>> {
        instantiate(&self.datasets, ObjectGroup::Datasets, class, args)
    }

    pub fn splitter(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<MultiSplitter> {
        instantiate(&self.splits, ObjectGroup::Splits, class, args)
    }

    pub fn preprocessor(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Preprocessor>> {
        instantiate(&self.preprocessors, ObjectGroup::Preprocessors, class, args)
    }

    pub fn collator(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Collator<B>>> {
        instantiate(&self.collators, ObjectGroup::Collators, class, args)
    }

    pub fn model(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Network<B>>> {
        instantiate(&self.models, ObjectGroup::Models, class, args)
    }

    pub fn optimizer(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Optimizer<B>>> {
        instantiate(&self.optimizers, ObjectGroup::Optimizers, class, args)
    }

    pub fn batch_adapter(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn BatchAdapter<B>>> {
        instantiate(&self.batch_adapters, ObjectGroup::BatchAdapters, class, args)
    }

    pub fn loss(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Criterion<B>>> {
        instantiate(&self.losses, ObjectGroup::Losses, class, args)
    }

    pub fn metric(&self, class: &str, args: &ConstructorArgs) -> TrainingResult<Box<dyn Metric<B>>> {
        instantiate(&self.metrics, ObjectGroup::Metrics, class, args)
    }
}

fn keys<V>(table: &BTreeMap<String, V>) -> Vec<String> {
    table.keys().cloned().collect()
}

/// Class paths are dot-separated identifiers, e.g. `models.Encoder`.
pub fn validate_class_path(class: &str) -> TrainingResult<()> {
    let well_formed = !class.is_empty()
        && class
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'));
    if well_formed {
        Ok(())
    } else {
        Err(TrainingError::InvalidSpec(format!("malformed class path `{class}`")))
    }
}

fn instantiate<T>(
    table: &BTreeMap<String, Factory<T>>,
    group: ObjectGroup,
    class: &str,
    args: &ConstructorArgs,
) -> TrainingResult<T> {
    validate_class_path(class)?;
    let factory = table.get(class).ok_or_else(|| TrainingError::ClassImport {
        group: group.to_string(),
        class: class.to_string(),
        available: keys(table),
    })?;
    factory(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{toy_registry, ToyBackend};
    use serde_json::json;

    #[test]
    fn test_builtin_classes_are_registered() {
        let registry: ClassRegistry<ToyBackend> = ClassRegistry::new();
        assert_eq!(registry.classes(ObjectGroup::Splits), vec![MULTI_SPLITTER.to_string()]);
        assert!(registry.classes(ObjectGroup::Datasets).contains(&JSONL_DATASET.to_string()));
        assert!(registry.classes(ObjectGroup::Models).is_empty());
    }

    #[test]
    fn test_unknown_class_lists_alternatives() {
        let registry = toy_registry();
        let err = registry.model("toy.Transformer", &ConstructorArgs::default()).err().unwrap();
        match err {
            TrainingError::ClassImport { group, class, available } => {
                assert_eq!(group, "models");
                assert_eq!(class, "toy.Transformer");
                assert!(available.contains(&"toy.Affine".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_class_path_is_rejected() {
        let registry = toy_registry();
        for class in ["", "toy..Affine", "toy.Af fine", ".Affine"] {
            let err = registry.model(class, &ConstructorArgs::default()).err().unwrap();
            assert!(matches!(err, TrainingError::InvalidSpec(_)), "{class}");
        }
    }

    #[test]
    fn test_unknown_function_is_reported() {
        let registry = toy_registry();
        assert!(registry.function("toy.swap").is_ok());
        let err = registry.function("toy.flip").err().unwrap();
        assert!(matches!(err, TrainingError::FunctionImport { .. }));
    }

    #[test]
    fn test_constructor_errors_propagate() {
        let registry = toy_registry();
        let args = ConstructorArgs::new(vec![], serde_json::from_value(json!({"weight": "heavy"})).unwrap());
        assert!(matches!(registry.model("toy.Affine", &args).err().unwrap(), TrainingError::Component(_)));
    }
}
