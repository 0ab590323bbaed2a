//! Builds a `Session` from a spec document.
//!
//! Definitions are processed in declaration order. Each one goes through its
//! group's loader, then the group's installer if it has one (fitting
//! preprocessors, shuffling splitters), then, when restoring, the persisted
//! static state is laid over it. Attributes it exposes are published into the
//! build context for later `dynamic_kwargs`.

use crate::config::TrainingSettings;
use crate::context::BuildContext;
use crate::error::{TrainingError, TrainingResult};
use crate::persistence::ObjectPersistence;
use crate::registry::ClassRegistry;
use crate::session::{LossEntry, MetricEntry, Pipeline, PipelineNode, Progress, Session, SplitEntry, Stage};
use crate::spec::{override_spec, Definition, Keyring, ObjectGroup, ObjectSpec, PipelineSpec, SessionSpec, StageSpec};
use crate::splitter::shuffled_indices;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_abstraction::{
    Backend, BatchAdapter, Collator, Component, ConstructorArgs, Dataset, Network, Optimizer, Preprocessor,
};

/// Post-construction step of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installer {
    /// Fit the preprocessor against the dataset named by `fit`.
    FitPreprocessor,
    /// Give the splitter its shuffle permutation and check the split.
    ConfigureSplitter,
}

impl Installer {
    #[must_use]
    pub fn for_group(group: ObjectGroup) -> Option<Self> {
        match group {
            ObjectGroup::Preprocessors => Some(Self::FitPreprocessor),
            ObjectGroup::Splits => Some(Self::ConfigureSplitter),
            _ => None,
        }
    }
}

/// A freshly constructed object, tagged with its group.
pub enum SessionObject<B: Backend> {
    Dataset(Box<dyn Dataset>),
    Split(SplitEntry),
    Preprocessor(Box<dyn Preprocessor>),
    Collator(Box<dyn Collator<B>>),
    Model(Box<dyn Network<B>>),
    Optimizer(Box<dyn Optimizer<B>>),
    BatchAdapter(Box<dyn BatchAdapter<B>>),
    Loss(LossEntry<B>),
    Metric(MetricEntry<B>),
}

impl<B: Backend> SessionObject<B> {
    #[must_use]
    pub fn group(&self) -> ObjectGroup {
        match self {
            Self::Dataset(_) => ObjectGroup::Datasets,
            Self::Split(_) => ObjectGroup::Splits,
            Self::Preprocessor(_) => ObjectGroup::Preprocessors,
            Self::Collator(_) => ObjectGroup::Collators,
            Self::Model(_) => ObjectGroup::Models,
            Self::Optimizer(_) => ObjectGroup::Optimizers,
            Self::BatchAdapter(_) => ObjectGroup::BatchAdapters,
            Self::Loss(_) => ObjectGroup::Losses,
            Self::Metric(_) => ObjectGroup::Metrics,
        }
    }

    #[must_use]
    pub fn component(&self) -> &dyn Component {
        match self {
            Self::Dataset(d) => &**d as &dyn Component,
            Self::Split(s) => &s.splitter,
            Self::Preprocessor(p) => &**p as &dyn Component,
            Self::Collator(c) => &**c as &dyn Component,
            Self::Model(m) => &**m as &dyn Component,
            Self::Optimizer(o) => &**o as &dyn Component,
            Self::BatchAdapter(a) => &**a as &dyn Component,
            Self::Loss(l) => &*l.criterion as &dyn Component,
            Self::Metric(m) => &*m.metric as &dyn Component,
        }
    }

    pub fn component_mut(&mut self) -> &mut dyn Component {
        match self {
            Self::Dataset(d) => &mut **d as &mut dyn Component,
            Self::Split(s) => &mut s.splitter,
            Self::Preprocessor(p) => &mut **p as &mut dyn Component,
            Self::Collator(c) => &mut **c as &mut dyn Component,
            Self::Model(m) => &mut **m as &mut dyn Component,
            Self::Optimizer(o) => &mut **o as &mut dyn Component,
            Self::BatchAdapter(a) => &mut **a as &mut dyn Component,
            Self::Loss(l) => &mut *l.criterion as &mut dyn Component,
            Self::Metric(m) => &mut *m.metric as &mut dyn Component,
        }
    }
}

/// Turns spec documents into sessions using a class registry.
pub struct SessionBuilder<'r, B: Backend> {
    registry: &'r ClassRegistry<B>,
    static_state: Option<ObjectPersistence>,
}

impl<'r, B: Backend> SessionBuilder<'r, B> {
    #[must_use]
    pub fn new(registry: &'r ClassRegistry<B>) -> Self {
        Self { registry, static_state: None }
    }

    /// Builder that overlays persisted static state after each installer.
    #[must_use]
    pub fn restoring(registry: &'r ClassRegistry<B>, static_state: ObjectPersistence) -> Self {
        Self { registry, static_state: Some(static_state) }
    }

    pub fn build(&self, document: &Value) -> TrainingResult<Session<B>> {
        self.build_spec(&SessionSpec::from_value(document)?)
    }

    pub fn build_spec(&self, spec: &SessionSpec) -> TrainingResult<Session<B>> {
        spec.validate()?;
        let mut context = BuildContext::new();
        let mut session = Session::default();

        for definition in &spec.initialize.definitions {
            self.build_definition(definition, &mut context, &mut session)?;
        }
        for (name, pipeline) in &spec.initialize.pipelines {
            let pipeline = load_pipeline(&session, name, pipeline)?;
            session.pipelines.insert(name.clone(), pipeline);
        }

        let mut stage_names = BTreeSet::new();
        for (idx, stage) in spec.train.stages.iter().enumerate() {
            let stage = load_stage(&session, idx, stage, &spec.train.settings)?;
            if !stage_names.insert(stage.name.clone()) {
                return Err(TrainingError::InvalidSpec(format!("duplicate stage name `{}`", stage.name)));
            }
            session.stages.push(stage);
        }
        session.progress = Progress::new(session.stages.len());

        info!(
            definitions = spec.initialize.definitions.len(),
            pipelines = session.pipelines.len(),
            stages = session.stages.len(),
            "Session built"
        );
        Ok(session)
    }

    fn build_definition(
        &self,
        definition: &Definition,
        context: &mut BuildContext,
        session: &mut Session<B>,
    ) -> TrainingResult<()> {
        let Definition { group, name, spec } = definition;
        debug!(group = %group, object = %name, class = %spec.class, "Loading object");

        let mut object = self.load(*group, spec, context, session)?;
        if let Some(installer) = Installer::for_group(*group) {
            install(installer, name, spec, &mut object, session)?;
        }
        if let Some(persistence) = &self.static_state
            && group.is_static()
        {
            persistence.load(name, object.component_mut())?;
        }
        for attribute in &spec.expose {
            let value = object.component().attribute(attribute).ok_or_else(|| {
                TrainingError::InvalidSpec(format!("`{name}` ({group}) does not expose attribute `{attribute}`"))
            })?;
            context.publish(attribute, value);
        }
        insert(session, name, object)
    }

    fn load(
        &self,
        group: ObjectGroup,
        spec: &ObjectSpec,
        context: &BuildContext,
        session: &Session<B>,
    ) -> TrainingResult<SessionObject<B>> {
        let args = ConstructorArgs::new(spec.args.clone(), context.resolve_kwargs(&spec.kwargs, &spec.dynamic_kwargs)?);
        let registry = self.registry;
        let class = spec.class.as_str();

        Ok(match group {
            ObjectGroup::Datasets => SessionObject::Dataset(registry.dataset(class, &args)?),
            ObjectGroup::Splits => {
                let dataset = spec.dataset_name.clone().ok_or_else(|| {
                    TrainingError::InvalidSpec(format!("split of class `{class}` needs a `dataset_name`"))
                })?;
                if !session.datasets.contains_key(&dataset) {
                    return Err(TrainingError::InvalidSpec(format!(
                        "split refers to unknown dataset `{dataset}`; declared so far: [{}]",
                        session.names(ObjectGroup::Datasets).join(", ")
                    )));
                }
                SessionObject::Split(SplitEntry { splitter: registry.splitter(class, &args)?, dataset })
            }
            ObjectGroup::Preprocessors => SessionObject::Preprocessor(registry.preprocessor(class, &args)?),
            ObjectGroup::Collators => SessionObject::Collator(registry.collator(class, &args)?),
            ObjectGroup::Models => SessionObject::Model(registry.model(class, &args)?),
            ObjectGroup::Optimizers => SessionObject::Optimizer(registry.optimizer(class, &args)?),
            ObjectGroup::BatchAdapters => SessionObject::BatchAdapter(registry.batch_adapter(class, &args)?),
            ObjectGroup::Losses => SessionObject::Loss(LossEntry {
                criterion: registry.loss(class, &args)?,
                inputs: spec.inputs.clone(),
                transform: spec.transform.as_deref().map(|f| registry.function(f)).transpose()?,
            }),
            ObjectGroup::Metrics => SessionObject::Metric(MetricEntry {
                metric: registry.metric(class, &args)?,
                inputs: spec.inputs.clone(),
                transform: spec.transform.as_deref().map(|f| registry.function(f)).transpose()?,
            }),
        })
    }
}

fn install<B: Backend>(
    installer: Installer,
    name: &str,
    spec: &ObjectSpec,
    object: &mut SessionObject<B>,
    session: &Session<B>,
) -> TrainingResult<()> {
    match (installer, object) {
        (Installer::FitPreprocessor, SessionObject::Preprocessor(preprocessor)) => {
            let reference = spec.fit.as_deref().ok_or_else(|| {
                TrainingError::InvalidSpec(format!("preprocessor `{name}` needs a `fit` dataset reference"))
            })?;
            let dataset = session.resolve_dataset(reference)?;
            preprocessor.fit(&*dataset)?;
            debug!(object = %name, dataset = %reference, examples = dataset.len(), "Fitted preprocessor");
        }
        (Installer::ConfigureSplitter, SessionObject::Split(entry)) => {
            let base = session.resolve_dataset(&entry.dataset)?;
            if entry.splitter.wants_shuffle() {
                let seed = entry.splitter.seed().unwrap_or_else(rand::random);
                entry.splitter.configure(shuffled_indices(base.len(), seed));
            }
            let split = entry.splitter.split(base)?;
            debug!(object = %name, parts = split.len(), "Configured splitter");
        }
        (installer, object) => {
            return Err(TrainingError::InvalidSpec(format!(
                "installer {installer:?} does not apply to `{name}` ({})",
                object.group()
            )));
        }
    }
    Ok(())
}

fn insert<B: Backend>(session: &mut Session<B>, name: &str, object: SessionObject<B>) -> TrainingResult<()> {
    let group = object.group();
    if session.component(group, name).is_some() {
        return Err(TrainingError::InvalidSpec(format!("duplicate name `{name}` in group `{group}`")));
    }
    let name = name.to_string();
    match object {
        SessionObject::Dataset(d) => {
            session.datasets.insert(name, Arc::from(d));
        }
        SessionObject::Split(s) => {
            session.splits.insert(name, s);
        }
        SessionObject::Preprocessor(p) => {
            session.preprocessors.insert(name, p);
        }
        SessionObject::Collator(c) => {
            session.collators.insert(name, c);
        }
        SessionObject::Model(m) => {
            session.models.insert(name, m);
        }
        SessionObject::Optimizer(o) => {
            session.optimizers.insert(name, o);
        }
        SessionObject::BatchAdapter(a) => {
            session.batch_adapters.insert(name, a);
        }
        SessionObject::Loss(l) => {
            session.losses.insert(name, l);
        }
        SessionObject::Metric(m) => {
            session.metrics.insert(name, m);
        }
    }
    Ok(())
}

fn load_pipeline<B: Backend>(session: &Session<B>, name: &str, spec: &PipelineSpec) -> TrainingResult<Pipeline> {
    let mut nodes = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        if !session.models.contains_key(&node.model) {
            return Err(TrainingError::InvalidSpec(format!(
                "node `{}` of pipeline `{name}` uses unknown model `{}`; models: [{}]",
                node.name,
                node.model,
                session.names(ObjectGroup::Models).join(", ")
            )));
        }
        if let Some(optimizer) = &node.optimizer
            && !session.optimizers.contains_key(optimizer)
        {
            return Err(TrainingError::InvalidSpec(format!(
                "node `{}` of pipeline `{name}` uses unknown optimizer `{optimizer}`; optimizers: [{}]",
                node.name,
                session.names(ObjectGroup::Optimizers).join(", ")
            )));
        }
        nodes.push(PipelineNode {
            name: node.name.clone(),
            model: node.model.clone(),
            optimizer: node.optimizer.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
        });
    }
    Ok(Pipeline { name: name.to_string(), nodes })
}

fn require<B: Backend>(session: &Session<B>, group: ObjectGroup, name: &str, stage: &str) -> TrainingResult<()> {
    if session.component(group, name).is_some() {
        return Ok(());
    }
    let what = if group == ObjectGroup::Metrics { "metric" } else { group.as_str() };
    Err(TrainingError::InvalidSpec(format!(
        "Unknown {what} `{name}` in stage `{stage}`. Must be one of [{}]",
        session.names(group).join(", ")
    )))
}

fn load_stage<B: Backend>(
    session: &Session<B>,
    idx: usize,
    spec: &StageSpec,
    global: &TrainingSettings,
) -> TrainingResult<Stage> {
    let name = spec.resolved_name(idx);

    let pipeline = session.pipelines.get(&spec.pipeline).ok_or_else(|| {
        TrainingError::InvalidSpec(format!(
            "stage `{name}` uses unknown pipeline `{}`; pipelines: [{}]",
            spec.pipeline,
            session.pipelines.keys().cloned().collect::<Vec<_>>().join(", ")
        ))
    })?;

    session.resolve_dataset(&spec.train_dataset)?;
    if let Some(val) = &spec.val_dataset {
        session.resolve_dataset(val)?;
    }
    require(session, ObjectGroup::Collators, &spec.collator, &name)?;
    for preprocessor in &spec.preprocessors {
        require(session, ObjectGroup::Preprocessors, preprocessor, &name)?;
    }
    if let Some(adapter) = &spec.batch_adapter {
        require(session, ObjectGroup::BatchAdapters, adapter, &name)?;
    }
    require(session, ObjectGroup::Losses, &spec.loss, &name)?;
    for metric in &spec.metrics {
        require(session, ObjectGroup::Metrics, metric, &name)?;
    }

    let node_names: Vec<String> = pipeline.nodes.iter().map(|n| n.name.clone()).collect();
    let trainable = spec.trainable.clone().unwrap_or_else(|| node_names.clone());
    if let Some(unknown) = trainable.iter().find(|t| !node_names.contains(t)) {
        return Err(TrainingError::InvalidSpec(format!(
            "stage `{name}` trains unknown node `{unknown}`; nodes of `{}`: [{}]",
            pipeline.name,
            node_names.join(", ")
        )));
    }

    let merged = override_spec(&serde_json::to_value(global)?, &Value::Object(spec.settings.clone()), &Keyring::new());
    let settings: TrainingSettings = serde_json::from_value(merged)
        .map_err(|e| TrainingError::InvalidSpec(format!("settings of stage `{name}`: {e}")))?;
    settings.validate()?;

    Ok(Stage {
        name,
        pipeline: spec.pipeline.clone(),
        train_dataset: spec.train_dataset.clone(),
        val_dataset: spec.val_dataset.clone(),
        preprocessors: spec.preprocessors.clone(),
        collator: spec.collator.clone(),
        batch_adapter: spec.batch_adapter.clone(),
        loss: spec.loss.clone(),
        metrics: spec.metrics.clone(),
        epochs: spec.epochs,
        trainable,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{toy_registry, toy_spec};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_build_toy_session() {
        let registry = toy_registry();
        let session = SessionBuilder::new(&registry).build(&toy_spec()).unwrap();

        assert_eq!(session.names(ObjectGroup::Datasets), vec!["points".to_string()]);
        assert_eq!(session.stages.len(), 2);
        assert_eq!(session.stages[0].name, "warmup");
        assert_eq!(session.stages[0].settings.batch_size, 2);
        assert_eq!(session.stages[1].settings.batch_size, 4);
        assert_eq!(session.stages[1].trainable, vec!["affine".to_string()]);
        assert_eq!(session.progress.current_stage_id().unwrap(), 0);
        assert_eq!(session.resolve_dataset("holdout.train").unwrap().len(), 8);
    }

    #[test]
    fn test_dynamic_kwargs_read_exposed_attributes() {
        let registry = toy_registry();
        let session = SessionBuilder::new(&registry).build(&toy_spec()).unwrap();
        // The model's width comes from the vocabulary the counter fitted.
        let width = session.models["affine"].attribute("width").unwrap();
        let vocab = session.preprocessors["vocab"].attribute("vocab_size").unwrap();
        assert_eq!(width, vocab);
        assert_eq!(vocab, json!(8));
    }

    #[test]
    fn test_unknown_metric_lists_alternatives() {
        let registry = toy_registry();
        let mut spec = toy_spec();
        spec["train"]["stages"][0]["metrics"] = json!(["accuracy"]);
        let err = SessionBuilder::new(&registry).build(&spec).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Unknown metric `accuracy`"), "{msg}");
        assert!(msg.contains("mae"), "{msg}");
    }

    #[test]
    fn test_forward_reference_fails_before_training() {
        let registry = toy_registry();
        let mut spec = toy_spec();
        let definitions = spec["initialize"]["definitions"].as_array_mut().unwrap();
        let model = definitions.iter().position(|d| d["name"] == "affine").unwrap();
        let moved = definitions.remove(model);
        definitions.insert(0, moved);

        let err = SessionBuilder::new(&registry).build(&spec).unwrap_err();
        assert!(err.to_string().contains("vocab_size"));
    }

    #[test]
    fn test_unknown_class_fails_fast() {
        let registry = toy_registry();
        let mut spec = toy_spec();
        spec["initialize"]["definitions"][0]["spec"]["class"] = json!("trellis.ParquetDataset");
        let err = SessionBuilder::new(&registry).build(&spec).unwrap_err();
        assert!(matches!(err, TrainingError::ClassImport { .. }));
    }

    #[test]
    fn test_seeded_splitter_is_deterministic() {
        let registry = toy_registry();
        let first = SessionBuilder::new(&registry).build(&toy_spec()).unwrap();
        let second = SessionBuilder::new(&registry).build(&toy_spec()).unwrap();
        assert_eq!(
            first.splits["holdout"].splitter.shuffled(),
            second.splits["holdout"].splitter.shuffled()
        );
        assert!(first.splits["holdout"].splitter.shuffled().is_some());
    }

    #[test]
    fn test_restoring_builder_overlays_static_state() {
        let temp = TempDir::new().unwrap();
        let persistence = ObjectPersistence::new(temp.path().to_path_buf());
        std::fs::write(persistence.record_path("vocab"), r#"{"vocab_size": 3}"#).unwrap();

        let registry = toy_registry();
        let session = SessionBuilder::restoring(&registry, persistence).build(&toy_spec()).unwrap();
        assert_eq!(session.preprocessors["vocab"].attribute("vocab_size"), Some(json!(3)));
        assert_eq!(session.models["affine"].attribute("width"), Some(json!(3)));
    }

    #[test]
    fn test_missing_exposed_attribute_is_rejected() {
        let registry = toy_registry();
        let mut spec = toy_spec();
        spec["initialize"]["definitions"][0]["spec"]["expose"] = json!(["num_rows"]);
        let err = SessionBuilder::new(&registry).build(&spec).unwrap_err();
        assert!(err.to_string().contains("num_rows"));
    }

    #[test]
    fn test_stage_settings_are_validated() {
        let registry = toy_registry();
        let mut spec = toy_spec();
        spec["train"]["stages"][0]["settings"] = json!({"batch_size": 0});
        let err = SessionBuilder::new(&registry).build(&spec).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }
}
