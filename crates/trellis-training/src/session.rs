//! Live session object graph and the multi-stage progress state machine.

use crate::config::TrainingSettings;
use crate::error::{TrainingError, TrainingResult};
use crate::registry::TransformFn;
use crate::spec::ObjectGroup;
use crate::splitter::MultiSplitter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use trellis_abstraction::{
    Backend, BatchAdapter, Collator, Component, Criterion, Dataset, Metric, Network, Optimizer, Preprocessor,
    TensorMap,
};

/// One stage's progress: epochs trained so far and whether the stage is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressBar {
    pub stage_id: usize,
    pub epochs_done: usize,
    pub completed: bool,
}

impl ProgressBar {
    #[must_use]
    pub fn new(stage_id: usize) -> Self {
        Self { stage_id, epochs_done: 0, completed: false }
    }
}

/// Ordered progress bars, one per stage.
///
/// The current stage is the first bar that is not completed; once every bar
/// is completed the tracker is terminal and `current_stage_id` returns
/// `StopTraining`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    bars: Vec<ProgressBar>,
}

impl Progress {
    #[must_use]
    pub fn new(num_stages: usize) -> Self {
        Self { bars: (0..num_stages).map(ProgressBar::new).collect() }
    }

    pub fn from_list(bars: Vec<ProgressBar>) -> TrainingResult<Self> {
        for (idx, bar) in bars.iter().enumerate() {
            if bar.stage_id != idx {
                return Err(TrainingError::Checkpoint(format!(
                    "progress bar at position {idx} refers to stage {}",
                    bar.stage_id
                )));
            }
        }
        Ok(Self { bars })
    }

    #[must_use]
    pub fn to_list(&self) -> Vec<ProgressBar> {
        self.bars.clone()
    }

    #[must_use]
    pub fn bars(&self) -> &[ProgressBar] {
        &self.bars
    }

    fn current_bar_mut(&mut self) -> TrainingResult<&mut ProgressBar> {
        self.bars.iter_mut().find(|bar| !bar.completed).ok_or(TrainingError::StopTraining)
    }

    pub fn current_stage_id(&self) -> TrainingResult<usize> {
        self.bars.iter().find(|bar| !bar.completed).map(|bar| bar.stage_id).ok_or(TrainingError::StopTraining)
    }

    pub fn current_bar(&self) -> TrainingResult<ProgressBar> {
        self.bars.iter().find(|bar| !bar.completed).copied().ok_or(TrainingError::StopTraining)
    }

    /// One more epoch trained in the current stage.
    pub fn increment_progress(&mut self) -> TrainingResult<ProgressBar> {
        let bar = self.current_bar_mut()?;
        bar.epochs_done += 1;
        bar.completed = false;
        Ok(*bar)
    }

    pub fn mark_completed(&mut self) -> TrainingResult<ProgressBar> {
        let bar = self.current_bar_mut()?;
        bar.completed = true;
        Ok(*bar)
    }

    /// Epochs trained across all stages; identifies checkpoints.
    #[must_use]
    pub fn epochs_done_total(&self) -> usize {
        self.bars.iter().map(|bar| bar.epochs_done).sum()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.bars.iter().all(|bar| bar.completed)
    }
}

/// A splitter together with the dataset it partitions.
#[derive(Debug, Clone)]
pub struct SplitEntry {
    pub splitter: MultiSplitter,
    pub dataset: String,
}

/// A loss criterion wired to named lookup-table entries.
pub struct LossEntry<B: Backend> {
    pub criterion: Box<dyn Criterion<B>>,
    pub inputs: Vec<String>,
    pub transform: Option<TransformFn<B>>,
}

/// A metric wired to named lookup-table entries.
pub struct MetricEntry<B: Backend> {
    pub metric: Box<dyn Metric<B>>,
    pub inputs: Vec<String>,
    pub transform: Option<TransformFn<B>>,
}

fn gather<B: Backend>(
    table: &TensorMap<B::Tensor>,
    inputs: &[String],
    transform: Option<&TransformFn<B>>,
) -> TrainingResult<Vec<B::Tensor>> {
    let args = inputs
        .iter()
        .map(|name| table.get(name).cloned().ok_or_else(|| TrainingError::missing_key(name, table.keys())))
        .collect::<TrainingResult<Vec<_>>>()?;
    match transform {
        Some(transform) => transform(args),
        None => Ok(args),
    }
}

impl<B: Backend> LossEntry<B> {
    pub fn compute(&self, table: &TensorMap<B::Tensor>) -> TrainingResult<B::Tensor> {
        let args = gather::<B>(table, &self.inputs, self.transform.as_ref())?;
        Ok(self.criterion.compute(&args)?)
    }
}

impl<B: Backend> MetricEntry<B> {
    pub fn compute(&self, table: &TensorMap<B::Tensor>) -> TrainingResult<f64> {
        let args = gather::<B>(table, &self.inputs, self.transform.as_ref())?;
        Ok(self.metric.compute(&args)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNode {
    pub name: String,
    pub model: String,
    pub optimizer: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Ordered sub-model nodes; declaration order is execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
    pub nodes: Vec<PipelineNode>,
}

/// A resolved training stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub pipeline: String,
    pub train_dataset: String,
    pub val_dataset: Option<String>,
    pub preprocessors: Vec<String>,
    pub collator: String,
    pub batch_adapter: Option<String>,
    pub loss: String,
    pub metrics: Vec<String>,
    pub epochs: usize,
    /// Nodes whose optimizers step during this stage.
    pub trainable: Vec<String>,
    pub settings: TrainingSettings,
}

/// Everything a training run needs, built from a spec.
pub struct Session<B: Backend> {
    pub datasets: BTreeMap<String, Arc<dyn Dataset>>,
    pub splits: BTreeMap<String, SplitEntry>,
    pub preprocessors: BTreeMap<String, Box<dyn Preprocessor>>,
    pub collators: BTreeMap<String, Box<dyn Collator<B>>>,
    pub models: BTreeMap<String, Box<dyn Network<B>>>,
    pub optimizers: BTreeMap<String, Box<dyn Optimizer<B>>>,
    pub batch_adapters: BTreeMap<String, Box<dyn BatchAdapter<B>>>,
    pub losses: BTreeMap<String, LossEntry<B>>,
    pub metrics: BTreeMap<String, MetricEntry<B>>,
    pub pipelines: BTreeMap<String, Pipeline>,
    pub stages: Vec<Stage>,
    pub progress: Progress,
}

impl<B: Backend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("datasets", &self.datasets.keys().collect::<Vec<_>>())
            .field("splits", &self.splits.keys().collect::<Vec<_>>())
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("optimizers", &self.optimizers.keys().collect::<Vec<_>>())
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .field("stages", &self.stages.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Default for Session<B> {
    fn default() -> Self {
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
            pipelines: BTreeMap::new(),
            stages: Vec::new(),
            progress: Progress::new(0),
        }
    }
}

impl<B: Backend> Session<B> {
    /// Resolve `<dataset>` or `<split>.<slice>` to a dataset view.
    pub fn resolve_dataset(&self, reference: &str) -> TrainingResult<Arc<dyn Dataset>> {
        if let Some(dataset) = self.datasets.get(reference) {
            return Ok(Arc::clone(dataset));
        }
        if let Some((split_name, slice)) = reference.rsplit_once('.')
            && let Some(entry) = self.splits.get(split_name)
        {
            let base = self.datasets.get(&entry.dataset).ok_or_else(|| {
                TrainingError::InvalidSpec(format!(
                    "split `{split_name}` refers to unknown dataset `{}`",
                    entry.dataset
                ))
            })?;
            let split = entry.splitter.split(Arc::clone(base))?;
            return Ok(Arc::new(split.slice(slice)?));
        }
        let mut known: Vec<String> = self.datasets.keys().cloned().collect();
        known.extend(self.splits.keys().map(|s| format!("{s}.<slice>")));
        Err(TrainingError::InvalidSpec(format!(
            "unknown dataset reference `{reference}`; known: [{}]",
            known.join(", ")
        )))
    }

    /// Names of the objects in `group`.
    #[must_use]
    pub fn names(&self, group: ObjectGroup) -> Vec<String> {
        match group {
            ObjectGroup::Datasets => self.datasets.keys().cloned().collect(),
            ObjectGroup::Splits => self.splits.keys().cloned().collect(),
            ObjectGroup::Preprocessors => self.preprocessors.keys().cloned().collect(),
            ObjectGroup::Collators => self.collators.keys().cloned().collect(),
            ObjectGroup::Models => self.models.keys().cloned().collect(),
            ObjectGroup::Optimizers => self.optimizers.keys().cloned().collect(),
            ObjectGroup::BatchAdapters => self.batch_adapters.keys().cloned().collect(),
            ObjectGroup::Losses => self.losses.keys().cloned().collect(),
            ObjectGroup::Metrics => self.metrics.keys().cloned().collect(),
        }
    }

    /// Borrow a stored object through its `Component` face.
    #[must_use]
    pub fn component(&self, group: ObjectGroup, name: &str) -> Option<&dyn Component> {
        match group {
            ObjectGroup::Datasets => self.datasets.get(name).map(|d| &**d as &dyn Component),
            ObjectGroup::Splits => self.splits.get(name).map(|s| &s.splitter as &dyn Component),
            ObjectGroup::Preprocessors => self.preprocessors.get(name).map(|p| &**p as &dyn Component),
            ObjectGroup::Collators => self.collators.get(name).map(|c| &**c as &dyn Component),
            ObjectGroup::Models => self.models.get(name).map(|m| &**m as &dyn Component),
            ObjectGroup::Optimizers => self.optimizers.get(name).map(|o| &**o as &dyn Component),
            ObjectGroup::BatchAdapters => self.batch_adapters.get(name).map(|a| &**a as &dyn Component),
            ObjectGroup::Losses => self.losses.get(name).map(|l| &*l.criterion as &dyn Component),
            ObjectGroup::Metrics => self.metrics.get(name).map(|m| &*m.metric as &dyn Component),
        }
    }

    #[must_use]
    pub fn current_stage(&self) -> Option<&Stage> {
        self.progress.current_stage_id().ok().and_then(|id| self.stages.get(id))
    }
}
