//! Stage-by-stage training loop over a session's pipelines.

use crate::average::MovingAverage;
use crate::config::TrainingSettings;
use crate::datasets::DataLoader;
use crate::error::{TrainingError, TrainingResult};
use crate::history::LOSS_COLUMN;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::saver::Saver;
use crate::session::{LossEntry, MetricEntry, Pipeline, Session, Stage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};
use trellis_abstraction::{
    Backend, Batch, BatchAdapter, Collator, Dataset, Network, Optimizer, Preprocessor, TensorMap,
};

type Models<B> = BTreeMap<String, Box<dyn Network<B>>>;
type Optimizers<B> = BTreeMap<String, Box<dyn Optimizer<B>>>;

fn network<'m, B: Backend>(models: &'m mut Models<B>, name: &str) -> TrainingResult<&'m mut Box<dyn Network<B>>> {
    if !models.contains_key(name) {
        let available: Vec<&str> = models.keys().map(String::as_str).collect();
        return Err(TrainingError::InvalidSpec(format!(
            "unknown model `{name}`; models: [{}]",
            available.join(", ")
        )));
    }
    models.get_mut(name).ok_or_else(|| TrainingError::InvalidSpec(format!("unknown model `{name}`")))
}

/// Run every node of `pipeline` on one batch, in declaration order.
///
/// A node reads each declared input from the outputs of earlier nodes or, failing
/// that, from the batch inputs filed under its own name. The returned table holds
/// every node output under its declared output name.
pub fn forward_pass<B: Backend>(
    pipeline: &Pipeline,
    models: &mut Models<B>,
    batch: &Batch<B::Tensor>,
) -> TrainingResult<TensorMap<B::Tensor>> {
    let empty = TensorMap::new();
    let mut outputs: TensorMap<B::Tensor> = TensorMap::new();

    for node in &pipeline.nodes {
        let raw = batch.inputs.get(&node.name).unwrap_or(&empty);
        let inputs = node
            .inputs
            .iter()
            .map(|name| {
                outputs.get(name).or_else(|| raw.get(name)).cloned().ok_or_else(|| {
                    TrainingError::missing_key(name, outputs.keys().chain(raw.keys()).collect::<BTreeSet<_>>())
                })
            })
            .collect::<TrainingResult<Vec<_>>>()?;

        let produced = network(models, &node.model)?.forward(inputs)?;
        if produced.len() != node.outputs.len() {
            return Err(TrainingError::InvalidSpec(format!(
                "node `{}` declares {} outputs but its model returned {}",
                node.name,
                node.outputs.len(),
                produced.len()
            )));
        }
        outputs.extend(node.outputs.iter().cloned().zip(produced));
    }
    Ok(outputs)
}

/// Targets and node outputs in one lookup table; outputs shadow targets.
fn lookup_table<B: Backend>(batch: &Batch<B::Tensor>, outputs: TensorMap<B::Tensor>) -> TensorMap<B::Tensor> {
    let mut table = batch.targets.clone();
    table.extend(outputs);
    table
}

/// The session objects one stage works with.
struct StageRunner<'s, B: Backend> {
    stage: &'s Stage,
    pipeline: &'s Pipeline,
    models: &'s mut Models<B>,
    optimizers: &'s mut Optimizers<B>,
    loss: &'s LossEntry<B>,
    metrics: Vec<(&'s str, &'s MetricEntry<B>)>,
    /// Distinct (optimizer, model) pairs stepped during this stage. An
    /// optimizer shared by several nodes appears once per model.
    participating: Vec<(String, String)>,
}

fn metric_values<B: Backend>(
    metrics: &[(&str, &MetricEntry<B>)],
    table: &TensorMap<B::Tensor>,
) -> TrainingResult<BTreeMap<String, f64>> {
    metrics.iter().map(|(name, metric)| Ok(((*name).to_string(), metric.compute(table)?))).collect()
}

impl<B: Backend> StageRunner<'_, B> {
    /// One optimization step; returns the loss and the metric values of the batch.
    fn train_on_batch(&mut self, batch: &Batch<B::Tensor>) -> TrainingResult<(f64, BTreeMap<String, f64>)> {
        for (optimizer, model) in &self.participating {
            let net = network(self.models, model)?;
            if let Some(optimizer) = self.optimizers.get_mut(optimizer) {
                optimizer.zero_grad(&mut **net)?;
            }
        }

        let outputs = forward_pass(self.pipeline, self.models, batch)?;
        let table = lookup_table::<B>(batch, outputs);
        let loss = self.loss.compute(&table)?;
        B::backward(&loss)?;

        for (optimizer, model) in &self.participating {
            let net = network(self.models, model)?;
            if let Some(optimizer) = self.optimizers.get_mut(optimizer) {
                optimizer.step(&mut **net)?;
            }
        }

        Ok((B::to_scalar(&loss)?, metric_values(&self.metrics, &table)?))
    }

    fn set_training(&mut self, training: bool) {
        for node in &self.pipeline.nodes {
            if let Some(model) = self.models.get_mut(&node.model) {
                model.set_training(training);
            }
        }
    }

    /// Average loss and metrics over at most `eval_batches` validation batches.
    fn evaluate(
        &mut self,
        loader: impl Iterator<Item = TrainingResult<Batch<B::Tensor>>>,
    ) -> TrainingResult<BTreeMap<String, f64>> {
        let max_batches = self.stage.settings.eval_batches;
        self.set_training(false);
        let (pipeline, loss, metrics) = (self.pipeline, self.loss, &self.metrics);
        let models = &mut *self.models;
        let result: TrainingResult<_> = B::without_grad(|| {
            let mut averages: BTreeMap<String, MovingAverage> = BTreeMap::new();
            for batch in loader.take(max_batches) {
                let batch = batch?;
                let outputs = forward_pass(pipeline, models, &batch)?;
                let table = lookup_table::<B>(&batch, outputs);
                let value = B::to_scalar(&loss.compute(&table)?)?;
                averages.entry(LOSS_COLUMN.to_string()).or_default().update(value);
                for (name, value) in metric_values(metrics, &table)? {
                    averages.entry(name).or_default().update(value);
                }
            }
            Ok(means(&averages))
        });
        self.set_training(true);
        result
    }
}

fn means(averages: &BTreeMap<String, MovingAverage>) -> BTreeMap<String, f64> {
    averages.iter().filter_map(|(name, avg)| avg.value().map(|v| (name.clone(), v))).collect()
}

/// Borrowed data-loading objects of one stage.
struct StageData<'s, B: Backend> {
    preprocessors: Vec<&'s dyn Preprocessor>,
    collator: &'s dyn Collator<B>,
    adapter: Option<&'s dyn BatchAdapter<B>>,
}

impl<'s, B: Backend> StageData<'s, B> {
    fn loader(&self, dataset: Arc<dyn Dataset>, settings: &TrainingSettings) -> DataLoader<'s, B> {
        DataLoader::new(dataset, self.preprocessors.clone(), self.collator, self.adapter, settings.batch_size)
    }
}

fn missing(group: &str, name: &str) -> TrainingError {
    TrainingError::InvalidSpec(format!("unknown {group} `{name}`"))
}

/// Train one epoch of the current stage and evaluate when due.
///
/// Returns the epoch averages of the training batches and, if evaluation ran,
/// the validation averages.
pub fn run_epoch<B: Backend>(
    session: &mut Session<B>,
    stage: &Stage,
    epoch: usize,
    sink: &dyn ProgressSink,
) -> TrainingResult<(BTreeMap<String, f64>, Option<BTreeMap<String, f64>>)> {
    let train_dataset = session.resolve_dataset(&stage.train_dataset)?;
    let val_dataset = stage.val_dataset.as_deref().map(|r| session.resolve_dataset(r)).transpose()?;

    let Session {
        preprocessors,
        collators,
        models,
        optimizers,
        batch_adapters,
        losses,
        metrics,
        pipelines,
        ..
    } = session;

    let data = StageData {
        preprocessors: stage
            .preprocessors
            .iter()
            .map(|name| preprocessors.get(name).map(|p| &**p).ok_or_else(|| missing("preprocessor", name)))
            .collect::<TrainingResult<_>>()?,
        collator: collators.get(&stage.collator).map(|c| &**c).ok_or_else(|| missing("collator", &stage.collator))?,
        adapter: stage
            .batch_adapter
            .as_ref()
            .map(|name| batch_adapters.get(name).map(|a| &**a).ok_or_else(|| missing("batch adapter", name)))
            .transpose()?,
    };

    let pipeline = pipelines.get(&stage.pipeline).ok_or_else(|| missing("pipeline", &stage.pipeline))?;
    let mut participating: Vec<(String, String)> = Vec::new();
    for node in pipeline.nodes.iter().filter(|n| stage.trainable.contains(&n.name)) {
        if let Some(optimizer) = &node.optimizer {
            let pair = (optimizer.clone(), node.model.clone());
            if !participating.contains(&pair) {
                participating.push(pair);
            }
        }
    }

    let mut runner = StageRunner {
        stage,
        pipeline,
        models,
        optimizers,
        loss: losses.get(&stage.loss).ok_or_else(|| missing("loss", &stage.loss))?,
        metrics: stage
            .metrics
            .iter()
            .map(|name| metrics.get(name).map(|m| (name.as_str(), m)).ok_or_else(|| missing("metric", name)))
            .collect::<TrainingResult<_>>()?,
        participating,
    };

    let settings = &stage.settings;
    let mut loader = data.loader(train_dataset, settings);
    if settings.shuffle {
        loader = loader.shuffled(settings.epoch_seed(epoch));
    }
    debug!(stage = %stage.name, epoch, batches = loader.num_batches(), "Starting epoch");

    let mut running: BTreeMap<String, MovingAverage> = BTreeMap::new();
    let mut totals: BTreeMap<String, MovingAverage> = BTreeMap::new();
    for (iteration, batch) in loader.enumerate() {
        let (loss, values) = runner.train_on_batch(&batch?)?;
        for (name, value) in std::iter::once((LOSS_COLUMN.to_string(), loss)).chain(values) {
            running.entry(name.clone()).or_default().update(value);
            totals.entry(name).or_default().update(value);
        }

        if (iteration + 1) % settings.report_interval == 0 {
            let mut report = means(&running);
            let loss = report.remove(LOSS_COLUMN).unwrap_or_default();
            sink.on_event(ProgressEvent::Report {
                stage: stage.name.clone(),
                epoch,
                iteration: iteration + 1,
                loss,
                metrics: report,
            });
            running.values_mut().for_each(MovingAverage::reset);
        }
    }

    let due = epoch % settings.eval_every == 0 || epoch == stage.epochs;
    let val = match val_dataset {
        Some(dataset) if due => Some(runner.evaluate(data.loader(dataset, settings))?),
        _ => None,
    };
    Ok((means(&totals), val))
}

/// Train the current stage until its epoch target is reached.
///
/// Fails with `StopTraining` when no stage is left.
pub fn run_stage<B: Backend>(session: &mut Session<B>, saver: &Saver, sink: &dyn ProgressSink) -> TrainingResult<()> {
    let stage_id = session.progress.current_stage_id()?;
    let stage = session
        .stages
        .get(stage_id)
        .cloned()
        .ok_or_else(|| TrainingError::InvalidSpec(format!("progress refers to unknown stage {stage_id}")))?;
    let mut epochs_done = session.progress.current_bar()?.epochs_done;

    info!(stage = %stage.name, epochs_done, epochs = stage.epochs, "Starting stage");
    sink.on_event(ProgressEvent::StageStarted { stage: stage.name.clone(), epochs_done, epochs: stage.epochs });

    if epochs_done >= stage.epochs {
        session.progress.mark_completed()?;
    }
    while epochs_done < stage.epochs {
        let epoch = epochs_done + 1;
        let (train, val) = run_epoch(session, &stage, epoch, sink)?;

        epochs_done = session.progress.increment_progress()?.epochs_done;
        let completed = epochs_done >= stage.epochs;
        if completed {
            session.progress.mark_completed()?;
        }
        let checkpoint = if completed || epoch % stage.settings.checkpoint_every == 0 {
            Some(saver.save_checkpoint(session)?)
        } else {
            None
        };
        saver.log_metrics(&stage, epoch, &train, val.as_ref())?;

        info!(stage = %stage.name, epoch, ?checkpoint, "Epoch finished");
        sink.on_event(ProgressEvent::EpochFinished { stage: stage.name.clone(), epoch, train, val, checkpoint });
    }

    sink.on_event(ProgressEvent::StageCompleted { stage: stage.name.clone() });
    Ok(())
}

/// Run the remaining stages in order until every stage is completed.
pub fn train_session<B: Backend>(session: &mut Session<B>, saver: &Saver, sink: &dyn ProgressSink) -> TrainingResult<()> {
    loop {
        match run_stage(session, saver, sink) {
            Ok(()) => {}
            Err(e) if e.is_stop_signal() => break,
            Err(e) => return Err(e),
        }
    }
    let epochs_done = session.progress.epochs_done_total();
    info!(epochs_done, "Training finished");
    sink.on_event(ProgressEvent::Finished { epochs_done });
    Ok(())
}
