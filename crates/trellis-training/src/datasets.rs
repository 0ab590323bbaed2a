//! Builtin datasets and the batching data loader.

use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trellis_abstraction::{
    Backend, Batch, BatchAdapter, Collator, Component, ComponentError, ConstructorArgs, Dataset, Example,
    Preprocessor,
};

/// Dataset backed by a vector of examples, typically given inline in the spec.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    examples: Vec<Example>,
}

impl InMemoryDataset {
    #[must_use]
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Builds from an `examples` keyword argument (or the first positional argument).
    pub fn from_args(args: &ConstructorArgs) -> TrainingResult<Self> {
        let examples = if args.kwargs.contains_key("examples") { args.kwarg("examples")? } else { args.arg(0)? };
        Ok(Self::new(examples))
    }
}

impl Component for InMemoryDataset {}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Result<Example, ComponentError> {
        self.examples
            .get(index)
            .cloned()
            .ok_or(ComponentError::IndexOutOfBounds { index, len: self.examples.len() })
    }
}

/// Dataset read from a JSONL file, one example per non-empty line.
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    path: PathBuf,
    examples: Vec<Example>,
}

impl JsonlDataset {
    pub fn open(path: &Path, limit: Option<usize>) -> TrainingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut examples = Vec::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(line).map_err(|e| {
                TrainingError::InvalidSpec(format!(
                    "failed to parse line {} of {}: {}",
                    idx + 1,
                    path.display(),
                    e
                ))
            })?;
            examples.push(example);
            if limit.is_some_and(|limit| examples.len() >= limit) {
                break;
            }
        }

        Ok(Self { path: path.to_path_buf(), examples })
    }

    /// Builds from `path` and optional `limit` keyword arguments.
    pub fn from_args(args: &ConstructorArgs) -> TrainingResult<Self> {
        let path: PathBuf = args.kwarg("path")?;
        let limit = args.kwarg_or("limit", None)?;
        Self::open(&path, limit)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Component for JsonlDataset {}

impl Dataset for JsonlDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Result<Example, ComponentError> {
        self.examples
            .get(index)
            .cloned()
            .ok_or(ComponentError::IndexOutOfBounds { index, len: self.examples.len() })
    }
}

/// Iterates a dataset in batches: fetch, preprocess, collate, adapt.
pub struct DataLoader<'a, B: Backend> {
    dataset: Arc<dyn Dataset>,
    preprocessors: Vec<&'a dyn Preprocessor>,
    collator: &'a dyn Collator<B>,
    adapter: Option<&'a dyn BatchAdapter<B>>,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a, B: Backend> DataLoader<'a, B> {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        preprocessors: Vec<&'a dyn Preprocessor>,
        collator: &'a dyn Collator<B>,
        adapter: Option<&'a dyn BatchAdapter<B>>,
        batch_size: usize,
    ) -> Self {
        let order = (0..dataset.len()).collect();
        Self { dataset, preprocessors, collator, adapter, batch_size: batch_size.max(1), order, cursor: 0 }
    }

    /// Visit examples in a seeded random order instead of sequentially.
    #[must_use]
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self
    }

    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn load_example(&self, index: usize) -> TrainingResult<Example> {
        let mut example = self.dataset.get(index)?;
        for preprocessor in &self.preprocessors {
            example = preprocessor.process(example)?;
        }
        Ok(example)
    }

    fn next_batch(&mut self) -> TrainingResult<Batch<B::Tensor>> {
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let examples = indices.into_iter().map(|i| self.load_example(i)).collect::<TrainingResult<Vec<_>>>()?;
        let batch = self.collator.collate(examples)?;
        match self.adapter {
            Some(adapter) => Ok(adapter.adapt(batch)?),
            None => Ok(batch),
        }
    }
}

impl<B: Backend> Iterator for DataLoader<'_, B> {
    type Item = TrainingResult<Batch<B::Tensor>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScalarCollator, ToyBackend, VocabularyCounter};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_dataset_skips_blank_lines_and_honors_limit() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.jsonl");
        std::fs::write(&path, "{\"x\": 1}\n\n{\"x\": 2}\n{\"x\": 3}\n").unwrap();

        let all = JsonlDataset::open(&path, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.get(1).unwrap(), json!({"x": 2}));

        let limited = JsonlDataset::open(&path, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_jsonl_dataset_reports_bad_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.jsonl");
        std::fs::write(&path, "{\"x\": 1}\nnot json\n").unwrap();

        let err = JsonlDataset::open(&path, None).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_loader_batches_preprocesses_and_collates() {
        let examples = (0..5).map(|i| json!({"x": i, "y": 2 * i})).collect();
        let dataset: Arc<dyn Dataset> = Arc::new(InMemoryDataset::new(examples));
        let mut counter = VocabularyCounter::default();
        counter.fit(&*dataset).unwrap();
        let collator = ScalarCollator::new("net");

        let loader: DataLoader<'_, ToyBackend> =
            DataLoader::new(Arc::clone(&dataset), vec![&counter as &dyn Preprocessor], &collator, None, 2);
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<_> = loader.collect::<TrainingResult<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].inputs["net"]["x"], vec![0.0, 1.0]);
        assert_eq!(batches[2].targets["y"], vec![8.0]);
    }

    #[test]
    fn test_shuffled_loader_visits_every_example_once() {
        let examples = (0..6).map(|i| json!({"x": i, "y": i})).collect();
        let dataset: Arc<dyn Dataset> = Arc::new(InMemoryDataset::new(examples));
        let collator = ScalarCollator::new("net");

        let loader: DataLoader<'_, ToyBackend> = DataLoader::new(dataset, vec![], &collator, None, 4).shuffled(11);
        let mut seen: Vec<f64> = loader.flat_map(|b| b.unwrap().targets["y"].clone()).collect();
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
