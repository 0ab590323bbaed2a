//! Ratio-based dataset partitioning.
//!
//! A `MultiSplitter` cuts the index range `[0, len)` of a dataset into
//! contiguous slices proportional to its ratios, optionally after applying a
//! fixed shuffle permutation. Slices are lazy views over the base dataset.

use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use trellis_abstraction::{
    is_empty_record, Component, ComponentError, ConstructorArgs, Dataset, Example, StateRecord,
};

const RATIO_TOLERANCE: f64 = 1e-6;
const ROUNDING_SLACK: f64 = 1e-9;

/// Produce a seeded permutation of `0..len`.
#[must_use]
pub fn shuffled_indices(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SplitterState {
    shuffled_indices: Option<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct MultiSplitter {
    ratio: Vec<f64>,
    shuffle: bool,
    seed: Option<u64>,
    shuffled_indices: Option<Arc<[usize]>>,
}

impl MultiSplitter {
    pub fn new(ratio: Vec<f64>) -> TrainingResult<Self> {
        if ratio.is_empty() {
            return Err(TrainingError::BadSplit("ratio list must not be empty".to_string()));
        }
        if let Some(r) = ratio.iter().find(|r| !r.is_finite() || **r <= 0.0) {
            return Err(TrainingError::BadSplit(format!("ratios must be positive, got {r}")));
        }
        let total: f64 = ratio.iter().sum();
        if (total - 1.0).abs() > RATIO_TOLERANCE {
            return Err(TrainingError::BadSplit(format!("ratios must add up to 1, got {total}")));
        }
        Ok(Self { ratio, shuffle: false, seed: None, shuffled_indices: None })
    }

    /// Builds a splitter from `ratio`, `shuffle` and `seed` keyword arguments.
    pub fn from_args(args: &ConstructorArgs) -> TrainingResult<Self> {
        let ratio = args.kwarg_or("ratio", vec![0.8, 0.2])?;
        let mut splitter = Self::new(ratio)?;
        splitter.shuffle = args.kwarg_or("shuffle", true)?;
        splitter.seed = args.kwarg_or("seed", None)?;
        Ok(splitter)
    }

    #[must_use]
    pub fn ratio(&self) -> &[f64] {
        &self.ratio
    }

    /// Whether the installer should derive a permutation for this splitter.
    #[must_use]
    pub fn wants_shuffle(&self) -> bool {
        self.shuffle
    }

    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn configure(&mut self, shuffled_indices: Vec<usize>) {
        self.shuffled_indices = Some(shuffled_indices.into());
    }

    #[must_use]
    pub fn shuffled(&self) -> Option<&[usize]> {
        self.shuffled_indices.as_deref()
    }

    /// Sizes of the slices for a dataset of `len` examples.
    ///
    /// Each slice gets the floor of its proportional share; what is left goes
    /// to the last slice.
    pub fn slice_sizes(&self, len: usize) -> TrainingResult<Vec<usize>> {
        let parts = self.ratio.len();
        if len < parts {
            return Err(TrainingError::BadSplit(format!(
                "dataset of {len} examples cannot be split into {parts} parts"
            )));
        }

        let total: f64 = self.ratio.iter().sum();
        let mut sizes: Vec<usize> = self
            .ratio
            .iter()
            .map(|r| (r / total * len as f64 + ROUNDING_SLACK).floor() as usize)
            .collect();

        let allocated: usize = sizes.iter().sum();
        if allocated > len {
            return Err(TrainingError::BadSplit(format!(
                "allocated {allocated} examples out of {len}"
            )));
        }
        if let Some(last) = sizes.last_mut() {
            *last += len - allocated;
        }

        let covered: usize = sizes.iter().sum();
        if covered != len {
            return Err(TrainingError::BadSplit(format!("slices cover {covered} of {len} examples")));
        }
        if let Some(idx) = sizes.iter().position(|s| *s == 0) {
            return Err(TrainingError::BadSplit(format!(
                "slice {idx} would be empty (ratio {}, dataset of {len})",
                self.ratio[idx]
            )));
        }
        Ok(sizes)
    }

    pub fn split(&self, dataset: Arc<dyn Dataset>) -> TrainingResult<Split> {
        let len = dataset.len();
        if let Some(order) = &self.shuffled_indices {
            validate_permutation(order, len)?;
        }
        let sizes = self.slice_sizes(len)?;

        let mut parts = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for size in sizes {
            parts.push(DatasetSlice {
                base: Arc::clone(&dataset),
                order: self.shuffled_indices.clone(),
                start,
                end: start + size,
            });
            start += size;
        }
        Ok(Split { parts })
    }
}

fn validate_permutation(order: &[usize], len: usize) -> TrainingResult<()> {
    if order.len() != len {
        return Err(TrainingError::BadSplit(format!(
            "shuffle indices have length {} but dataset has {len} examples",
            order.len()
        )));
    }
    let mut seen = vec![false; len];
    for &idx in order {
        if idx >= len || std::mem::replace(&mut seen[idx], true) {
            return Err(TrainingError::BadSplit(format!(
                "shuffle indices are not a permutation of 0..{len} (offending index {idx})"
            )));
        }
    }
    Ok(())
}

impl Component for MultiSplitter {
    fn state_dict(&self) -> Option<StateRecord> {
        let state = SplitterState { shuffled_indices: self.shuffled_indices.as_deref().map(<[usize]>::to_vec) };
        Some(json!(state))
    }

    fn load_state_dict(&mut self, state: StateRecord) -> Result<(), ComponentError> {
        if is_empty_record(&state) {
            return Ok(());
        }
        let state: SplitterState =
            serde_json::from_value(state).map_err(|e| ComponentError::InvalidState(e.to_string()))?;
        self.shuffled_indices = state.shuffled_indices.map(Into::into);
        Ok(())
    }
}

/// Result of splitting a dataset: slice 0 is train, 1 is val, 2 is test.
#[derive(Clone)]
pub struct Split {
    parts: Vec<DatasetSlice>,
}

impl Split {
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&DatasetSlice> {
        self.parts.get(index)
    }

    #[must_use]
    pub fn parts(&self) -> &[DatasetSlice] {
        &self.parts
    }

    #[must_use]
    pub fn train(&self) -> &DatasetSlice {
        &self.parts[0]
    }

    #[must_use]
    pub fn val(&self) -> Option<&DatasetSlice> {
        self.parts.get(1)
    }

    #[must_use]
    pub fn test(&self) -> Option<&DatasetSlice> {
        self.parts.get(2)
    }

    /// Resolve `train`/`val`/`test` or a positional index.
    pub fn slice(&self, name: &str) -> TrainingResult<DatasetSlice> {
        let index = match name {
            "train" => 0,
            "val" => 1,
            "test" => 2,
            other => other.parse::<usize>().map_err(|_| {
                TrainingError::InvalidSpec(format!(
                    "unknown split slice `{other}`; expected train, val, test or an index"
                ))
            })?,
        };
        self.parts.get(index).cloned().ok_or_else(|| {
            TrainingError::InvalidSpec(format!("split has {} slices, requested `{name}`", self.parts.len()))
        })
    }
}

/// Lazy view over `[start, end)` of a (possibly permuted) base dataset.
#[derive(Clone)]
pub struct DatasetSlice {
    base: Arc<dyn Dataset>,
    order: Option<Arc<[usize]>>,
    start: usize,
    end: usize,
}

impl DatasetSlice {
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    pub fn examples(&self) -> TrainingResult<Vec<Example>> {
        (0..self.len()).map(|i| self.get(i).map_err(Into::into)).collect()
    }
}

impl Component for DatasetSlice {}

impl Dataset for DatasetSlice {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn get(&self, index: usize) -> Result<Example, ComponentError> {
        if index >= self.len() {
            return Err(ComponentError::IndexOutOfBounds { index, len: self.len() });
        }
        let position = self.start + index;
        let base_index = self.order.as_ref().map_or(position, |order| order[position]);
        self.base.get(base_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::InMemoryDataset;
    use proptest::prelude::*;

    fn dataset(values: &[i64]) -> Arc<dyn Dataset> {
        Arc::new(InMemoryDataset::new(values.iter().map(|v| json!(v)).collect()))
    }

    fn values(slice: &DatasetSlice) -> Vec<i64> {
        slice.examples().unwrap().iter().map(|v| v.as_i64().unwrap()).collect()
    }

    #[test]
    fn test_cannot_create_splitter_with_empty_ratio() {
        assert!(matches!(MultiSplitter::new(vec![]), Err(TrainingError::BadSplit(_))));
    }

    #[test]
    fn test_cannot_create_splitter_with_ratio_not_adding_to_one() {
        for ratio in [vec![0.5], vec![0.5, 0.25], vec![0.5, 0.3, 0.1], vec![0.1; 6]] {
            assert!(matches!(MultiSplitter::new(ratio), Err(TrainingError::BadSplit(_))));
        }
    }

    #[test]
    fn test_ratio_sum_uses_float_tolerance() {
        assert!(MultiSplitter::new(vec![0.1; 10]).is_ok());
    }

    #[test]
    fn test_cannot_split_dataset_smaller_than_part_count() {
        let splitter = MultiSplitter::new(vec![0.5, 0.5]).unwrap();
        assert!(matches!(splitter.split(dataset(&[])), Err(TrainingError::BadSplit(_))));

        let splitter = MultiSplitter::new(vec![0.7, 0.3]).unwrap();
        assert!(matches!(splitter.split(dataset(&[1])), Err(TrainingError::BadSplit(_))));

        let splitter = MultiSplitter::new(vec![0.5, 0.4, 0.1]).unwrap();
        assert!(matches!(splitter.split(dataset(&[1, 2])), Err(TrainingError::BadSplit(_))));
    }

    #[test]
    fn test_cannot_produce_empty_slices() {
        let splitter = MultiSplitter::new(vec![0.1, 0.9]).unwrap();
        assert!(matches!(splitter.split(dataset(&[1, 2, 3, 4])), Err(TrainingError::BadSplit(_))));

        let splitter = MultiSplitter::new(vec![0.5, 0.1, 0.4]).unwrap();
        assert!(matches!(splitter.split(dataset(&[0, 1, 2, 3])), Err(TrainingError::BadSplit(_))));

        let splitter = MultiSplitter::new(vec![0.2; 5]).unwrap();
        assert!(matches!(splitter.split(dataset(&[0, 1, 2])), Err(TrainingError::BadSplit(_))));
    }

    #[test]
    fn test_slice_sizes_cover_dataset() {
        let splitter = MultiSplitter::new(vec![1.0]).unwrap();
        assert_eq!(splitter.slice_sizes(3).unwrap(), vec![3]);

        let splitter = MultiSplitter::new(vec![0.4, 0.3, 0.1, 0.2]).unwrap();
        assert_eq!(splitter.slice_sizes(12).unwrap().iter().sum::<usize>(), 12);

        let splitter = MultiSplitter::new(vec![0.1; 10]).unwrap();
        assert_eq!(splitter.slice_sizes(16).unwrap().iter().sum::<usize>(), 16);
    }

    #[test]
    fn test_slices_follow_positional_convention() {
        let split = MultiSplitter::new(vec![1.0]).unwrap().split(dataset(&[1, 2, 3])).unwrap();
        assert_eq!(values(split.train()), vec![1, 2, 3]);
        assert!(split.val().is_none());

        let split = MultiSplitter::new(vec![0.5, 0.5]).unwrap().split(dataset(&[1, 2, 3])).unwrap();
        assert_eq!(values(split.train()), vec![1]);
        assert_eq!(values(split.val().unwrap()), vec![2, 3]);

        let split = MultiSplitter::new(vec![0.4, 0.5, 0.1])
            .unwrap()
            .split(dataset(&[1, 2, 3, 4, 5, 6]))
            .unwrap();
        assert_eq!(values(split.get(0).unwrap()), vec![1, 2]);
        assert_eq!(values(split.val().unwrap()), vec![3, 4, 5]);
        assert_eq!(values(split.test().unwrap()), vec![6]);
        assert_eq!(values(&split.slice("2").unwrap()), vec![6]);
        assert!(split.slice("holdout").is_err());
    }

    #[test]
    fn test_rejects_mismatched_shuffle_indices() {
        let mut splitter = MultiSplitter::new(vec![1.0]).unwrap();
        splitter.configure(vec![0, 2, 1]);
        for data in [&[1][..], &[1, 2], &[1, 2, 3, 4], &[1, 2, 3, 4, 5]] {
            assert!(matches!(splitter.split(dataset(data)), Err(TrainingError::BadSplit(_))));
        }
    }

    #[test]
    fn test_rejects_shuffle_indices_that_are_not_a_permutation() {
        let mut splitter = MultiSplitter::new(vec![1.0]).unwrap();
        splitter.configure(vec![0, 0, 1]);
        assert!(matches!(splitter.split(dataset(&[1, 2, 3])), Err(TrainingError::BadSplit(_))));
    }

    #[test]
    fn test_shuffling() {
        let mut splitter = MultiSplitter::new(vec![0.6, 0.4]).unwrap();
        splitter.configure(vec![0, 2, 1, 3]);
        let split = splitter.split(dataset(&[6, 7, 8, 9])).unwrap();
        assert_eq!(values(split.train()), vec![6, 8]);
        assert_eq!(values(split.val().unwrap()), vec![7, 9]);
    }

    #[test]
    fn test_slice_index_out_of_bounds() {
        let split = MultiSplitter::new(vec![0.5, 0.5]).unwrap().split(dataset(&[1, 2])).unwrap();
        assert!(matches!(
            split.train().get(1),
            Err(ComponentError::IndexOutOfBounds { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_state_round_trip_restores_permutation() {
        let mut splitter = MultiSplitter::new(vec![0.5, 0.5]).unwrap();
        splitter.configure(shuffled_indices(8, 7));
        let state = splitter.state_dict().unwrap();

        let mut restored = MultiSplitter::new(vec![0.5, 0.5]).unwrap();
        restored.load_state_dict(state).unwrap();
        assert_eq!(restored.shuffled(), splitter.shuffled());
    }

    #[test]
    fn test_seeded_shuffle_is_deterministic() {
        assert_eq!(shuffled_indices(20, 3), shuffled_indices(20, 3));
        let mut sorted = shuffled_indices(20, 3);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_slices_are_non_empty_and_cover_dataset(
            weights in proptest::collection::vec(1u32..100, 1..8),
            extra in 0usize..200,
        ) {
            let total: u32 = weights.iter().sum();
            let ratio: Vec<f64> = weights.iter().map(|w| f64::from(*w) / f64::from(total)).collect();
            let splitter = MultiSplitter::new(ratio).unwrap();
            let len = splitter.ratio().len() + extra;

            match splitter.slice_sizes(len) {
                Ok(sizes) => {
                    prop_assert_eq!(sizes.iter().sum::<usize>(), len);
                    prop_assert!(sizes.iter().all(|s| *s > 0));
                }
                Err(err) => prop_assert!(matches!(err, TrainingError::BadSplit(_))),
            }
        }
    }
}
