//! Trellis Training
//!
//! Config-driven, multi-stage training sessions:
//! - Building a session object graph from a declarative spec (`SessionBuilder`)
//! - Splitting datasets and batching them (`MultiSplitter`, `DataLoader`)
//! - Tracking stage progress and running the training loop (`train_session`)
//! - Persisting sessions, static object state and checkpoints (`Saver`)

pub mod average;
pub mod config;
pub mod context;
pub mod datasets;
pub mod error;
pub mod history;
pub mod layout;
pub mod loaders;
pub mod persistence;
pub mod progress;
pub mod registry;
pub mod saver;
pub mod session;
pub mod spec;
pub mod splitter;
pub mod training;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use average::MovingAverage;
pub use config::TrainingSettings;
pub use context::BuildContext;
pub use datasets::{DataLoader, InMemoryDataset, JsonlDataset};
pub use error::{TrainingError, TrainingResult};
pub use history::{read_history, TrainingHistory};
pub use layout::SessionLayout;
pub use loaders::{Installer, SessionBuilder, SessionObject};
pub use persistence::ObjectPersistence;
pub use progress::{ProgressEvent, ProgressSink, StdoutProgressSink, TracingProgressSink};
pub use registry::{ClassRegistry, TransformFn};
pub use saver::{create_and_save_session, create_session, Checkpoint, CheckpointManifest, Saver};
pub use session::{LossEntry, MetricEntry, Pipeline, PipelineNode, Progress, ProgressBar, Session, SplitEntry, Stage};
pub use spec::{
    default_keyring, default_stage_name, override_session_spec, override_spec, Keyring, ObjectGroup, SessionSpec,
};
pub use splitter::{shuffled_indices, DatasetSlice, MultiSplitter, Split};
pub use training::{forward_pass, run_epoch, run_stage, train_session};
