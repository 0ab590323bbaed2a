use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted { stage: String, epochs_done: usize, epochs: usize },
    Report { stage: String, epoch: usize, iteration: usize, loss: f64, metrics: BTreeMap<String, f64> },
    EpochFinished {
        stage: String,
        epoch: usize,
        train: BTreeMap<String, f64>,
        val: Option<BTreeMap<String, f64>>,
        checkpoint: Option<usize>,
    },
    StageCompleted { stage: String },
    Finished { epochs_done: usize },
}

pub trait ProgressSink {
    fn on_event(&self, event: ProgressEvent);
}

fn format_values(values: &BTreeMap<String, f64>) -> String {
    values.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::StageStarted { stage, epochs_done, epochs } => {
                println!("[train:{stage}] started at epoch {epochs_done}/{epochs}");
            }
            ProgressEvent::Report { stage, epoch, iteration, loss, metrics } => {
                if metrics.is_empty() {
                    println!("[train:{stage}] epoch {epoch} iter {iteration} loss={loss:.4}");
                } else {
                    println!(
                        "[train:{stage}] epoch {epoch} iter {iteration} loss={loss:.4} {}",
                        format_values(&metrics)
                    );
                }
            }
            ProgressEvent::EpochFinished { stage, epoch, train, val, checkpoint } => {
                println!("[train:{stage}] epoch {epoch} train {}", format_values(&train));
                if let Some(val) = val {
                    println!("[train:{stage}] epoch {epoch} val {}", format_values(&val));
                }
                if let Some(checkpoint) = checkpoint {
                    println!("[train:{stage}] checkpoint {checkpoint} saved");
                }
            }
            ProgressEvent::StageCompleted { stage } => println!("[train:{stage}] completed"),
            ProgressEvent::Finished { epochs_done } => println!("[train] finished after {epochs_done} epochs"),
        }
    }
}

/// Forwards progress events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Report { stage, epoch, iteration, loss, metrics } => {
                info!(%stage, epoch, iteration, loss, metrics = %format_values(&metrics), "Training report");
            }
            ProgressEvent::EpochFinished { stage, epoch, train, val, checkpoint } => {
                info!(
                    %stage,
                    epoch,
                    train = %format_values(&train),
                    val = %val.as_ref().map(format_values).unwrap_or_default(),
                    ?checkpoint,
                    "Epoch finished"
                );
            }
            other => info!(event = ?other, "Training progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = ProgressEvent::StageCompleted { stage: "warmup".to_string() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stage_completed");
        assert_eq!(value["stage"], "warmup");
    }

    #[test]
    fn test_format_values_is_sorted_and_rounded() {
        let values = BTreeMap::from([("mae".to_string(), 0.5), ("loss".to_string(), 1.0 / 3.0)]);
        assert_eq!(format_values(&values), "loss=0.3333 mae=0.5000");
    }
}
