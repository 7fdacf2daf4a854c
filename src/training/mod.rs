//! Training: epoch loop, dataset handling, and metric recording.

pub mod datasets;
pub mod metrics;
pub mod trainer;

pub use datasets::DigitDataset;
pub use metrics::MetricRecorder;
pub use trainer::{Trainer, TrainerConfig, TrainingSummary};
