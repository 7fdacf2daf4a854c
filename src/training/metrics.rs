//! Metric series recorded during training.
//!
//! The recorder is a passive observer: it copies scalars out of the
//! simulation and never feeds anything back, so recording cannot alter
//! the numerical trajectory of a run.

use serde::Serialize;

use crate::utils::persist::RunDir;
use crate::Result;

/// Scalar metric series accumulated over a training run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricRecorder {
    /// Percent error on the full test set, one entry per epoch boundary
    /// (including the pre-training test).
    pub full_test_errors: Vec<f32>,
    /// Percent error on the quick test subset.
    pub quick_test_errors: Vec<f32>,
    /// Output-layer loss per training example.
    pub losses: Vec<f32>,
    /// Angle (degrees) between local and backpropagated errors per
    /// example.
    pub bp_angles: Vec<f32>,
    /// Percent training error per epoch.
    pub training_errors: Vec<f32>,
    /// Label of each training example in presentation order.
    pub training_labels: Vec<u8>,
}

impl MetricRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist every series as one JSON document.
    pub fn write(&self, run: &RunDir) -> Result<()> {
        run.write_json("metrics.json", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn series_serialize_to_json() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::create(&dir.path().join("run"), false).unwrap();

        let mut recorder = MetricRecorder::new();
        recorder.full_test_errors.push(88.0);
        recorder.losses.extend([0.5, 0.25]);
        recorder.write(&run).unwrap();

        let raw = std::fs::read_to_string(run.path().join("metrics.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["full_test_errors"][0], 88.0);
        assert_eq!(value["losses"][1], 0.25);
    }
}
