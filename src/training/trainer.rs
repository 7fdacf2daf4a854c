//! Training loop.
//!
//! Drives the network through shuffled epochs of two-phase examples,
//! interleaves quick and full evaluations, and hands metrics and weight
//! snapshots to the persistence adapter at epoch boundaries. The trainer
//! never touches files itself unless a run directory is supplied.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::model::Network;
use crate::training::datasets::DigitDataset;
use crate::training::metrics::MetricRecorder;
use crate::utils::persist::{RunDir, RunManifest};
use crate::{DendraError, Result};

/// Training-loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of passes over the training set.
    pub epochs: usize,
    /// Examples per epoch; `None` uses the whole training set.
    pub examples_per_epoch: Option<usize>,
    /// Forward learning rate per layer (input side first).
    pub f_etas: Vec<f32>,
    /// Feedback learning rate per layer; only used when backward
    /// weights are updated.
    pub b_etas: Vec<f32>,
    /// Examples used for the full test at epoch boundaries.
    pub full_test_examples: usize,
    /// Examples used for the quick mid-epoch test.
    pub quick_test_examples: usize,
    /// Quick-test cadence in training examples.
    pub quick_test_interval: usize,
    /// Track percent training error per epoch.
    pub record_training_error: bool,
    /// Track the label sequence of presented examples.
    pub record_training_labels: bool,
    /// Snapshot weights into the run directory at each epoch end.
    pub save_epoch_weights: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            examples_per_epoch: None,
            f_etas: vec![0.1, 0.1],
            b_etas: vec![0.0, 0.0],
            full_test_examples: 10_000,
            quick_test_examples: 100,
            quick_test_interval: 1000,
            record_training_error: true,
            record_training_labels: true,
            save_epoch_weights: true,
        }
    }
}

/// Headline numbers from a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    /// Full-test error before any training.
    pub initial_test_error: f32,
    /// Full-test error after the final epoch.
    pub final_test_error: f32,
    /// Full-test error at every epoch boundary.
    pub full_test_errors: Vec<f32>,
    /// Mean output loss over all training examples.
    pub mean_loss: f32,
}

/// Epoch loop around a [`Network`].
pub struct Trainer {
    net: Network,
    config: TrainerConfig,
    recorder: MetricRecorder,
    shuffle_rng: StdRng,
}

impl Trainer {
    pub fn new(net: Network, config: TrainerConfig) -> Result<Self> {
        let depth = net.depth();
        if config.f_etas.len() != depth || config.b_etas.len() != depth {
            return Err(DendraError::Config(format!(
                "network has {} layers but {} forward / {} backward learning rates were given",
                depth,
                config.f_etas.len(),
                config.b_etas.len()
            )));
        }
        if config.epochs == 0 {
            return Err(DendraError::Config("training needs at least one epoch".to_string()));
        }
        let shuffle_rng = StdRng::seed_from_u64(net.config().seed.wrapping_add(1));
        Ok(Self {
            net,
            config,
            recorder: MetricRecorder::new(),
            shuffle_rng,
        })
    }

    pub fn network(&self) -> &Network {
        &self.net
    }

    pub fn recorder(&self) -> &MetricRecorder {
        &self.recorder
    }

    /// Give the trained network back to the caller.
    pub fn into_network(self) -> Network {
        self.net
    }

    /// Run the configured number of epochs over `data`. When `run` is
    /// given, the manifest, weight snapshots, and metric series are
    /// persisted there.
    pub fn train(&mut self, data: &DigitDataset, run: Option<&RunDir>) -> Result<TrainingSummary> {
        if data.input_size() != self.net.input_size() {
            return Err(DendraError::Shape(format!(
                "dataset has {} features but the network expects {}",
                data.input_size(),
                self.net.input_size()
            )));
        }

        if let Some(run) = run {
            run.write_manifest(&RunManifest {
                version: crate::VERSION.to_string(),
                config: self.net.config().clone(),
                trainer: self.config.clone(),
                layer_sizes: self.net.sizes().to_vec(),
                input_size: self.net.input_size(),
            })?;
            self.net.save_weights(run.path(), "initial_")?;
        }

        log::info!("starting training: {} epochs", self.config.epochs);
        let initial_test_error = self.full_test(data, run)?;
        log::info!("initial full-test error: {:.2}%", initial_test_error);

        let examples_per_epoch = self
            .config
            .examples_per_epoch
            .unwrap_or(data.n_train())
            .min(data.n_train());

        let mut total_loss = 0.0;
        let mut total_examples = 0usize;

        for epoch in 0..self.config.epochs {
            let epoch_start = Instant::now();
            let mut order: Vec<usize> = (0..data.n_train()).collect();
            order.shuffle(&mut self.shuffle_rng);
            let mut num_correct = 0usize;

            for (i, &example) in order.iter().take(examples_per_epoch).enumerate() {
                let x = data.train_inputs.column(example).to_owned();
                let t = data.train_targets.column(example).to_owned();
                let label = data.train_label(example);

                let outcome = match self.net.train_example(
                    &x,
                    &t,
                    &self.config.f_etas,
                    &self.config.b_etas,
                ) {
                    Ok(outcome) => outcome,
                    // A single numerically degenerate example is logged
                    // and skipped; anything else aborts the run.
                    Err(DendraError::Numerical(msg)) => {
                        log::warn!(
                            "skipping example {} in epoch {}: {}",
                            example,
                            epoch,
                            msg
                        );
                        self.net.clear_transient();
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                self.recorder.losses.push(outcome.loss);
                if let Some(angle) = outcome.bp_angle {
                    self.recorder.bp_angles.push(angle);
                }
                if self.config.record_training_labels {
                    self.recorder.training_labels.push(label as u8);
                }
                if self.config.record_training_error && outcome.predicted == label {
                    num_correct += 1;
                }
                total_loss += outcome.loss;
                total_examples += 1;

                if (i + 1) % 100 == 0 {
                    log::info!(
                        "epoch {}, example {}/{}, loss {:.5}",
                        epoch,
                        i + 1,
                        examples_per_epoch,
                        outcome.loss
                    );
                }

                // Quick mid-epoch test; the epoch boundary gets the full
                // test instead.
                if (i + 1) % self.config.quick_test_interval == 0 && i + 1 != examples_per_epoch {
                    let error = self.quick_test(data, run)?;
                    log::info!(
                        "epoch {}, example {}/{}: quick-test error {:.2}%",
                        epoch,
                        i + 1,
                        examples_per_epoch,
                        error
                    );
                }
            }

            let error = self.full_test(data, run)?;
            if self.config.record_training_error {
                let train_error =
                    (1.0 - num_correct as f32 / examples_per_epoch as f32) * 100.0;
                self.recorder.training_errors.push(train_error);
                log::info!(
                    "epoch {} done in {:.1?}: full-test error {:.2}%, training error {:.2}%",
                    epoch,
                    epoch_start.elapsed(),
                    error,
                    train_error
                );
            } else {
                log::info!(
                    "epoch {} done in {:.1?}: full-test error {:.2}%",
                    epoch,
                    epoch_start.elapsed(),
                    error
                );
            }

            if let Some(run) = run {
                if self.config.save_epoch_weights {
                    self.net
                        .save_weights(run.path(), &format!("epoch_{}_", epoch))?;
                }
                self.recorder.write(run)?;
            }
        }

        let full = self.recorder.full_test_errors.clone();
        Ok(TrainingSummary {
            initial_test_error,
            final_test_error: *full.last().unwrap_or(&initial_test_error),
            full_test_errors: full,
            mean_loss: if total_examples > 0 {
                total_loss / total_examples as f32
            } else {
                0.0
            },
        })
    }

    fn full_test(&mut self, data: &DigitDataset, run: Option<&RunDir>) -> Result<f32> {
        let error = self.net.evaluate(
            &data.test_inputs,
            &data.test_targets,
            self.config.full_test_examples,
        )?;
        self.recorder.full_test_errors.push(error);
        self.recorder.quick_test_errors.push(error);
        if let Some(run) = run {
            run.append_metric("full_test_errors.txt", error)?;
            run.append_metric("quick_test_errors.txt", error)?;
        }
        Ok(error)
    }

    fn quick_test(&mut self, data: &DigitDataset, run: Option<&RunDir>) -> Result<f32> {
        let error = self.net.evaluate(
            &data.test_inputs,
            &data.test_targets,
            self.config.quick_test_examples,
        )?;
        self.recorder.quick_test_errors.push(error);
        if let Some(run) = run {
            run.append_metric("quick_test_errors.txt", error)?;
        }
        Ok(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::training::datasets;
    use tempfile::TempDir;

    fn quick_config() -> SimConfig {
        SimConfig {
            use_rand_phase_lengths: false,
            use_rand_burst_times: false,
            forward_steps: 40,
            target_steps: 40,
            forward_steps_test: 60,
            settle_steps: 20,
            seed: 13,
            ..Default::default()
        }
    }

    fn quick_trainer_config() -> TrainerConfig {
        TrainerConfig {
            epochs: 1,
            examples_per_epoch: Some(20),
            f_etas: vec![0.1, 0.1],
            b_etas: vec![0.0, 0.0],
            full_test_examples: 20,
            quick_test_examples: 10,
            quick_test_interval: 10,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_mismatched_learning_rates() {
        let net = Network::new(quick_config(), &[20, 10], 20).unwrap();
        let config = TrainerConfig {
            f_etas: vec![0.1],
            ..quick_trainer_config()
        };
        assert!(Trainer::new(net, config).is_err());
    }

    #[test]
    fn records_metrics_and_persists_artifacts() {
        let config = quick_config();
        let phi_max = config.derive().phi_max;
        let data = datasets::synthetic_digits(20, 40, 20, 5, phi_max);
        let net = Network::new(config, &[20, 10], 20).unwrap();
        let mut trainer = Trainer::new(net, quick_trainer_config()).unwrap();

        let dir = TempDir::new().unwrap();
        let run = RunDir::create(&dir.path().join("run"), false).unwrap();
        let summary = trainer.train(&data, Some(&run)).unwrap();

        assert_eq!(trainer.recorder().losses.len(), 20);
        assert_eq!(trainer.recorder().bp_angles.len(), 20);
        assert_eq!(trainer.recorder().training_labels.len(), 20);
        assert_eq!(trainer.recorder().training_errors.len(), 1);
        // Pre-training test plus one epoch boundary.
        assert_eq!(summary.full_test_errors.len(), 2);

        assert!(run.path().join("simulation.json").exists());
        assert!(run.path().join("initial_f_weights_0.bin").exists());
        assert!(run.path().join("epoch_0_f_weights_1.bin").exists());
        assert!(run.path().join("metrics.json").exists());
        assert!(run.path().join("full_test_errors.txt").exists());
    }
}
