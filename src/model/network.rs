//! Network orchestrator.
//!
//! Owns the layer stack, the weight tensors, and the input spike history,
//! and drives the two-phase simulation: every timestep pushes a fresh
//! Poisson sample of the input, propagates the layers bottom-up, and
//! accumulates post-settle averages; at the end of each target phase the
//! per-layer plasticity rule updates the weights exactly once.

use std::path::Path;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{Derived, SimConfig, CLASSES};
use crate::model::dynamics;
use crate::model::init::{self, Weights};
use crate::model::kernel::SynapticKernel;
use crate::model::layer::{outer, HiddenLayer, OutputLayer, Phase, SynapticInput};
use crate::model::phase::{self, PhasePlan};
use crate::model::spikes::{self, SpikeHistory};
use crate::utils::persist;
use crate::{DendraError, Result};

/// Seed offset separating evaluation randomness from training
/// randomness, so interleaved tests never perturb the training
/// trajectory.
const EVAL_SEED_OFFSET: u64 = 0x5eed_0f0f;

/// Per-example results handed back to the training loop.
#[derive(Debug, Clone, Copy)]
pub struct ExampleOutcome {
    /// Squared rate discrepancy at the output layer.
    pub loss: f32,
    /// Class predicted from the forward-phase somatic averages.
    pub predicted: usize,
    /// Angle (degrees) between the local and backpropagated errors of
    /// the first hidden layer, when recorded.
    pub bp_angle: Option<f32>,
}

/// A stack of hidden layers topped by an output layer, with shared
/// ownership of all weight tensors.
pub struct Network {
    config: SimConfig,
    derived: Derived,
    kernel: SynapticKernel,
    sizes: Vec<usize>,
    input_size: usize,
    per_class: usize,

    weights: Weights,
    hidden: Vec<HiddenLayer>,
    output: OutputLayer,

    input_rates: Array1<f32>,
    input_history: SpikeHistory,
    target: Array1<f32>,

    rng: StdRng,
}

impl Network {
    /// Build a network with the given hidden/output layer sizes. The
    /// final entry of `sizes` is the output layer and must split evenly
    /// into the ten digit classes.
    pub fn new(config: SimConfig, sizes: &[usize], input_size: usize) -> Result<Self> {
        config.validate()?;
        if sizes.is_empty() {
            return Err(DendraError::Config(
                "network needs at least an output layer".to_string(),
            ));
        }
        if input_size == 0 {
            return Err(DendraError::Config("input size must be positive".to_string()));
        }
        let output_size = sizes[sizes.len() - 1];
        if output_size % CLASSES != 0 {
            return Err(DendraError::Config(format!(
                "output size {} must divide evenly into {} classes",
                output_size, CLASSES
            )));
        }

        let derived = config.derive();
        let kernel = SynapticKernel::new(&config)?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        log::info!(
            "creating network: input {} -> {:?}, {} per class",
            input_size,
            sizes,
            output_size / CLASSES
        );

        let weights = init::initialize(&config, &derived, sizes, input_size, &mut rng)?;
        for m in 0..sizes.len() {
            log::debug!(
                "layer {}: {} units, W {:?}, Y {:?}",
                m,
                sizes[m],
                weights.w[m].dim(),
                weights.y[m].dim()
            );
        }

        let depth = sizes.len();
        let mut hidden = Vec::with_capacity(depth - 1);
        for m in 0..depth - 1 {
            let f_input = if m == 0 { input_size } else { sizes[m - 1] };
            let b_input = if config.use_broadcast {
                output_size
            } else {
                sizes[m + 1]
            };
            hidden.push(HiddenLayer::new(
                sizes[m],
                f_input,
                b_input,
                config.memory_steps,
            ));
        }
        let output_f_input = if depth == 1 {
            input_size
        } else {
            sizes[depth - 2]
        };
        let output = OutputLayer::new(output_size, output_f_input, config.memory_steps);

        Ok(Self {
            input_history: SpikeHistory::new(input_size, config.memory_steps),
            input_rates: Array1::zeros(input_size),
            target: Array1::zeros(output_size),
            per_class: output_size / CLASSES,
            sizes: sizes.to_vec(),
            input_size,
            weights,
            hidden,
            output,
            kernel,
            derived,
            config,
            rng,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn derived(&self) -> &Derived {
        &self.derived
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn depth(&self) -> usize {
        self.sizes.len()
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn hidden_layers(&self) -> &[HiddenLayer] {
        &self.hidden
    }

    pub fn output_layer(&self) -> &OutputLayer {
        &self.output
    }

    /// Install the rate vector for the current example. Rates are
    /// clamped to non-negative before any sampling.
    fn set_example(&mut self, x: &Array1<f32>) -> Result<()> {
        if x.len() != self.input_size {
            return Err(DendraError::Shape(format!(
                "input has {} features, network expects {}",
                x.len(),
                self.input_size
            )));
        }
        // f32::max silently discards NaN, so finiteness is checked first.
        if x.iter().any(|v| !v.is_finite()) {
            return Err(DendraError::Numerical(
                "non-finite input rate".to_string(),
            ));
        }
        self.input_rates = x.mapv(|v| v.max(0.0));
        Ok(())
    }

    /// Spread a one-hot class target over each class's group of output
    /// neurons.
    fn expand_target(&self, t: &Array1<f32>) -> Result<Array1<f32>> {
        if t.len() != CLASSES {
            return Err(DendraError::Shape(format!(
                "target has {} entries, expected {}",
                t.len(),
                CLASSES
            )));
        }
        Ok(Array1::from_shape_fn(self.output.size, |j| {
            t[j / self.per_class]
        }))
    }

    /// Advance the whole network one timestep in topological order.
    fn advance(&mut self, phase: Phase, accumulate: bool) -> Result<()> {
        // Fresh Poisson sample of the external input.
        let counts = spikes::sample_counts(&self.input_rates, &mut self.rng)?;
        self.input_history.push(&counts);

        let depth = self.sizes.len();
        for m in 0..depth - 1 {
            let (below, rest) = self.hidden.split_at_mut(m);
            let (layer, above) = rest.split_first_mut().expect("layer index in range");

            let f_input = if m == 0 {
                if self.config.use_spiking_feedforward {
                    SynapticInput::Spikes(&self.input_history)
                } else {
                    SynapticInput::Rates(&self.input_rates)
                }
            } else {
                let prev = below.last().expect("previous layer exists");
                if self.config.use_spiking_feedforward {
                    SynapticInput::Spikes(&prev.spikes)
                } else {
                    SynapticInput::Rates(&prev.rate)
                }
            };

            let b_input = if self.config.use_broadcast || m == depth - 2 {
                if self.config.use_spiking_feedback {
                    SynapticInput::Spikes(&self.output.spikes)
                } else {
                    SynapticInput::Rates(&self.output.rate)
                }
            } else {
                let next = above.first().expect("layer above exists");
                if self.config.use_spiking_feedback {
                    SynapticInput::Spikes(&next.spikes)
                } else {
                    SynapticInput::Rates(&next.rate)
                }
            };

            layer.step(
                &self.config,
                &self.derived,
                &self.kernel,
                &self.weights.w[m],
                &self.weights.b[m],
                &self.weights.y[m],
                &self.weights.c[m],
                f_input,
                b_input,
                &mut self.rng,
            )?;
            if accumulate {
                layer.accumulate();
            }
        }

        let f_input = if depth == 1 {
            if self.config.use_spiking_feedforward {
                SynapticInput::Spikes(&self.input_history)
            } else {
                SynapticInput::Rates(&self.input_rates)
            }
        } else {
            let prev = self.hidden.last().expect("hidden layer exists");
            if self.config.use_spiking_feedforward {
                SynapticInput::Spikes(&prev.spikes)
            } else {
                SynapticInput::Rates(&prev.rate)
            }
        };
        let target = match phase {
            Phase::Forward => None,
            Phase::Target => Some(&self.target),
        };
        self.output.step(
            &self.config,
            &self.derived,
            &self.kernel,
            &self.weights.w[depth - 1],
            &self.weights.b[depth - 1],
            f_input,
            target,
            &mut self.rng,
        )?;
        if accumulate {
            self.output.accumulate();
        }
        Ok(())
    }

    fn finalize_phase(&mut self, phase: Phase) {
        for layer in &mut self.hidden {
            layer.finalize(phase);
        }
        self.output.finalize(phase);
    }

    /// Run a forward phase of the given length and finalize its
    /// averages.
    fn run_forward_phase(&mut self, steps: usize) -> Result<()> {
        for step in 0..steps {
            let accumulate = step >= self.config.settle_steps;
            self.advance(Phase::Forward, accumulate)?;
        }
        self.finalize_phase(Phase::Forward);
        Ok(())
    }

    /// Run a target phase, sampling per-neuron burst statistics at the
    /// drawn burst steps.
    fn run_target_phase(&mut self, steps: usize, bursts: &[Vec<usize>]) -> Result<()> {
        let depth = self.sizes.len();
        for step in 0..steps {
            let accumulate = step >= self.config.settle_steps;
            self.advance(Phase::Target, accumulate)?;
            for (m, layer) in self.hidden.iter_mut().enumerate() {
                layer.snapshot_bursts(step, &bursts[m]);
            }
            self.output.snapshot_bursts(step, &bursts[depth - 1]);
        }
        self.finalize_phase(Phase::Target);
        Ok(())
    }

    /// Class with the highest group-pooled forward-phase somatic
    /// average.
    pub fn classify(&self) -> usize {
        let mut best = 0;
        let mut best_mean = f32::NEG_INFINITY;
        for class in 0..CLASSES {
            let group = self
                .output
                .avg_soma_f
                .slice(ndarray::s![class * self.per_class..(class + 1) * self.per_class]);
            let mean = group.mean().unwrap_or(f32::NEG_INFINITY);
            if mean > best_mean {
                best_mean = mean;
                best = class;
            }
        }
        best
    }

    /// Apply the phase-end weight updates, top layer first so lower
    /// layers backpropagate through the just-updated weights above them.
    fn apply_updates(&mut self, f_etas: &[f32], b_etas: &[f32]) -> Result<Option<f32>> {
        let depth = self.sizes.len();
        let d = self.derived;

        let e_out = self.output.error(&d);
        apply_delta(
            &mut self.weights.w[depth - 1],
            &mut self.weights.b[depth - 1],
            &e_out,
            &self.output.avg_psp_basal_f,
            f_etas[depth - 1] * d.p_final,
        );

        let mut bp_angle = None;
        let mut e_above = e_out;
        let needs_bp = self.config.use_backprop || self.config.record_backprop_angle;

        for m in (0..depth - 1).rev() {
            let layer = &self.hidden[m];
            let e_bp = if needs_bp {
                Some(layer.backprop_error(&d, &self.weights.w[m + 1], &e_above))
            } else {
                None
            };
            let e_local = if self.config.use_backprop {
                e_bp.clone().expect("backprop error computed")
            } else {
                layer.local_error(&d)
            };

            if m == 0 && self.config.record_backprop_angle && depth > 1 {
                if let Some(ref bp) = e_bp {
                    bp_angle = Some(angle_degrees(bp, &e_local));
                }
            }

            apply_delta(
                &mut self.weights.w[m],
                &mut self.weights.b[m],
                &e_local,
                &layer.avg_psp_basal_f,
                f_etas[m] * d.p_hidden,
            );

            if self.config.update_backward_weights {
                let e_inv = layer.feedback_error(&d);
                let delta_y = outer(&e_inv, &layer.avg_psp_apical_f);
                self.weights.y[m].scaled_add(-b_etas[m], &delta_y);
                if self.config.use_sparse_feedback {
                    init::reapply_dropout(&mut self.weights.y[m], &self.weights.y_dropout[m]);
                }
            }

            e_above = e_bp.unwrap_or(e_local);
        }

        if self.config.use_symmetric_weights {
            init::make_symmetric(&self.config, &mut self.weights, &mut self.rng);
            if self.config.use_sparse_feedback {
                for m in 0..depth - 1 {
                    init::sparsify(&self.config, &mut self.weights.y[m], &self.weights.y_dropout[m]);
                }
            }
        }

        Ok(bp_angle)
    }

    fn reset_averages(&mut self) {
        for layer in &mut self.hidden {
            layer.reset_averages();
        }
        self.output.reset_averages();
    }

    /// Present one training example: forward phase, target phase, one
    /// weight update, average reset.
    pub fn train_example(
        &mut self,
        x: &Array1<f32>,
        t: &Array1<f32>,
        f_etas: &[f32],
        b_etas: &[f32],
    ) -> Result<ExampleOutcome> {
        let depth = self.sizes.len();
        if f_etas.len() != depth || b_etas.len() != depth {
            return Err(DendraError::Config(format!(
                "expected {} learning rates per pathway, got {} forward / {} backward",
                depth,
                f_etas.len(),
                b_etas.len()
            )));
        }

        self.set_example(x)?;
        let PhasePlan {
            forward_steps,
            target_steps,
        } = phase::draw_plan(&self.config, &mut self.rng)?;

        self.run_forward_phase(forward_steps)?;
        let predicted = self.classify();

        let mut bursts = Vec::with_capacity(depth);
        for m in 0..depth {
            let steps =
                phase::draw_burst_steps(&self.config, self.sizes[m], target_steps, &mut self.rng);
            bursts.push(steps);
        }

        self.target = self.expand_target(t)?;
        self.run_target_phase(target_steps, &bursts)?;

        let forward_rate = dynamics::spike_rate(&self.output.avg_soma_f, self.derived.phi_max);
        let loss = (&self.output.avg_rate_t - &forward_rate)
            .mapv(|v| v * v)
            .mean()
            .unwrap_or(0.0);

        let bp_angle = self.apply_updates(f_etas, b_etas)?;
        self.reset_averages();

        Ok(ExampleOutcome {
            loss,
            predicted,
            bp_angle,
        })
    }

    /// Zero every per-neuron transient: potentials, spike histories,
    /// sums, and averages. Weights are untouched.
    pub fn clear_transient(&mut self) {
        for layer in &mut self.hidden {
            layer.clear_state();
        }
        self.output.clear_state();
        self.input_history.clear();
    }

    /// Forward-phase somatic averages for a single input, using the
    /// test-time phase length and evaluation randomness.
    pub fn infer(&mut self, x: &Array1<f32>) -> Result<Array1<f32>> {
        let saved = self.rng.clone();
        self.rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(EVAL_SEED_OFFSET));
        let result = self.infer_inner(x);
        self.rng = saved;
        result
    }

    fn infer_inner(&mut self, x: &Array1<f32>) -> Result<Array1<f32>> {
        self.clear_transient();
        self.set_example(x)?;
        self.run_forward_phase(self.config.forward_steps_test)?;
        let averages = self.output.avg_soma_f.clone();
        self.clear_transient();
        Ok(averages)
    }

    /// Percent misclassification over (up to) `n_examples` held-out
    /// examples.
    ///
    /// Evaluation is inference-only: weights are never written, every
    /// per-neuron transient is reset around each example, and a
    /// dedicated RNG reseeded per call makes repeated evaluations
    /// reproduce each other exactly.
    pub fn evaluate(
        &mut self,
        inputs: &Array2<f32>,
        targets: &Array2<f32>,
        n_examples: usize,
    ) -> Result<f32> {
        if inputs.nrows() != self.input_size {
            return Err(DendraError::Shape(format!(
                "test inputs have {} features, network expects {}",
                inputs.nrows(),
                self.input_size
            )));
        }
        if targets.nrows() != CLASSES || targets.ncols() != inputs.ncols() {
            return Err(DendraError::Shape(format!(
                "test targets {}x{} do not match {} examples",
                targets.nrows(),
                targets.ncols(),
                inputs.ncols()
            )));
        }

        let saved = self.rng.clone();
        self.rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(EVAL_SEED_OFFSET));
        let result = self.evaluate_inner(inputs, targets, n_examples);
        self.rng = saved;
        result
    }

    fn evaluate_inner(
        &mut self,
        inputs: &Array2<f32>,
        targets: &Array2<f32>,
        n_examples: usize,
    ) -> Result<f32> {
        let n = n_examples.min(inputs.ncols());
        if n == 0 {
            return Err(DendraError::Data(
                "evaluation requires at least one example".to_string(),
            ));
        }

        let mut order: Vec<usize> = (0..inputs.ncols()).collect();
        order.shuffle(&mut self.rng);

        let mut correct = 0;
        for (seen, &j) in order.iter().take(n).enumerate() {
            self.clear_transient();
            let x = inputs.column(j).to_owned();
            self.set_example(&x)?;
            self.run_forward_phase(self.config.forward_steps_test)?;

            let predicted = self.classify();
            let label = argmax(&targets.column(j).to_owned());
            if predicted == label {
                correct += 1;
            }

            if (seen + 1) % 100 == 0 {
                log::debug!(
                    "testing example {}/{}, error {:.2}%",
                    seen + 1,
                    n,
                    (1.0 - correct as f32 / (seen + 1) as f32) * 100.0
                );
            }
        }
        self.clear_transient();

        Ok((1.0 - correct as f32 / n as f32) * 100.0)
    }

    /// Write every weight tensor into `dir`, one file per tensor.
    pub fn save_weights(&self, dir: &Path, prefix: &str) -> Result<()> {
        for m in 0..self.sizes.len() {
            persist::write_matrix(&dir.join(format!("{}f_weights_{}.bin", prefix, m)), &self.weights.w[m])?;
            persist::write_vector(&dir.join(format!("{}f_bias_{}.bin", prefix, m)), &self.weights.b[m])?;
            persist::write_matrix(&dir.join(format!("{}b_weights_{}.bin", prefix, m)), &self.weights.y[m])?;
            persist::write_vector(&dir.join(format!("{}b_bias_{}.bin", prefix, m)), &self.weights.c[m])?;
        }
        Ok(())
    }

    /// Load weight tensors saved by [`Network::save_weights`] into a
    /// network of identical topology.
    pub fn load_weights(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        log::info!("loading weights from {:?} with prefix {:?}", dir, prefix);
        for m in 0..self.sizes.len() {
            let w = persist::read_matrix(&dir.join(format!("{}f_weights_{}.bin", prefix, m)))?;
            let b = persist::read_vector(&dir.join(format!("{}f_bias_{}.bin", prefix, m)))?;
            let y = persist::read_matrix(&dir.join(format!("{}b_weights_{}.bin", prefix, m)))?;
            let c = persist::read_vector(&dir.join(format!("{}b_bias_{}.bin", prefix, m)))?;

            if w.dim() != self.weights.w[m].dim() || y.dim() != self.weights.y[m].dim() {
                return Err(DendraError::Shape(format!(
                    "saved weights for layer {} have shape {:?}/{:?}, expected {:?}/{:?}",
                    m,
                    w.dim(),
                    y.dim(),
                    self.weights.w[m].dim(),
                    self.weights.y[m].dim()
                )));
            }
            self.weights.w[m] = w;
            self.weights.b[m] = b;
            self.weights.y[m] = y;
            self.weights.c[m] = c;
        }
        Ok(())
    }
}

/// `W -= step * (E ⊗ PSP)`, `b -= step * E`.
fn apply_delta(
    w: &mut Array2<f32>,
    b: &mut Array1<f32>,
    e: &Array1<f32>,
    psp_avg: &Array1<f32>,
    step: f32,
) {
    let delta_w = outer(e, psp_avg);
    w.scaled_add(-step, &delta_w);
    b.scaled_add(-step, e);
}

fn angle_degrees(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.mapv(|v| v * v).sum().sqrt();
    let norm_b = b.mapv(|v| v * v).sum().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 90.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0).acos().to_degrees()
}

fn argmax(v: &Array1<f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &val) in v.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best = i;
        }
    }
    best
}
