//! Synaptic filter kernel.
//!
//! Spike counts are converted into postsynaptic-potential (PSP) estimates
//! by convolving the bounded spike history with a causal double-exponential
//! kernel. The kernel is evaluated once at startup and never changes.

use ndarray::Array1;

use crate::config::SimConfig;
use crate::model::spikes::SpikeHistory;
use crate::{DendraError, Result};

/// Causal double-exponential synaptic kernel.
///
/// `weights[i]` holds the kernel evaluated at lag `i + 1`, so the most
/// recent spike column contributes `kappa(1)` and the oldest contributes
/// `kappa(memory_steps)`.
#[derive(Debug, Clone)]
pub struct SynapticKernel {
    weights: Array1<f32>,
}

/// Kernel value at lag `x`:
/// `(e^{-x/tau_l} - e^{-x/tau_s}) / (tau_l - tau_s)`.
fn kappa(x: f32, tau_l: f32, tau_s: f32) -> f32 {
    ((-x / tau_l).exp() - (-x / tau_s).exp()) / (tau_l - tau_s)
}

impl SynapticKernel {
    /// Evaluate the kernel for a configured memory window.
    pub fn new(config: &SimConfig) -> Result<Self> {
        Self::with_params(config.memory_steps, config.tau_l, config.tau_s)
    }

    /// Evaluate the kernel at lags `1..=memory_steps`.
    pub fn with_params(memory_steps: usize, tau_l: f32, tau_s: f32) -> Result<Self> {
        if memory_steps == 0 {
            return Err(DendraError::Config(
                "kernel needs a memory window of at least one step".to_string(),
            ));
        }
        if (tau_l - tau_s).abs() < f32::EPSILON {
            return Err(DendraError::Config(
                "kernel is undefined when tau_l equals tau_s".to_string(),
            ));
        }
        let weights = Array1::from_shape_fn(memory_steps, |i| kappa((i + 1) as f32, tau_l, tau_s));
        Ok(Self { weights })
    }

    /// Number of lags covered by the kernel.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Kernel weights indexed by lag minus one.
    pub fn weights(&self) -> &Array1<f32> {
        &self.weights
    }

    /// PSP estimate: inner product of the time-reversed kernel with the
    /// spike history of each neuron.
    pub fn psp(&self, history: &SpikeHistory) -> Array1<f32> {
        debug_assert_eq!(history.window(), self.len());
        let mut psp = Array1::zeros(history.neurons());
        for lag in 1..=self.len() {
            psp.scaled_add(self.weights[lag - 1], &history.column_at_lag(lag));
        }
        psp
    }
}
