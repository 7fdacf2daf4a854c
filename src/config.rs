//! Simulation configuration and derived constants.
//!
//! All tunable parameters live in a single immutable [`SimConfig`] that is
//! constructed once per run and passed by reference to every component.
//! Constants that follow from the configuration (steady-state gains,
//! error-scaling factors) are computed once into [`Derived`] rather than
//! being recomputed at use sites.

use serde::{Deserialize, Serialize};

use crate::{DendraError, Result};

/// Number of target classes (digits 0-9).
pub const CLASSES: usize = 10;

/// Peak spike rate per millisecond; the effective maximum rate per
/// timestep is `0.2 * dt`.
pub const MAX_RATE_PER_MS: f32 = 0.2;

/// Simulation parameters.
///
/// Defaults reproduce the standard configuration: conductance-based
/// somatic dynamics, spiking feedforward and feedback signalling,
/// broadcast feedback from the output layer, and optimized initial
/// weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Integration time step (ms).
    pub dt: f32,
    /// Length of the spike-history window used for PSP estimation
    /// (timesteps).
    pub memory_steps: usize,
    /// Timesteps at the start of each phase during which averages are
    /// not accumulated, letting potentials settle.
    pub settle_steps: usize,
    /// Forward-phase length during training (timesteps). Acts as the
    /// minimum length when phase lengths are drawn randomly.
    pub forward_steps: usize,
    /// Target-phase length during training (timesteps). Acts as the
    /// minimum length when phase lengths are drawn randomly.
    pub target_steps: usize,
    /// Forward-phase length used for test-time inference (timesteps).
    pub forward_steps_test: usize,

    /// Draw per-example phase lengths from a shifted Wald distribution.
    pub use_rand_phase_lengths: bool,
    /// Draw per-neuron plasticity (burst) times within the target phase.
    pub use_rand_burst_times: bool,
    /// Integrate somatic potentials with conductance dynamics instead of
    /// setting them to their algebraic steady state.
    pub use_conductances: bool,
    /// Feedback to every hidden layer comes from the output layer; when
    /// disabled, each hidden layer receives feedback from the layer
    /// directly above it.
    pub use_broadcast: bool,
    /// Feedback input arrives as spike trains filtered through the
    /// synaptic kernel; when disabled, raw rates are used.
    pub use_spiking_feedback: bool,
    /// Feedforward input arrives as spike trains filtered through the
    /// synaptic kernel; when disabled, raw rates are used.
    pub use_spiking_feedforward: bool,
    /// Tie feedback weights to the transpose of the forward weights.
    pub use_symmetric_weights: bool,
    /// Add Gaussian noise when tying symmetric feedback weights.
    pub noisy_symmetric_weights: bool,
    /// Zero out a fixed fraction of feedback weights at initialization
    /// and rescale the survivors.
    pub use_sparse_feedback: bool,
    /// Learn the feedback weights with a local inversion rule.
    pub update_backward_weights: bool,
    /// Replace the local error with the exact backpropagated error.
    pub use_backprop: bool,
    /// Couple the apical compartment to the soma with a small
    /// conductance.
    pub use_apical_conductance: bool,
    /// Solve for initial weight statistics that put somatic potentials
    /// in a target mean/variance regime.
    pub use_weight_optimization: bool,
    /// Record the angle between the local hidden-layer error and the
    /// exact backpropagated error.
    pub record_backprop_angle: bool,

    /// Synaptic rise time constant (ms).
    pub tau_s: f32,
    /// Leak / synaptic decay time constant (ms).
    pub tau_l: f32,
    /// Basal dendrite conductance.
    pub g_b: f32,
    /// Apical dendrite conductance (used only when
    /// `use_apical_conductance` is set).
    pub g_a: f32,
    /// Excitatory reversal potential for target injection.
    pub e_e: f32,
    /// Inhibitory reversal potential for target injection.
    pub e_i: f32,

    /// Fraction of feedback weights zeroed in sparse-feedback mode.
    pub sparse_drop_fraction: f32,
    /// Magnitude rescale applied to surviving sparse feedback weights.
    pub sparse_rescale: f32,
    /// Mean of the Wald distribution for random phase lengths.
    pub wald_mean: f32,
    /// Shape of the Wald distribution for random phase lengths.
    pub wald_shape: f32,

    /// Seed for every random draw in the simulation.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dt: 1.0,
            memory_steps: 10,
            settle_steps: 30,
            forward_steps: 50,
            target_steps: 50,
            forward_steps_test: 250,
            use_rand_phase_lengths: true,
            use_rand_burst_times: true,
            use_conductances: true,
            use_broadcast: true,
            use_spiking_feedback: true,
            use_spiking_feedforward: true,
            use_symmetric_weights: false,
            noisy_symmetric_weights: false,
            use_sparse_feedback: false,
            update_backward_weights: false,
            use_backprop: false,
            use_apical_conductance: false,
            use_weight_optimization: true,
            record_backprop_angle: true,
            tau_s: 3.0,
            tau_l: 10.0,
            g_b: 0.6,
            g_a: 0.05,
            e_e: 8.0,
            e_i: -8.0,
            sparse_drop_fraction: 0.8,
            sparse_rescale: 5.0,
            wald_mean: 2.0,
            wald_shape: 1.0,
            seed: 0,
        }
    }
}

impl SimConfig {
    /// Check the configuration for inconsistencies that would corrupt a
    /// run. Called before any computation; a bad configuration aborts
    /// construction.
    pub fn validate(&self) -> Result<()> {
        if self.dt <= 0.0 || !self.dt.is_finite() {
            return Err(DendraError::Config(format!(
                "time step must be positive, got {}",
                self.dt
            )));
        }
        if self.memory_steps == 0 {
            return Err(DendraError::Config(
                "spike memory window must hold at least one step".to_string(),
            ));
        }
        if self.tau_l <= 0.0 || self.tau_s <= 0.0 {
            return Err(DendraError::Config(
                "synaptic time constants must be positive".to_string(),
            ));
        }
        if (self.tau_l - self.tau_s).abs() < f32::EPSILON {
            return Err(DendraError::Config(
                "kernel is undefined when tau_l equals tau_s".to_string(),
            ));
        }
        let min_phase = self
            .forward_steps
            .min(self.target_steps)
            .min(self.forward_steps_test);
        if self.settle_steps >= min_phase {
            return Err(DendraError::Config(format!(
                "settle interval ({} steps) must be shorter than every phase (min {} steps)",
                self.settle_steps, min_phase
            )));
        }
        if !(0.0..1.0).contains(&self.sparse_drop_fraction) {
            return Err(DendraError::Config(format!(
                "sparse drop fraction must be in [0, 1), got {}",
                self.sparse_drop_fraction
            )));
        }
        if self.wald_mean <= 0.0 || self.wald_shape <= 0.0 {
            return Err(DendraError::Config(
                "Wald distribution parameters must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Compute the constants derived from this configuration.
    pub fn derive(&self) -> Derived {
        let phi_max = MAX_RATE_PER_MS * self.dt;
        let g_l = 1.0 / self.tau_l;
        let g_d = self.g_b;
        let g_a = if self.use_apical_conductance {
            self.g_a
        } else {
            0.0
        };
        Derived {
            phi_max,
            g_l,
            g_b: self.g_b,
            g_a,
            g_d,
            k_b: self.g_b / (g_l + self.g_b + g_a),
            k_d: g_d / (g_l + g_d),
            k_i: 1.0 / (g_l + g_d),
            p_hidden: 20.0 / phi_max,
            p_final: 20.0 / (phi_max * phi_max),
        }
    }
}

/// Constants computed once from a [`SimConfig`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Derived {
    /// Maximum spike rate per timestep.
    pub phi_max: f32,
    /// Leak conductance.
    pub g_l: f32,
    /// Basal dendrite conductance.
    pub g_b: f32,
    /// Effective apical conductance (zero unless enabled).
    pub g_a: f32,
    /// Dendritic conductance of the output layer.
    pub g_d: f32,
    /// Steady-state basal gain of hidden somata.
    pub k_b: f32,
    /// Steady-state dendritic gain of output somata.
    pub k_d: f32,
    /// Steady-state injected-current gain of output somata.
    pub k_i: f32,
    /// Error-signal scaling for hidden layers.
    pub p_hidden: f32,
    /// Error-signal scaling for the output layer.
    pub p_final: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn derived_constants_match_closed_forms() {
        let config = SimConfig::default();
        let d = config.derive();

        assert!((d.phi_max - 0.2).abs() < 1e-6);
        assert!((d.g_l - 0.1).abs() < 1e-6);
        // k_B = g_B / (g_L + g_B) with the apical conductance disabled
        assert!((d.k_b - 0.6 / 0.7).abs() < 1e-6);
        assert!((d.k_d - 0.6 / 0.7).abs() < 1e-6);
        assert!((d.k_i - 1.0 / 0.7).abs() < 1e-6);
        assert!((d.p_hidden - 100.0).abs() < 1e-3);
        assert!((d.p_final - 500.0).abs() < 1e-2);
    }

    #[test]
    fn apical_conductance_changes_basal_gain() {
        let config = SimConfig {
            use_apical_conductance: true,
            ..Default::default()
        };
        let d = config.derive();
        assert!((d.g_a - 0.05).abs() < 1e-6);
        assert!((d.k_b - 0.6 / 0.75).abs() < 1e-6);
    }

    #[test]
    fn rejects_degenerate_kernel() {
        let config = SimConfig {
            tau_s: 5.0,
            tau_l: 5.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_settle_longer_than_phase() {
        let config = SimConfig {
            settle_steps: 50,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_memory_window() {
        let config = SimConfig {
            memory_steps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
