//! Hidden and output layers.
//!
//! A hidden layer integrates feedforward drive in its basal compartment
//! and feedback drive in its apical compartment; the output layer replaces
//! the apical compartment with a target-driven somatic current. Both keep
//! running per-phase sums of their potentials, rates, and PSP inputs over
//! the post-settle portion of each phase, and turn them into phase
//! averages for the plasticity rule.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;

use crate::config::{Derived, SimConfig};
use crate::model::dynamics;
use crate::model::kernel::SynapticKernel;
use crate::model::spikes::{self, SpikeHistory};
use crate::{DendraError, Result};

/// Which phase a timestep belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Target,
}

/// Synaptic input to a layer: either a spike history to be filtered
/// through the kernel, or a raw rate vector that bypasses it.
pub enum SynapticInput<'a> {
    Spikes(&'a SpikeHistory),
    Rates(&'a Array1<f32>),
}

impl SynapticInput<'_> {
    fn psp(&self, kernel: &SynapticKernel) -> Array1<f32> {
        match self {
            SynapticInput::Spikes(history) => kernel.psp(history),
            SynapticInput::Rates(rates) => (*rates).clone(),
        }
    }
}

/// Outer product of an error signal with a presynaptic PSP average.
pub(crate) fn outer(e: &Array1<f32>, psp: &Array1<f32>) -> Array2<f32> {
    let e2 = e.view().insert_axis(Axis(1));
    let p2 = psp.view().insert_axis(Axis(0));
    e2.dot(&p2)
}

fn check_finite(potentials: &Array1<f32>, what: &str) -> Result<()> {
    if potentials.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DendraError::Numerical(format!(
            "non-finite {} potential",
            what
        )))
    }
}

/// Hidden layer: basal + apical dendritic compartments feeding a soma.
#[derive(Debug, Clone)]
pub struct HiddenLayer {
    pub size: usize,
    pub f_input_size: usize,
    pub b_input_size: usize,

    // instantaneous state
    pub basal: Array1<f32>,
    pub apical: Array1<f32>,
    pub soma: Array1<f32>,
    pub rate: Array1<f32>,
    pub spikes: SpikeHistory,
    psp_basal: Array1<f32>,
    psp_apical: Array1<f32>,

    // post-settle running sums for the current phase
    sum_soma: Array1<f32>,
    sum_apical: Array1<f32>,
    sum_rate: Array1<f32>,
    sum_psp_basal: Array1<f32>,
    sum_psp_apical: Array1<f32>,
    sum_steps: usize,

    // finalized phase averages
    pub avg_soma_f: Array1<f32>,
    pub avg_soma_t: Array1<f32>,
    pub avg_apical_f: Array1<f32>,
    pub avg_apical_t: Array1<f32>,
    pub avg_rate_f: Array1<f32>,
    pub avg_psp_basal_f: Array1<f32>,
    pub avg_psp_basal_t: Array1<f32>,
    pub avg_psp_apical_f: Array1<f32>,
    pub avg_psp_apical_t: Array1<f32>,

    /// Steps averaged in the most recent finalized phase.
    pub last_window: usize,

    // per-neuron target-phase apical statistic sampled at burst time
    burst_apical: Array1<f32>,
    burst_taken: Vec<bool>,
}

impl HiddenLayer {
    pub fn new(size: usize, f_input_size: usize, b_input_size: usize, window: usize) -> Self {
        Self {
            size,
            f_input_size,
            b_input_size,
            basal: Array1::zeros(size),
            apical: Array1::zeros(size),
            soma: Array1::zeros(size),
            rate: Array1::zeros(size),
            spikes: SpikeHistory::new(size, window),
            psp_basal: Array1::zeros(f_input_size),
            psp_apical: Array1::zeros(b_input_size),
            sum_soma: Array1::zeros(size),
            sum_apical: Array1::zeros(size),
            sum_rate: Array1::zeros(size),
            sum_psp_basal: Array1::zeros(f_input_size),
            sum_psp_apical: Array1::zeros(b_input_size),
            sum_steps: 0,
            avg_soma_f: Array1::zeros(size),
            avg_soma_t: Array1::zeros(size),
            avg_apical_f: Array1::zeros(size),
            avg_apical_t: Array1::zeros(size),
            avg_rate_f: Array1::zeros(size),
            avg_psp_basal_f: Array1::zeros(f_input_size),
            avg_psp_basal_t: Array1::zeros(f_input_size),
            avg_psp_apical_f: Array1::zeros(b_input_size),
            avg_psp_apical_t: Array1::zeros(b_input_size),
            last_window: 0,
            burst_apical: Array1::zeros(size),
            burst_taken: vec![false; size],
        }
    }

    /// Advance one timestep: update both dendritic compartments, the
    /// soma, the rate, and emit spikes.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        config: &SimConfig,
        d: &Derived,
        kernel: &SynapticKernel,
        w: &Array2<f32>,
        b: &Array1<f32>,
        y: &Array2<f32>,
        c: &Array1<f32>,
        f_input: SynapticInput<'_>,
        b_input: SynapticInput<'_>,
        rng: &mut StdRng,
    ) -> Result<()> {
        self.psp_basal = f_input.psp(kernel);
        self.basal = dynamics::dendritic_potential(w, &self.psp_basal, b);

        self.psp_apical = b_input.psp(kernel);
        self.apical = dynamics::dendritic_potential(y, &self.psp_apical, c);

        if config.use_conductances {
            dynamics::hidden_soma_step(&mut self.soma, &self.basal, &self.apical, d, config.dt);
        } else {
            self.soma = self.basal.mapv(|v| d.k_b * v);
        }
        check_finite(&self.soma, "hidden somatic")?;

        self.rate = dynamics::spike_rate(&self.soma, d.phi_max);
        spikes::fire(&mut self.spikes, &self.rate, rng)
    }

    /// Add the current state into the post-settle running sums.
    pub fn accumulate(&mut self) {
        self.sum_soma += &self.soma;
        self.sum_apical += &self.apical;
        self.sum_rate += &self.rate;
        self.sum_psp_basal += &self.psp_basal;
        self.sum_psp_apical += &self.psp_apical;
        self.sum_steps += 1;
    }

    /// Sample the target-phase apical statistic for neurons whose burst
    /// time is the current step.
    pub fn snapshot_bursts(&mut self, step: usize, burst_steps: &[usize]) {
        if self.sum_steps == 0 {
            return;
        }
        let inv = 1.0 / self.sum_steps as f32;
        for (i, &burst) in burst_steps.iter().enumerate() {
            if burst == step {
                self.burst_apical[i] = self.sum_apical[i] * inv;
                self.burst_taken[i] = true;
            }
        }
    }

    /// Convert the running sums into the phase averages and zero the
    /// sums for the next phase.
    pub fn finalize(&mut self, phase: Phase) {
        debug_assert!(self.sum_steps > 0, "phase ended before the settle interval");
        let inv = 1.0 / self.sum_steps.max(1) as f32;
        match phase {
            Phase::Forward => {
                self.avg_soma_f = &self.sum_soma * inv;
                self.avg_apical_f = &self.sum_apical * inv;
                self.avg_rate_f = &self.sum_rate * inv;
                self.avg_psp_basal_f = &self.sum_psp_basal * inv;
                self.avg_psp_apical_f = &self.sum_psp_apical * inv;
            }
            Phase::Target => {
                self.avg_soma_t = &self.sum_soma * inv;
                self.avg_apical_t = &self.sum_apical * inv;
                self.avg_psp_basal_t = &self.sum_psp_basal * inv;
                self.avg_psp_apical_t = &self.sum_psp_apical * inv;
                // Neurons without a sampled burst statistic use the full
                // phase average.
                for i in 0..self.size {
                    if !self.burst_taken[i] {
                        self.burst_apical[i] = self.avg_apical_t[i];
                    }
                }
            }
        }
        self.last_window = self.sum_steps;
        self.reset_sums();
    }

    /// Local error from the apical discrepancy between phases.
    pub fn local_error(&self, d: &Derived) -> Array1<f32> {
        let target = dynamics::apical_sigmoid(&self.burst_apical);
        let forward = dynamics::apical_sigmoid(&self.avg_apical_f);
        let deriv = dynamics::spike_rate_deriv(&self.avg_soma_f, d.phi_max);
        (target - forward) * -d.k_b * deriv
    }

    /// Exact backpropagated error from the layer above.
    pub fn backprop_error(
        &self,
        d: &Derived,
        w_above: &Array2<f32>,
        e_above: &Array1<f32>,
    ) -> Array1<f32> {
        let deriv = dynamics::spike_rate_deriv(&self.avg_soma_f, d.phi_max);
        w_above.t().dot(e_above) * d.k_b * deriv
    }

    /// Error driving the feedback weights toward an inverse of the
    /// forward pathway.
    pub fn feedback_error(&self, d: &Derived) -> Array1<f32> {
        let soma_rate = dynamics::spike_rate(&self.avg_soma_f, d.phi_max);
        let apical_rate = dynamics::spike_rate(&self.avg_apical_f, d.phi_max);
        let deriv = dynamics::spike_rate_deriv(&self.avg_apical_f, d.phi_max);
        (soma_rate - apical_rate) * -1.0 * deriv
    }

    /// Zero the finalized averages and burst statistics after a weight
    /// update.
    pub fn reset_averages(&mut self) {
        self.avg_soma_f.fill(0.0);
        self.avg_soma_t.fill(0.0);
        self.avg_apical_f.fill(0.0);
        self.avg_apical_t.fill(0.0);
        self.avg_rate_f.fill(0.0);
        self.avg_psp_basal_f.fill(0.0);
        self.avg_psp_basal_t.fill(0.0);
        self.avg_psp_apical_f.fill(0.0);
        self.avg_psp_apical_t.fill(0.0);
        self.burst_apical.fill(0.0);
        self.burst_taken.fill(false);
    }

    fn reset_sums(&mut self) {
        self.sum_soma.fill(0.0);
        self.sum_apical.fill(0.0);
        self.sum_rate.fill(0.0);
        self.sum_psp_basal.fill(0.0);
        self.sum_psp_apical.fill(0.0);
        self.sum_steps = 0;
    }

    /// Zero every per-neuron variable, e.g. between test examples.
    pub fn clear_state(&mut self) {
        self.basal.fill(0.0);
        self.apical.fill(0.0);
        self.soma.fill(0.0);
        self.rate.fill(0.0);
        self.spikes.clear();
        self.psp_basal.fill(0.0);
        self.psp_apical.fill(0.0);
        self.reset_sums();
        self.reset_averages();
        self.last_window = 0;
    }

    #[cfg(test)]
    pub(crate) fn sum_steps(&self) -> usize {
        self.sum_steps
    }
}

/// Output layer: basal dendritic compartment plus a target-driven
/// somatic current.
#[derive(Debug, Clone)]
pub struct OutputLayer {
    pub size: usize,
    pub f_input_size: usize,

    pub basal: Array1<f32>,
    pub current: Array1<f32>,
    pub soma: Array1<f32>,
    pub rate: Array1<f32>,
    pub spikes: SpikeHistory,
    psp_basal: Array1<f32>,

    sum_soma: Array1<f32>,
    sum_rate: Array1<f32>,
    sum_psp_basal: Array1<f32>,
    sum_steps: usize,

    pub avg_soma_f: Array1<f32>,
    pub avg_soma_t: Array1<f32>,
    pub avg_rate_f: Array1<f32>,
    pub avg_rate_t: Array1<f32>,
    pub avg_psp_basal_f: Array1<f32>,
    pub avg_psp_basal_t: Array1<f32>,

    /// Steps averaged in the most recent finalized phase.
    pub last_window: usize,

    burst_rate: Array1<f32>,
    burst_taken: Vec<bool>,
}

impl OutputLayer {
    pub fn new(size: usize, f_input_size: usize, window: usize) -> Self {
        Self {
            size,
            f_input_size,
            basal: Array1::zeros(size),
            current: Array1::zeros(size),
            soma: Array1::zeros(size),
            rate: Array1::zeros(size),
            spikes: SpikeHistory::new(size, window),
            psp_basal: Array1::zeros(f_input_size),
            sum_soma: Array1::zeros(size),
            sum_rate: Array1::zeros(size),
            sum_psp_basal: Array1::zeros(f_input_size),
            sum_steps: 0,
            avg_soma_f: Array1::zeros(size),
            avg_soma_t: Array1::zeros(size),
            avg_rate_f: Array1::zeros(size),
            avg_rate_t: Array1::zeros(size),
            avg_psp_basal_f: Array1::zeros(f_input_size),
            avg_psp_basal_t: Array1::zeros(f_input_size),
            last_window: 0,
            burst_rate: Array1::zeros(size),
            burst_taken: vec![false; size],
        }
    }

    /// Advance one timestep. During the target phase the desired output
    /// drives a somatic current; during the forward phase the current is
    /// zero.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        config: &SimConfig,
        d: &Derived,
        kernel: &SynapticKernel,
        w: &Array2<f32>,
        b: &Array1<f32>,
        f_input: SynapticInput<'_>,
        target: Option<&Array1<f32>>,
        rng: &mut StdRng,
    ) -> Result<()> {
        self.psp_basal = f_input.psp(kernel);
        self.basal = dynamics::dendritic_potential(w, &self.psp_basal, b);

        match target {
            None => self.current.fill(0.0),
            Some(t) => {
                self.current = if config.use_conductances {
                    dynamics::target_conductance_current(&self.soma, t, config.e_e, config.e_i)
                } else {
                    dynamics::target_affine_current(t)
                };
            }
        }

        if config.use_conductances {
            dynamics::output_soma_step(&mut self.soma, &self.basal, &self.current, d, config.dt);
        } else if target.is_some() {
            self.soma = self.basal.mapv(|v| d.k_d * v) + self.current.mapv(|v| d.k_i * v);
        } else {
            self.soma = self.basal.mapv(|v| d.k_d * v);
        }
        check_finite(&self.soma, "output somatic")?;

        self.rate = dynamics::spike_rate(&self.soma, d.phi_max);
        spikes::fire(&mut self.spikes, &self.rate, rng)
    }

    pub fn accumulate(&mut self) {
        self.sum_soma += &self.soma;
        self.sum_rate += &self.rate;
        self.sum_psp_basal += &self.psp_basal;
        self.sum_steps += 1;
    }

    /// Sample the target-phase rate statistic for neurons whose burst
    /// time is the current step.
    pub fn snapshot_bursts(&mut self, step: usize, burst_steps: &[usize]) {
        if self.sum_steps == 0 {
            return;
        }
        let inv = 1.0 / self.sum_steps as f32;
        for (i, &burst) in burst_steps.iter().enumerate() {
            if burst == step {
                self.burst_rate[i] = self.sum_rate[i] * inv;
                self.burst_taken[i] = true;
            }
        }
    }

    pub fn finalize(&mut self, phase: Phase) {
        debug_assert!(self.sum_steps > 0, "phase ended before the settle interval");
        let inv = 1.0 / self.sum_steps.max(1) as f32;
        match phase {
            Phase::Forward => {
                self.avg_soma_f = &self.sum_soma * inv;
                self.avg_rate_f = &self.sum_rate * inv;
                self.avg_psp_basal_f = &self.sum_psp_basal * inv;
            }
            Phase::Target => {
                self.avg_soma_t = &self.sum_soma * inv;
                self.avg_rate_t = &self.sum_rate * inv;
                self.avg_psp_basal_t = &self.sum_psp_basal * inv;
                for i in 0..self.size {
                    if !self.burst_taken[i] {
                        self.burst_rate[i] = self.avg_rate_t[i];
                    }
                }
            }
        }
        self.last_window = self.sum_steps;
        self.reset_sums();
    }

    /// Local error: rate discrepancy between phases weighted by the
    /// forward-phase rate sensitivity.
    pub fn error(&self, d: &Derived) -> Array1<f32> {
        let forward_rate = dynamics::spike_rate(&self.avg_soma_f, d.phi_max);
        let deriv = dynamics::spike_rate_deriv(&self.avg_soma_f, d.phi_max);
        (&self.burst_rate - &forward_rate) * -d.k_d * deriv
    }

    pub fn reset_averages(&mut self) {
        self.avg_soma_f.fill(0.0);
        self.avg_soma_t.fill(0.0);
        self.avg_rate_f.fill(0.0);
        self.avg_rate_t.fill(0.0);
        self.avg_psp_basal_f.fill(0.0);
        self.avg_psp_basal_t.fill(0.0);
        self.burst_rate.fill(0.0);
        self.burst_taken.fill(false);
    }

    fn reset_sums(&mut self) {
        self.sum_soma.fill(0.0);
        self.sum_rate.fill(0.0);
        self.sum_psp_basal.fill(0.0);
        self.sum_steps = 0;
    }

    pub fn clear_state(&mut self) {
        self.basal.fill(0.0);
        self.current.fill(0.0);
        self.soma.fill(0.0);
        self.rate.fill(0.0);
        self.spikes.clear();
        self.psp_basal.fill(0.0);
        self.reset_sums();
        self.reset_averages();
        self.last_window = 0;
    }

    #[cfg(test)]
    pub(crate) fn sum_steps(&self) -> usize {
        self.sum_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use rand::SeedableRng;

    fn fixture() -> (SimConfig, Derived, SynapticKernel, StdRng) {
        let config = SimConfig::default();
        let d = config.derive();
        let kernel = SynapticKernel::new(&config).unwrap();
        let rng = StdRng::seed_from_u64(21);
        (config, d, kernel, rng)
    }

    #[test]
    fn averages_cover_exactly_the_accumulated_steps() {
        let (config, d, kernel, mut rng) = fixture();
        let mut layer = HiddenLayer::new(4, 3, 2, config.memory_steps);
        let w = Array2::from_elem((4, 3), 0.1);
        let b = Array1::zeros(4);
        let y = Array2::from_elem((4, 2), 0.1);
        let c = Array1::zeros(4);
        let f_rates = Array1::from_elem(3, 0.05);
        let b_rates = Array1::from_elem(2, 0.05);

        for _ in 0..7 {
            layer
                .step(
                    &config,
                    &d,
                    &kernel,
                    &w,
                    &b,
                    &y,
                    &c,
                    SynapticInput::Rates(&f_rates),
                    SynapticInput::Rates(&b_rates),
                    &mut rng,
                )
                .unwrap();
            layer.accumulate();
        }
        assert_eq!(layer.sum_steps(), 7);

        layer.finalize(Phase::Forward);
        assert_eq!(layer.last_window, 7);
        assert_eq!(layer.sum_steps(), 0);
        assert!(layer.avg_soma_f.iter().all(|v| v.is_finite()));
        // The constant rate input passes straight through as the PSP
        // average in non-spiking mode.
        assert!((layer.avg_psp_basal_f[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn reset_leaves_averages_exactly_zero() {
        let (config, d, kernel, mut rng) = fixture();
        let mut layer = OutputLayer::new(4, 3, config.memory_steps);
        let w = Array2::from_elem((4, 3), 0.2);
        let b = Array1::zeros(4);
        let f_rates = Array1::from_elem(3, 0.1);

        for _ in 0..5 {
            layer
                .step(
                    &config,
                    &d,
                    &kernel,
                    &w,
                    &b,
                    SynapticInput::Rates(&f_rates),
                    None,
                    &mut rng,
                )
                .unwrap();
            layer.accumulate();
        }
        layer.finalize(Phase::Forward);
        assert!(layer.avg_soma_f.iter().any(|&v| v != 0.0));

        layer.reset_averages();
        assert!(layer.avg_soma_f.iter().all(|&v| v == 0.0));
        assert!(layer.avg_rate_f.iter().all(|&v| v == 0.0));
        assert!(layer.avg_psp_basal_f.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn output_error_points_down_the_rate_gap() {
        let (config, d, _, _) = fixture();
        let mut layer = OutputLayer::new(2, 2, config.memory_steps);

        // Forward-phase somatic average of zero gives rate phi_max / 2;
        // a higher target-phase rate must produce a negative error so the
        // update (-eta * delta) raises the weights.
        layer.avg_soma_f = Array1::zeros(2);
        layer.burst_rate = Array1::from_elem(2, d.phi_max * 0.9);
        let e = layer.error(&d);
        assert!(e.iter().all(|&v| v < 0.0));

        // A lower target-phase rate flips the sign.
        layer.burst_rate = Array1::from_elem(2, d.phi_max * 0.1);
        let e = layer.error(&d);
        assert!(e.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn hidden_error_follows_apical_discrepancy() {
        let (config, d, _, _) = fixture();
        let mut layer = HiddenLayer::new(3, 2, 2, config.memory_steps);

        layer.avg_soma_f = Array1::zeros(3);
        layer.avg_apical_f = Array1::zeros(3);
        layer.burst_apical = Array1::from_elem(3, 2.0);
        let e = layer.local_error(&d);
        assert!(e.iter().all(|&v| v < 0.0));

        layer.burst_apical = Array1::from_elem(3, -2.0);
        let e = layer.local_error(&d);
        assert!(e.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn clear_state_zeroes_everything() {
        let (config, d, kernel, mut rng) = fixture();
        let mut layer = HiddenLayer::new(2, 2, 2, config.memory_steps);
        let w = Array2::from_elem((2, 2), 0.3);
        let b = Array1::from_elem(2, 0.5);
        let y = Array2::from_elem((2, 2), 0.3);
        let c = Array1::zeros(2);
        let rates = Array1::from_elem(2, 0.1);

        for _ in 0..4 {
            layer
                .step(
                    &config,
                    &d,
                    &kernel,
                    &w,
                    &b,
                    &y,
                    &c,
                    SynapticInput::Rates(&rates),
                    SynapticInput::Rates(&rates),
                    &mut rng,
                )
                .unwrap();
            layer.accumulate();
        }
        layer.clear_state();

        assert!(layer.soma.iter().all(|&v| v == 0.0));
        assert!(layer.basal.iter().all(|&v| v == 0.0));
        assert_eq!(layer.sum_steps(), 0);
        assert!(layer.avg_soma_f.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn non_finite_weights_are_reported() {
        let (config, d, kernel, mut rng) = fixture();
        let mut layer = OutputLayer::new(2, 2, config.memory_steps);
        let w = Array2::from_elem((2, 2), f32::NAN);
        let b = Array1::zeros(2);
        let rates = Array1::from_elem(2, 0.1);

        let result = layer.step(
            &config,
            &d,
            &kernel,
            &w,
            &b,
            SynapticInput::Rates(&rates),
            None,
            &mut rng,
        );
        assert!(result.is_err());
    }
}
