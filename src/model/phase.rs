//! Phase scheduling: per-example phase lengths and plasticity timing.
//!
//! Every training example runs a forward phase followed by a target
//! phase. Phase lengths are either fixed or drawn independently per
//! example from a shifted Wald (inverse Gaussian) distribution, which
//! guarantees the configured minimum length. When burst timing is
//! enabled, each neuron additionally draws the target-phase step at which
//! its plasticity statistic is sampled.

use rand::rngs::StdRng;
use rand_distr::{Distribution, InverseGaussian, Normal};

use crate::config::SimConfig;
use crate::{DendraError, Result};

/// Largest number of steps a burst time may precede the end of the
/// target phase.
const MAX_BURST_LEAD: usize = 15;

/// Phase lengths drawn for one training example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    pub forward_steps: usize,
    pub target_steps: usize,
}

/// Draw the forward/target lengths for one example.
pub fn draw_plan(config: &SimConfig, rng: &mut StdRng) -> Result<PhasePlan> {
    if !config.use_rand_phase_lengths {
        return Ok(PhasePlan {
            forward_steps: config.forward_steps,
            target_steps: config.target_steps,
        });
    }

    let wald = InverseGaussian::new(config.wald_mean, config.wald_shape).map_err(|e| {
        DendraError::Config(format!(
            "invalid Wald parameters ({}, {}): {}",
            config.wald_mean, config.wald_shape, e
        ))
    })?;
    let forward_steps = config.forward_steps + wald.sample(rng) as usize;
    let target_steps = config.target_steps + wald.sample(rng) as usize;
    Ok(PhasePlan {
        forward_steps,
        target_steps,
    })
}

/// Draw per-neuron burst steps for one layer.
///
/// With random burst times, a neuron's statistic is sampled up to
/// `MAX_BURST_LEAD` steps before the end of the target phase, with the
/// lead drawn from a clamped half-normal. Otherwise every neuron samples
/// at the final step.
pub fn draw_burst_steps(
    config: &SimConfig,
    size: usize,
    target_steps: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let last = target_steps - 1;
    if !config.use_rand_burst_times {
        return vec![last; size];
    }

    // Normal(0, 5) is always valid; unwrap-free construction keeps the
    // call sites simple.
    let lead_dist = Normal::new(0.0_f32, 5.0).expect("valid normal");
    (0..size)
        .map(|_| {
            let lead = (lead_dist.sample(rng).abs() as usize).min(MAX_BURST_LEAD);
            last.saturating_sub(lead)
        })
        .collect()
}
