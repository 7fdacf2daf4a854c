//! Spike generation and bounded spike histories.
//!
//! Each neuron keeps a fixed-length window of recent per-timestep spike
//! counts in a ring buffer with an explicit write cursor, so pushing a new
//! sample is O(1) with no reallocation. Spike counts are drawn from a
//! Poisson distribution whose mean is the neuron's instantaneous rate.

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};

use crate::{DendraError, Result};

/// Fixed-capacity ring buffer of per-timestep spike counts.
///
/// Columns are ordered by the write cursor; [`SpikeHistory::column_at_lag`]
/// resolves a lag (1 = most recent) to the right storage column.
#[derive(Debug, Clone)]
pub struct SpikeHistory {
    counts: ndarray::Array2<f32>,
    cursor: usize,
}

impl SpikeHistory {
    pub fn new(neurons: usize, window: usize) -> Self {
        Self {
            counts: ndarray::Array2::zeros((neurons, window)),
            cursor: 0,
        }
    }

    pub fn neurons(&self) -> usize {
        self.counts.nrows()
    }

    pub fn window(&self) -> usize {
        self.counts.ncols()
    }

    /// Overwrite the oldest column with the newest spike counts.
    pub fn push(&mut self, counts: &Array1<f32>) {
        self.counts.column_mut(self.cursor).assign(counts);
        self.cursor = (self.cursor + 1) % self.window();
    }

    /// Spike counts `lag` steps in the past (lag 1 = most recent push).
    pub fn column_at_lag(&self, lag: usize) -> ArrayView1<'_, f32> {
        debug_assert!(lag >= 1 && lag <= self.window());
        let idx = (self.cursor + self.window() - lag) % self.window();
        self.counts.column(idx)
    }

    /// Zero the history and rewind the cursor.
    pub fn clear(&mut self) {
        self.counts.fill(0.0);
        self.cursor = 0;
    }
}

/// Draw one Poisson spike count per neuron from an instantaneous rate
/// vector.
///
/// Rates are clamped to zero from below; a non-finite rate means a NaN
/// has propagated through the potentials and is reported as a fatal
/// invariant violation rather than silently sampled.
pub fn sample_counts(rates: &Array1<f32>, rng: &mut StdRng) -> Result<Array1<f32>> {
    let mut counts = Array1::zeros(rates.len());
    for (i, &rate) in rates.iter().enumerate() {
        if !rate.is_finite() {
            return Err(DendraError::Numerical(format!(
                "non-finite spike rate {} at neuron {}",
                rate, i
            )));
        }
        if rate > 0.0 {
            let dist = Poisson::new(rate).map_err(|e| {
                DendraError::Numerical(format!("invalid Poisson rate {}: {}", rate, e))
            })?;
            counts[i] = dist.sample(rng);
        }
    }
    Ok(counts)
}

/// Sample spike counts from `rates` and append them to `history`.
pub fn fire(history: &mut SpikeHistory, rates: &Array1<f32>, rng: &mut StdRng) -> Result<()> {
    let counts = sample_counts(rates, rng)?;
    history.push(&counts);
    Ok(())
}
