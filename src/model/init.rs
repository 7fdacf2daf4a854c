//! Weight initialization.
//!
//! Forward weights and biases are sampled so that the resulting
//! steady-state somatic potentials land in a target mean/variance regime;
//! the required weight statistics follow in closed form from the desired
//! potential statistics. Feedback weights are derived from the same scale,
//! either layer-wise or as products chained down from the output layer
//! (broadcast mode), and can be tied to the forward weights (symmetric
//! mode) or sparsified.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{Derived, SimConfig};
use crate::{DendraError, Result};

/// Desired mean of steady-state dendritic potentials.
const V_AVG: f32 = 3.0;
/// Desired standard deviation of steady-state dendritic potentials.
const V_SD: f32 = 3.0;
/// Desired mean of biases.
const B_AVG: f32 = 0.8;
/// Desired standard deviation of biases.
const B_SD: f32 = 0.001;
/// Half-width multiplier mapping a standard deviation onto the matching
/// uniform range: U(-0.5, 0.5) has sd 1/sqrt(12), so 3.465 ~ sqrt(12).
const UNIFORM_SPAN: f32 = 3.465;
/// Standard deviation of the noise added to noisy symmetric weights.
const SYMMETRIC_NOISE_SD: f32 = 0.05;

/// All weight tensors for a network.
#[derive(Debug, Clone)]
pub struct Weights {
    /// Forward weight matrices, one per layer.
    pub w: Vec<Array2<f32>>,
    /// Forward biases, one per layer.
    pub b: Vec<Array1<f32>>,
    /// Feedback weight matrices; the output layer carries a dummy
    /// identity so indexing stays uniform.
    pub y: Vec<Array2<f32>>,
    /// Feedback biases.
    pub c: Vec<Array1<f32>>,
    /// Flattened indices of feedback weights zeroed in sparse mode, one
    /// list per hidden layer.
    pub y_dropout: Vec<Vec<usize>>,
}

/// Closed-form weight statistics that put potentials at the target
/// mean/variance for a layer with `n_inputs` presynaptic units.
fn weight_scale(n_inputs: usize, phi_max: f32) -> Result<(f32, f32)> {
    let n = n_inputs as f32;
    let nu = phi_max * 0.25;
    let v_sm = V_SD * V_SD + V_AVG * V_AVG;

    let w_avg = (V_AVG - B_AVG) / (nu * n * V_AVG);
    let w_sm = (v_sm + nu * nu * (n - n * n) * w_avg * w_avg * V_AVG * V_AVG
        - 2.0 * n * nu * B_AVG * V_AVG * w_avg
        - B_AVG * B_AVG)
        / (n * nu * nu * v_sm);
    let w_sd = (w_sm - w_avg * w_avg).sqrt();
    if !w_avg.is_finite() || !w_sd.is_finite() {
        return Err(DendraError::Config(format!(
            "weight optimization is ill-conditioned for {} inputs",
            n_inputs
        )));
    }
    Ok((w_avg, w_sd))
}

fn uniform_matrix(rows: usize, cols: usize, avg: f32, sd: f32, rng: &mut StdRng) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| {
        avg + UNIFORM_SPAN * sd * (rng.gen::<f32>() - 0.5)
    })
}

fn uniform_vector(len: usize, avg: f32, sd: f32, rng: &mut StdRng) -> Array1<f32> {
    Array1::from_shape_fn(len, |_| avg + UNIFORM_SPAN * sd * (rng.gen::<f32>() - 0.5))
}

/// Initialize every weight tensor for a network with the given layer
/// sizes and input dimension.
pub fn initialize(
    config: &SimConfig,
    d: &Derived,
    sizes: &[usize],
    input_size: usize,
    rng: &mut StdRng,
) -> Result<Weights> {
    let depth = sizes.len();
    let output_size = sizes[depth - 1];

    let mut w: Vec<Array2<f32>> = vec![Array2::zeros((0, 0)); depth];
    let mut b: Vec<Array1<f32>> = vec![Array1::zeros(0); depth];
    let mut y: Vec<Array2<f32>> = vec![Array2::zeros((0, 0)); depth];
    let mut c: Vec<Array1<f32>> = vec![Array1::zeros(0); depth];

    // Dummy feedback weights at the output keep per-layer indexing
    // uniform and seed the broadcast product chain.
    y[depth - 1] = Array2::eye(output_size);

    for m in (0..depth).rev() {
        let n_inputs = if m == 0 { input_size } else { sizes[m - 1] };

        if config.use_weight_optimization {
            let (w_avg, w_sd) = weight_scale(n_inputs, d.phi_max)?;
            w[m] = uniform_matrix(sizes[m], n_inputs, w_avg, w_sd, rng);
            b[m] = uniform_vector(sizes[m], B_AVG, B_SD, rng);

            if m != 0 {
                if config.use_broadcast {
                    let scale = uniform_matrix(n_inputs, sizes[m], 0.0, w_sd, rng);
                    y[m - 1] = scale.dot(&y[m]);
                } else {
                    y[m - 1] = uniform_matrix(n_inputs, sizes[m], w_avg, w_sd, rng);
                }
            }
        } else {
            w[m] = uniform_matrix(sizes[m], n_inputs, 0.0, 0.1 / UNIFORM_SPAN, rng);
            b[m] = uniform_vector(sizes[m], 0.0, 1.0 / UNIFORM_SPAN, rng);

            if m != 0 {
                let fb_inputs = if config.use_broadcast {
                    output_size
                } else {
                    sizes[m]
                };
                y[m - 1] = uniform_matrix(n_inputs, fb_inputs, 0.0, 1.0 / UNIFORM_SPAN, rng);
            }
        }

        if m != 0 {
            c[m - 1] = Array1::zeros(n_inputs);
        }
    }

    let mut weights = Weights {
        w,
        b,
        y,
        c,
        y_dropout: Vec::new(),
    };

    if config.use_symmetric_weights {
        make_symmetric(config, &mut weights, rng);
    }

    if config.use_sparse_feedback {
        weights.y_dropout = (0..depth - 1)
            .map(|m| {
                let total = weights.y[m].len();
                let drop = (config.sparse_drop_fraction * total as f32) as usize;
                rand::seq::index::sample(rng, total, drop).into_vec()
            })
            .collect();
        for m in 0..depth - 1 {
            sparsify(config, &mut weights.y[m], &weights.y_dropout[m]);
        }
    }

    Ok(weights)
}

/// Tie feedback weights to the transpose of the forward weights above,
/// chaining the products downstream in broadcast mode.
pub fn make_symmetric(config: &SimConfig, weights: &mut Weights, rng: &mut StdRng) {
    let depth = weights.w.len();
    if depth < 2 {
        return;
    }
    let noise = Normal::new(0.0_f32, SYMMETRIC_NOISE_SD).expect("valid normal");

    for m in (0..depth - 1).rev() {
        let mut w_above = weights.w[m + 1].t().to_owned();
        if config.noisy_symmetric_weights {
            w_above.mapv_inplace(|v| v + noise.sample(rng));
        }
        if config.use_broadcast && m < depth - 2 {
            weights.y[m] = w_above.dot(&weights.y[m + 1]);
        } else {
            weights.y[m] = w_above;
        }
    }
}

/// Zero the dropped feedback entries and boost the survivors so the
/// expected feedback magnitude is preserved.
pub fn sparsify(config: &SimConfig, y: &mut Array2<f32>, dropped: &[usize]) {
    if let Some(flat) = y.as_slice_mut() {
        for &idx in dropped {
            flat[idx] = 0.0;
        }
    }
    *y *= config.sparse_rescale;
}

/// Re-zero the dropped entries without rescaling, used after incremental
/// feedback-weight updates.
pub fn reapply_dropout(y: &mut Array2<f32>, dropped: &[usize]) {
    if let Some(flat) = y.as_slice_mut() {
        for &idx in dropped {
            flat[idx] = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn setup(config: &SimConfig, sizes: &[usize], input: usize) -> Weights {
        let d = config.derive();
        let mut rng = StdRng::seed_from_u64(99);
        initialize(config, &d, sizes, input, &mut rng).unwrap()
    }

    #[test]
    fn shapes_follow_topology() {
        let config = SimConfig::default();
        let weights = setup(&config, &[100, 30, 10], 64);

        assert_eq!(weights.w[0].dim(), (100, 64));
        assert_eq!(weights.w[1].dim(), (30, 100));
        assert_eq!(weights.w[2].dim(), (10, 30));
        // Broadcast feedback maps output spikes onto each hidden layer.
        assert_eq!(weights.y[0].dim(), (100, 10));
        assert_eq!(weights.y[1].dim(), (30, 10));
        assert_eq!(weights.y[2].dim(), (10, 10));
        assert_eq!(weights.c[0].len(), 100);
        assert_eq!(weights.c[1].len(), 30);
    }

    #[test]
    fn layerwise_feedback_maps_from_layer_above() {
        let config = SimConfig {
            use_broadcast: false,
            ..Default::default()
        };
        let weights = setup(&config, &[100, 30, 10], 64);
        assert_eq!(weights.y[0].dim(), (100, 30));
        assert_eq!(weights.y[1].dim(), (30, 10));
    }

    #[test]
    fn optimized_potentials_hit_target_statistics() {
        // Sample dendritic potentials B = W * r + b over fresh weight
        // draws with presynaptic rates r = nu * V, V ~ N(V_avg, V_sd).
        // The closed-form weight statistics should reproduce V_avg/V_sd
        // in the potentials.
        let config = SimConfig::default();
        let d = config.derive();
        let mut rng = StdRng::seed_from_u64(1234);

        let n_inputs = 500;
        let layer = 100;
        let trials = 100;
        let nu = d.phi_max * 0.25;
        let normal = Normal::new(V_AVG, V_SD).unwrap();

        let mut samples = Vec::with_capacity(layer * trials);
        for _ in 0..trials {
            let (w_avg, w_sd) = weight_scale(n_inputs, d.phi_max).unwrap();
            let w = uniform_matrix(layer, n_inputs, w_avg, w_sd, &mut rng);
            let b = uniform_vector(layer, B_AVG, B_SD, &mut rng);
            let rates =
                Array1::from_shape_fn(n_inputs, |_| nu * normal.sample(&mut rng));
            let potentials = w.dot(&rates) + &b;
            samples.extend(potentials.iter().copied());
        }

        let n = samples.len() as f32;
        let mean: f32 = samples.iter().sum::<f32>() / n;
        let var: f32 = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let sd = var.sqrt();

        assert!(
            (mean - V_AVG).abs() < 0.05 * V_AVG,
            "potential mean {} misses target {}",
            mean,
            V_AVG
        );
        assert!(
            (sd - V_SD).abs() < 0.10 * V_SD,
            "potential sd {} misses target {}",
            sd,
            V_SD
        );
    }

    #[test]
    fn symmetric_weights_match_transpose() {
        let config = SimConfig {
            use_symmetric_weights: false,
            ..Default::default()
        };
        let mut weights = setup(&config, &[40, 10], 20);
        let symmetric_config = SimConfig {
            use_symmetric_weights: true,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        make_symmetric(&symmetric_config, &mut weights, &mut rng);

        let expected = weights.w[1].t().to_owned();
        assert_eq!(weights.y[0], expected);
    }

    #[test]
    fn sparse_feedback_zeroes_the_configured_fraction() {
        let config = SimConfig {
            use_sparse_feedback: true,
            ..Default::default()
        };
        let weights = setup(&config, &[100, 10], 50);

        let total = weights.y[0].len();
        let zeros = weights.y[0].iter().filter(|&&v| v == 0.0).count();
        let expected = (config.sparse_drop_fraction * total as f32) as usize;
        assert!(zeros >= expected);
    }
}
