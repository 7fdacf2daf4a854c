//! Membrane dynamics: compartment potentials and the spike-rate
//! nonlinearity.
//!
//! Dendritic potentials are algebraic functions of their synaptic input;
//! somatic potentials either integrate a conductance-based differential
//! equation with forward Euler or jump directly to their steady state when
//! conductance dynamics are disabled.

use ndarray::{Array1, Array2};

use crate::config::Derived;

/// Spike rate `phi(c) = phi_max / (1 + e^{-c})`.
pub fn spike_rate(c: &Array1<f32>, phi_max: f32) -> Array1<f32> {
    c.mapv(|v| phi_max / (1.0 + (-v).exp()))
}

/// Derivative of the spike rate, written as `phi_max * s * (1 - s)` with
/// `s` the logistic sigmoid so large potentials cannot overflow.
pub fn spike_rate_deriv(c: &Array1<f32>, phi_max: f32) -> Array1<f32> {
    c.mapv(|v| {
        let s = 1.0 / (1.0 + (-v).exp());
        phi_max * s * (1.0 - s)
    })
}

/// Apical nonlinearity `alpha(a)`: a unit-height logistic sigmoid.
pub fn apical_sigmoid(a: &Array1<f32>) -> Array1<f32> {
    a.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Dendritic potential: weighted PSP input plus bias.
pub fn dendritic_potential(w: &Array2<f32>, psp: &Array1<f32>, bias: &Array1<f32>) -> Array1<f32> {
    w.dot(psp) + bias
}

/// One forward-Euler step of a hidden-layer soma:
/// `dC/dt = -g_L*C + g_B*(B - C) [+ g_A*(A - C)]`.
pub fn hidden_soma_step(
    soma: &mut Array1<f32>,
    basal: &Array1<f32>,
    apical: &Array1<f32>,
    d: &Derived,
    dt: f32,
) {
    for ((c, &b), &a) in soma.iter_mut().zip(basal.iter()).zip(apical.iter()) {
        let c_dot = -d.g_l * *c + d.g_b * (b - *c) + d.g_a * (a - *c);
        *c += c_dot * dt;
    }
}

/// One forward-Euler step of an output-layer soma:
/// `dC/dt = -g_L*C + g_D*(B - C) + I`.
pub fn output_soma_step(
    soma: &mut Array1<f32>,
    basal: &Array1<f32>,
    current: &Array1<f32>,
    d: &Derived,
    dt: f32,
) {
    for ((c, &b), &i) in soma.iter_mut().zip(basal.iter()).zip(current.iter()) {
        let c_dot = -d.g_l * *c + d.g_d * (b - *c) + i;
        *c += c_dot * dt;
    }
}

/// Target-driven somatic current under the conductance model:
/// `I = g_E*(E_E - C) + g_I*(E_I - C)` with `g_E` the target signal and
/// `g_I = 1 - g_E`.
pub fn target_conductance_current(
    soma: &Array1<f32>,
    target: &Array1<f32>,
    e_e: f32,
    e_i: f32,
) -> Array1<f32> {
    let mut current = Array1::zeros(soma.len());
    for ((i, &c), &g_e) in current.iter_mut().zip(soma.iter()).zip(target.iter()) {
        let g_i = 1.0 - g_e;
        *i = g_e * (e_e - c) + g_i * (e_i - c);
    }
    current
}

/// Affine target current used when conductance dynamics are disabled.
pub fn target_affine_current(target: &Array1<f32>) -> Array1<f32> {
    target.mapv(|t| 8.0 * t - 4.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn derived() -> Derived {
        SimConfig::default().derive()
    }

    #[test]
    fn spike_rate_is_bounded_and_monotonic() {
        let d = derived();
        // Stay below the f32 saturation point so the upper bound is
        // strict.
        let c = Array1::from_vec(vec![-10.0, -1.0, 0.0, 1.0, 10.0]);
        let rates = spike_rate(&c, d.phi_max);

        for w in rates.as_slice().unwrap().windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(rates.iter().all(|&r| r > 0.0 && r < d.phi_max));
        assert!((rates[2] - d.phi_max / 2.0).abs() < 1e-7);
    }

    #[test]
    fn spike_rate_deriv_matches_finite_difference() {
        let d = derived();
        let eps = 1e-3_f32;
        for &v in &[-3.0_f32, -0.5, 0.0, 0.8, 4.0] {
            let lo = spike_rate(&Array1::from_elem(1, v - eps), d.phi_max)[0];
            let hi = spike_rate(&Array1::from_elem(1, v + eps), d.phi_max)[0];
            let numeric = (hi - lo) / (2.0 * eps);
            let analytic = spike_rate_deriv(&Array1::from_elem(1, v), d.phi_max)[0];
            assert!(
                (numeric - analytic).abs() < 1e-4,
                "deriv mismatch at {}: {} vs {}",
                v,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn spike_rate_deriv_survives_large_potentials() {
        let d = derived();
        let c = Array1::from_vec(vec![100.0, -100.0]);
        let deriv = spike_rate_deriv(&c, d.phi_max);
        assert!(deriv.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn hidden_soma_converges_to_steady_state() {
        let config = SimConfig::default();
        let d = config.derive();
        let basal = Array1::from_elem(3, 2.0);
        let apical = Array1::zeros(3);
        let mut soma = Array1::zeros(3);

        for _ in 0..500 {
            hidden_soma_step(&mut soma, &basal, &apical, &d, config.dt);
        }
        for &c in soma.iter() {
            assert!((c - d.k_b * 2.0).abs() < 1e-4);
        }
    }

    #[test]
    fn output_soma_converges_to_steady_state() {
        let config = SimConfig::default();
        let d = config.derive();
        let basal = Array1::from_elem(2, 1.5);
        let current = Array1::zeros(2);
        let mut soma = Array1::zeros(2);

        for _ in 0..500 {
            output_soma_step(&mut soma, &basal, &current, &d, config.dt);
        }
        for &c in soma.iter() {
            assert!((c - d.k_d * 1.5).abs() < 1e-4);
        }
    }

    #[test]
    fn target_current_pulls_toward_reversal_potentials() {
        let soma = Array1::from_vec(vec![0.0, 0.0]);
        let target = Array1::from_vec(vec![1.0, 0.0]);
        let current = target_conductance_current(&soma, &target, 8.0, -8.0);

        // Full excitatory drive pulls up, full inhibitory drive pulls down.
        assert!((current[0] - 8.0).abs() < 1e-6);
        assert!((current[1] + 8.0).abs() < 1e-6);
    }
}
