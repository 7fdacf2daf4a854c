//! Spiking-network simulator with two-phase dendritic credit assignment.
//!
//! Simulates a stack of two-compartment (hidden) and one-compartment
//! (output) spiking neuron layers. Each training example is presented in
//! two phases: a *forward* phase in which the network settles under the
//! input alone, and a *target* phase in which the desired output is
//! injected into the output layer. The discrepancy between the phase
//! statistics drives a local, per-layer weight update instead of
//! end-to-end backpropagation.
//!
//! # Example
//!
//! ```rust,no_run
//! use dendra::config::SimConfig;
//! use dendra::model::Network;
//! use dendra::training::{datasets, Trainer, TrainerConfig};
//!
//! fn main() -> dendra::Result<()> {
//!     let config = SimConfig::default();
//!     let phi_max = config.derive().phi_max;
//!     let data = datasets::synthetic_digits(64, 1000, 200, 17, phi_max);
//!     let net = Network::new(config, &[100, 10], data.input_size())?;
//!     let mut trainer = Trainer::new(net, TrainerConfig::default())?;
//!     let summary = trainer.train(&data, None)?;
//!     println!("final test error: {:.2}%", summary.final_test_error);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod model;
pub mod training;
pub mod utils;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types
#[derive(thiserror::Error, Debug)]
pub enum DendraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Data(String),

    #[error("Numerical invariant violation: {0}")]
    Numerical(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, DendraError>;
