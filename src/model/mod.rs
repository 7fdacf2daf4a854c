//! Simulation engine: neurons, layers, and the network orchestrator.
//!
//! The leaf components (synaptic kernel, spike histories, membrane
//! dynamics) are composed into hidden and output layers, which the
//! [`Network`] drives through forward and target phases.

pub mod dynamics;
pub mod init;
pub mod kernel;
pub mod layer;
pub mod network;
pub mod phase;
pub mod spikes;

pub use kernel::SynapticKernel;
pub use layer::{HiddenLayer, OutputLayer, Phase};
pub use network::{ExampleOutcome, Network};
pub use spikes::SpikeHistory;
