//! Command-line entry point.
//!
//! Usage:
//!   dendra train --data mnist/ --out runs/baseline --hidden 500
//!   dendra train --synthetic --out runs/demo --epochs 2 --overwrite
//!   dendra evaluate --run runs/baseline --data mnist/ --prefix epoch_0_

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use dendra::config::SimConfig;
use dendra::model::Network;
use dendra::training::{datasets, Trainer, TrainerConfig};
use dendra::utils::persist::RunDir;

/// Spiking-network simulator with two-phase dendritic credit assignment
#[derive(Parser)]
#[command(name = "dendra")]
#[command(version = dendra::VERSION)]
#[command(about = "Train and evaluate spiking networks with local two-phase plasticity")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a network and persist the run
    Train(TrainArgs),
    /// Evaluate saved weights on the test set
    Evaluate(EvalArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Directory holding the MNIST IDX files or their cache
    #[arg(long, conflicts_with = "synthetic")]
    data: Option<PathBuf>,

    /// Use a synthetic linearly separable dataset instead of MNIST
    #[arg(long)]
    synthetic: bool,

    /// Run directory to create
    #[arg(short, long)]
    out: PathBuf,

    /// Replace the run directory if it already exists
    #[arg(long)]
    overwrite: bool,

    /// Hidden layer sizes, input side first
    #[arg(long, value_delimiter = ',', default_value = "500")]
    hidden: Vec<usize>,

    /// Output layer size (must divide into 10 classes)
    #[arg(long, default_value = "10")]
    output: usize,

    /// Number of training epochs
    #[arg(short, long, default_value = "1")]
    epochs: usize,

    /// Examples per epoch (defaults to the whole training set)
    #[arg(long)]
    examples: Option<usize>,

    /// Forward learning rate, repeated per layer or given once for all
    #[arg(long, value_delimiter = ',', default_value = "0.1")]
    f_eta: Vec<f32>,

    /// Feedback learning rate, repeated per layer or given once for all
    #[arg(long, value_delimiter = ',', default_value = "0.0")]
    b_eta: Vec<f32>,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Use exact backpropagation instead of the local rule
    #[arg(long)]
    backprop: bool,

    /// Tie feedback weights to the forward-weight transpose
    #[arg(long)]
    symmetric: bool,

    /// Use fixed phase lengths instead of Wald-distributed ones
    #[arg(long)]
    fixed_phases: bool,
}

#[derive(Args)]
struct EvalArgs {
    /// Run directory holding the manifest and weights
    #[arg(short, long)]
    run: PathBuf,

    /// Directory holding the MNIST IDX files or their cache
    #[arg(long)]
    data: Option<PathBuf>,

    /// Use a synthetic linearly separable dataset instead of MNIST
    #[arg(long)]
    synthetic: bool,

    /// Weight-file prefix, e.g. "initial_" or "epoch_0_"
    #[arg(long, default_value = "epoch_0_")]
    prefix: String,

    /// Number of test examples
    #[arg(long, default_value = "10000")]
    examples: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Evaluate(args) => evaluate(args),
    }
}

fn spread_etas(etas: &[f32], depth: usize) -> Vec<f32> {
    if etas.len() == 1 {
        vec![etas[0]; depth]
    } else {
        etas.to_vec()
    }
}

fn load_data(
    data: &Option<PathBuf>,
    synthetic: bool,
    phi_max: f32,
) -> Result<datasets::DigitDataset> {
    if synthetic {
        info!("generating synthetic dataset");
        return Ok(datasets::synthetic_digits(100, 5000, 1000, 17, phi_max));
    }
    let dir = data
        .as_ref()
        .context("either --data or --synthetic is required")?;
    datasets::load_mnist(dir, phi_max).context("failed to load MNIST")
}

fn train(args: TrainArgs) -> Result<()> {
    let config = SimConfig {
        seed: args.seed,
        use_backprop: args.backprop,
        use_symmetric_weights: args.symmetric,
        use_rand_phase_lengths: !args.fixed_phases,
        use_rand_burst_times: !args.fixed_phases,
        ..Default::default()
    };
    let phi_max = config.derive().phi_max;

    let data = load_data(&args.data, args.synthetic, phi_max)?;

    let mut sizes = args.hidden.clone();
    sizes.push(args.output);
    let depth = sizes.len();

    let run = RunDir::create(&args.out, args.overwrite)?;
    let net = Network::new(config, &sizes, data.input_size())?;

    let trainer_config = TrainerConfig {
        epochs: args.epochs,
        examples_per_epoch: args.examples,
        f_etas: spread_etas(&args.f_eta, depth),
        b_etas: spread_etas(&args.b_eta, depth),
        ..Default::default()
    };
    let mut trainer = Trainer::new(net, trainer_config)?;

    let summary = trainer.train(&data, Some(&run))?;
    info!(
        "training finished: {:.2}% -> {:.2}% full-test error",
        summary.initial_test_error, summary.final_test_error
    );
    Ok(())
}

fn evaluate(args: EvalArgs) -> Result<()> {
    let run = RunDir::open(&args.run)?;
    let manifest = run.read_manifest()?;
    let phi_max = manifest.config.derive().phi_max;

    let data = load_data(&args.data, args.synthetic, phi_max)?;

    let mut net = Network::new(
        manifest.config.clone(),
        &manifest.layer_sizes,
        manifest.input_size,
    )?;
    net.load_weights(run.path(), &args.prefix)?;

    let error = net.evaluate(&data.test_inputs, &data.test_targets, args.examples)?;
    info!(
        "test error with prefix {:?}: {:.2}% over {} examples",
        args.prefix,
        error,
        args.examples.min(data.n_test())
    );
    println!("{:.4}", error);
    Ok(())
}
