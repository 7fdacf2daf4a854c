//! Digit datasets.
//!
//! Inputs are pixel intensities normalized to `[0, 1]` and scaled into
//! the spike-rate range `[0, phi_max]`; targets are one-hot vectors over
//! the ten digit classes. The MNIST loader parses the original IDX
//! binaries once and caches the parsed arrays in the binary tensor
//! format, so subsequent runs skip the parse. A synthetic generator
//! provides linearly separable data for tests and demos.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::CLASSES;
use crate::utils::persist;
use crate::{DendraError, Result};

const IDX_IMAGE_MAGIC: u32 = 2051;
const IDX_LABEL_MAGIC: u32 = 2049;

const CACHE_FILES: [&str; 4] = [
    "train_inputs.bin",
    "train_targets.bin",
    "test_inputs.bin",
    "test_targets.bin",
];

/// Train/test splits of a digit-classification dataset, one column per
/// example.
#[derive(Debug, Clone)]
pub struct DigitDataset {
    pub train_inputs: Array2<f32>,
    pub train_targets: Array2<f32>,
    pub test_inputs: Array2<f32>,
    pub test_targets: Array2<f32>,
}

impl DigitDataset {
    pub fn input_size(&self) -> usize {
        self.train_inputs.nrows()
    }

    pub fn n_train(&self) -> usize {
        self.train_inputs.ncols()
    }

    pub fn n_test(&self) -> usize {
        self.test_inputs.ncols()
    }

    /// Class label of training example `i`.
    pub fn train_label(&self, i: usize) -> usize {
        argmax_column(&self.train_targets, i)
    }
}

fn argmax_column(targets: &Array2<f32>, col: usize) -> usize {
    let column = targets.column(col);
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in column.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Load MNIST from `dir`, preferring the binary cache and falling back
/// to the original IDX files. Missing data is fatal.
pub fn load_mnist(dir: &Path, phi_max: f32) -> Result<DigitDataset> {
    let cache = dir.join("cache");
    if CACHE_FILES.iter().all(|f| cache.join(f).exists()) {
        log::info!("loading MNIST from cache at {:?}", cache);
        return read_cache(&cache, phi_max);
    }

    log::info!("no cache found, parsing MNIST IDX files in {:?}", dir);
    let train_inputs = read_idx_images(&dir.join("train-images.idx3-ubyte"))?;
    let train_labels = read_idx_labels(&dir.join("train-labels.idx1-ubyte"))?;
    let test_inputs = read_idx_images(&dir.join("t10k-images.idx3-ubyte"))?;
    let test_labels = read_idx_labels(&dir.join("t10k-labels.idx1-ubyte"))?;

    if train_inputs.ncols() != train_labels.len() || test_inputs.ncols() != test_labels.len() {
        return Err(DendraError::Data(
            "MNIST image and label counts disagree".to_string(),
        ));
    }

    let train_targets = one_hot(&train_labels);
    let test_targets = one_hot(&test_labels);

    std::fs::create_dir_all(&cache)?;
    persist::write_matrix(&cache.join(CACHE_FILES[0]), &train_inputs)?;
    persist::write_matrix(&cache.join(CACHE_FILES[1]), &train_targets)?;
    persist::write_matrix(&cache.join(CACHE_FILES[2]), &test_inputs)?;
    persist::write_matrix(&cache.join(CACHE_FILES[3]), &test_targets)?;
    log::info!("cached parsed MNIST arrays at {:?}", cache);

    Ok(DigitDataset {
        train_inputs: train_inputs * phi_max,
        train_targets,
        test_inputs: test_inputs * phi_max,
        test_targets,
    })
}

fn read_cache(cache: &Path, phi_max: f32) -> Result<DigitDataset> {
    Ok(DigitDataset {
        train_inputs: persist::read_matrix(&cache.join(CACHE_FILES[0]))? * phi_max,
        train_targets: persist::read_matrix(&cache.join(CACHE_FILES[1]))?,
        test_inputs: persist::read_matrix(&cache.join(CACHE_FILES[2]))? * phi_max,
        test_targets: persist::read_matrix(&cache.join(CACHE_FILES[3]))?,
    })
}

fn read_u32_be(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Parse an IDX image file into a (pixels x examples) matrix normalized
/// to `[0, 1]`.
fn read_idx_images(path: &Path) -> Result<Array2<f32>> {
    let file = File::open(path)
        .map_err(|e| DendraError::Data(format!("cannot open MNIST images {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let magic = read_u32_be(&mut reader)?;
    if magic != IDX_IMAGE_MAGIC {
        return Err(DendraError::Data(format!(
            "{:?} has magic {}, expected IDX images",
            path, magic
        )));
    }
    let count = read_u32_be(&mut reader)? as usize;
    let rows = read_u32_be(&mut reader)? as usize;
    let cols = read_u32_be(&mut reader)? as usize;
    let pixels = rows * cols;

    let mut raw = vec![0u8; count * pixels];
    reader.read_exact(&mut raw)?;

    let mut images = Array2::zeros((pixels, count));
    for n in 0..count {
        for p in 0..pixels {
            images[[p, n]] = raw[n * pixels + p] as f32 / 255.0;
        }
    }
    Ok(images)
}

/// Parse an IDX label file.
fn read_idx_labels(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)
        .map_err(|e| DendraError::Data(format!("cannot open MNIST labels {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let magic = read_u32_be(&mut reader)?;
    if magic != IDX_LABEL_MAGIC {
        return Err(DendraError::Data(format!(
            "{:?} has magic {}, expected IDX labels",
            path, magic
        )));
    }
    let count = read_u32_be(&mut reader)? as usize;
    let mut labels = vec![0u8; count];
    reader.read_exact(&mut labels)?;

    if labels.iter().any(|&l| l as usize >= CLASSES) {
        return Err(DendraError::Data(format!(
            "{:?} contains labels outside 0..{}",
            path, CLASSES
        )));
    }
    Ok(labels)
}

fn one_hot(labels: &[u8]) -> Array2<f32> {
    let mut targets = Array2::zeros((CLASSES, labels.len()));
    for (i, &label) in labels.iter().enumerate() {
        targets[[label as usize, i]] = 1.0;
    }
    targets
}

/// Generate a linearly separable digit-like dataset: each class drives
/// its own group of input features (feature `f` belongs to class
/// `f % 10`), with multiplicative amplitude jitter and a weak uniform
/// background.
pub fn synthetic_digits(
    n_features: usize,
    n_train: usize,
    n_test: usize,
    seed: u64,
    phi_max: f32,
) -> DigitDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut generate = |n: usize, rng: &mut StdRng| {
        let mut inputs = Array2::zeros((n_features, n));
        let mut targets = Array2::zeros((CLASSES, n));
        for i in 0..n {
            let class = i % CLASSES;
            targets[[class, i]] = 1.0;
            for f in 0..n_features {
                let active = f % CLASSES == class;
                inputs[[f, i]] = if active {
                    phi_max * rng.gen_range(0.8..1.0)
                } else {
                    phi_max * rng.gen_range(0.0..0.05)
                };
            }
        }
        (inputs, targets)
    };

    let (train_inputs, train_targets) = generate(n_train, &mut rng);
    let (test_inputs, test_targets) = generate(n_test, &mut rng);
    DigitDataset {
        train_inputs,
        train_targets,
        test_inputs,
        test_targets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn synthetic_targets_are_one_hot() {
        let data = synthetic_digits(20, 50, 30, 9, 0.2);
        assert_eq!(data.input_size(), 20);
        assert_eq!(data.n_train(), 50);
        assert_eq!(data.n_test(), 30);

        for i in 0..data.n_train() {
            let ones = data
                .train_targets
                .column(i)
                .iter()
                .filter(|&&v| v == 1.0)
                .count();
            assert_eq!(ones, 1);
            assert_eq!(data.train_label(i), i % CLASSES);
        }
        assert!(data.train_inputs.iter().all(|&v| (0.0..=0.2).contains(&v)));
    }

    #[test]
    fn synthetic_classes_are_separable() {
        let data = synthetic_digits(20, 100, 10, 2, 0.2);
        // Active features carry far more drive than background features.
        for i in 0..data.n_train() {
            let class = data.train_label(i);
            for f in 0..20 {
                let value = data.train_inputs[[f, i]];
                if f % CLASSES == class {
                    assert!(value > 0.1);
                } else {
                    assert!(value < 0.05 * 0.2 + 1e-6);
                }
            }
        }
    }

    fn write_idx_fixture(dir: &Path) {
        // Two 2x2 images with labels 3 and 7.
        let mut images = Vec::new();
        images.extend_from_slice(&IDX_IMAGE_MAGIC.to_be_bytes());
        images.extend_from_slice(&2u32.to_be_bytes());
        images.extend_from_slice(&2u32.to_be_bytes());
        images.extend_from_slice(&2u32.to_be_bytes());
        images.extend_from_slice(&[0, 128, 255, 64, 255, 0, 32, 16]);
        File::create(dir.join("train-images.idx3-ubyte"))
            .unwrap()
            .write_all(&images)
            .unwrap();
        File::create(dir.join("t10k-images.idx3-ubyte"))
            .unwrap()
            .write_all(&images)
            .unwrap();

        let mut labels = Vec::new();
        labels.extend_from_slice(&IDX_LABEL_MAGIC.to_be_bytes());
        labels.extend_from_slice(&2u32.to_be_bytes());
        labels.extend_from_slice(&[3, 7]);
        File::create(dir.join("train-labels.idx1-ubyte"))
            .unwrap()
            .write_all(&labels)
            .unwrap();
        File::create(dir.join("t10k-labels.idx1-ubyte"))
            .unwrap()
            .write_all(&labels)
            .unwrap();
    }

    #[test]
    fn idx_parse_and_cache_round_trip() {
        let dir = TempDir::new().unwrap();
        write_idx_fixture(dir.path());

        let data = load_mnist(dir.path(), 0.2).unwrap();
        assert_eq!(data.input_size(), 4);
        assert_eq!(data.n_train(), 2);
        assert_eq!(data.train_label(0), 3);
        assert_eq!(data.train_label(1), 7);
        // Pixel 255 scales to phi_max.
        assert!((data.train_inputs[[2, 0]] - 0.2).abs() < 1e-6);

        // Cache now exists; a reload must agree with the parse.
        assert!(dir.path().join("cache").join("train_inputs.bin").exists());
        let cached = load_mnist(dir.path(), 0.2).unwrap();
        assert_eq!(cached.train_inputs, data.train_inputs);
        assert_eq!(cached.test_targets, data.test_targets);
    }

    #[test]
    fn missing_dataset_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(load_mnist(dir.path(), 0.2).is_err());
    }
}
