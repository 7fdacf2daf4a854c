//! Run-directory persistence.
//!
//! The simulation core performs no file IO; the trainer calls into this
//! adapter at phase and epoch boundaries. A run directory holds the JSON
//! manifest needed to reproduce the run, binary weight tensors, metric
//! arrays, and append-only human-readable logs.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::SimConfig;
use crate::training::TrainerConfig;
use crate::{DendraError, Result};

/// Magic bytes prefixing every tensor file.
const TENSOR_MAGIC: &[u8; 4] = b"DNT1";

/// Everything needed to reproduce a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: String,
    pub config: SimConfig,
    pub trainer: TrainerConfig,
    pub layer_sizes: Vec<usize>,
    pub input_size: usize,
}

/// A directory owning all artifacts of one simulation run.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create a run directory. Refuses to reuse an existing directory
    /// unless `overwrite` is set, in which case the old contents are
    /// removed.
    pub fn create(path: &Path, overwrite: bool) -> Result<Self> {
        if path.exists() {
            if !overwrite {
                return Err(DendraError::Config(format!(
                    "run directory {:?} already exists; pass overwrite to replace it",
                    path
                )));
            }
            fs::remove_dir_all(path)?;
        }
        fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Open an existing run directory.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(DendraError::Config(format!(
                "run directory {:?} does not exist",
                path
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the manifest as JSON plus a sorted human-readable text
    /// rendering.
    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(self.path.join("simulation.json"), json)?;

        let rendered = serde_json::to_value(manifest)?;
        let mut lines = Vec::new();
        flatten_json("", &rendered, &mut lines);
        lines.sort();
        let mut file = File::create(self.path.join("simulation.txt"))?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Read the manifest back.
    pub fn read_manifest(&self) -> Result<RunManifest> {
        let json = fs::read_to_string(self.path.join("simulation.json"))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Serialize any value as a JSON file in the run directory.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        fs::write(self.path.join(name), json)?;
        Ok(())
    }

    /// Append one metric value to a human-readable log file.
    pub fn append_metric(&self, name: &str, value: f32) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(name))?;
        writeln!(file, "{:.10}", value)?;
        Ok(())
    }
}

fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_json(&path, nested, out);
            }
        }
        other => out.push(format!("{}: {}", prefix, other)),
    }
}

fn write_tensor(path: &Path, dims: &[u64], data: &[f32]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(TENSOR_MAGIC)?;
    writer.write_all(&[dims.len() as u8])?;
    for &dim in dims {
        writer.write_all(&dim.to_le_bytes())?;
    }
    for &value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn read_tensor(path: &Path) -> Result<(Vec<u64>, Vec<f32>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != TENSOR_MAGIC {
        return Err(DendraError::Data(format!(
            "{:?} is not a tensor file (bad magic)",
            path
        )));
    }

    let mut rank = [0u8; 1];
    reader.read_exact(&mut rank)?;
    let mut dims = Vec::with_capacity(rank[0] as usize);
    let mut buf8 = [0u8; 8];
    for _ in 0..rank[0] {
        reader.read_exact(&mut buf8)?;
        dims.push(u64::from_le_bytes(buf8));
    }

    let total: u64 = dims.iter().product();
    let mut data = Vec::with_capacity(total as usize);
    let mut buf4 = [0u8; 4];
    for _ in 0..total {
        reader.read_exact(&mut buf4)?;
        data.push(f32::from_le_bytes(buf4));
    }
    Ok((dims, data))
}

/// Write a matrix in the binary tensor format.
pub fn write_matrix(path: &Path, matrix: &Array2<f32>) -> Result<()> {
    let (rows, cols) = matrix.dim();
    let data: Vec<f32> = matrix.iter().copied().collect();
    write_tensor(path, &[rows as u64, cols as u64], &data)
}

/// Read a matrix written by [`write_matrix`].
pub fn read_matrix(path: &Path) -> Result<Array2<f32>> {
    let (dims, data) = read_tensor(path)?;
    if dims.len() != 2 {
        return Err(DendraError::Data(format!(
            "{:?} holds a rank-{} tensor, expected a matrix",
            path,
            dims.len()
        )));
    }
    Array2::from_shape_vec((dims[0] as usize, dims[1] as usize), data)
        .map_err(|e| DendraError::Data(format!("corrupt matrix in {:?}: {}", path, e)))
}

/// Write a vector in the binary tensor format.
pub fn write_vector(path: &Path, vector: &Array1<f32>) -> Result<()> {
    let data: Vec<f32> = vector.iter().copied().collect();
    write_tensor(path, &[vector.len() as u64], &data)
}

/// Read a vector written by [`write_vector`].
pub fn read_vector(path: &Path) -> Result<Array1<f32>> {
    let (dims, data) = read_tensor(path)?;
    if dims.len() != 1 {
        return Err(DendraError::Data(format!(
            "{:?} holds a rank-{} tensor, expected a vector",
            path,
            dims.len()
        )));
    }
    Ok(Array1::from_vec(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tensor_round_trip_preserves_values() {
        let dir = TempDir::new().unwrap();

        let matrix = Array2::from_shape_fn((3, 5), |(i, j)| (i * 5 + j) as f32 * 0.25 - 1.0);
        let m_path = dir.path().join("m.bin");
        write_matrix(&m_path, &matrix).unwrap();
        assert_eq!(read_matrix(&m_path).unwrap(), matrix);

        let vector = Array1::from_vec(vec![1.5, -2.25, 0.0, 7.125]);
        let v_path = dir.path().join("v.bin");
        write_vector(&v_path, &vector).unwrap();
        assert_eq!(read_vector(&v_path).unwrap(), vector);
    }

    #[test]
    fn rank_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        write_vector(&path, &Array1::from_vec(vec![1.0])).unwrap();
        assert!(read_matrix(&path).is_err());
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.bin");
        std::fs::write(&path, b"not a tensor at all").unwrap();
        assert!(read_matrix(&path).is_err());
    }

    #[test]
    fn create_refuses_existing_directory() {
        let dir = TempDir::new().unwrap();
        let run_path = dir.path().join("run");
        RunDir::create(&run_path, false).unwrap();
        assert!(RunDir::create(&run_path, false).is_err());
        // With overwrite the old contents disappear.
        std::fs::write(run_path.join("stale.txt"), "old").unwrap();
        let run = RunDir::create(&run_path, true).unwrap();
        assert!(!run.path().join("stale.txt").exists());
    }

    #[test]
    fn manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::create(&dir.path().join("run"), false).unwrap();

        let manifest = RunManifest {
            version: crate::VERSION.to_string(),
            config: SimConfig::default(),
            trainer: TrainerConfig::default(),
            layer_sizes: vec![100, 10],
            input_size: 784,
        };
        run.write_manifest(&manifest).unwrap();

        let loaded = run.read_manifest().unwrap();
        assert_eq!(loaded.layer_sizes, vec![100, 10]);
        assert_eq!(loaded.input_size, 784);
        assert_eq!(loaded.config.forward_steps, manifest.config.forward_steps);
        assert!(run.path().join("simulation.txt").exists());
    }

    #[test]
    fn metric_lines_append() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::create(&dir.path().join("run"), false).unwrap();
        run.append_metric("full_test_errors.txt", 42.5).unwrap();
        run.append_metric("full_test_errors.txt", 40.0).unwrap();

        let contents = std::fs::read_to_string(run.path().join("full_test_errors.txt")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
