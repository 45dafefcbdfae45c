use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FoamError;
use crate::structures::Split;

/// Evaluation settings, stored as JSON next to the checkpoint they describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub data_dir: PathBuf,
    pub split: String,
    /// Downsampling factors the scene was trained at; evaluation uses the smallest.
    pub downsample: Vec<u32>,
    pub device: String,
    pub scene_file: String,
    pub image_dir: String,
    pub metrics_file: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            split: "test".to_string(),
            downsample: vec![1],
            device: "cpu".to_string(),
            scene_file: "scene.ply".to_string(),
            image_dir: "test_images".to_string(),
            metrics_file: "metrics.txt".to_string(),
        }
    }
}

impl EvalConfig {
    pub fn load(path: &Path) -> Result<Self, FoamError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            FoamError::Config(format!("failed to read config from {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            FoamError::Config(format!("failed to parse config from {}: {}", path.display(), e))
        })?;
        config.split()?;
        config.eval_downsample()?;
        Ok(config)
    }

    /// The checkpoint directory is the directory holding the config file.
    pub fn checkpoint_dir(path: &Path) -> PathBuf {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn split(&self) -> Result<Split, FoamError> {
        Split::parse(&self.split)
    }

    pub fn eval_downsample(&self) -> Result<u32, FoamError> {
        match self.downsample.iter().copied().min() {
            None => Err(FoamError::Config("downsample list is empty".to_string())),
            Some(0) => Err(FoamError::Config("downsample factors must be positive".to_string())),
            Some(d) => Ok(d),
        }
    }

    /// Relative data directories are taken relative to the checkpoint.
    pub fn resolve_data_dir(&self, checkpoint: &Path) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            checkpoint.join(&self.data_dir)
        }
    }
}
