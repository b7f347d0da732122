// Checkpoint store - full optimization state as one safetensors file
//
// Tensors are namespaced by owner (`model.*`, `center_loss.*`, `optimizer.*`,
// `optimizer_centerloss.*`); everything scalar lives in a JSON header under
// the `checkpoint` metadata key.

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{Result, TrainError};
use crate::optim::{OptimizerScalars, OptimizerState, ScheduleState};

/// Newest header layout this build reads and writes
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

pub const LAST_CHECKPOINT: &str = "model_last.safetensors";
pub const BEST_CHECKPOINT: &str = "model_best.safetensors";

const HEADER_KEY: &str = "checkpoint";
const MODEL_PREFIX: &str = "model.";
const CENTER_LOSS_PREFIX: &str = "center_loss.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const CENTER_OPTIMIZER_PREFIX: &str = "optimizer_centerloss.";

/// Everything needed to continue training after `epoch`
#[derive(Debug, Clone)]
pub struct OptimizationState {
    /// Last completed epoch
    pub epoch: usize,
    pub model: BTreeMap<String, Tensor>,
    pub center_loss: BTreeMap<String, Tensor>,
    pub optimizer: OptimizerState,
    pub optimizer_centerloss: OptimizerState,
    pub lr_scheduler: ScheduleState,
    /// Best validation accuracy so far, `None` before the first epoch
    pub best_accuracy: Option<f64>,
    pub run_id: String,
}

/// JSON header stored in the safetensors metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub schema_version: u32,
    pub epoch: usize,
    #[serde(default)]
    pub best_accuracy: Option<f64>,
    pub lr_scheduler: ScheduleState,
    pub optimizer: OptimizerScalars,
    pub optimizer_centerloss: OptimizerScalars,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// Writes and reads checkpoints in one run directory
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join(LAST_CHECKPOINT)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }

    /// Write `model_last`, and `model_best` with the same bytes when `is_best`
    pub fn save(&self, state: &OptimizationState, is_best: bool) -> Result<PathBuf> {
        let bytes = encode(state)?;

        let last = self.last_path();
        write_atomic(&last, &bytes)?;
        tracing::info!(epoch = state.epoch, path = %last.display(), "Saved checkpoint");

        if is_best {
            let best = self.best_path();
            write_atomic(&best, &bytes)?;
            tracing::info!(
                epoch = state.epoch,
                best_accuracy = state.best_accuracy,
                path = %best.display(),
                "Saved current best"
            );
        }
        Ok(last)
    }

    /// Read a checkpoint written by `save`, placing tensors on `device`
    pub fn load(path: &Path, device: &Device) -> Result<OptimizationState> {
        if !path.exists() {
            return Err(TrainError::CheckpointNotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        let header = read_header(path, &bytes)?;

        let mut model = BTreeMap::new();
        let mut center_loss = BTreeMap::new();
        let mut optimizer = BTreeMap::new();
        let mut optimizer_centerloss = BTreeMap::new();
        for (name, tensor) in candle_core::safetensors::load_buffer(&bytes, device)? {
            if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
                model.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(CENTER_LOSS_PREFIX) {
                center_loss.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(OPTIMIZER_PREFIX) {
                optimizer.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(CENTER_OPTIMIZER_PREFIX) {
                optimizer_centerloss.insert(rest.to_string(), tensor);
            } else {
                tracing::warn!(tensor = %name, "Ignoring unrecognized checkpoint tensor");
            }
        }

        tracing::info!(
            epoch = header.epoch,
            run_id = %header.run_id,
            path = %path.display(),
            "Loaded checkpoint"
        );

        Ok(OptimizationState {
            epoch: header.epoch,
            model,
            center_loss,
            optimizer: OptimizerState {
                scalars: header.optimizer,
                buffers: optimizer,
            },
            optimizer_centerloss: OptimizerState {
                scalars: header.optimizer_centerloss,
                buffers: optimizer_centerloss,
            },
            lr_scheduler: header.lr_scheduler,
            best_accuracy: header.best_accuracy,
            run_id: header.run_id,
        })
    }

    /// Header only, without materializing tensors
    pub fn read_header(path: &Path) -> Result<CheckpointHeader> {
        if !path.exists() {
            return Err(TrainError::CheckpointNotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        read_header(path, &bytes)
    }
}

fn encode(state: &OptimizationState) -> Result<Vec<u8>> {
    let header = CheckpointHeader {
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        epoch: state.epoch,
        best_accuracy: state.best_accuracy,
        lr_scheduler: state.lr_scheduler,
        optimizer: state.optimizer.scalars,
        optimizer_centerloss: state.optimizer_centerloss.scalars,
        run_id: state.run_id.clone(),
        saved_at: Some(Utc::now()),
    };
    let mut metadata = HashMap::new();
    metadata.insert(HEADER_KEY.to_string(), serde_json::to_string(&header)?);

    let groups = [
        (MODEL_PREFIX, &state.model),
        (CENTER_LOSS_PREFIX, &state.center_loss),
        (OPTIMIZER_PREFIX, &state.optimizer.buffers),
        (CENTER_OPTIMIZER_PREFIX, &state.optimizer_centerloss.buffers),
    ];
    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for (prefix, group) in groups {
        for (name, tensor) in group {
            // Stored contiguous on the host so the byte image is device independent
            let host = tensor.to_device(&Device::Cpu)?.contiguous()?;
            tensors.push((format!("{}{}", prefix, name), host));
        }
    }

    Ok(safetensors::serialize(
        tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
        &Some(metadata),
    )?)
}

fn read_header(path: &Path, bytes: &[u8]) -> Result<CheckpointHeader> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)
        .map_err(|e| TrainError::incompatible(path, format!("not a safetensors file: {}", e)))?;
    let raw = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(HEADER_KEY))
        .ok_or_else(|| TrainError::incompatible(path, "missing checkpoint header"))?;

    let header: CheckpointHeader = serde_json::from_str(raw)
        .map_err(|e| TrainError::incompatible(path, format!("unreadable header: {}", e)))?;
    if header.schema_version > CHECKPOINT_SCHEMA_VERSION {
        return Err(TrainError::incompatible(
            path,
            format!(
                "schema version {} is newer than supported version {}",
                header.schema_version, CHECKPOINT_SCHEMA_VERSION
            ),
        ));
    }
    Ok(header)
}

/// Write to a temp sibling, then rename over the target
///
/// On failure the temp file is removed and the previous target is untouched.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let written = write_synced(&temp_path, bytes).and_then(|()| fs::rename(&temp_path, path));
    if let Err(e) = written {
        if temp_path.is_file() {
            let _ = fs::remove_file(&temp_path);
        }
        return Err(e.into());
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
