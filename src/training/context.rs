// Run context - directories, device and epoch range for one training run

use candle_core::Device;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::TrainerSettings;
use crate::errors::{Result, TrainError};

/// Format of the per-run identifier
pub const RUN_ID_FORMAT: &str = "%m%d_%H%M%S";

#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    checkpoint_dir: PathBuf,
    log_dir: PathBuf,
    mirror_dir: Option<PathBuf>,
    device: Device,
    start_epoch: usize,
    epochs: usize,
    resumed: bool,
}

impl RunContext {
    /// Create a context whose run id is the current local time
    pub fn new(settings: &TrainerSettings) -> Result<Self> {
        Self::with_run_id(settings, new_run_id())
    }

    /// Log directory a run with `run_id` will use
    pub fn log_dir_for(settings: &TrainerSettings, run_id: &str) -> PathBuf {
        Path::new(&settings.log_dir).join(run_id)
    }

    /// Create a context with an explicit run id; creates the run directories
    pub fn with_run_id(settings: &TrainerSettings, run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        if settings.epochs == 0 {
            return Err(TrainError::config("trainer.epochs must be positive"));
        }

        let checkpoint_dir = Path::new(&settings.checkpoint_dir).join(&run_id);
        let log_dir = Self::log_dir_for(settings, &run_id);
        let mirror_dir = if settings.log_dir_saved.trim().is_empty() {
            None
        } else {
            Some(Path::new(&settings.log_dir_saved).join(&run_id))
        };

        fs::create_dir_all(&checkpoint_dir)?;
        fs::create_dir_all(&log_dir)?;

        let device = select_device(settings.use_gpu);

        tracing::info!(
            run_id = %run_id,
            checkpoint_dir = %checkpoint_dir.display(),
            log_dir = %log_dir.display(),
            device = ?device,
            "Initialized run context"
        );

        Ok(Self {
            run_id,
            checkpoint_dir,
            log_dir,
            mirror_dir,
            device,
            start_epoch: 1,
            epochs: settings.epochs,
            resumed: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Secondary copy of the log directory, if configured
    pub fn mirror_dir(&self) -> Option<&Path> {
        self.mirror_dir.as_deref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// Epochs still to run, zero when resumed past the end
    pub fn remaining_epochs(&self) -> usize {
        (self.epochs + 1).saturating_sub(self.start_epoch)
    }

    /// Continue after `completed_epoch`; only allowed once per run
    pub fn resume_from(&mut self, completed_epoch: usize) -> Result<()> {
        if self.resumed {
            return Err(TrainError::config(format!(
                "start epoch already set to {} by an earlier resume",
                self.start_epoch
            )));
        }
        self.start_epoch = completed_epoch + 1;
        self.resumed = true;
        Ok(())
    }
}

/// Run id from the current local time
pub fn new_run_id() -> String {
    chrono::Local::now().format(RUN_ID_FORMAT).to_string()
}

/// CUDA, then Metal, then CPU
fn select_device(use_gpu: bool) -> Device {
    if !use_gpu {
        return Device::Cpu;
    }
    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(e) => tracing::warn!(error = %e, "Failed to open CUDA device"),
        }
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(e) => tracing::warn!(error = %e, "Failed to open Metal device"),
        }
    }
    tracing::warn!("GPU requested but no CUDA or Metal device is available, training on CPU");
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> TrainerSettings {
        TrainerSettings {
            epochs: 3,
            checkpoint_dir: dir.path().join("ckpt").display().to_string(),
            log_dir: dir.path().join("logs").display().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_directories_created_per_run() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::with_run_id(&settings(&dir), "0101_000000").unwrap();

        assert!(ctx.checkpoint_dir().ends_with("ckpt/0101_000000"));
        assert!(ctx.checkpoint_dir().is_dir());
        assert!(ctx.log_dir().is_dir());
        assert!(ctx.mirror_dir().is_none());
        assert_eq!(ctx.start_epoch(), 1);
        assert_eq!(ctx.remaining_epochs(), 3);
    }

    #[test]
    fn test_mirror_dir_follows_run_id() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir);
        s.log_dir_saved = dir.path().join("saved").display().to_string();
        let ctx = RunContext::with_run_id(&s, "run").unwrap();
        assert!(ctx.mirror_dir().unwrap().ends_with("saved/run"));
    }

    #[test]
    fn test_resume_only_once() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::with_run_id(&settings(&dir), "run").unwrap();

        ctx.resume_from(2).unwrap();
        assert_eq!(ctx.start_epoch(), 3);
        assert_eq!(ctx.remaining_epochs(), 1);
        assert!(ctx.resume_from(3).is_err());
        assert_eq!(ctx.start_epoch(), 3);
    }

    #[test]
    fn test_resume_past_end_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::with_run_id(&settings(&dir), "run").unwrap();
        ctx.resume_from(5).unwrap();
        assert_eq!(ctx.remaining_epochs(), 0);
    }

    #[test]
    fn test_run_id_format() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(&settings(&dir)).unwrap();
        assert_eq!(ctx.run_id().len(), "0101_000000".len());
        assert_eq!(ctx.run_id().as_bytes()[4], b'_');
    }
}
