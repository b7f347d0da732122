// Training observers
// The loop reports through events; rendering and logging live here

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;

use crate::data::Phase;

/// Something the training loop reports
#[derive(Debug, Clone, Copy)]
pub enum TrainingEvent<'a> {
    RunStarted {
        run_id: &'a str,
        start_epoch: usize,
        epochs: usize,
    },
    PhaseStarted {
        epoch: usize,
        phase: Phase,
        batches: usize,
    },
    BatchFinished {
        epoch: usize,
        phase: Phase,
        batch: usize,
        loss: f64,
        accuracy: f64,
    },
    PhaseFinished {
        epoch: usize,
        phase: Phase,
    },
    /// Combined train/validation results, keyed `loss`, `accuracy`, `val_loss`, ...
    EpochFinished {
        epoch: usize,
        log: &'a BTreeMap<String, f64>,
    },
    CheckpointSaved {
        epoch: usize,
        path: &'a Path,
        is_best: bool,
    },
    RunFinished {
        best_accuracy: Option<f64>,
    },
}

pub trait TrainingObserver {
    fn on_event(&mut self, event: &TrainingEvent<'_>);
}

/// One progress bar per phase, "Epoch N" prefix with running loss/accuracy
#[derive(Default)]
pub struct ProgressObserver {
    bar: Option<ProgressBar>,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_event(&mut self, event: &TrainingEvent<'_>) {
        match *event {
            TrainingEvent::PhaseStarted {
                epoch,
                phase,
                batches,
            } => {
                let bar = ProgressBar::new(batches as u64);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{prefix} {msg} [{bar:40.cyan/blue}] {pos}/{len} [{elapsed_precise}]")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                bar.set_prefix(format!("Epoch {} {}", epoch, phase));
                self.bar = Some(bar);
            }
            TrainingEvent::BatchFinished { loss, accuracy, .. } => {
                if let Some(bar) = &self.bar {
                    bar.set_message(format!("loss={:.4} acc={:.4}", loss, accuracy));
                    bar.inc(1);
                }
            }
            TrainingEvent::PhaseFinished { .. } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish();
                }
            }
            _ => {}
        }
    }
}

/// Logs epoch results one key per line, plus run and checkpoint milestones
#[derive(Default)]
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

/// `    {key:15}: {value}` lines for an epoch's results
pub fn format_epoch_log(epoch: usize, log: &BTreeMap<String, f64>) -> Vec<String> {
    std::iter::once(format!("    {:15}: {}", "epoch", epoch))
        .chain(log.iter().map(|(key, value)| format!("    {:15}: {}", key, value)))
        .collect()
}

impl TrainingObserver for LogObserver {
    fn on_event(&mut self, event: &TrainingEvent<'_>) {
        match *event {
            TrainingEvent::RunStarted {
                run_id,
                start_epoch,
                epochs,
            } => {
                tracing::info!(run_id = %run_id, start_epoch, epochs, "Starting training");
            }
            TrainingEvent::EpochFinished { epoch, log } => {
                for line in format_epoch_log(epoch, log) {
                    tracing::info!("{}", line);
                }
            }
            TrainingEvent::CheckpointSaved {
                epoch,
                path,
                is_best,
            } => {
                tracing::debug!(epoch, path = %path.display(), is_best, "Checkpoint written");
            }
            TrainingEvent::RunFinished { best_accuracy } => {
                tracing::info!(best_accuracy, "Training finished");
            }
            _ => {}
        }
    }
}
