// Training module - run context, joint optimization step, checkpoints and the epoch loop

pub mod checkpoint;
pub mod context;
pub mod joint_step;
pub mod mirror;
pub mod observer;
pub mod trainer;

pub use checkpoint::{
    CheckpointHeader, CheckpointStore, OptimizationState, BEST_CHECKPOINT,
    CHECKPOINT_SCHEMA_VERSION, LAST_CHECKPOINT,
};
pub use context::{new_run_id, RunContext, RUN_ID_FORMAT};
pub use joint_step::{JointStep, StepStage};
pub use mirror::mirror_dir;
pub use observer::{format_epoch_log, LogObserver, ProgressObserver, TrainingEvent, TrainingObserver};
pub use trainer::{EpochResult, Trainer, TrainingParts, TrainingSummary, METRICS};
