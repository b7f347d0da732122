// reid-trainer - Person re-identification training
// Library exports

pub mod config;
pub mod data; // Batch sources (synthetic identity clusters)
pub mod errors;
pub mod losses; // Softmax/triplet and center losses
pub mod metrics; // Metric tracking, scalar sinks, run aggregation
pub mod models; // Embedding networks
pub mod optim; // Checkpointable optimizers and lr schedule
pub mod training; // Run context, joint step, checkpoints, epoch loop
