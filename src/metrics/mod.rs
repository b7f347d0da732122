// Metrics module
// Per-epoch averaging, scalar sinks and offline aggregation of runs

mod aggregator;
mod sink;
mod tracker;

pub use aggregator::{aggregate, valid_filename, AGGREGATES_DIR};
pub use sink::{read_scalars, MemorySink, MetricsSink, ScalarEvent, ScalarWriter, SCALARS_FILE};
pub use tracker::MetricTracker;
