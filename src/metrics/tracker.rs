// Streaming mean accumulator for a fixed set of named metrics

use std::collections::BTreeMap;

use crate::errors::{Result, TrainError};

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    count: usize,
}

/// Running averages for one phase (train or validation)
#[derive(Debug, Clone)]
pub struct MetricTracker {
    metrics: BTreeMap<String, Accumulator>,
}

impl MetricTracker {
    /// Create a tracker for exactly these metric names
    pub fn new(names: &[&str]) -> Self {
        Self {
            metrics: names
                .iter()
                .map(|name| (name.to_string(), Accumulator::default()))
                .collect(),
        }
    }

    /// Zero every accumulator
    pub fn reset(&mut self) {
        for acc in self.metrics.values_mut() {
            *acc = Accumulator::default();
        }
    }

    pub fn update(&mut self, name: &str, value: f64) -> Result<()> {
        let acc = self
            .metrics
            .get_mut(name)
            .ok_or_else(|| TrainError::UnknownMetric(name.to_string()))?;
        acc.sum += value;
        acc.count += 1;
        Ok(())
    }

    /// Mean of the values since the last reset
    pub fn avg(&self, name: &str) -> Result<f64> {
        let acc = self
            .metrics
            .get(name)
            .ok_or_else(|| TrainError::UnknownMetric(name.to_string()))?;
        if acc.count == 0 {
            return Err(TrainError::EmptyMetric(name.to_string()));
        }
        Ok(acc.sum / acc.count as f64)
    }

    /// Updates since the last reset
    pub fn count(&self, name: &str) -> Result<usize> {
        self.metrics
            .get(name)
            .map(|acc| acc.count)
            .ok_or_else(|| TrainError::UnknownMetric(name.to_string()))
    }

    /// All averages, keyed by metric name
    pub fn result(&self) -> Result<BTreeMap<String, f64>> {
        self.metrics
            .keys()
            .map(|name| Ok((name.clone(), self.avg(name)?)))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }
}
