// Aggregates scalar logs of several runs into one CSV per tag
//
// All runs must record the same tags, and each tag must have the same step
// sequence in every run.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::sink::{read_scalars, ScalarEvent, SCALARS_FILE};
use crate::errors::{Result, TrainError};

/// Subdirectory the CLI writes aggregates into by default
pub const AGGREGATES_DIR: &str = "aggregates";

/// Events of one run, grouped by tag, in step order of emission
type RunScalars = BTreeMap<String, Vec<ScalarEvent>>;

fn extract(log_root: &Path, run: &str) -> Result<RunScalars> {
    let path = log_root.join(run).join(SCALARS_FILE);
    if !path.exists() {
        return Err(TrainError::data(format!(
            "run '{}' has no scalar log at {}",
            run,
            path.display()
        )));
    }

    let mut by_tag: RunScalars = BTreeMap::new();
    for event in read_scalars(&path)? {
        by_tag.entry(event.tag.clone()).or_default().push(event);
    }
    Ok(by_tag)
}

/// Characters not allowed in an aggregate file name
static INVALID_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^-\w.]").expect("Failed to compile filename regex"));

/// Turn a tag into a safe file stem (`Loss/Train` → `LossTrain`)
pub fn valid_filename(tag: &str) -> String {
    let spaced = tag.trim().replace(' ', "_");
    INVALID_FILENAME_CHARS.replace_all(&spaced, "").into_owned()
}

/// Aggregate `runs` under `log_root`, writing `<tag>.csv` files to `output_dir`
///
/// Returns the number of rows written per tag.
pub fn aggregate(
    log_root: &Path,
    runs: &[String],
    output_dir: &Path,
) -> Result<BTreeMap<String, usize>> {
    if runs.is_empty() {
        return Err(TrainError::data("no runs given to aggregate"));
    }

    let extracted = runs
        .iter()
        .map(|run| extract(log_root, run))
        .collect::<Result<Vec<_>>>()?;

    let keys: Vec<&String> = extracted[0].keys().collect();
    for (run, scalars) in runs.iter().zip(&extracted).skip(1) {
        if scalars.keys().collect::<Vec<_>>() != keys {
            return Err(TrainError::data(format!(
                "all runs need the same scalar tags; '{}' has {:?}, '{}' has {:?}",
                runs[0],
                keys,
                run,
                scalars.keys().collect::<Vec<_>>()
            )));
        }
    }

    for key in &keys {
        let step_sets: Vec<Vec<usize>> = extracted
            .iter()
            .map(|scalars| scalars[*key].iter().map(|e| e.step).collect())
            .collect();
        if step_sets.iter().any(|steps| steps != &step_sets[0]) {
            return Err(TrainError::data(format!(
                "step numbering or count for '{}' differs between runs: {:?}",
                key,
                step_sets.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
    }

    fs::create_dir_all(output_dir)?;
    let mut rows = BTreeMap::new();
    for key in keys {
        let file = output_dir.join(format!("{}.csv", valid_filename(key)));
        let mut writer = csv::Writer::from_path(&file)?;
        writer.write_record(["Wall time", "Step", "Value", "Run"])?;
        let mut count = 0;
        for (run, scalars) in runs.iter().zip(&extracted) {
            for event in &scalars[key] {
                writer.write_record([
                    event.wall_time.to_string(),
                    event.step.to_string(),
                    event.value.to_string(),
                    run.clone(),
                ])?;
                count += 1;
            }
        }
        writer.flush()?;
        tracing::debug!(tag = %key, rows = count, path = %file.display(), "Wrote aggregate");
        rows.insert(key.clone(), count);
    }

    tracing::info!(runs = runs.len(), tags = rows.len(), "Aggregated runs");
    Ok(rows)
}
