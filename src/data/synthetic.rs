// Synthetic re-id dataset
// Gaussian identity clusters in input space, generated from the run seed

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{Batch, BatchSource, Phase};
use crate::config::DataSettings;
use crate::errors::{Result, TrainError};
use crate::models::common::normal_samples;

/// Samples of one split, row-major
struct Split {
    inputs: Vec<f32>,
    labels: Vec<u32>,
}

impl Split {
    fn len(&self) -> usize {
        self.labels.len()
    }
}

pub struct SyntheticReid {
    train: Split,
    val: Split,
    input_dim: usize,
    batch_size: usize,
    num_classes: usize,
    seed: u64,
}

impl SyntheticReid {
    pub fn new(settings: &DataSettings, seed: u64) -> Result<Self> {
        if settings.batch_size == 0 {
            return Err(TrainError::config("data.batch_size must be positive"));
        }
        if settings.num_classes == 0 || settings.input_dim == 0 {
            return Err(TrainError::config(
                "data.num_classes and data.input_dim must be positive",
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let centers = normal_samples(&mut rng, settings.num_classes * settings.input_dim);

        let train = generate_split(&centers, settings, settings.train_per_class, &mut rng);
        let val = generate_split(&centers, settings, settings.val_per_class, &mut rng);

        tracing::info!(
            classes = settings.num_classes,
            train = train.len(),
            val = val.len(),
            "Generated synthetic re-id data"
        );

        Ok(Self {
            train,
            val,
            input_dim: settings.input_dim,
            batch_size: settings.batch_size,
            num_classes: settings.num_classes,
            seed,
        })
    }

    fn split(&self, phase: Phase) -> &Split {
        match phase {
            Phase::Train => &self.train,
            Phase::Validation => &self.val,
        }
    }

    fn make_batch(&self, split: &Split, ids: &[usize]) -> Result<Batch> {
        let mut inputs = Vec::with_capacity(ids.len() * self.input_dim);
        let mut labels = Vec::with_capacity(ids.len());
        for &id in ids {
            let row = id * self.input_dim;
            inputs.extend_from_slice(&split.inputs[row..row + self.input_dim]);
            labels.push(split.labels[id]);
        }
        Ok(Batch {
            inputs: Tensor::from_vec(inputs, (ids.len(), self.input_dim), &Device::Cpu)?,
            labels: Tensor::from_vec(labels, ids.len(), &Device::Cpu)?,
            ids: ids.to_vec(),
        })
    }
}

impl BatchSource for SyntheticReid {
    fn num_batches(&self, phase: Phase) -> usize {
        self.split(phase).len().div_ceil(self.batch_size)
    }

    /// Train order is shuffled from `seed + epoch`; validation order is fixed
    fn batches(&mut self, phase: Phase, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let mut order: Vec<usize> = (0..self.split(phase).len()).collect();
        if phase == Phase::Train {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let this: &Self = self;
        let chunks: Vec<Vec<usize>> = order
            .chunks(this.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Box::new(
            chunks
                .into_iter()
                .map(move |ids| this.make_batch(this.split(phase), &ids)),
        )
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// `per_class` noisy samples around every identity center
fn generate_split(
    centers: &[f32],
    settings: &DataSettings,
    per_class: usize,
    rng: &mut StdRng,
) -> Split {
    let dim = settings.input_dim;
    let count = settings.num_classes * per_class;
    let noise = normal_samples(rng, count * dim);

    let mut inputs = Vec::with_capacity(count * dim);
    let mut labels = Vec::with_capacity(count);
    for class in 0..settings.num_classes {
        let center = &centers[class * dim..(class + 1) * dim];
        for sample in 0..per_class {
            let offset = (class * per_class + sample) * dim;
            inputs.extend(
                center
                    .iter()
                    .zip(&noise[offset..offset + dim])
                    .map(|(c, n)| c + settings.noise * n),
            );
            labels.push(class as u32);
        }
    }
    Split { inputs, labels }
}
