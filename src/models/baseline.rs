// Baseline embedding model
// Two-layer MLP backbone producing the embedding, linear classifier on top

use candle_core::{Device, Module, Tensor, Var};
use candle_nn::{Dropout, Linear};
use rand::rngs::StdRng;

use super::common::{uniform_var, EmbeddingModel, Mode, ModelOutput};
use crate::config::ModelSettings;
use crate::errors::Result;

pub struct Baseline {
    fc1: Linear,
    fc2: Linear,
    classifier: Linear,
    dropout: Dropout,
    dropout_p: f32,
    feature_dim: usize,
    params: Vec<(String, Var)>,
}

impl Baseline {
    /// Create a baseline with seeded kaiming-uniform init
    pub fn new(
        input_dim: usize,
        num_classes: usize,
        settings: &ModelSettings,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let hidden = settings.feature_dim * 2;
        let mut params = Vec::new();

        let fc1 = linear(input_dim, hidden, true, "backbone.fc1", rng, device, &mut params)?;
        let fc2 = linear(
            hidden,
            settings.feature_dim,
            true,
            "backbone.fc2",
            rng,
            device,
            &mut params,
        )?;
        // No bias on the classifier, as in the re-id baseline head
        let classifier = linear(
            settings.feature_dim,
            num_classes,
            false,
            "classifier",
            rng,
            device,
            &mut params,
        )?;
        params.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::debug!(
            input_dim,
            feature_dim = settings.feature_dim,
            num_classes,
            parameters = params.len(),
            "Built baseline model"
        );

        Ok(Self {
            fc1,
            fc2,
            classifier,
            dropout: Dropout::new(settings.dropout),
            dropout_p: settings.dropout,
            feature_dim: settings.feature_dim,
            params,
        })
    }
}

impl EmbeddingModel for Baseline {
    fn forward(&self, inputs: &Tensor, mode: Mode) -> Result<ModelOutput> {
        let hidden = self.fc1.forward(inputs)?.relu()?;
        let features = self.fc2.forward(&hidden)?;

        let head_input = if mode.is_train() && self.dropout_p > 0.0 {
            self.dropout.forward(&features, true)?
        } else {
            features.clone()
        };
        let scores = self.classifier.forward(&head_input)?;

        Ok(ModelOutput { scores, features })
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.params.clone()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

fn linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    prefix: &str,
    rng: &mut StdRng,
    device: &Device,
    params: &mut Vec<(String, Var)>,
) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f32).sqrt();
    let weight = uniform_var(rng, (out_dim, in_dim), bound, device)?;
    params.push((format!("{}.weight", prefix), weight.clone()));

    let bias = if bias {
        let b = uniform_var(rng, out_dim, bound, device)?;
        params.push((format!("{}.bias", prefix), b.clone()));
        Some(b.as_tensor().clone())
    } else {
        None
    };

    Ok(Linear::new(weight.as_tensor().clone(), bias))
}
