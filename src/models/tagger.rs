use rand::rngs::StdRng;

use super::layers::{Encoder, Linear, NextWordHead, argmax_from, dropout, token_rows};
use super::{FIRST_REAL_ID, Model, ModelOutput, Pass};
use crate::config::{Config, ModelKind};
use crate::data::dataset::XPOS;
use crate::data::{Minibatch, TokenPrediction, Vocabs};
use crate::graph::{Parameter, Tensor};

/// Predicts XPOS tags from words alone.
#[derive(Debug, Clone)]
pub struct Tagger {
    encoder: Encoder,
    mlp: Linear,
    output: Linear,
    next_word: NextWordHead,
    mlp_keep_prob: f64,
}

impl Tagger {
    pub fn new(config: &Config, vocabs: &Vocabs, rng: &mut StdRng) -> Self {
        let scale = config.layers.init_scale;
        let encoder = Encoder::new(config, vocabs.words.len(), None, rng);
        let mlp = Linear::new(
            "tagger/mlp",
            encoder.output_size(),
            config.layers.mlp_size,
            scale,
            rng,
        );
        let output = Linear::new(
            "tagger/output",
            config.layers.mlp_size,
            vocabs.tags.len(),
            scale,
            rng,
        );
        let next_word = NextWordHead::new(
            "tagger/next_word",
            encoder.recur_size(),
            vocabs.words.len(),
            scale,
            rng,
        );
        Self {
            encoder,
            mlp,
            output,
            next_word,
            mlp_keep_prob: config.regularization.mlp_keep_prob,
        }
    }
}

impl Model for Tagger {
    fn kind(&self) -> ModelKind {
        ModelKind::Tagger
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = self.encoder.parameters();
        params.extend(self.mlp.parameters());
        params.extend(self.output.parameters());
        params.extend(self.next_word.parameters());
        params
    }

    fn weights(&self) -> Vec<Tensor> {
        let mut weights = self.encoder.weights();
        weights.push(self.mlp.weight.tensor.clone());
        weights.push(self.output.weight.tensor.clone());
        weights
    }

    fn forward(&self, batch: &Minibatch, mut pass: Pass<'_>) -> ModelOutput {
        let encoded = self.encoder.forward(batch, XPOS, pass.rng());
        let n_tokens = batch.n_tokens();

        if let Pass::Pretrain(_) = pass {
            let (loss, n_correct) = self.next_word.loss(&encoded, batch);
            return ModelOutput {
                loss,
                n_correct,
                n_tokens,
                predictions: Vec::new(),
                regularizers: encoded.regularizers,
            };
        }

        let rows = token_rows(batch);
        let hidden = self.mlp.forward(&encoded.states.gather(&rows)).relu();
        let hidden = dropout(&hidden, self.mlp_keep_prob, pass.rng());
        let log_probs = self.output.forward(&hidden).log_softmax_rows();

        let gold: Vec<usize> = (0..batch.len())
            .flat_map(|b| (1..batch.lengths[b]).map(move |t| batch.rows[b][t][XPOS]))
            .collect();
        let n_tags = log_probs.cols();
        let data = log_probs.data();
        let predicted: Vec<usize> = data
            .chunks(n_tags)
            .map(|row| argmax_from(row, FIRST_REAL_ID))
            .collect();
        let n_correct = predicted.iter().zip(&gold).filter(|(p, g)| p == g).count();

        let predictions = match pass {
            Pass::Eval => {
                let mut remaining = predicted.iter();
                batch
                    .lengths
                    .iter()
                    .map(|len| {
                        remaining
                            .by_ref()
                            .take(len - 1)
                            .map(|&xpos| TokenPrediction {
                                xpos: Some(xpos),
                                ..TokenPrediction::default()
                            })
                            .collect()
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        let loss = log_probs.pick(&gold).sum().scale(-1.0 / n_tokens.max(1) as f64);
        ModelOutput {
            loss,
            n_correct,
            n_tokens,
            predictions,
            regularizers: encoded.regularizers,
        }
    }
}
