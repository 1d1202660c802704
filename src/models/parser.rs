use std::iter;

use rand::rngs::StdRng;

use super::layers::{Encoder, Linear, NextWordHead, argmax_from, dropout, uniform};
use super::mst::decode_tree;
use super::{FIRST_REAL_ID, Model, ModelOutput, Pass};
use crate::config::{Config, ModelKind};
use crate::data::dataset::{HEAD, REL, XPOS};
use crate::data::{Minibatch, TokenPrediction, Vocabs};
use crate::graph::{Parameter, Tensor, add_n};

/// Biaffine graph-based dependency parser over words and XPOS tags.
///
/// Arc scores for a sentence are `D U H^T + 1 (H u)^T`, where `D` and `H`
/// are the dependent and head MLP outputs. Relations are classified from
/// the dependent, its head, and their elementwise product; training uses
/// gold heads, decoding uses the predicted tree.
#[derive(Debug, Clone)]
pub struct Parser {
    encoder: Encoder,
    arc_dep: Linear,
    arc_head: Linear,
    arc_weights: Parameter,
    arc_bias: Parameter,
    rel_dep: Linear,
    rel_head: Linear,
    rel_output: Linear,
    next_word: NextWordHead,
    mlp_keep_prob: f64,
}

/// Per-sentence MLP activations shared by the arc and relation scorers.
struct Activations {
    arc_dep: Tensor,
    arc_head: Tensor,
    rel_dep: Tensor,
    rel_head: Tensor,
}

impl Parser {
    pub fn new(config: &Config, vocabs: &Vocabs, rng: &mut StdRng) -> Self {
        let layers = &config.layers;
        let scale = layers.init_scale;
        let encoder = Encoder::new(config, vocabs.words.len(), Some(vocabs.tags.len()), rng);
        let input = encoder.output_size();

        let arc_dep = Linear::new("parser/arc_dep", input, layers.mlp_size, scale, rng);
        let arc_head = Linear::new("parser/arc_head", input, layers.mlp_size, scale, rng);
        let arc_weights = uniform(
            "parser/arcs/weights".to_string(),
            layers.mlp_size,
            layers.mlp_size,
            scale,
            rng,
        );
        let arc_bias = uniform("parser/arcs/head_bias".to_string(), layers.mlp_size, 1, scale, rng);
        let rel_dep = Linear::new("parser/rel_dep", input, layers.rel_mlp_size, scale, rng);
        let rel_head = Linear::new("parser/rel_head", input, layers.rel_mlp_size, scale, rng);
        let rel_output = Linear::new(
            "parser/rels",
            3 * layers.rel_mlp_size,
            vocabs.rels.len(),
            scale,
            rng,
        );
        let next_word = NextWordHead::new(
            "parser/next_word",
            encoder.recur_size(),
            vocabs.words.len(),
            scale,
            rng,
        );

        Self {
            encoder,
            arc_dep,
            arc_head,
            arc_weights,
            arc_bias,
            rel_dep,
            rel_head,
            rel_output,
            next_word,
            mlp_keep_prob: config.regularization.mlp_keep_prob,
        }
    }

    /// `[len - 1, len]` log-probabilities of each token's head.
    fn arc_log_probs(&self, acts: &Activations, rows: &[usize]) -> Tensor {
        let deps = acts.arc_dep.gather(&rows[1..]);
        let heads = acts.arc_head.gather(rows);
        let head_bias = heads.matmul(&self.arc_bias.tensor).transpose();
        deps.matmul(&self.arc_weights.tensor)
            .matmul(&heads.transpose())
            .add_row(&head_bias)
            .log_softmax_rows()
    }

    /// `[len - 1, n_rels]` log-probabilities of each token's relation to
    /// `heads` (sentence positions).
    fn rel_log_probs(&self, acts: &Activations, rows: &[usize], heads: &[usize]) -> Tensor {
        let deps = acts.rel_dep.gather(&rows[1..]);
        let head_rows: Vec<usize> = heads.iter().map(|&head| rows[head]).collect();
        let heads = acts.rel_head.gather(&head_rows);
        let features = Tensor::concat_cols(&[deps.clone(), heads.clone(), deps.mul(&heads)]);
        self.rel_output.forward(&features).log_softmax_rows()
    }
}

impl Model for Parser {
    fn kind(&self) -> ModelKind {
        ModelKind::Parser
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = self.encoder.parameters();
        params.extend(self.arc_dep.parameters());
        params.extend(self.arc_head.parameters());
        params.push(self.arc_weights.clone());
        params.push(self.arc_bias.clone());
        params.extend(self.rel_dep.parameters());
        params.extend(self.rel_head.parameters());
        params.extend(self.rel_output.parameters());
        params.extend(self.next_word.parameters());
        params
    }

    fn weights(&self) -> Vec<Tensor> {
        let mut weights = self.encoder.weights();
        weights.extend(
            [
                &self.arc_dep.weight,
                &self.arc_head.weight,
                &self.arc_weights,
                &self.rel_dep.weight,
                &self.rel_head.weight,
                &self.rel_output.weight,
            ]
            .into_iter()
            .map(|param| param.tensor.clone()),
        );
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

        let keep = self.mlp_keep_prob;
        let states = &encoded.states;
        let acts = Activations {
            arc_dep: dropout(&self.arc_dep.forward(states).relu(), keep, pass.rng()),
            arc_head: dropout(&self.arc_head.forward(states).relu(), keep, pass.rng()),
            rel_dep: dropout(&self.rel_dep.forward(states).relu(), keep, pass.rng()),
            rel_head: dropout(&self.rel_head.forward(states).relu(), keep, pass.rng()),
        };
        let decode = matches!(pass, Pass::Eval);

        let batch_size = batch.len();
        let mut terms = Vec::with_capacity(2 * batch_size);
        let mut n_correct = 0;
        let mut predictions = Vec::new();
        for b in 0..batch_size {
            let len = batch.lengths[b];
            let rows: Vec<usize> = (0..len).map(|t| t * batch_size + b).collect();
            let gold_heads: Vec<usize> = (1..len).map(|t| batch.rows[b][t][HEAD]).collect();
            let gold_rels: Vec<usize> = (1..len).map(|t| batch.rows[b][t][REL]).collect();

            let arc_log_probs = self.arc_log_probs(&acts, &rows);
            let rel_log_probs = self.rel_log_probs(&acts, &rows, &gold_heads);
            terms.push(arc_log_probs.pick(&gold_heads).sum());
            terms.push(rel_log_probs.pick(&gold_rels).sum());

            let arc_data = arc_log_probs.data();
            let rel_data = rel_log_probs.data();
            let n_rels = rel_log_probs.cols();
            n_correct += arc_data
                .chunks(len)
                .zip(rel_data.chunks(n_rels))
                .zip(gold_heads.iter().zip(&gold_rels))
                .filter(|((arcs, rels), (head, rel))| {
                    argmax_from(arcs, 0) == **head && argmax_from(rels, FIRST_REAL_ID) == **rel
                })
                .count();

            if decode {
                let scores: Vec<Vec<f64>> = iter::once(vec![f64::NEG_INFINITY; len])
                    .chain(arc_data.chunks(len).map(<[f64]>::to_vec))
                    .collect();
                let heads = decode_tree(&scores).split_off(1);
                let rel_data = self.rel_log_probs(&acts, &rows, &heads).data();
                predictions.push(
                    heads
                        .iter()
                        .zip(rel_data.chunks(n_rels))
                        .map(|(&head, rels)| TokenPrediction {
                            head: Some(head),
                            rel: Some(argmax_from(rels, FIRST_REAL_ID)),
                            ..TokenPrediction::default()
                        })
                        .collect(),
                );
            }
        }

        let loss = add_n(&terms).scale(-1.0 / n_tokens.max(1) as f64);
        ModelOutput {
            loss,
            n_correct,
            n_tokens,
            predictions,
            regularizers: encoded.regularizers,
        }
    }
}
