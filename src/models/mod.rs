mod layers;
mod mst;
mod parser;
mod tagger;

use std::fmt::Write as _;

use rand::rngs::StdRng;

use crate::config::{Config, ModelKind};
use crate::data::dataset::{HEAD, REL, WORD, XPOS};
use crate::data::{Minibatch, TokenPrediction, Vocabs};
use crate::graph::{Parameter, Tensor};

pub use layers::Regularizers;
pub use mst::{chu_liu_edmonds, decode_tree, tree_score};
pub use parser::Parser;
pub use tagger::Tagger;

/// First vocabulary id that is not PAD, ROOT or UNK; predictions never
/// pick a reserved id.
const FIRST_REAL_ID: usize = crate::data::vocab::UNK_ID + 1;

/// Which graph a forward call builds. Training passes carry the dropout RNG.
pub enum Pass<'a> {
    Pretrain(&'a mut StdRng),
    Train(&'a mut StdRng),
    Eval,
}

impl Pass<'_> {
    fn rng(&mut self) -> Option<&mut StdRng> {
        match self {
            Self::Pretrain(rng) | Self::Train(rng) => Some(&mut **rng),
            Self::Eval => None,
        }
    }
}

#[derive(Debug)]
pub struct ModelOutput {
    /// Scalar objective for the pass: the pretrain loss on
    /// `Pass::Pretrain`, the supervised loss otherwise.
    pub loss: Tensor,
    pub n_correct: usize,
    pub n_tokens: usize,
    /// One entry per sentence (ROOT excluded); filled on `Pass::Eval` only.
    pub predictions: Vec<Vec<TokenPrediction>>,
    pub regularizers: Regularizers,
}

pub trait Model {
    fn kind(&self) -> ModelKind;

    /// Every trainable tensor, named.
    fn parameters(&self) -> Vec<Parameter>;

    /// Matrices that take the L2 penalty.
    fn weights(&self) -> Vec<Tensor>;

    fn forward(&self, batch: &Minibatch, pass: Pass<'_>) -> ModelOutput;
}

pub fn build_model(
    kind: ModelKind,
    config: &Config,
    vocabs: &Vocabs,
    rng: &mut StdRng,
) -> Box<dyn Model> {
    match kind {
        ModelKind::Tagger => Box::new(Tagger::new(config, vocabs, rng)),
        ModelKind::Parser => Box::new(Parser::new(config, vocabs, rng)),
    }
}

/// Human-readable gold/predicted dump of one minibatch:
/// `word gold_tag pred_tag gold_head pred_head gold_rel pred_rel`.
pub fn sanity_check(
    batch: &Minibatch,
    predictions: &[Vec<TokenPrediction>],
    vocabs: &Vocabs,
) -> String {
    let mut out = String::new();
    let or_blank = |value: Option<String>| value.unwrap_or_else(|| "_".to_string());
    for (rows, (len, preds)) in batch
        .rows
        .iter()
        .zip(batch.lengths.iter().zip(predictions))
    {
        for (row, pred) in rows[1..*len].iter().zip(preds) {
            let word = vocabs.words.get(row[WORD]).unwrap_or("_");
            let gold_tag = vocabs.tags.get(row[XPOS]).unwrap_or("_");
            let gold_rel = vocabs.rels.get(row[REL]).unwrap_or("_");
            let pred_tag = or_blank(pred.xpos.and_then(|id| vocabs.tags.get(id)).map(str::to_string));
            let pred_head = or_blank(pred.head.map(|head| head.to_string()));
            let pred_rel = or_blank(pred.rel.and_then(|id| vocabs.rels.get(id)).map(str::to_string));
            let _ = writeln!(
                out,
                "{word}\t{gold_tag}\t{pred_tag}\t{}\t{pred_head}\t{gold_rel}\t{pred_rel}",
                row[HEAD]
            );
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{Model, Pass, sanity_check};
    use crate::config::Config;
    use crate::data::conll::parse_conll;
    use crate::data::conll::tests::TREEBANK;
    use crate::data::{Dataset, Minibatch, TokenPrediction, Vocabs};
    use crate::graph::Radam;

    pub(crate) fn tiny_config() -> Config {
        let mut config = Config::default();
        config.layers.word_embed_size = 6;
        config.layers.tag_embed_size = 4;
        config.layers.recur_size = 5;
        config.layers.mlp_size = 6;
        config.layers.rel_mlp_size = 4;
        config.radam.learning_rate = 2e-2;
        config.radam.epsilon = 1e-8;
        config.regularization.embed_keep_prob = 1.0;
        config.regularization.mlp_keep_prob = 1.0;
        config
    }

    pub(crate) fn treebank_batch() -> (Vocabs, Minibatch) {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocabs = Vocabs::from_training(&sentences, 1, false);
        let dataset = Dataset::new("Trainset", sentences, &vocabs, 1).expect("dataset");
        let batch = dataset
            .minibatches::<StdRng>(1000, None)
            .into_iter()
            .next()
            .expect("one batch");
        (vocabs, batch)
    }

    /// Runs `steps` updates on one batch and returns the first and last loss.
    pub(crate) fn fit(model: &dyn Model, config: &Config, batch: &Minibatch, steps: usize) -> (f64, f64) {
        let params = model.parameters();
        let mut optimizer = Radam::new(config.radam);
        let mut rng = StdRng::seed_from_u64(9);
        let mut losses = Vec::with_capacity(steps);
        for _ in 0..steps {
            for param in &params {
                param.tensor.zero_grad();
            }
            let output = model.forward(batch, Pass::Train(&mut rng));
            losses.push(output.loss.item());
            output.loss.backward();
            optimizer.step(&params);
        }
        (losses[0], losses[steps - 1])
    }

    #[test]
    fn sanity_check_lists_every_token() {
        let (vocabs, batch) = treebank_batch();
        let predictions: Vec<_> = batch
            .lengths
            .iter()
            .map(|len| vec![TokenPrediction::default(); len - 1])
            .collect();
        let text = sanity_check(&batch, &predictions, &vocabs);
        let token_lines = text.lines().filter(|line| !line.is_empty()).count();
        assert_eq!(token_lines, batch.n_tokens());
        assert!(text.lines().any(|line| line.starts_with("barks\tVBZ\t_\t0\t_\troot")));
    }
}
