use rand::Rng;
use rand::rngs::StdRng;

use crate::config::{Config, LayersConfig};
use crate::data::Minibatch;
use crate::graph::{Parameter, Tensor, add_n};

pub(crate) fn uniform(name: String, rows: usize, cols: usize, scale: f64, rng: &mut StdRng) -> Parameter {
    let tensor = Tensor::from_fn(rows, cols, |_, _| rng.gen_range(-scale..=scale));
    Parameter::new(name, tensor)
}

/// Multiplies by a fresh keep-mask scaled by `1 / keep_prob`; identity
/// outside training or when `keep_prob` is 1.
pub(crate) fn dropout(x: &Tensor, keep_prob: f64, rng: Option<&mut StdRng>) -> Tensor {
    let Some(rng) = rng else {
        return x.clone();
    };
    if keep_prob >= 1.0 {
        return x.clone();
    }
    let (rows, cols) = x.shape();
    let mask = Tensor::from_fn(rows, cols, |_, _| {
        if rng.gen_bool(keep_prob) {
            1.0 / keep_prob
        } else {
            0.0
        }
    });
    x.mul(&mask)
}

/// Index of the best entry at or after `start`; falls back to the overall
/// best when nothing lies past `start`.
pub(crate) fn argmax_from(row: &[f64], start: usize) -> usize {
    let start = if start < row.len() { start } else { 0 };
    row.iter()
        .enumerate()
        .skip(start)
        .fold((start, f64::NEG_INFINITY), |best, (idx, value)| {
            if *value > best.1 { (idx, *value) } else { best }
        })
        .0
}

#[derive(Debug, Clone)]
pub(crate) struct Linear {
    pub weight: Parameter,
    pub bias: Parameter,
}

impl Linear {
    pub fn new(name: &str, inputs: usize, outputs: usize, scale: f64, rng: &mut StdRng) -> Self {
        Self {
            weight: uniform(format!("{name}/weights"), inputs, outputs, scale, rng),
            bias: Parameter::new(format!("{name}/biases"), Tensor::zeros(1, outputs)),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.weight.tensor).add_row(&self.bias.tensor)
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Regulariser terms collected while building a forward pass.
#[derive(Debug, Clone, Default)]
pub struct Regularizers {
    pub recur: Vec<Tensor>,
    pub covar: Vec<Tensor>,
    pub ortho: Vec<Tensor>,
}

#[derive(Debug, Clone)]
struct Recurrent {
    input: Parameter,
    recur: Parameter,
    bias: Parameter,
}

impl Recurrent {
    fn new(name: &str, inputs: usize, size: usize, scale: f64, rng: &mut StdRng) -> Self {
        Self {
            input: uniform(format!("{name}/input"), inputs, size, scale, rng),
            recur: uniform(format!("{name}/recur"), size, size, scale, rng),
            bias: Parameter::new(format!("{name}/biases"), Tensor::zeros(1, size)),
        }
    }

    /// Runs over `inputs` (time-major, `[batch, in]` each) and returns the
    /// state at every step in time order. Padded steps carry the previous
    /// state through unchanged.
    fn run(&self, inputs: &[Tensor], masks: &[(Tensor, Tensor)], reverse: bool) -> Vec<Tensor> {
        let batch = inputs.first().map_or(0, Tensor::rows);
        let size = self.recur.tensor.rows();
        let mut state = Tensor::zeros(batch, size);
        let mut states = vec![state.clone(); inputs.len()];
        let order: Vec<usize> = if reverse {
            (0..inputs.len()).rev().collect()
        } else {
            (0..inputs.len()).collect()
        };
        for t in order {
            let (keep, carry) = &masks[t];
            let candidate = inputs[t]
                .matmul(&self.input.tensor)
                .add(&state.matmul(&self.recur.tensor))
                .add_row(&self.bias.tensor)
                .tanh();
            state = candidate.mul(keep).add(&state.mul(carry));
            states[t] = state.clone();
        }
        states
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.input.clone(), self.recur.clone(), self.bias.clone()]
    }
}

/// Mean squared change of the hidden-state norm between consecutive steps.
fn norm_stabilizer(states: &[Tensor], n_tokens: usize) -> Tensor {
    let norms: Vec<Tensor> = states.iter().map(Tensor::row_norms).collect();
    let terms: Vec<Tensor> = norms
        .windows(2)
        .map(|pair| {
            let diff = pair[1].sub(&pair[0]);
            diff.mul(&diff).sum()
        })
        .collect();
    add_n(&terms).scale(1.0 / n_tokens.max(1) as f64)
}

/// Sum of squared off-diagonal entries of the covariance of `states` rows.
fn covariance_penalty(states: &Tensor) -> Tensor {
    let (n, dims) = states.shape();
    let ones = Tensor::constant(1, n, 1.0 / n.max(1) as f64);
    let mean = ones.matmul(states);
    let centered = states.add_row(&mean.scale(-1.0));
    let covariance = centered.transpose().matmul(&centered).scale(1.0 / n.max(1) as f64);
    let off_diagonal = Tensor::from_fn(dims, dims, |i, j| if i == j { 0.0 } else { 1.0 });
    let masked = covariance.mul(&off_diagonal);
    masked.mul(&masked).sum()
}

/// `||W^T W - I||^2`.
fn orthogonality_penalty(weight: &Tensor) -> Tensor {
    let size = weight.cols();
    let identity = Tensor::from_fn(size, size, |i, j| if i == j { 1.0 } else { 0.0 });
    let diff = weight.transpose().matmul(weight).sub(&identity);
    diff.mul(&diff).sum()
}

#[derive(Debug)]
pub(crate) struct EncoderOutput {
    /// `[max_len * batch, 2 * recur_size]`, row `t * batch + b`.
    pub states: Tensor,
    /// Last layer, forward direction, one `[batch, recur_size]` per step.
    pub forward_states: Vec<Tensor>,
    pub regularizers: Regularizers,
}

/// Word (and optionally tag) embeddings followed by stacked bidirectional
/// tanh recurrences.
#[derive(Debug, Clone)]
pub(crate) struct Encoder {
    word_embed: Parameter,
    tag_embed: Option<Parameter>,
    layers: Vec<(Recurrent, Recurrent)>,
    embed_keep_prob: f64,
}

impl Encoder {
    pub fn new(
        config: &Config,
        n_words: usize,
        n_tags: Option<usize>,
        rng: &mut StdRng,
    ) -> Self {
        let LayersConfig {
            word_embed_size,
            tag_embed_size,
            recur_size,
            n_recur,
            init_scale,
            ..
        } = config.layers;

        let word_embed = uniform(
            "encoder/word_embed".to_string(),
            n_words,
            word_embed_size,
            init_scale,
            rng,
        );
        let tag_embed = n_tags.map(|n_tags| {
            uniform(
                "encoder/tag_embed".to_string(),
                n_tags,
                tag_embed_size,
                init_scale,
                rng,
            )
        });
        let mut input_size = word_embed_size + tag_embed.as_ref().map_or(0, |_| tag_embed_size);
        let mut layers = Vec::with_capacity(n_recur.max(1));
        for layer in 0..n_recur.max(1) {
            let fw = Recurrent::new(&format!("encoder/rnn{layer}/fw"), input_size, recur_size, init_scale, rng);
            let bw = Recurrent::new(&format!("encoder/rnn{layer}/bw"), input_size, recur_size, init_scale, rng);
            layers.push((fw, bw));
            input_size = 2 * recur_size;
        }

        Self {
            word_embed,
            tag_embed,
            layers,
            embed_keep_prob: config.regularization.embed_keep_prob,
        }
    }

    pub fn output_size(&self) -> usize {
        2 * self.layers[0].0.recur.tensor.rows()
    }

    pub fn recur_size(&self) -> usize {
        self.layers[0].0.recur.tensor.rows()
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.word_embed.clone()];
        params.extend(self.tag_embed.clone());
        for (fw, bw) in &self.layers {
            params.extend(fw.parameters());
            params.extend(bw.parameters());
        }
        params
    }

    pub fn weights(&self) -> Vec<Tensor> {
        self.layers
            .iter()
            .flat_map(|(fw, bw)| {
                [
                    fw.input.tensor.clone(),
                    fw.recur.tensor.clone(),
                    bw.input.tensor.clone(),
                    bw.recur.tensor.clone(),
                ]
            })
            .collect()
    }

    pub fn forward(&self, batch: &Minibatch, tag_column: usize, mut rng: Option<&mut StdRng>) -> EncoderOutput {
        let batch_size = batch.len();
        let max_len = batch.max_len;
        let recur_size = self.recur_size();

        let masks: Vec<(Tensor, Tensor)> = (0..max_len)
            .map(|t| {
                let valid = |b: usize| if t < batch.lengths[b] { 1.0 } else { 0.0 };
                (
                    Tensor::from_fn(batch_size, recur_size, |b, _| valid(b)),
                    Tensor::from_fn(batch_size, recur_size, |b, _| 1.0 - valid(b)),
                )
            })
            .collect();

        let mut inputs: Vec<Tensor> = (0..max_len)
            .map(|t| {
                let words = self
                    .word_embed
                    .tensor
                    .gather(&batch.column(crate::data::dataset::WORD, t));
                let embedded = match &self.tag_embed {
                    Some(tag_embed) => {
                        let tags = tag_embed.tensor.gather(&batch.column(tag_column, t));
                        Tensor::concat_cols(&[words, tags])
                    }
                    None => words,
                };
                dropout(&embedded, self.embed_keep_prob, rng.as_deref_mut())
            })
            .collect();

        let mut regularizers = Regularizers::default();
        let n_tokens = batch.lengths.iter().sum::<usize>();
        let mut forward_states = Vec::new();
        for (fw, bw) in &self.layers {
            let fw_states = fw.run(&inputs, &masks, false);
            let bw_states = bw.run(&inputs, &masks, true);
            regularizers.recur.push(norm_stabilizer(&fw_states, n_tokens));
            regularizers.recur.push(norm_stabilizer(&bw_states, n_tokens));
            regularizers.ortho.push(orthogonality_penalty(&fw.recur.tensor));
            regularizers.ortho.push(orthogonality_penalty(&bw.recur.tensor));
            inputs = fw_states
                .iter()
                .zip(&bw_states)
                .map(|(f, b)| Tensor::concat_cols(&[f.clone(), b.clone()]))
                .collect();
            forward_states = fw_states;
        }

        let states = Tensor::concat_rows(&inputs);
        let valid_rows: Vec<usize> = (0..batch_size)
            .flat_map(|b| (0..batch.lengths[b]).map(move |t| t * batch_size + b))
            .collect();
        regularizers
            .covar
            .push(covariance_penalty(&states.gather(&valid_rows)));

        EncoderOutput {
            states,
            forward_states,
            regularizers,
        }
    }
}

/// Predicts each word from the forward state of the word before it; the
/// pretraining objective for the encoder.
#[derive(Debug, Clone)]
pub(crate) struct NextWordHead {
    output: Linear,
}

impl NextWordHead {
    pub fn new(name: &str, recur_size: usize, n_words: usize, scale: f64, rng: &mut StdRng) -> Self {
        Self {
            output: Linear::new(name, recur_size, n_words, scale, rng),
        }
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        self.output.parameters()
    }

    /// Mean negative log-likelihood over real tokens, and how many were
    /// predicted exactly.
    pub fn loss(&self, encoded: &EncoderOutput, batch: &Minibatch) -> (Tensor, usize) {
        let batch_size = batch.len();
        let previous = Tensor::concat_rows(&encoded.forward_states[..batch.max_len - 1]);
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for b in 0..batch_size {
            for t in 1..batch.lengths[b] {
                rows.push((t - 1) * batch_size + b);
                targets.push(batch.rows[b][t][crate::data::dataset::WORD]);
            }
        }
        let log_probs = self
            .output
            .forward(&previous.gather(&rows))
            .log_softmax_rows();
        let n_words = log_probs.cols();
        let data = log_probs.data();
        let n_correct = targets
            .iter()
            .enumerate()
            .filter(|(i, target)| argmax_from(&data[i * n_words..(i + 1) * n_words], 0) == **target)
            .count();
        let loss = log_probs
            .pick(&targets)
            .sum()
            .scale(-1.0 / targets.len().max(1) as f64);
        (loss, n_correct)
    }
}

/// Row indices into `EncoderOutput::states` for every real token (ROOT
/// excluded), sentence by sentence.
pub(crate) fn token_rows(batch: &Minibatch) -> Vec<usize> {
    let batch_size = batch.len();
    (0..batch_size)
        .flat_map(|b| (1..batch.lengths[b]).map(move |t| t * batch_size + b))
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{argmax_from, covariance_penalty, dropout, orthogonality_penalty};
    use crate::graph::Tensor;

    #[test]
    fn argmax_skips_reserved_ids() {
        assert_eq!(argmax_from(&[9.0, 1.0, 5.0, 2.0], 1), 2);
        assert_eq!(argmax_from(&[9.0, 1.0], 3), 0);
    }

    #[test]
    fn dropout_is_identity_outside_training() {
        let x = Tensor::from_fn(2, 3, |i, j| (i + j) as f64);
        assert_eq!(dropout(&x, 0.5, None).data(), x.data());

        let mut rng = StdRng::seed_from_u64(1);
        let dropped = dropout(&x, 0.5, Some(&mut rng)).data();
        for (d, v) in dropped.iter().zip(x.data()) {
            assert!(*d == 0.0 || (*d - 2.0 * v).abs() < 1e-12);
        }
    }

    #[test]
    fn orthogonal_matrix_has_no_penalty() {
        let rotation = Tensor::new(2, 2, vec![0.6, -0.8, 0.8, 0.6]).expect("shape");
        assert!(orthogonality_penalty(&rotation).item().abs() < 1e-12);
        let skewed = Tensor::new(2, 2, vec![1.0, 1.0, 0.0, 1.0]).expect("shape");
        assert!(orthogonality_penalty(&skewed).item() > 0.1);
    }

    #[test]
    fn uncorrelated_units_have_no_covariance_penalty() {
        let states = Tensor::new(4, 2, vec![1.0, 1.0, -1.0, 1.0, 1.0, -1.0, -1.0, -1.0])
            .expect("shape");
        assert!(covariance_penalty(&states).item().abs() < 1e-12);
        let correlated =
            Tensor::new(3, 2, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]).expect("shape");
        assert!(covariance_penalty(&correlated).item() > 0.0);
    }
}
