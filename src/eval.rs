use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{Sentence, TokenPrediction, Vocab};

/// Gold tags whose tokens are left out of every score.
pub const PUNCT_TAGS: [&str; 6] = ["``", "''", ":", ",", ".", "PUNCT"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("got predictions for {predicted} sentences, expected {gold}")]
    SentenceCount { gold: usize, predicted: usize },
    #[error("sentence {sentence}: got {predicted} token predictions, expected {gold}")]
    TokenCount {
        sentence: usize,
        gold: usize,
        predicted: usize,
    },
}

/// Percent accuracies over non-punctuation tokens. A metric is `None` when
/// the model predicts nothing for that column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub tokens: usize,
    pub uas: Option<f64>,
    pub las: Option<f64>,
    pub upos: Option<f64>,
    pub xpos: Option<f64>,
}

impl fmt::Display for Scores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tokens: {}", self.tokens)?;
        for (name, value) in [
            ("UAS", self.uas),
            ("LAS", self.las),
            ("UPOS", self.upos),
            ("XPOS", self.xpos),
        ] {
            if let Some(value) = value {
                writeln!(f, "{name}: {value:5.2}%")?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Tally {
    seen: usize,
    correct: usize,
}

impl Tally {
    fn observe(&mut self, predicted: Option<bool>) {
        if let Some(correct) = predicted {
            self.seen += 1;
            self.correct += usize::from(correct);
        }
    }

    fn percent(&self) -> Option<f64> {
        (self.seen > 0).then(|| 100.0 * self.correct as f64 / self.seen as f64)
    }
}

pub fn is_punct(tag: &str) -> bool {
    PUNCT_TAGS.contains(&tag)
}

pub fn score(
    gold: &[Sentence],
    predictions: &[Vec<TokenPrediction>],
    tags: &Vocab,
    rels: &Vocab,
) -> Result<Scores, EvalError> {
    if gold.len() != predictions.len() {
        return Err(EvalError::SentenceCount {
            gold: gold.len(),
            predicted: predictions.len(),
        });
    }

    let mut tokens = 0;
    let mut uas = Tally::default();
    let mut las = Tally::default();
    let mut upos = Tally::default();
    let mut xpos = Tally::default();
    for (idx, (sentence, preds)) in gold.iter().zip(predictions).enumerate() {
        if sentence.len() != preds.len() {
            return Err(EvalError::TokenCount {
                sentence: idx + 1,
                gold: sentence.len(),
                predicted: preds.len(),
            });
        }
        for (token, pred) in sentence.tokens.iter().zip(preds) {
            if is_punct(&token.xpos) || is_punct(&token.upos) {
                continue;
            }
            tokens += 1;
            let head_ok = pred.head.map(|head| head == token.head);
            let rel_ok = pred.rel.map(|rel| rels.get(rel) == Some(token.deprel.as_str()));
            uas.observe(head_ok);
            las.observe(head_ok.zip(rel_ok).map(|(head, rel)| head && rel));
            upos.observe(pred.upos.map(|id| tags.get(id) == Some(token.upos.as_str())));
            xpos.observe(pred.xpos.map(|id| tags.get(id) == Some(token.xpos.as_str())));
        }
    }

    Ok(Scores {
        tokens,
        uas: uas.percent(),
        las: las.percent(),
        upos: upos.percent(),
        xpos: xpos.percent(),
    })
}
