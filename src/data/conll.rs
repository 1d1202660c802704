use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::vocab::Vocab;

const N_COLUMNS: usize = 10;

#[derive(Debug, Error)]
pub enum ConllError {
    #[error("cannot read {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: expected {N_COLUMNS} tab-separated columns, found {found}")]
    Columns { line: usize, found: usize },
    #[error("line {line}: bad token id {value:?}")]
    Id { line: usize, value: String },
    #[error("line {line}: bad head {value:?}")]
    Head { line: usize, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: usize,
    pub form: String,
    pub lemma: String,
    pub upos: String,
    pub xpos: String,
    pub feats: String,
    pub head: usize,
    pub deprel: String,
    pub deps: String,
    pub misc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sentence {
    pub tokens: Vec<Token>,
}

impl Sentence {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// What a model produced for one token; `None` fields fall back to gold
/// (or `_` for the secondary arc) when written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenPrediction {
    pub upos: Option<usize>,
    pub xpos: Option<usize>,
    pub head: Option<usize>,
    pub rel: Option<usize>,
    pub secondary_head: Option<usize>,
    pub secondary_rel: Option<usize>,
}

pub fn read_conll(path: &Path) -> Result<Vec<Sentence>, ConllError> {
    let text = fs::read_to_string(path).map_err(|source| ConllError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_conll(&text)
}

pub fn parse_conll(text: &str) -> Result<Vec<Sentence>, ConllError> {
    let mut sentences = Vec::new();
    let mut current = Sentence::default();

    for (line_idx, line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                sentences.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != N_COLUMNS {
            return Err(ConllError::Columns {
                line: line_no,
                found: fields.len(),
            });
        }
        // multiword ranges (3-4) and empty nodes (5.1)
        if fields[0].contains('-') || fields[0].contains('.') {
            continue;
        }

        let id = fields[0].parse().map_err(|_| ConllError::Id {
            line: line_no,
            value: fields[0].to_string(),
        })?;
        let head = fields[6].parse().map_err(|_| ConllError::Head {
            line: line_no,
            value: fields[6].to_string(),
        })?;
        current.tokens.push(Token {
            id,
            form: fields[1].to_string(),
            lemma: fields[2].to_string(),
            upos: fields[3].to_string(),
            xpos: fields[4].to_string(),
            feats: fields[5].to_string(),
            head,
            deprel: fields[7].to_string(),
            deps: fields[8].to_string(),
            misc: fields[9].to_string(),
        });
    }

    if !current.is_empty() {
        sentences.push(current);
    }
    Ok(sentences)
}

/// One output line: `id form _ UPOS XPOS _ HEAD REL HEAD2 REL2`.
pub fn format_prediction(
    position: usize,
    gold: &Token,
    prediction: &TokenPrediction,
    tags: &Vocab,
    rels: &Vocab,
) -> String {
    let tag_or = |predicted: Option<usize>, fallback: &str| {
        predicted
            .and_then(|id| tags.get(id))
            .unwrap_or(fallback)
            .to_string()
    };
    let rel_or = |predicted: Option<usize>, fallback: &str| {
        predicted
            .and_then(|id| rels.get(id))
            .unwrap_or(fallback)
            .to_string()
    };

    let upos = tag_or(prediction.upos, &gold.upos);
    let xpos = tag_or(prediction.xpos, &gold.xpos);
    let head = prediction.head.unwrap_or(gold.head).to_string();
    let rel = rel_or(prediction.rel, &gold.deprel);
    let secondary_head = prediction
        .secondary_head
        .map_or_else(|| "_".to_string(), |head| head.to_string());
    let secondary_rel = rel_or(prediction.secondary_rel, "_");

    format!(
        "{position}\t{}\t_\t{upos}\t{xpos}\t_\t{head}\t{rel}\t{secondary_head}\t{secondary_rel}",
        gold.form
    )
}

/// Writes every sentence followed by a blank line.
pub fn format_predictions(
    sentences: &[Sentence],
    predictions: &[Vec<TokenPrediction>],
    tags: &Vocab,
    rels: &Vocab,
) -> String {
    let mut out = String::new();
    for (sentence, preds) in sentences.iter().zip(predictions) {
        for (idx, (token, pred)) in sentence.tokens.iter().zip(preds).enumerate() {
            out.push_str(&format_prediction(idx + 1, token, pred, tags, rels));
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
