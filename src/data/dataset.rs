use std::path::Path;

use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

use super::conll::{ConllError, Sentence, read_conll};
use super::vocab::{PAD_ID, ROOT_ID, Vocabs};

/// Feature columns of a numericalised token row.
pub const WORD: usize = 0;
pub const UPOS: usize = 1;
pub const XPOS: usize = 2;
pub const HEAD: usize = 3;
pub const REL: usize = 4;
pub const N_FEATURES: usize = 5;

pub type TokenRow = [usize; N_FEATURES];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset {0} contains no sentences")]
    Empty(String),
    #[error("dataset {dataset}, sentence {sentence}: token {token} has head {head} past the sentence end")]
    Head {
        dataset: String,
        sentence: usize,
        token: usize,
        head: usize,
    },
    #[error(transparent)]
    Conll(#[from] ConllError),
}

/// A length-stratified group of sentences; every sentence in it is padded to
/// `max_len` (ROOT included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub max_len: usize,
    pub sentences: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Minibatch {
    /// `rows[s][t]` is token `t` of sentence `s`; position 0 is ROOT and
    /// positions past `lengths[s]` are all-PAD.
    pub rows: Vec<Vec<TokenRow>>,
    pub lengths: Vec<usize>,
    /// `(bucket, index in bucket)` of each sentence.
    pub origins: Vec<(usize, usize)>,
    /// Index of each sentence in file order.
    pub sentence_ids: Vec<usize>,
    pub max_len: usize,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tokens excluding ROOT and padding.
    pub fn n_tokens(&self) -> usize {
        self.lengths.iter().map(|len| len - 1).sum()
    }

    pub fn column(&self, feature: usize, position: usize) -> Vec<usize> {
        self.rows.iter().map(|row| row[position][feature]).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    sentences: Vec<Sentence>,
    rows: Vec<Vec<TokenRow>>,
    buckets: Vec<Bucket>,
    metabucket: Vec<(usize, usize)>,
}

impl Dataset {
    pub fn from_file(
        name: &str,
        path: &Path,
        vocabs: &Vocabs,
        n_bkts: usize,
    ) -> Result<Self, DatasetError> {
        Self::new(name, read_conll(path)?, vocabs, n_bkts)
    }

    pub fn new(
        name: &str,
        sentences: Vec<Sentence>,
        vocabs: &Vocabs,
        n_bkts: usize,
    ) -> Result<Self, DatasetError> {
        if sentences.is_empty() {
            return Err(DatasetError::Empty(name.to_string()));
        }
        for (sentence_idx, sentence) in sentences.iter().enumerate() {
            if let Some((token_idx, token)) = sentence
                .tokens
                .iter()
                .enumerate()
                .find(|(_, token)| token.head > sentence.len())
            {
                return Err(DatasetError::Head {
                    dataset: name.to_string(),
                    sentence: sentence_idx + 1,
                    token: token_idx + 1,
                    head: token.head,
                });
            }
        }
        let rows: Vec<Vec<TokenRow>> = sentences
            .iter()
            .map(|sentence| numericalize(sentence, vocabs))
            .collect();

        let lengths: Vec<usize> = rows.iter().map(Vec::len).collect();
        let boundaries = bucket_boundaries(&lengths, n_bkts);
        let mut buckets: Vec<Bucket> = boundaries
            .iter()
            .map(|&max_len| Bucket {
                max_len,
                sentences: Vec::new(),
            })
            .collect();
        let mut metabucket = Vec::with_capacity(rows.len());
        for (sentence_id, len) in lengths.iter().enumerate() {
            let bkt_idx = boundaries.partition_point(|max_len| max_len < len);
            metabucket.push((bkt_idx, buckets[bkt_idx].sentences.len()));
            buckets[bkt_idx].sentences.push(sentence_id);
        }

        tracing::debug!(
            dataset = name,
            sentences = rows.len(),
            buckets = ?boundaries,
            "bucketed dataset"
        );

        Ok(Self {
            name: name.to_string(),
            sentences,
            rows,
            buckets,
            metabucket,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sentences(&self) -> &[Sentence] {
        &self.sentences
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// `(bucket, index in bucket)` for every sentence, in file order.
    pub fn metabucket(&self) -> &[(usize, usize)] {
        &self.metabucket
    }

    /// Splits each bucket into `max(size * max_len / batch_size, 1)` chunks,
    /// so `batch_size` is measured in padded tokens. With `rng`, sentence
    /// order within buckets and the order of chunks are shuffled.
    pub fn minibatches<R: Rng>(&self, batch_size: usize, rng: Option<&mut R>) -> Vec<Minibatch> {
        let mut rng = rng;
        let mut chunks: Vec<(usize, Vec<usize>)> = Vec::new();
        for (bkt_idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.sentences.is_empty() {
                continue;
            }
            let mut order: Vec<usize> = (0..bucket.sentences.len()).collect();
            if let Some(rng) = rng.as_deref_mut() {
                order.shuffle(rng);
            }
            let n_splits = (bucket.sentences.len() * bucket.max_len / batch_size.max(1)).max(1);
            for split in array_split(&order, n_splits) {
                chunks.push((bkt_idx, split));
            }
        }
        if let Some(rng) = rng.as_deref_mut() {
            chunks.shuffle(rng);
        }

        chunks
            .into_iter()
            .map(|(bkt_idx, split)| self.build_minibatch(bkt_idx, &split))
            .collect()
    }

    fn build_minibatch(&self, bkt_idx: usize, positions: &[usize]) -> Minibatch {
        let bucket = &self.buckets[bkt_idx];
        let mut rows = Vec::with_capacity(positions.len());
        let mut lengths = Vec::with_capacity(positions.len());
        let mut origins = Vec::with_capacity(positions.len());
        let mut sentence_ids = Vec::with_capacity(positions.len());
        for &position in positions {
            let sentence_id = bucket.sentences[position];
            let mut padded = self.rows[sentence_id].clone();
            lengths.push(padded.len());
            padded.resize(bucket.max_len, [PAD_ID; N_FEATURES]);
            rows.push(padded);
            origins.push((bkt_idx, position));
            sentence_ids.push(sentence_id);
        }
        Minibatch {
            rows,
            lengths,
            origins,
            sentence_ids,
            max_len: bucket.max_len,
        }
    }
}

fn numericalize(sentence: &Sentence, vocabs: &Vocabs) -> Vec<TokenRow> {
    let mut rows = Vec::with_capacity(sentence.len() + 1);
    rows.push([ROOT_ID, ROOT_ID, ROOT_ID, 0, ROOT_ID]);
    for token in &sentence.tokens {
        rows.push([
            vocabs.words.index(&token.form),
            vocabs.tags.index(&token.upos),
            vocabs.tags.index(&token.xpos),
            token.head,
            vocabs.rels.index(&token.deprel),
        ]);
    }
    rows
}

/// Upper length bounds of at most `n_bkts` buckets minimising the total
/// number of padded tokens. Exact DP over the distinct lengths.
pub fn bucket_boundaries(lengths: &[usize], n_bkts: usize) -> Vec<usize> {
    let mut distinct: Vec<(usize, usize)> = Vec::new();
    let mut sorted = lengths.to_vec();
    sorted.sort_unstable();
    for len in sorted {
        match distinct.last_mut() {
            Some((last, count)) if *last == len => *count += 1,
            _ => distinct.push((len, 1)),
        }
    }
    let m = distinct.len();
    if m == 0 {
        return Vec::new();
    }
    let k = n_bkts.clamp(1, m);

    let mut prefix = vec![0usize; m + 1];
    for (i, (_, count)) in distinct.iter().enumerate() {
        prefix[i + 1] = prefix[i] + count;
    }
    // cost of one bucket holding distinct[i..=j]
    let cost = |i: usize, j: usize| distinct[j].0 * (prefix[j + 1] - prefix[i]);

    // best[b][j]: min cost of covering distinct[0..=j] with b + 1 buckets
    let mut best = vec![vec![usize::MAX; m]; k];
    let mut split = vec![vec![0usize; m]; k];
    for j in 0..m {
        best[0][j] = cost(0, j);
    }
    for b in 1..k {
        for j in b..m {
            for i in b..=j {
                let prev = best[b - 1][i - 1];
                if prev == usize::MAX {
                    continue;
                }
                let total = prev + cost(i, j);
                if total < best[b][j] {
                    best[b][j] = total;
                    split[b][j] = i;
                }
            }
        }
    }

    let mut boundaries = Vec::with_capacity(k);
    let mut j = m - 1;
    for b in (0..k).rev() {
        boundaries.push(distinct[j].0);
        if b > 0 {
            j = split[b][j] - 1;
        }
    }
    boundaries.reverse();
    boundaries
}

/// `numpy.array_split`: `n` contiguous chunks whose sizes differ by at most
/// one, larger chunks first.
fn array_split(items: &[usize], n: usize) -> Vec<Vec<usize>> {
    let n = n.clamp(1, items.len().max(1));
    let base = items.len() / n;
    let extra = items.len() % n;
    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for idx in 0..n {
        let size = base + usize::from(idx < extra);
        chunks.push(items[start..start + size].to_vec());
        start += size;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{Dataset, DatasetError, HEAD, REL, WORD, array_split, bucket_boundaries};
    use crate::data::conll::parse_conll;
    use crate::data::conll::tests::TREEBANK;
    use crate::data::vocab::{ROOT_ID, Vocabs};

    fn dataset(n_bkts: usize) -> Dataset {
        let sentences = parse_conll(TREEBANK).expect("treebank");
        let vocabs = Vocabs::from_training(&sentences, 1, false);
        Dataset::new("Trainset", sentences, &vocabs, n_bkts).expect("dataset")
    }

    #[test]
    fn bucketing_minimizes_padding() {
        assert_eq!(bucket_boundaries(&[2, 2, 2, 10], 2), vec![2, 10]);
        assert_eq!(bucket_boundaries(&[3, 4, 9, 10, 10], 2), vec![4, 10]);
        assert_eq!(bucket_boundaries(&[5, 5, 5], 4), vec![5]);
        assert_eq!(bucket_boundaries(&[1, 2, 3], 1), vec![3]);
        assert!(bucket_boundaries(&[], 3).is_empty());
    }

    #[test]
    fn array_split_matches_numpy_sizes() {
        let sizes: Vec<usize> = array_split(&[0, 1, 2, 3, 4, 5, 6], 3)
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert_eq!(array_split(&[0, 1], 5).len(), 2);
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let vocabs = Vocabs::from_training(&[], 1, false);
        let err = Dataset::new("Validset", Vec::new(), &vocabs, 2).expect_err("empty");
        assert!(matches!(err, DatasetError::Empty(name) if name == "Validset"));
    }

    #[test]
    fn head_past_sentence_end_is_an_error() {
        let sentences = parse_conll("1\ta\ta\tX\tX\t_\t4\tdep\t_\t_\n").expect("parses");
        let vocabs = Vocabs::from_training(&sentences, 1, false);
        let err = Dataset::new("Testset", sentences, &vocabs, 1).expect_err("bad head");
        assert!(matches!(err, DatasetError::Head { sentence: 1, token: 1, head: 4, .. }));
    }

    #[test]
    fn rows_are_root_prefixed() {
        let data = dataset(2);
        let batches = data.minibatches::<StdRng>(1000, None);
        let batch = batches
            .iter()
            .find(|b| b.sentence_ids.contains(&0))
            .expect("first sentence present");
        let s = batch.sentence_ids.iter().position(|id| *id == 0).expect("in batch");
        assert_eq!(batch.rows[s][0][WORD], ROOT_ID);
        assert_eq!(batch.lengths[s], 5);
        assert_eq!(batch.rows[s][1][HEAD], 2);
        assert_ne!(batch.rows[s][3][REL], 0);
    }

    #[test]
    fn metabucket_points_back_to_file_order() {
        let data = dataset(3);
        for (sentence_id, (bkt_idx, idx)) in data.metabucket().iter().enumerate() {
            assert_eq!(data.buckets()[*bkt_idx].sentences[*idx], sentence_id);
        }
    }

    #[test]
    fn minibatches_cover_every_sentence_once() {
        let data = dataset(2);
        let mut rng = StdRng::seed_from_u64(3);
        let batches = data.minibatches(5, Some(&mut rng));
        let mut seen: Vec<usize> = batches
            .iter()
            .flat_map(|b| b.sentence_ids.iter().copied())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        for batch in &batches {
            assert!(batch.rows.iter().all(|row| row.len() == batch.max_len));
        }
    }

    #[test]
    fn token_budget_controls_split_count() {
        let data = dataset(1);
        // one bucket of 3 sentences padded to 7 tokens = 21 tokens
        assert_eq!(data.minibatches::<StdRng>(1000, None).len(), 1);
        assert_eq!(data.minibatches::<StdRng>(7, None).len(), 3);
        assert_eq!(data.minibatches::<StdRng>(10, None).len(), 2);
    }
}
