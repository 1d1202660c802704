pub mod conll;
pub mod dataset;
pub mod vocab;

pub use conll::{ConllError, Sentence, Token, TokenPrediction, read_conll};
pub use dataset::{Bucket, Dataset, DatasetError, Minibatch};
pub use vocab::{Vocab, VocabColumn, Vocabs};
