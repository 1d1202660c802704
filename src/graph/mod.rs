//! Reverse-mode autodiff over dense matrices and the optimizer that trains
//! the graph's leaf parameters.

mod optimizer;
mod tensor;

pub use optimizer::{MovingGuard, Radam, RadamSlots, RadamSnapshot};
pub use tensor::Tensor;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("buffer of length {len} does not fit a {rows}x{cols} tensor")]
    Shape { rows: usize, cols: usize, len: usize },
    #[error("parameter {0:?} is not known to this model")]
    UnknownParameter(String),
}

/// A trainable matrix with a stable name, used for checkpoints.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub tensor: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

/// Sums a list of scalar losses; an empty list is zero.
pub fn add_n(terms: &[Tensor]) -> Tensor {
    let mut iter = terms.iter();
    match iter.next() {
        Some(first) => iter.fold(first.clone(), |acc, term| acc.add(term)),
        None => Tensor::scalar(0.0),
    }
}
