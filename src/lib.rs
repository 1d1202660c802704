//! Graph-based dependency parser and part-of-speech tagger trained with a
//! small reverse-mode autodiff engine.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod eval;
pub mod graph;
pub mod models;
pub mod network;
pub mod training;
