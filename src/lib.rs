//! Local mirror of a GitHub repository with a three-tier cache, plus a
//! single-path engine for the workflows that operate on it.

pub mod cache;
pub mod config;
pub mod engine;
pub mod remote;
pub mod workflows;
