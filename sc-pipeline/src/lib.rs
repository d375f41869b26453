//! # sc-pipeline: clustering and differential expression of single-cell counts

#![deny(missing_docs)]

/// Dimensionality reduction methods
pub mod dim_red;

/// Count matrix normalization methods
pub mod normalization;

/// Missing value imputation
pub mod impute;

/// K-means clustering
pub mod kmeans;

/// Ranking clusters by size
pub mod cluster_select;

/// CSV loading and writing of expression matrices
pub mod csv_matrix;

/// End-to-end analysis
pub mod pipeline;

pub use pipeline::{run_pipeline, ComparisonPolicy, PipelineConfig, PipelineOutput, Stage};
