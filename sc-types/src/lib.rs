//! Shared data types for the single-cell analysis pipeline

/// Typed pipeline errors
pub mod error;

/// Cells grouped by cluster label
pub mod label_class;

/// Labeled gene-by-cell expression matrix
pub mod matrix;

pub use error::{ErrorKind, ScanError};
pub use label_class::CellGroups;
pub use matrix::ExpressionMatrix;
