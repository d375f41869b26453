/// differential expression between two groups of cells
#[allow(clippy::module_inception)]
pub mod diff_exp;
/// test statistics and p-value adjustment
pub mod dist;
/// statistics extension
pub mod stat;

pub use crate::diff_exp::{
    differential_expression, log1p_matrix, significant_genes, DiffExpParams, DiffExpResult, GeneTest,
    SignificantGeneTable, TTestKind,
};
