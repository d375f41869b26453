use crate::error::ScanError;
use anyhow::Error;
use ndarray::{Array2, Axis};

/// Dense gene-by-cell expression matrix. Rows are genes, columns are cells.
/// Missing entries are stored as `NaN`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExpressionMatrix {
    pub gene_ids: Vec<String>,
    pub cell_ids: Vec<String>,
    pub matrix: Array2<f64>,
}

impl ExpressionMatrix {
    /// Build a matrix, checking that the labels line up with its shape.
    pub fn new(gene_ids: Vec<String>, cell_ids: Vec<String>, matrix: Array2<f64>) -> Result<ExpressionMatrix, Error> {
        let (rows, cols) = matrix.dim();
        if gene_ids.len() != rows {
            return Err(ScanError::invalid(format!("{} gene ids for a matrix with {} rows", gene_ids.len(), rows)).into());
        }
        if cell_ids.len() != cols {
            return Err(ScanError::invalid(format!("{} cell ids for a matrix with {} columns", cell_ids.len(), cols)).into());
        }
        Ok(ExpressionMatrix {
            gene_ids,
            cell_ids,
            matrix,
        })
    }

    /// Same labels, new values. Used by stages that keep the shape.
    pub fn with_values(&self, matrix: Array2<f64>) -> Result<ExpressionMatrix, Error> {
        ExpressionMatrix::new(self.gene_ids.clone(), self.cell_ids.clone(), matrix)
    }

    pub fn num_genes(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn num_cells(&self) -> usize {
        self.matrix.ncols()
    }

    /// Number of missing (`NaN`) entries
    pub fn count_missing(&self) -> usize {
        self.matrix.iter().filter(|v| v.is_nan()).count()
    }

    pub fn has_missing(&self) -> bool {
        self.matrix.iter().any(|v| v.is_nan())
    }

    /// Per-cell totals over the present entries
    pub fn cell_totals(&self) -> Vec<f64> {
        self.matrix
            .axis_iter(Axis(1))
            .map(|col| col.iter().filter(|v| !v.is_nan()).sum())
            .collect()
    }

    /// Keep only the given genes, in the given order. All cells are retained.
    pub fn select_genes(&self, rows: &[usize]) -> ExpressionMatrix {
        ExpressionMatrix {
            gene_ids: rows.iter().map(|&r| self.gene_ids[r].clone()).collect(),
            cell_ids: self.cell_ids.clone(),
            matrix: self.matrix.select(Axis(0), rows),
        }
    }
}
