use anyhow::Error;
use log::info;
use ndarray::{Array1, Array2, Axis, Zip};
use sc_types::{ExpressionMatrix, ScanError};

/// Counts-per-million target total for every cell
pub const CPM_TOTAL: f64 = 1e6;

/// Counts-per-million normalization: each cell (column) is divided by `total / 1e6`,
/// so its present values sum to 1,000,000.
pub fn normalize_cpm(matrix: &ExpressionMatrix) -> Result<ExpressionMatrix, Error> {
    normalize_with_target(matrix, CPM_TOTAL)
}

/// Scale each cell (column) to have the same total count given by `target_total`:
/// `scaling_factor = total / target_total`, every value divided by it.
/// Missing (`NaN`) values are skipped in the total and stay missing.
/// A cell whose total is zero, overflows, or yields a subnormal scaling factor is rejected.
pub fn normalize_with_target(matrix: &ExpressionMatrix, target_total: f64) -> Result<ExpressionMatrix, Error> {
    if !target_total.is_finite() || target_total <= 0.0 {
        return Err(ScanError::invalid(format!("target total {target_total} must be finite and positive")).into());
    }
    if matrix.num_cells() == 0 {
        return Err(ScanError::invalid("matrix has no numeric cell columns").into());
    }
    if let Some(((g, c), v)) = matrix
        .matrix
        .indexed_iter()
        .find(|(_, v)| v.is_infinite() || **v < 0.0)
    {
        return Err(ScanError::invalid(format!(
            "value {v} for gene {:?} in cell {:?} is not a non-negative count",
            matrix.gene_ids[g], matrix.cell_ids[c]
        ))
        .into());
    }

    let totals = Array1::from(matrix.cell_totals());
    if let Some(c) = totals.iter().position(|&t| t == 0.0) {
        return Err(ScanError::ZeroTotalCount {
            cell: matrix.cell_ids[c].clone(),
        }
        .into());
    }
    if let Some(c) = totals
        .iter()
        .position(|&t| !t.is_finite() || !(t / target_total).is_normal())
    {
        return Err(ScanError::DegenerateTotalCount {
            cell: matrix.cell_ids[c].clone(),
            total: totals[c],
        }
        .into());
    }

    let mut normalized = Array2::<f64>::zeros(matrix.matrix.dim());
    Zip::from(normalized.axis_iter_mut(Axis(1)))
        .and(matrix.matrix.axis_iter(Axis(1)))
        .and(&totals)
        .for_each(|mut out, col, &total| {
            let scaling_factor = total / target_total;
            out.assign(&col.mapv(|v| v / scaling_factor));
        });

    info!(
        "normalized {} cells x {} genes to {} counts per cell",
        matrix.num_cells(),
        matrix.num_genes(),
        target_total
    );
    matrix.with_values(normalized)
}
