#![allow(non_snake_case)]

use super::{from_dmatrix, to_dmatrix, Pca, PcaResult};
use anyhow::{format_err, Error};
use ndarray::{Array1, ArrayView2, Axis};

/// Full SVD of the matrix, truncated to `k` components
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactSvd;

impl Pca for ExactSvd {
    fn run_pca(&self, matrix: &ArrayView2<f64>, k: usize) -> Result<PcaResult, Error> {
        let (m, n) = matrix.dim();
        if k > m.min(n) {
            return Err(format_err!("invalid k = {} for a {} x {} matrix", k, m, n));
        }
        let svd = to_dmatrix(matrix)
            .try_svd(true, true, f64::EPSILON, 0)
            .ok_or_else(|| format_err!("SVD did not converge"))?;
        let U = svd.u.as_ref().ok_or_else(|| format_err!("SVD did not compute U"))?;
        let Vt = svd.v_t.as_ref().ok_or_else(|| format_err!("SVD did not compute V^T"))?;

        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
        order.truncate(k);

        let U = from_dmatrix(U).select(Axis(1), &order);
        let V = from_dmatrix(Vt).select(Axis(0), &order).reversed_axes();
        let s = order.iter().map(|&i| svd.singular_values[i]).collect::<Array1<f64>>();
        Ok((U, s, V))
    }
}
