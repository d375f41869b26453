#![allow(non_snake_case)]

use super::{from_dmatrix, to_dmatrix, Pca, PcaResult};
use anyhow::{format_err, Error};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Settings for Randomized PCA
#[derive(Clone, Debug)]
pub struct RandSvd {
    /// Multiple of the requested k to use in randomized projections
    pub l_multiplier: f64,

    /// Number of power iteration to perform
    pub n_iter: usize,

    /// Seed for the random projection
    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            l_multiplier: 10.0,
            n_iter: 2,
            seed: 0,
        }
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl Pca for RandSvd {
    fn run_pca(&self, array: &ArrayView2<f64>, k: usize) -> Result<PcaResult, Error> {
        let (m, n) = array.dim();
        let l = std::cmp::max(k + 4, ((k as f64) * self.l_multiplier) as usize).min(m.min(n));
        let (u, s, vt) = svd_rand(array, k, l, self.n_iter, self.seed)?;
        Ok((u, s, vt.reversed_axes()))
    }
}

fn orthonormal_basis(a: DMatrix<f64>) -> DMatrix<f64> {
    a.qr().q()
}

/// SVD of the small projected matrix, truncated to `k`
fn truncated_svd(B: DMatrix<f64>, k: usize) -> Result<(DMatrix<f64>, Array1<f64>, DMatrix<f64>), Error> {
    let svd = B
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(|| format_err!("SVD of the projected matrix did not converge"))?;
    let U = svd.u.ok_or_else(|| format_err!("SVD did not compute U"))?;
    let Vt = svd.v_t.ok_or_else(|| format_err!("SVD did not compute V^T"))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    order.truncate(k);

    let U = U.select_columns(order.iter());
    let Vt = Vt.select_rows(order.iter());
    let s = order.iter().map(|&i| svd.singular_values[i]).collect();
    Ok((U, s, Vt))
}

/// Perform an SVD of matrix `A`, making a rank `k` approximation. Use `l` projection dimensions and `n_iter` power iterations.
/// Returns `(U, s, V^T)`.
#[inline(never)]
pub fn svd_rand(
    A: &ArrayView2<f64>,
    k: usize, // svd rank
    l: usize,
    n_iter: usize, // power iterations
    seed: u64,
) -> Result<PcaResult, Error> {
    let (m, n) = A.dim();

    if m < 2 || n < 2 {
        return Err(format_err!("The input matrix must be at least 2x2."));
    }

    if k > std::cmp::min(m, n) || l < k {
        return Err(format_err!("invalid k = {} (l = {}) for a {} x {} matrix", k, l, m, n));
    }

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let unif = Uniform::new(-1.0, 1.0);
    let A = to_dmatrix(A);

    if m >= n {
        let omega = to_dmatrix(&Array2::random_using((n, l), unif, &mut rng).view());
        let mut Q = orthonormal_basis(&A * omega);

        for _ in 0..n_iter {
            Q = orthonormal_basis(A.tr_mul(&Q));
            Q = orthonormal_basis(&A * Q);
        }

        let B = Q.tr_mul(&A);
        let (U, sigma, Vt) = truncated_svd(B, k)?;
        let U = Q * U;
        Ok((from_dmatrix(&U), sigma, from_dmatrix(&Vt)))
    } else {
        // n > m
        let omega = to_dmatrix(&Array2::random_using((l, m), unif, &mut rng).view());
        let mut Q = orthonormal_basis((omega * &A).transpose());

        for _ in 0..n_iter {
            Q = orthonormal_basis(&A * Q);
            Q = orthonormal_basis(A.tr_mul(&Q));
        }

        let B = &A * &Q;
        let (U, sigma, Vt) = truncated_svd(B, k)?;
        let Vt = Vt * Q.transpose();
        Ok((from_dmatrix(&U), sigma, from_dmatrix(&Vt)))
    }
}
