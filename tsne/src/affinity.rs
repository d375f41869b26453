use crate::knn::nearest_neighbors;
use log::{debug, warn};
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Zip};
use sprs::{CsMat, TriMat};

const MAX_SEARCH_STEPS: usize = 200;
const ENTROPY_TOL: f64 = 1e-5;
const MIN_PROBABILITY: f64 = 1e-12;

/// Pairwise squared Euclidean distances between the rows of `x`
pub fn squared_distances(x: &ArrayView2<f64>) -> Array2<f64> {
    let n = x.nrows();
    let mut d = Array2::<f64>::zeros((n, n));
    Zip::from(d.rows_mut()).and(x.rows()).par_for_each(|mut drow, xi| {
        for (j, xj) in x.rows().into_iter().enumerate() {
            drow[j] = xi.iter().zip(xj.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
        }
    });
    d
}

/// Fill `out` with the conditional probabilities p(j|i) whose entropy matches `ln(perplexity)`,
/// leaving the entry at `skip` (the point itself) at zero.
/// Returns false if the bisection on the Gaussian precision did not converge.
fn conditional_row(dist: ArrayView1<f64>, skip: Option<usize>, perplexity: f64, mut out: ArrayViewMut1<f64>) -> bool {
    let target = perplexity.ln();
    // Shifting by the nearest distance leaves p(j|i) unchanged and keeps exp() from underflowing
    let d_min = dist
        .iter()
        .enumerate()
        .filter(|&(j, _)| Some(j) != skip)
        .map(|(_, &d)| d)
        .fold(f64::INFINITY, f64::min);

    let mut beta = 1.0;
    let mut beta_min = f64::NEG_INFINITY;
    let mut beta_max = f64::INFINITY;
    let mut converged = false;

    for _ in 0..MAX_SEARCH_STEPS {
        let mut sum_p = 0.0;
        let mut sum_dp = 0.0;
        for (j, (&d, p)) in dist.iter().zip(out.iter_mut()).enumerate() {
            if Some(j) == skip {
                *p = 0.0;
                continue;
            }
            let shifted = d - d_min;
            *p = (-beta * shifted).exp();
            sum_p += *p;
            sum_dp += shifted * *p;
        }
        let entropy = sum_p.ln() + beta * sum_dp / sum_p;
        let diff = entropy - target;

        if diff.abs() < ENTROPY_TOL {
            converged = true;
            break;
        }
        if diff > 0.0 {
            beta_min = beta;
            beta = if beta_max.is_infinite() { beta * 2.0 } else { (beta + beta_max) / 2.0 };
        } else {
            beta_max = beta;
            beta = if beta_min.is_infinite() { beta / 2.0 } else { (beta + beta_min) / 2.0 };
        }
    }

    let sum_p: f64 = out.sum();
    out.mapv_inplace(|p| p / sum_p);
    converged
}

/// Symmetrized joint probabilities `P = (P_cond + P_cond^T) / 2n`, floored at 1e-12 off the diagonal
pub fn joint_probabilities(sq_dist: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = sq_dist.nrows();
    let mut cond = Array2::<f64>::zeros((n, n));

    let failed: usize = cond
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .map(|(i, row)| usize::from(!conditional_row(sq_dist.row(i), Some(i), perplexity, row)))
        .sum();
    if failed > 0 {
        warn!("perplexity search did not converge for {} of {} points", failed, n);
    }

    let mut p = &cond + &cond.t();
    let total = 2.0 * n as f64;
    for ((i, j), v) in p.indexed_iter_mut() {
        *v = if i == j { 0.0 } else { (*v / total).max(MIN_PROBABILITY) };
    }
    p
}

/// Sparse symmetrized joint probabilities over the `3 * perplexity` nearest neighbours
/// of every row, normalized to sum to 1
pub fn sparse_joint_probabilities(x: &ArrayView2<f64>, perplexity: f64) -> CsMat<f64> {
    let n = x.nrows();
    let k = ((3.0 * perplexity) as usize).clamp(1, n.saturating_sub(1).max(1));
    let (indices, distances) = nearest_neighbors(x, k);
    debug!("{} nearest neighbours per point for the input affinities", k);

    let mut cond = Array2::<f64>::zeros((n, k));
    let failed: usize = cond
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .map(|(i, row)| usize::from(!conditional_row(distances.row(i), None, perplexity, row)))
        .sum();
    if failed > 0 {
        warn!("perplexity search did not converge for {} of {} points", failed, n);
    }

    let mut tri = TriMat::with_capacity((n, n), 2 * n * k);
    for ((i, m), &p) in cond.indexed_iter() {
        let j = indices[[i, m]];
        if j < n && p > 0.0 {
            tri.add_triplet(i, j, p);
            tri.add_triplet(j, i, p);
        }
    }
    // duplicate triplets are summed
    let mut p: CsMat<f64> = tri.to_csr();
    let total: f64 = p.data().iter().sum();
    if total > 0.0 {
        p.map_inplace(|v| v / total);
    }
    p
}
