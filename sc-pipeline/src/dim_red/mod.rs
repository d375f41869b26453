#![allow(non_snake_case)]

//! PCA followed by t-SNE.
//!
//! The SVD solvers work on `nalgebra` matrices; observations come in and embeddings go out
//! as `ndarray` arrays, so the conversions live here. A solver returns `(U, s, V)` with
//! `U` of shape `(n, k)`, `s` of length `k` sorted in descending order and `V` of shape `(p, k)`.

use anyhow::{Context, Error};
use log::{debug, info};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use sc_types::ScanError;
use std::str::FromStr;
use tsne::TSNE;

/// Exact SVD
pub mod exact_svd;

/// Randomized SVD method
pub mod rand_svd;

#[cfg(test)]
mod test;

/// `(U, s, V)` of a rank `k` decomposition
pub type PcaResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Perform a SVD of a `matrix`, retaining `k` principal components.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca {
    /// Compute a rank `k` decomposition of `matrix`
    fn run_pca(&self, matrix: &ArrayView2<f64>, k: usize) -> Result<PcaResult, Error>;
}

/// Which SVD backs the PCA
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PcaSolver {
    /// Exact for small inputs or many components, randomized otherwise
    #[default]
    Auto,
    /// Full SVD
    Exact,
    /// Seeded randomized SVD
    Randomized,
}

impl FromStr for PcaSolver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(PcaSolver::Auto),
            "exact" | "full" => Ok(PcaSolver::Exact),
            "randomized" => Ok(PcaSolver::Randomized),
            _ => Err(ScanError::invalid(format!("unknown PCA solver {s:?}")).into()),
        }
    }
}

const AUTO_EXACT_MAX_DIM: usize = 500;
const AUTO_EXACT_COMPONENT_RATIO: f64 = 0.8;

impl PcaSolver {
    /// Resolve `Auto` for an `n x p` input and `k` components
    pub fn resolve(self, n: usize, p: usize, k: usize) -> PcaSolver {
        match self {
            PcaSolver::Auto => {
                if n.max(p) <= AUTO_EXACT_MAX_DIM || k as f64 >= AUTO_EXACT_COMPONENT_RATIO * n.min(p) as f64 {
                    PcaSolver::Exact
                } else {
                    PcaSolver::Randomized
                }
            }
            s => s,
        }
    }
}

pub(crate) fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Make the decomposition deterministic: the largest-magnitude entry of every
/// column of `U` becomes positive, and the matching column of `V` flips with it.
pub fn svd_flip(U: &mut Array2<f64>, V: &mut Array2<f64>) {
    for j in 0..U.ncols() {
        let mut best = 0;
        for i in 1..U.nrows() {
            if U[[i, j]].abs() > U[[best, j]].abs() {
                best = i;
            }
        }
        if U.nrows() > 0 && U[[best, j]] < 0.0 {
            U.column_mut(j).mapv_inplace(|v| -v);
            V.column_mut(j).mapv_inplace(|v| -v);
        }
    }
}

fn check_components(n: usize, p: usize, k: usize) -> Result<(), Error> {
    let available = n.min(p);
    if k == 0 || k > available {
        return Err(ScanError::Dimensionality {
            parameter: "n_components",
            requested: k as f64,
            available,
            entity: "observations or features",
            limit: "1 <= n_components <= min(n_observations, n_features)",
        }
        .into());
    }
    Ok(())
}

/// Project the rows of `observations` onto their top `n_components` principal components.
/// Returns the scores `U * s`, one row per observation.
pub fn pca_project(
    observations: &ArrayView2<f64>,
    n_components: usize,
    solver: PcaSolver,
    seed: u64,
) -> Result<Array2<f64>, Error> {
    let (n, p) = observations.dim();
    check_components(n, p, n_components)?;
    if observations.iter().any(|v| !v.is_finite()) {
        return Err(ScanError::invalid("PCA input contains missing or non-finite values").into());
    }

    let mean = observations
        .mean_axis(Axis(0))
        .ok_or_else(|| ScanError::invalid("PCA input has no observations"))?;
    let centered = observations - &mean;

    let solver = solver.resolve(n, p, n_components);
    debug!("PCA of {} x {} with {:?} solver", n, p, solver);
    let (mut U, s, mut V) = match solver {
        PcaSolver::Randomized => rand_svd::RandSvd {
            seed,
            ..Default::default()
        }
        .run_pca(&centered.view(), n_components)?,
        _ => exact_svd::ExactSvd.run_pca(&centered.view(), n_components)?,
    };
    svd_flip(&mut U, &mut V);

    let total_var: f64 = centered.iter().map(|v| v * v).sum();
    if total_var > 0.0 {
        let explained: f64 = s.iter().map(|v| v * v).sum::<f64>() / total_var;
        info!(
            "PCA kept {} components explaining {:.1}% of the variance",
            n_components,
            100.0 * explained
        );
    }

    Ok(&U * &s)
}

/// Parameters of the PCA + t-SNE reduction
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReductionParams {
    /// number of principal components fed to t-SNE
    pub n_components: usize,
    /// t-SNE perplexity, must be below the number of observations
    pub perplexity: f64,
    /// SVD used for the PCA
    pub pca_solver: PcaSolver,
    /// t-SNE gradient steps
    pub tsne_max_iter: usize,
    /// t-SNE learning rate
    pub learning_rate: f64,
    /// seeds the randomized SVD and the t-SNE initialization
    pub seed: u64,
}

impl Default for ReductionParams {
    fn default() -> Self {
        ReductionParams {
            n_components: 6,
            perplexity: 5.0,
            pca_solver: PcaSolver::Auto,
            tsne_max_iter: 1000,
            learning_rate: 200.0,
            seed: 0,
        }
    }
}

/// Two-dimensional embedding of the observations
#[derive(Clone, Debug)]
pub struct EmbeddingResult {
    /// PCA scores, `(n, n_components)`
    pub pca: Array2<f64>,
    /// t-SNE coordinates, `(n, 2)`, rows in input order
    pub embedding: Array2<f64>,
    /// KL divergence of the final t-SNE iteration
    pub kl_divergence: f64,
}

/// Reduce `observations` (one row per observation) to 2 dimensions: PCA to
/// `n_components`, then t-SNE (exact for small inputs, Barnes-Hut for large ones).
pub fn reduce_dimension(observations: &ArrayView2<f64>, params: &ReductionParams) -> Result<EmbeddingResult, Error> {
    let (n, p) = observations.dim();
    check_components(n, p, params.n_components)?;
    if !(params.perplexity > 0.0) || params.perplexity >= n as f64 {
        return Err(ScanError::Dimensionality {
            parameter: "perplexity",
            requested: params.perplexity,
            available: n,
            entity: "points",
            limit: "0 < perplexity < n_points",
        }
        .into());
    }

    let pca = pca_project(observations, params.n_components, params.pca_solver, params.seed)?;
    let tsne = TSNE {
        n_dims: 2,
        perplexity: params.perplexity,
        learning_rate: Some(params.learning_rate),
        seed: Some(params.seed),
        max_iter: params.tsne_max_iter,
        ..Default::default()
    };
    let res = tsne.fit(&pca.view()).context("t-SNE embedding")?;

    Ok(EmbeddingResult {
        pca,
        embedding: res.embedding,
        kl_divergence: res.kl_divergence,
    })
}
