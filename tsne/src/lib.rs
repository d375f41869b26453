//! t-distributed stochastic neighbor embedding.
//!
//! Small inputs get the exact gradient, which needs `N x N` affinity and kernel
//! matrices. Larger inputs use the Barnes-Hut approximation: input affinities
//! restricted to the `3 * perplexity` nearest neighbours, and repulsive forces
//! summarized over a space-partitioning tree with accuracy `theta`. Both share the
//! optimizer schedule (early exaggeration, momentum switch, adaptive gains).

#[macro_use]
extern crate smart_default;

pub mod affinity;
mod knn;
mod sptree;

use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use sprs::CsMat;
use sptree::SpaceTree;

// np.random.RandomState(0).randint(2**31-1)
const RANDOM_STATE: u64 = 209_652_396;
const STOP_LYING_ITER: usize = 250;
const MOM_SWITCH_ITER: usize = 250;
const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const MIN_PROBABILITY: f64 = 1e-12;

/// Inputs with at least this many points use Barnes-Hut under [`Method::Auto`]
pub const BARNES_HUT_MIN_POINTS: usize = 1000;
/// The tree has `2^n_dims` children per cell, so Barnes-Hut is limited to low output dimensions
pub const BARNES_HUT_MAX_DIMS: usize = 3;

/// How the gradient is computed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Method {
    /// Barnes-Hut from [`BARNES_HUT_MIN_POINTS`] points on, exact below
    #[default]
    Auto,
    /// Dense affinities and the full O(N^2) gradient
    Exact,
    /// Nearest-neighbour affinities and tree-summarized repulsion
    BarnesHut,
}

impl Method {
    /// Resolve `Auto` for `n_points` embedded into `n_dims` dimensions
    pub fn resolve(self, n_points: usize, n_dims: usize) -> Method {
        match self {
            Method::Auto if n_points >= BARNES_HUT_MIN_POINTS && n_dims <= BARNES_HUT_MAX_DIMS => Method::BarnesHut,
            Method::Auto => Method::Exact,
            m => m,
        }
    }
}

#[derive(Clone, Debug, SmartDefault)]
pub struct TSNE {
    #[default = 2]
    pub n_dims: usize,
    #[default = 30.]
    pub perplexity: f64,
    /// Barnes-Hut accuracy: cells with `width / distance < theta` are summarized
    #[default = 0.5]
    pub theta: f64,
    pub method: Method,
    #[default = 12.]
    pub early_exaggeration: f64,
    /// None picks `max(N / early_exaggeration / 4, 50)`
    #[default(None)]
    pub learning_rate: Option<f64>,
    #[default(None)]
    pub seed: Option<u64>,
    #[default = 1000]
    pub max_iter: usize,
    #[default(None)]
    pub stop_lying_iter: Option<usize>,
    #[default(None)]
    pub mom_switch_iter: Option<usize>,
}

/// Output of [`TSNE::fit`]
#[derive(Clone, Debug)]
pub struct TSNEResult {
    /// One row per input row, `n_dims` columns
    pub embedding: Array2<f64>,
    /// KL(P || Q) at the final iteration
    pub kl_divergence: f64,
}

#[inline]
fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

#[inline]
fn squared_distance(y: &Array2<f64>, i: usize, j: usize) -> f64 {
    y.row(i).iter().zip(y.row(j).iter()).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// Student-t kernel `1 / (1 + |y_i - y_j|^2)` with a zero diagonal, and its total
fn student_kernel(y: &Array2<f64>) -> (Array2<f64>, f64) {
    let n = y.nrows();
    let mut num = Array2::<f64>::zeros((n, n));
    num.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            for j in 0..n {
                if i != j {
                    row[j] = 1.0 / (1.0 + squared_distance(y, i, j));
                }
            }
        });
    let sum = num.sum();
    (num, sum)
}

/// Input affinities: dense for the exact gradient, nearest-neighbour sparse for Barnes-Hut
enum Affinities {
    Dense(Array2<f64>),
    Sparse(CsMat<f64>),
}

impl Affinities {
    /// Write `dC/dy` into `grad` and return the normalization `Z = sum_{i != j} (1 + |y_i - y_j|^2)^-1`
    fn gradient(&self, y: &Array2<f64>, exaggeration: f64, theta: f64, grad: &mut Array2<f64>) -> f64 {
        match self {
            Affinities::Dense(p) => exact_gradient(p, y, exaggeration, grad),
            Affinities::Sparse(p) => barnes_hut_gradient(p, y, exaggeration, theta, grad),
        }
    }

    /// KL(P || Q) with `q_ij = (1 + |y_i - y_j|^2)^-1 / z`
    fn kl_divergence(&self, y: &Array2<f64>, z: f64) -> f64 {
        let term = |i: usize, j: usize, pij: f64| {
            if i == j || pij <= 0.0 {
                return 0.0;
            }
            let qij = (1.0 / (1.0 + squared_distance(y, i, j)) / z).max(MIN_PROBABILITY);
            pij * (pij / qij).ln()
        };
        let mut kl = 0.0;
        match self {
            Affinities::Dense(p) => {
                for ((i, j), &pij) in p.indexed_iter() {
                    kl += term(i, j, pij);
                }
            }
            Affinities::Sparse(p) => {
                for (i, row) in p.outer_iterator().enumerate() {
                    for (j, &pij) in row.iter() {
                        kl += term(i, j, pij);
                    }
                }
            }
        }
        kl
    }
}

// dC/dy_i = 4 sum_j (p_ij - q_ij) (1 + |y_i - y_j|^2)^-1 (y_i - y_j)
fn exact_gradient(p: &Array2<f64>, y: &Array2<f64>, exaggeration: f64, grad: &mut Array2<f64>) -> f64 {
    let (num, z) = student_kernel(y);
    grad.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut g)| {
            g.fill(0.0);
            for j in 0..y.nrows() {
                if i == j {
                    continue;
                }
                let mult = (exaggeration * p[[i, j]] - num[[i, j]] / z) * num[[i, j]];
                for d in 0..g.len() {
                    g[d] += 4.0 * mult * (y[[i, d]] - y[[j, d]]);
                }
            }
        });
    z
}

// Same gradient split into attraction over the sparse P and tree-approximated repulsion:
// dC/dy_i = 4 (sum_j p_ij q'_ij (y_i - y_j) - sum_j q'_ij^2 (y_i - y_j) / Z), q'_ij unnormalized
fn barnes_hut_gradient(p: &CsMat<f64>, y: &Array2<f64>, exaggeration: f64, theta: f64, grad: &mut Array2<f64>) -> f64 {
    let tree = SpaceTree::new(y.view());
    let mut repulsion = Array2::<f64>::zeros(y.dim());
    let mut z_parts = Array1::<f64>::zeros(y.nrows());
    Zip::indexed(repulsion.rows_mut())
        .and(&mut z_parts)
        .par_for_each(|i, mut f, z| *z = tree.repulsion(i, theta, &mut f));
    // summed in order so the result does not depend on the thread schedule
    let z = z_parts.sum();

    Zip::indexed(grad.rows_mut())
        .and(repulsion.rows())
        .par_for_each(|i, mut g, rep| {
            g.fill(0.0);
            if let Some(row) = p.outer_view(i) {
                for (j, &pij) in row.iter() {
                    let mult = exaggeration * pij / (1.0 + squared_distance(y, i, j));
                    for d in 0..g.len() {
                        g[d] += mult * (y[[i, d]] - y[[j, d]]);
                    }
                }
            }
            for d in 0..g.len() {
                g[d] = 4.0 * (g[d] - rep[d] / z);
            }
        });
    z
}

impl TSNE {
    fn check(&self, n: usize, method: Method) -> Result<(), Error> {
        if n < 2 {
            bail!("t-SNE needs at least 2 points, got {}", n);
        }
        if self.n_dims == 0 {
            bail!("t-SNE output dimensionality must be positive");
        }
        if !(self.perplexity > 0.0) || self.perplexity >= n as f64 {
            bail!("perplexity {} must be positive and less than the number of points ({})", self.perplexity, n);
        }
        if not_positive_finite(self.early_exaggeration) {
            bail!("early exaggeration {} must be finite and positive", self.early_exaggeration);
        }
        if let Some(lr) = self.learning_rate {
            if not_positive_finite(lr) {
                bail!("learning rate {} must be finite and positive", lr);
            }
        }
        if method == Method::BarnesHut {
            if self.n_dims > BARNES_HUT_MAX_DIMS {
                bail!("Barnes-Hut t-SNE supports at most {} output dimensions, got {}", BARNES_HUT_MAX_DIMS, self.n_dims);
            }
            if !self.theta.is_finite() || self.theta < 0.0 {
                bail!("theta {} must be finite and non-negative", self.theta);
            }
        }
        Ok(())
    }

    /// Embed the rows of `x` into `n_dims` dimensions
    #[allow(non_snake_case)]
    pub fn fit(&self, X: &ArrayView2<f64>) -> Result<TSNEResult, Error> {
        let N = X.nrows();
        let method = self.method.resolve(N, self.n_dims);
        self.check(N, method)?;
        if X.iter().any(|v| !v.is_finite()) {
            bail!("t-SNE input contains non-finite values");
        }

        let learning_rate = self
            .learning_rate
            .unwrap_or_else(|| (N as f64 / self.early_exaggeration / 4.0).max(50.0));
        let stop_lying_iter = self.stop_lying_iter.unwrap_or(STOP_LYING_ITER);
        let mom_switch_iter = self.mom_switch_iter.unwrap_or(MOM_SWITCH_ITER);

        info!(
            "{:?} t-SNE on {} points, perplexity {}, learning rate {}",
            method, N, self.perplexity, learning_rate
        );
        let P = match method {
            Method::BarnesHut => Affinities::Sparse(affinity::sparse_joint_probabilities(X, self.perplexity)),
            _ => Affinities::Dense(affinity::joint_probabilities(
                &affinity::squared_distances(X),
                self.perplexity,
            )),
        };

        let mut rng = Pcg64Mcg::seed_from_u64(self.seed.unwrap_or(RANDOM_STATE));
        let normal = Normal::new(0.0, 1e-4)?;
        let mut Y = Array2::from_shape_simple_fn((N, self.n_dims), || normal.sample(&mut rng));

        let mut gains = Array2::<f64>::ones(Y.dim());
        let mut uY = Array2::<f64>::zeros(Y.dim());
        let mut dY = Array2::<f64>::zeros(Y.dim());

        for iter in 0..self.max_iter {
            let exaggeration = if iter < stop_lying_iter { self.early_exaggeration } else { 1.0 };
            let momentum = if iter < mom_switch_iter { INITIAL_MOMENTUM } else { FINAL_MOMENTUM };

            let z = P.gradient(&Y, exaggeration, self.theta, &mut dY);
            if (iter + 1) % 50 == 0 {
                debug!("iteration {}: KL divergence {:.6}", iter + 1, P.kl_divergence(&Y, z));
            }

            Zip::from(&mut gains).and(&mut uY).and(&dY).for_each(|gain, u, &dy| {
                *gain = if sign(dy) != sign(*u) { *gain + 0.2 } else { *gain * 0.8 };
                if *gain < MIN_GAIN {
                    *gain = MIN_GAIN;
                }
                *u = momentum * *u - learning_rate * *gain * dy;
            });
            Y += &uY;

            if let Some(mean) = Y.mean_axis(Axis(0)) {
                Y -= &mean;
            }
        }

        let z = P.gradient(&Y, 1.0, self.theta, &mut dY);
        let kl = P.kl_divergence(&Y, z);
        info!("t-SNE finished after {} iterations, KL divergence {:.6}", self.max_iter, kl);

        Ok(TSNEResult {
            embedding: Y,
            kl_divergence: kl,
        })
    }
}

fn not_positive_finite(v: f64) -> bool {
    !v.is_finite() || v <= 0.0
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use sprs::TriMat;

    /// Two tight blobs far apart in 5 dimensions
    fn blobs(per_blob: usize) -> Array2<f64> {
        Array2::from_shape_fn((2 * per_blob, 5), |(i, j)| {
            let center = if i < per_blob { 0.0 } else { 50.0 };
            center + ((i * 7 + j * 13) % 11) as f64 * 0.1
        })
    }

    #[test]
    fn test_shape_and_determinism() {
        let x = blobs(10);
        let tsne = TSNE {
            perplexity: 5.0,
            max_iter: 300,
            seed: Some(0),
            ..Default::default()
        };
        let a = tsne.fit(&x.view()).unwrap();
        let b = tsne.fit(&x.view()).unwrap();
        assert_eq!(a.embedding.dim(), (20, 2));
        assert_eq!(a.embedding, b.embedding);
        assert!(a.kl_divergence.is_finite());
        assert!(a.embedding.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_blobs_stay_apart() {
        let x = blobs(10);
        let tsne = TSNE {
            perplexity: 5.0,
            seed: Some(1),
            ..Default::default()
        };
        let y = tsne.fit(&x.view()).unwrap().embedding;
        let centroid = |r: std::ops::Range<usize>| {
            let n = r.len() as f64;
            let mut c = [0.0, 0.0];
            for i in r {
                c[0] += y[[i, 0]] / n;
                c[1] += y[[i, 1]] / n;
            }
            c
        };
        let (a, b) = (centroid(0..10), centroid(10..20));
        let between = ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt();
        // every point is nearer its own blob's centroid
        for i in 0..20 {
            let own = if i < 10 { a } else { b };
            let other = if i < 10 { b } else { a };
            let d_own = ((y[[i, 0]] - own[0]).powi(2) + (y[[i, 1]] - own[1]).powi(2)).sqrt();
            let d_other = ((y[[i, 0]] - other[0]).powi(2) + (y[[i, 1]] - other[1]).powi(2)).sqrt();
            assert!(d_own < d_other, "point {i}: {d_own} vs {d_other} (centroids {between} apart)");
        }
    }

    #[test]
    fn test_rejects_large_perplexity() {
        let x = blobs(3);
        let tsne = TSNE {
            perplexity: 6.0,
            ..Default::default()
        };
        assert!(tsne.fit(&x.view()).is_err());
        let tsne = TSNE {
            perplexity: 0.0,
            ..Default::default()
        };
        assert!(tsne.fit(&x.view()).is_err());
    }

    /// Two gaussian blobs with centers 40 apart in 5 dimensions
    fn noisy_blobs(per_blob: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((2 * per_blob, 5), |(i, _)| {
            let center = if i < per_blob { 0.0 } else { 40.0 };
            center + normal.sample(&mut rng)
        })
    }

    fn mean_row(y: &Array2<f64>, rows: std::ops::Range<usize>) -> Array1<f64> {
        y.slice(ndarray::s![rows, ..]).mean_axis(Axis(0)).unwrap()
    }

    #[test]
    fn test_method_resolve() {
        assert_eq!(Method::Auto.resolve(100, 2), Method::Exact);
        assert_eq!(Method::Auto.resolve(BARNES_HUT_MIN_POINTS, 2), Method::BarnesHut);
        assert_eq!(Method::Auto.resolve(BARNES_HUT_MIN_POINTS, 4), Method::Exact);
        assert_eq!(Method::BarnesHut.resolve(10, 2), Method::BarnesHut);
        assert_eq!(Method::Exact.resolve(5000, 2), Method::Exact);
    }

    #[test]
    fn test_gradients_agree_at_zero_theta() {
        let x = noisy_blobs(10, 5);
        let dense = affinity::joint_probabilities(&affinity::squared_distances(&x.view()), 4.0);
        let mut tri = TriMat::new((20, 20));
        for ((i, j), &v) in dense.indexed_iter() {
            if i != j {
                tri.add_triplet(i, j, v);
            }
        }
        let sparse: CsMat<f64> = tri.to_csr();

        let mut rng = Pcg64Mcg::seed_from_u64(6);
        let normal = Normal::new(0.0, 3.0).unwrap();
        let y = Array2::from_shape_simple_fn((20, 2), || normal.sample(&mut rng));

        let mut g_exact = Array2::zeros((20, 2));
        let mut g_bh = Array2::zeros((20, 2));
        let z_exact = exact_gradient(&dense, &y, 12.0, &mut g_exact);
        let z_bh = barnes_hut_gradient(&sparse, &y, 12.0, 0.0, &mut g_bh);
        assert_abs_diff_eq!(z_exact, z_bh, epsilon = 1e-9);
        for (&a, &b) in g_exact.iter().zip(g_bh.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }

        let kl_dense = Affinities::Dense(dense).kl_divergence(&y, z_exact);
        let kl_sparse = Affinities::Sparse(sparse).kl_divergence(&y, z_bh);
        assert_abs_diff_eq!(kl_dense, kl_sparse, epsilon = 1e-9);
    }

    #[test]
    fn test_barnes_hut_blobs() {
        let x = noisy_blobs(60, 7);
        let tsne = TSNE {
            perplexity: 10.0,
            method: Method::BarnesHut,
            seed: Some(2),
            ..Default::default()
        };
        let res = tsne.fit(&x.view()).unwrap();
        let y = res.embedding;
        assert_eq!(y.dim(), (120, 2));
        assert!(res.kl_divergence.is_finite());

        let (a, b) = (mean_row(&y, 0..60), mean_row(&y, 60..120));
        for i in 0..120 {
            let (own, other) = if i < 60 { (&a, &b) } else { (&b, &a) };
            let d_own = (&y.row(i) - own).mapv(|v| v * v).sum();
            let d_other = (&y.row(i) - other).mapv(|v| v * v).sum();
            assert!(d_own < d_other, "point {i}");
        }

        let again = tsne.fit(&x.view()).unwrap();
        assert_eq!(y, again.embedding);
    }

    #[test]
    fn test_barnes_hut_limits() {
        let x = noisy_blobs(5, 8);
        let tsne = TSNE {
            n_dims: 4,
            perplexity: 3.0,
            method: Method::BarnesHut,
            ..Default::default()
        };
        assert!(tsne.fit(&x.view()).is_err());
        let tsne = TSNE {
            perplexity: 3.0,
            theta: -1.0,
            method: Method::BarnesHut,
            ..Default::default()
        };
        assert!(tsne.fit(&x.view()).is_err());
        // exact mode ignores theta
        let tsne = TSNE {
            perplexity: 3.0,
            theta: -1.0,
            max_iter: 10,
            method: Method::Exact,
            ..Default::default()
        };
        assert!(tsne.fit(&x.view()).is_ok());
    }
}
