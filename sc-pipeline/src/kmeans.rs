//! Lloyd's k-means with greedy k-means++ seeding and independent restarts.

use anyhow::Error;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use noisy_float::types::n64;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use sc_types::ScanError;

/// Settings for k-means
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KMeans {
    /// number of clusters `k`
    pub n_clusters: usize,
    /// number of seeded restarts; the lowest-inertia run is kept
    pub n_init: usize,
    /// Lloyd iterations per restart
    pub max_iter: usize,
    /// convergence tolerance, relative to the mean per-feature variance
    pub tol: f64,
    /// restart `r` is seeded with `seed + r`
    pub seed: u64,
}

impl Default for KMeans {
    fn default() -> Self {
        KMeans {
            n_clusters: 6,
            n_init: 10,
            max_iter: 300,
            tol: 1e-4,
            seed: 0,
        }
    }
}

/// Result of a k-means fit
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterAssignment {
    /// label in `[0, k)` for every point, in input order
    pub labels: Vec<usize>,
    /// `(k, n_features)`
    pub centroids: Array2<f64>,
    /// sum of squared distances of the points to their centroid
    pub inertia: f64,
    /// Lloyd iterations of the winning restart
    pub n_iter: usize,
}

impl ClusterAssignment {
    /// Number of clusters, populated or not
    pub fn num_clusters(&self) -> usize {
        self.centroids.nrows()
    }
}

#[inline]
fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index and squared distance of the closest centroid; ties go to the lower index
fn nearest(point: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
        let d = sq_dist(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

/// Pick the index whose cumulative weight first reaches `r`
fn sample_weighted(weights: &[f64], r: f64) -> usize {
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if acc >= r {
            return i;
        }
    }
    weights.len() - 1
}

/// Greedy k-means++: each new center is the best of `2 + ln(k)` candidates drawn
/// proportionally to the squared distance to the centers chosen so far.
fn init_centroids(data: &ArrayView2<f64>, k: usize, rng: &mut Pcg64Mcg) -> Array2<f64> {
    let n = data.nrows();
    let mut centers = Array2::<f64>::zeros((k, data.ncols()));
    let first = rng.gen_range(0..n);
    centers.row_mut(0).assign(&data.row(first));

    let mut closest: Vec<f64> = data.rows().into_iter().map(|p| sq_dist(p, data.row(first))).collect();
    let mut potential: f64 = closest.iter().sum();
    let n_local_trials = 2 + (k as f64).ln() as usize;

    for c in 1..k {
        let mut best: Option<(usize, f64, Vec<f64>)> = None;
        for _ in 0..n_local_trials {
            let candidate = if potential > 0.0 {
                sample_weighted(&closest, rng.gen::<f64>() * potential)
            } else {
                rng.gen_range(0..n)
            };
            let dists: Vec<f64> = data
                .rows()
                .into_iter()
                .zip(closest.iter())
                .map(|(p, &d)| d.min(sq_dist(p, data.row(candidate))))
                .collect();
            let pot: f64 = dists.iter().sum();
            if best.as_ref().map_or(true, |b| pot < b.1) {
                best = Some((candidate, pot, dists));
            }
        }
        if let Some((idx, pot, dists)) = best {
            centers.row_mut(c).assign(&data.row(idx));
            potential = pot;
            closest = dists;
        }
    }
    centers
}

fn assign(data: &ArrayView2<f64>, centroids: &Array2<f64>) -> (Vec<usize>, f64) {
    let mut inertia = 0.0;
    let labels = data
        .rows()
        .into_iter()
        .map(|p| {
            let (c, d) = nearest(p, centroids);
            inertia += d;
            c
        })
        .collect();
    (labels, inertia)
}

impl KMeans {
    fn check(&self, data: &ArrayView2<f64>) -> Result<(), Error> {
        let n = data.nrows();
        if self.n_clusters == 0 || self.n_clusters > n {
            return Err(ScanError::Dimensionality {
                parameter: "n_clusters",
                requested: self.n_clusters as f64,
                available: n,
                entity: "points",
                limit: "1 <= n_clusters <= n_points",
            }
            .into());
        }
        if self.n_init == 0 {
            return Err(ScanError::invalid("n_init must be at least 1").into());
        }
        if self.max_iter == 0 {
            return Err(ScanError::invalid("max_iter must be at least 1").into());
        }
        if !(self.tol >= 0.0) {
            return Err(ScanError::invalid(format!("tolerance {} must be non-negative", self.tol)).into());
        }
        if data.ncols() == 0 || data.iter().any(|v| !v.is_finite()) {
            return Err(ScanError::invalid("k-means input must have finite values in at least one dimension").into());
        }
        Ok(())
    }

    /// `tol` scaled by the mean per-feature variance of `data`
    fn absolute_tol(&self, data: &ArrayView2<f64>) -> f64 {
        let var = data.var_axis(Axis(0), 0.0);
        self.tol * var.mean().unwrap_or(0.0)
    }

    fn single_run(&self, data: &ArrayView2<f64>, tol: f64, seed: u64) -> ClusterAssignment {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let k = self.n_clusters;
        let mut centroids = init_centroids(data, k, &mut rng);
        let mut n_iter = 0;

        for _ in 0..self.max_iter {
            n_iter += 1;
            let (labels, _) = assign(data, &centroids);

            let mut sums = Array2::<f64>::zeros(centroids.dim());
            let mut counts = Array1::<usize>::zeros(k);
            for (p, &l) in data.rows().into_iter().zip(labels.iter()) {
                let mut row = sums.row_mut(l);
                row += &p;
                counts[l] += 1;
            }
            let mut new_centroids = centroids.clone();
            for c in 0..k {
                if counts[c] > 0 {
                    new_centroids.row_mut(c).assign(&(&sums.row(c) / counts[c] as f64));
                } else {
                    debug!("cluster {} is empty in restart seeded {}; keeping its centroid", c, seed);
                }
            }

            let shift: f64 = (&new_centroids - &centroids).iter().map(|v| v * v).sum();
            centroids = new_centroids;
            if shift <= tol {
                break;
            }
        }

        let (labels, inertia) = assign(data, &centroids);
        debug!("restart seeded {}: inertia {:.6} after {} iterations", seed, inertia, n_iter);
        ClusterAssignment {
            labels,
            centroids,
            inertia,
            n_iter,
        }
    }

    /// Cluster the rows of `data`
    pub fn fit(&self, data: &ArrayView2<f64>) -> Result<ClusterAssignment, Error> {
        self.check(data)?;
        let tol = self.absolute_tol(data);

        let runs: Vec<ClusterAssignment> = (0..self.n_init)
            .into_par_iter()
            .map(|r| self.single_run(data, tol, self.seed.wrapping_add(r as u64)))
            .collect();

        // min_by_key keeps the first of equal minima, i.e. the earliest restart
        let best = runs
            .into_iter()
            .min_by_key(|run| n64(run.inertia))
            .ok_or_else(|| ScanError::invalid("no k-means restart was run"))?;

        info!(
            "k-means: {} clusters on {} points, inertia {:.4} after {} iterations",
            self.n_clusters,
            data.nrows(),
            best.inertia,
            best.n_iter
        );
        Ok(best)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use rand_distr::{Distribution, Normal};
    use sc_types::ErrorKind;

    /// `per_blob` points around each of `centers`
    fn blobs(centers: &[[f64; 2]], per_blob: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.5).unwrap();
        let mut x = Array2::zeros((centers.len() * per_blob, 2));
        for (b, c) in centers.iter().enumerate() {
            for i in 0..per_blob {
                x[[b * per_blob + i, 0]] = c[0] + noise.sample(&mut rng);
                x[[b * per_blob + i, 1]] = c[1] + noise.sample(&mut rng);
            }
        }
        x
    }

    #[test]
    fn test_separated_blobs() {
        let x = blobs(&[[0.0, 0.0], [20.0, 0.0], [0.0, 20.0]], 15, 0);
        let km = KMeans {
            n_clusters: 3,
            ..Default::default()
        };
        let res = km.fit(&x.view()).unwrap();
        assert_eq!(res.labels.len(), 45);
        assert_eq!(res.centroids.dim(), (3, 2));
        for b in 0..3 {
            let first = res.labels[b * 15];
            assert!(res.labels[b * 15..(b + 1) * 15].iter().all(|&l| l == first));
        }
        let mut distinct = res.labels.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct, vec![0, 1, 2]);
        // 45 points with per-axis variance 0.25
        assert!(res.inertia < 45.0);
    }

    #[test]
    fn test_deterministic() {
        let x = blobs(&[[0.0, 0.0], [3.0, 3.0], [6.0, 0.0], [3.0, -3.0]], 10, 1);
        let km = KMeans {
            n_clusters: 6,
            seed: 5,
            ..Default::default()
        };
        let a = km.fit(&x.view()).unwrap();
        let b = km.fit(&x.view()).unwrap();
        assert_eq!(a, b);
        assert!(a.labels.iter().all(|&l| l < 6));
    }

    #[test]
    fn test_inertia_matches_labels() {
        let x = blobs(&[[0.0, 0.0], [5.0, 5.0]], 8, 2);
        let res = KMeans {
            n_clusters: 2,
            ..Default::default()
        }
        .fit(&x.view())
        .unwrap();
        let mut inertia = 0.0;
        for (i, &l) in res.labels.iter().enumerate() {
            inertia += sq_dist(x.row(i), res.centroids.row(l));
        }
        assert!((inertia - res.inertia).abs() < 1e-9);
    }

    #[test]
    fn test_k_equals_n() {
        let x = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let res = KMeans {
            n_clusters: 3,
            ..Default::default()
        }
        .fit(&x.view())
        .unwrap();
        assert_eq!(res.inertia, 0.0);
    }

    #[test]
    fn test_identical_points() {
        let x = Array2::from_elem((5, 2), 1.5);
        let res = KMeans {
            n_clusters: 2,
            ..Default::default()
        }
        .fit(&x.view())
        .unwrap();
        assert_eq!(res.inertia, 0.0);
        assert_eq!(res.labels, vec![0; 5]);
    }

    #[test]
    fn test_bad_parameters() {
        let x = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        for k in [0, 4] {
            let err = KMeans {
                n_clusters: k,
                ..Default::default()
            }
            .fit(&x.view())
            .unwrap_err();
            assert_eq!(err.downcast_ref::<ScanError>().unwrap().kind(), ErrorKind::Dimensionality);
        }
        let err = KMeans {
            n_clusters: 2,
            n_init: 0,
            ..Default::default()
        }
        .fit(&x.view())
        .unwrap_err();
        assert_eq!(err.downcast_ref::<ScanError>().unwrap().kind(), ErrorKind::InvalidInput);
    }
}
