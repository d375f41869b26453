use super::exact_svd::ExactSvd;
use super::rand_svd::RandSvd;
use super::*;
use assert_approx_eq::assert_approx_eq;
use ndarray::{array, Array2};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use sc_types::ErrorKind;

/// Rank `r` signal plus small gaussian noise
fn low_rank(m: usize, n: usize, r: usize, seed: u64) -> Array2<f64> {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let noise = Normal::new(0.0, 0.01).unwrap();
    let left = Array2::from_shape_simple_fn((m, r), || normal.sample(&mut rng));
    let right = Array2::from_shape_simple_fn((r, n), || normal.sample(&mut rng));
    let scale = Array1::from_shape_fn(r, |i| 10.0 / (i + 1) as f64);
    (&left * &scale).dot(&right) + Array2::from_shape_simple_fn((m, n), || noise.sample(&mut rng))
}

fn frobenius(a: &Array2<f64>) -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// `||A V - U S|| / ||A||`
fn residual(a: &Array2<f64>, (u, s, v): &PcaResult) -> f64 {
    let av = a.dot(v);
    let us = u * s;
    frobenius(&(&av - &us)) / frobenius(a)
}

#[test]
fn test_exact_svd() {
    let a = low_rank(60, 20, 4, 0);
    let res = ExactSvd.run_pca(&a.view(), 6).unwrap();
    assert_eq!(res.0.dim(), (60, 6));
    assert_eq!(res.1.len(), 6);
    assert_eq!(res.2.dim(), (20, 6));
    assert!(residual(&a, &res) < 1e-10);
    for w in res.1.as_slice().unwrap().windows(2) {
        assert!(w[0] >= w[1]);
    }
}

#[test]
fn test_rand_svd_matches_exact() {
    for (m, n) in [(300, 80), (80, 300)] {
        let a = low_rank(m, n, 5, 1);
        let exact = ExactSvd.run_pca(&a.view(), 5).unwrap();
        let rand = RandSvd::new().run_pca(&a.view(), 5).unwrap();
        assert_eq!(rand.0.dim(), (m, 5));
        assert_eq!(rand.2.dim(), (n, 5));
        for (e, r) in exact.1.iter().zip(rand.1.iter()) {
            assert_approx_eq!(e / r, 1.0, 1e-4);
        }
        assert!(residual(&a, &rand) < 1e-3);
    }
}

#[test]
fn test_rand_svd_is_seeded() {
    let a = low_rank(100, 40, 3, 2);
    let svd = RandSvd {
        seed: 7,
        ..Default::default()
    };
    let r1 = svd.run_pca(&a.view(), 3).unwrap();
    let r2 = svd.run_pca(&a.view(), 3).unwrap();
    assert_eq!(r1.0, r2.0);
    assert_eq!(r1.1, r2.1);
}

#[test]
fn test_pca_on_a_line() {
    // centered: (-4/3, -4/3), (-1/3, -1/3), (5/3, 5/3)
    let x = array![[1.0, 1.0], [2.0, 2.0], [4.0, 4.0]];
    let scores = pca_project(&x.view(), 1, PcaSolver::Auto, 0).unwrap();
    let r2 = 2f64.sqrt();
    assert_eq!(scores.dim(), (3, 1));
    assert_approx_eq!(scores[[0, 0]], -4.0 / 3.0 * r2, 1e-10);
    assert_approx_eq!(scores[[1, 0]], -1.0 / 3.0 * r2, 1e-10);
    assert_approx_eq!(scores[[2, 0]], 5.0 / 3.0 * r2, 1e-10);
}

#[test]
fn test_pca_solvers_agree() {
    let x = low_rank(600, 30, 3, 3);
    assert_eq!(PcaSolver::Auto.resolve(600, 30, 3), PcaSolver::Randomized);
    assert_eq!(PcaSolver::Auto.resolve(600, 30, 25), PcaSolver::Exact);
    assert_eq!(PcaSolver::Auto.resolve(40, 20, 3), PcaSolver::Exact);

    let exact = pca_project(&x.view(), 3, PcaSolver::Exact, 0).unwrap();
    let rand = pca_project(&x.view(), 3, PcaSolver::Randomized, 0).unwrap();
    // svd_flip fixes the signs, so the scores agree entry by entry
    let diff = frobenius(&(&exact - &rand)) / frobenius(&exact);
    assert!(diff < 1e-4, "relative difference {diff}");
}

#[test]
fn test_pca_rejects_bad_components() {
    let x = low_rank(10, 4, 2, 4);
    for k in [0, 5] {
        let err = pca_project(&x.view(), k, PcaSolver::Exact, 0).unwrap_err();
        assert_eq!(err.downcast_ref::<ScanError>().unwrap().kind(), ErrorKind::Dimensionality);
    }
    assert!(pca_project(&x.view(), 4, PcaSolver::Exact, 0).is_ok());
}

#[test]
fn test_reduce_dimension() {
    let x = low_rank(30, 12, 3, 5);
    let params = ReductionParams {
        tsne_max_iter: 300,
        ..Default::default()
    };
    let res = reduce_dimension(&x.view(), &params).unwrap();
    assert_eq!(res.pca.dim(), (30, 6));
    assert_eq!(res.embedding.dim(), (30, 2));
    assert!(res.embedding.iter().all(|v| v.is_finite()));

    let again = reduce_dimension(&x.view(), &params).unwrap();
    assert_eq!(res.embedding, again.embedding);
}

#[test]
fn test_reduce_keeps_row_order() {
    // rows alternate between two blobs 50 apart
    let mut rng = Pcg64Mcg::seed_from_u64(8);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((30, 8), |(i, _)| {
        let center = if i % 2 == 0 { 0.0 } else { 50.0 };
        center + noise.sample(&mut rng)
    });
    let res = reduce_dimension(&x.view(), &ReductionParams::default()).unwrap();
    let y = &res.embedding;

    let centroid = |parity: usize| {
        let rows: Vec<usize> = (0..30).filter(|i| i % 2 == parity).collect();
        y.select(Axis(0), &rows).mean_axis(Axis(0)).unwrap()
    };
    let (even, odd) = (centroid(0), centroid(1));
    for i in 0..30 {
        let d_even = (&y.row(i) - &even).mapv(|v| v * v).sum();
        let d_odd = (&y.row(i) - &odd).mapv(|v| v * v).sum();
        if i % 2 == 0 {
            assert!(d_even < d_odd, "row {i}");
        } else {
            assert!(d_odd < d_even, "row {i}");
        }
    }
}

#[test]
fn test_reduce_rejects_perplexity() {
    let x = low_rank(5, 8, 2, 6);
    let params = ReductionParams {
        n_components: 2,
        perplexity: 5.0,
        ..Default::default()
    };
    let err = reduce_dimension(&x.view(), &params).unwrap_err();
    let e = err.downcast_ref::<ScanError>().unwrap();
    assert_eq!(e.kind(), ErrorKind::Dimensionality);
    assert!(e.to_string().contains("perplexity"));
}

#[test]
fn test_solver_from_str() {
    assert_eq!("exact".parse::<PcaSolver>().unwrap(), PcaSolver::Exact);
    assert_eq!("Randomized".parse::<PcaSolver>().unwrap(), PcaSolver::Randomized);
    assert!("arpack".parse::<PcaSolver>().is_err());
}
