use anyhow::{format_err, Error};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::cmp::Ordering;

/// Sample size, mean and unbiased variance of one group
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroupMoments {
    /// number of values
    pub n: f64,
    /// mean
    pub mean: f64,
    /// variance with ddof = 1
    pub var: f64,
}

/// Outcome of a two-sample t-test
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TTestOutcome {
    /// t statistic, positive when the second group has the larger mean
    pub statistic: f64,
    /// degrees of freedom
    pub df: f64,
    /// two-sided p-value
    pub p_value: f64,
}

/// Two-sided p-value of a t statistic with `df` degrees of freedom
#[inline]
pub fn two_sided_p_value(t: f64, df: f64) -> Result<f64, Error> {
    if t.is_infinite() {
        return Ok(0.0);
    }
    let dist = StudentsT::new(0.0, 1.0, df).map_err(|e| format_err!("t distribution with df = {df}: {e}"))?;
    Ok((2.0 * dist.sf(t.abs())).min(1.0))
}

/// Student's t-test (pooled variance) of `b` against `a`.
/// Both groups need at least two values and a non-zero pooled variance.
pub fn student_t_test(a: &GroupMoments, b: &GroupMoments) -> Result<TTestOutcome, Error> {
    let df = a.n + b.n - 2.0;
    let pooled = ((a.n - 1.0) * a.var + (b.n - 1.0) * b.var) / df;
    let se = (pooled * (1.0 / a.n + 1.0 / b.n)).sqrt();
    let statistic = (b.mean - a.mean) / se;
    Ok(TTestOutcome {
        statistic,
        df,
        p_value: two_sided_p_value(statistic, df)?,
    })
}

/// Welch's t-test (unequal variances) of `b` against `a`, with Welch–Satterthwaite degrees of freedom
pub fn welch_t_test(a: &GroupMoments, b: &GroupMoments) -> Result<TTestOutcome, Error> {
    let va = a.var / a.n;
    let vb = b.var / b.n;
    let se = (va + vb).sqrt();
    let df = (va + vb).powi(2) / (va * va / (a.n - 1.0) + vb * vb / (b.n - 1.0));
    let statistic = (b.mean - a.mean) / se;
    Ok(TTestOutcome {
        statistic,
        df,
        p_value: two_sided_p_value(statistic, df)?,
    })
}

/// adjusted_pvalue_bh
/// Benjamini-Hochberg adjustment of `(index, p-value)` pairs. The result is sorted by descending p-value.
#[inline]
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    // NaNs to the front
    let mut arr = pvalue.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| match a.partial_cmp(&b) {
        Some(o) => o.reverse(),
        None => match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    });

    // q = min(1, cummin(len / rank * p)) walking from the largest p-value down
    let len = arr.len() as f64;
    let mut min = f64::MAX;
    for (idx, (_, val)) in arr.iter_mut().enumerate() {
        *val *= len / (len - idx as f64);
        if *val < min {
            min = *val;
        }
        *val = min.min(1.0);
    }
    arr
}
