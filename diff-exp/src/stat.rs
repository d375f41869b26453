//! statistics
//!
//! ## `Statistics` trait
//!
//! Summary statistics over a slice of numbers, used by the per-gene tests.
//! `NaN` entries are not filtered here; callers pass present values only.

use num_traits::ToPrimitive;

/// Statistics Trait
///
/// It contains `sum`, `mean`, `var` and `is_constant`
pub trait Statistics {
    /// Compensated sum
    fn sum(&self) -> f64;
    /// Arithmetic mean. Panics on an empty slice.
    fn mean(&self) -> f64;
    /// Variance with `ddof` delta degrees of freedom; zero when there are not enough values
    fn var(&self, ddof: f64) -> f64;
    /// True when every value equals the first one
    fn is_constant(&self) -> bool;
}

impl<T: ToPrimitive + Copy> Statistics for [T] {
    fn sum(&self) -> f64 {
        // Neumaier summation
        let mut sum = 0.0f64;
        let mut comp = 0.0f64;
        for x in self {
            let x = x.to_f64().unwrap_or(f64::NAN);
            let t = sum + x;
            if sum.abs() >= x.abs() {
                comp += (sum - t) + x;
            } else {
                comp += (x - t) + sum;
            }
            sum = t;
        }
        sum + comp
    }

    fn mean(&self) -> f64 {
        assert!(!self.is_empty());
        Statistics::sum(self) / (self.len() as f64)
    }

    fn var(&self, ddof: f64) -> f64 {
        let n = self.len() as f64;
        if n <= ddof || self.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let ss = self
            .iter()
            .map(|x| {
                let d = x.to_f64().unwrap_or(f64::NAN) - mean;
                d * d
            })
            .sum::<f64>();
        ss / (n - ddof)
    }

    fn is_constant(&self) -> bool {
        match self.first() {
            None => true,
            Some(first) => {
                let first = first.to_f64();
                self.iter().all(|x| x.to_f64() == first)
            }
        }
    }
}
