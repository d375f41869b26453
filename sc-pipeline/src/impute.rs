use anyhow::Error;
use log::info;
use ndarray::{Axis, Zip};
use sc_types::{ExpressionMatrix, ScanError};

/// Mean of the present (non-`NaN`) values, `None` if every value is missing
fn present_mean<'a>(values: impl Iterator<Item = &'a f64>) -> Option<f64> {
    let (sum, n) = values
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Replace every missing entry with the mean of the present entries of its column.
/// A column with no present entries has no mean and is rejected.
pub fn impute_mean(matrix: &ExpressionMatrix) -> Result<ExpressionMatrix, Error> {
    let mut means = Vec::with_capacity(matrix.num_cells());
    for (c, col) in matrix.matrix.axis_iter(Axis(1)).enumerate() {
        match present_mean(col.iter()) {
            Some(m) => means.push(m),
            None => {
                return Err(ScanError::EmptyFeature {
                    column: matrix.cell_ids[c].clone(),
                }
                .into())
            }
        }
    }

    let missing = matrix.count_missing();
    let mut imputed = matrix.matrix.clone();
    Zip::from(imputed.axis_iter_mut(Axis(1)))
        .and(&ndarray::Array1::from(means))
        .for_each(|mut col, &mean| {
            col.mapv_inplace(|v| if v.is_nan() { mean } else { v });
        });

    info!("imputed {} missing values with column means", missing);
    matrix.with_values(imputed)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::array;
    use sc_types::ErrorKind;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_column_mean() -> Result<(), Error> {
        let m = array![[2.0, 1.0], [4.0, f64::NAN], [f64::NAN, 5.0]];
        let x = ExpressionMatrix::new(ids("g", 3), ids("c", 2), m)?;
        let y = impute_mean(&x)?;
        assert_approx_eq!(y.matrix[[2, 0]], 3.0);
        assert_approx_eq!(y.matrix[[1, 1]], 3.0);
        assert_eq!(y.matrix[[0, 0]], 2.0);
        assert!(!y.has_missing());
        assert_eq!(y.cell_ids, x.cell_ids);
        Ok(())
    }

    #[test]
    fn test_nothing_missing_is_unchanged() -> Result<(), Error> {
        let m = array![[2.0, 1.0], [4.0, 0.0]];
        let x = ExpressionMatrix::new(ids("g", 2), ids("c", 2), m)?;
        assert_eq!(impute_mean(&x)?, x);
        Ok(())
    }

    #[test]
    fn test_all_missing_column() {
        let m = array![[2.0, f64::NAN], [4.0, f64::NAN]];
        let x = ExpressionMatrix::new(ids("g", 2), ids("c", 2), m).unwrap();
        let err = impute_mean(&x).unwrap_err();
        let e = err.downcast_ref::<ScanError>().unwrap();
        assert_eq!(e.kind(), ErrorKind::DegenerateInput);
        assert_eq!(e, &ScanError::EmptyFeature { column: "c1".into() });
    }
}
