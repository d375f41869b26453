//! Differential expression between two clusters of cells with per-gene two-sample t-tests
//!
use crate::dist::{self, GroupMoments};
use crate::stat::Statistics;
use anyhow::{Context, Error};
use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use sc_types::{CellGroups, ExpressionMatrix, ScanError};

/// Default significance threshold on the raw p-value
pub static P_VALUE_THRESHOLD_DEFAULT: f64 = 0.05;

/// Variance assumption of the two-sample t-test
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TTestKind {
    /// pooled variance
    #[default]
    Student,
    /// unequal variances
    Welch,
}

impl std::str::FromStr for TTestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(TTestKind::Student),
            "welch" => Ok(TTestKind::Welch),
            _ => Err(ScanError::invalid(format!("t-test not recognized: {s}")).into()),
        }
    }
}

/// Parameters of a differential expression run
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiffExpParams {
    /// genes with a p-value strictly below this are significant
    pub p_value_threshold: f64,
    /// which t-test to run
    pub t_test: TTestKind,
}

impl Default for DiffExpParams {
    fn default() -> Self {
        DiffExpParams {
            p_value_threshold: P_VALUE_THRESHOLD_DEFAULT,
            t_test: TTestKind::Student,
        }
    }
}

/// Test result for one gene. Means are on the `ln(1 + x)` scale.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeneTest {
    /// false when a group had fewer than two present values for this gene
    pub tested: bool,
    /// mean in the control group
    pub mean_control: f64,
    /// mean in the case group
    pub mean_case: f64,
    /// `mean_case - mean_control`
    pub log_fold_change: f64,
    /// t statistic of case against control
    pub statistic: f64,
    /// two-sided p-value
    pub p_value: f64,
    /// Benjamini-Hochberg adjusted p-value
    pub adjusted_p_value: f64,
}

impl Default for GeneTest {
    fn default() -> Self {
        GeneTest {
            tested: false,
            mean_control: f64::NAN,
            mean_case: f64::NAN,
            log_fold_change: 0.0,
            statistic: 0.0,
            p_value: 1.0,
            adjusted_p_value: 1.0,
        }
    }
}

/// Result of Differential expression, one entry per gene
#[derive(Debug)]
pub struct DiffExpResult {
    /// per-gene test results
    pub genes: Array1<GeneTest>,
}

impl DiffExpResult {
    /// Indices of genes with `p_value < threshold`, ascending
    pub fn significant(&self, threshold: f64) -> Vec<usize> {
        self.genes
            .iter()
            .enumerate()
            .filter(|(_, g)| g.tested && g.p_value < threshold)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Log-transformed expression of the significant genes, all cells kept, plus their test results
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignificantGeneTable {
    /// `ln(1 + x)` expression, restricted to the significant genes
    pub expression: ExpressionMatrix,
    /// test results, aligned with `expression.gene_ids`
    pub tests: Vec<GeneTest>,
    /// control cluster id
    pub control: usize,
    /// case cluster id
    pub case: usize,
}

impl SignificantGeneTable {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Element-wise `ln(1 + x)`. Missing values stay missing.
pub fn log1p_matrix(m: &ArrayView2<f64>) -> Array2<f64> {
    m.mapv(f64::ln_1p)
}

fn group_values(row: &ArrayView1<f64>, cells: &[usize]) -> Vec<f64> {
    cells.iter().map(|&c| row[c]).filter(|v| !v.is_nan()).collect()
}

fn moments(values: &[f64]) -> GroupMoments {
    GroupMoments {
        n: values.len() as f64,
        mean: values.mean(),
        var: values.var(1.0),
    }
}

fn test_gene(row: ArrayView1<f64>, control: &[usize], case: &[usize], kind: TTestKind) -> Result<GeneTest, Error> {
    let a = group_values(&row, control);
    let b = group_values(&row, case);
    if a.len() < 2 || b.len() < 2 {
        return Ok(GeneTest::default());
    }

    let ma = moments(&a);
    let mb = moments(&b);
    let mut res = GeneTest {
        tested: true,
        mean_control: ma.mean,
        mean_case: mb.mean,
        log_fold_change: mb.mean - ma.mean,
        ..GeneTest::default()
    };

    if a.is_constant() && b.is_constant() {
        // no spread in either group: the test degenerates to comparing the two values
        if a[0] == b[0] {
            res.statistic = 0.0;
            res.p_value = 1.0;
        } else {
            res.statistic = f64::INFINITY.copysign(b[0] - a[0]);
            res.p_value = 0.0;
        }
        return Ok(res);
    }

    let outcome = match kind {
        TTestKind::Student => dist::student_t_test(&ma, &mb)?,
        TTestKind::Welch => dist::welch_t_test(&ma, &mb)?,
    };
    res.statistic = outcome.statistic;
    res.p_value = outcome.p_value;
    Ok(res)
}

/// Per-gene two-sample t-test of the `case` cells against the `control` cells.
/// `log_mat` is genes x cells and is expected to be log-transformed already.
/// Both groups must hold at least two cells.
pub fn differential_expression(
    log_mat: &ArrayView2<f64>,
    control: &[usize],
    case: &[usize],
    kind: TTestKind,
) -> Result<DiffExpResult, Error> {
    let mut genes = Array1::from_elem(log_mat.nrows(), GeneTest::default());
    let mut errors = Array1::<Option<String>>::from_elem(log_mat.nrows(), None);

    Zip::from(log_mat.rows())
        .and(&mut genes)
        .and(&mut errors)
        .par_for_each(|row, gene, err| match test_gene(row, control, case, kind) {
            Ok(g) => *gene = g,
            Err(e) => *err = Some(e.to_string()),
        });

    if let Some((i, msg)) = errors.iter().enumerate().find_map(|(i, e)| e.as_ref().map(|m| (i, m))) {
        return Err(ScanError::invalid(format!("t-test failed for gene {i}: {msg}")).into());
    }

    // Adjust p-values for multiple testing
    // Only adjust the genes that were actually tested
    let tested = genes
        .iter()
        .enumerate()
        .filter(|(_, g)| g.tested)
        .map(|(i, g)| (i, g.p_value))
        .collect::<Vec<_>>();
    for (i, q) in dist::adjusted_pvalue_bh(&tested) {
        genes[i].adjusted_p_value = q;
    }

    Ok(DiffExpResult { genes })
}

fn group_cells<'a>(groups: &'a CellGroups, cluster: usize, role: &'static str) -> Result<&'a [usize], ScanError> {
    let cells = groups.get_indices(cluster).unwrap_or(&[]);
    if cells.len() < 2 {
        return Err(ScanError::EmptyGroup {
            role,
            cluster,
            size: cells.len(),
        });
    }
    Ok(cells)
}

/// Log-transform `normalized`, split its cells by `assignments` into the `control` and `case`
/// clusters, test every gene, and keep the genes whose p-value is below the threshold.
pub fn significant_genes(
    normalized: &ExpressionMatrix,
    assignments: &[usize],
    control: usize,
    case: usize,
    params: &DiffExpParams,
) -> Result<SignificantGeneTable, Error> {
    if assignments.len() != normalized.num_cells() {
        return Err(ScanError::invalid(format!(
            "{} cluster labels for {} cells",
            assignments.len(),
            normalized.num_cells()
        ))
        .into());
    }
    if control == case {
        return Err(ScanError::invalid(format!("control and case are both cluster {control}")).into());
    }

    let groups = CellGroups::from_assignments(assignments);
    let control_cells = group_cells(&groups, control, "control")?;
    let case_cells = group_cells(&groups, case, "case")?;

    let log_mat = log1p_matrix(&normalized.matrix.view());
    let result = differential_expression(&log_mat.view(), control_cells, case_cells, params.t_test)
        .with_context(|| format!("comparing cluster {case} against cluster {control}"))?;

    let rows = result.significant(params.p_value_threshold);
    info!(
        "{} of {} genes significant (p < {}) between clusters {} and {}",
        rows.len(),
        normalized.num_genes(),
        params.p_value_threshold,
        control,
        case
    );

    let log_expr = normalized.with_values(log_mat)?;
    Ok(SignificantGeneTable {
        expression: log_expr.select_genes(&rows),
        tests: rows.iter().map(|&r| result.genes[r]).collect(),
        control,
        case,
    })
}
