//! The full analysis: normalize, impute, embed and cluster the cells, then test for
//! genes that differ between two clusters.

use crate::cluster_select::{comparison_pair, relabel_by_size, select_top_clusters};
use crate::dim_red::{reduce_dimension, EmbeddingResult, PcaSolver, ReductionParams};
use crate::impute::impute_mean;
use crate::kmeans::{ClusterAssignment, KMeans};
use crate::normalization::normalize_cpm;
use anyhow::{Context, Error};
use diff_exp::{significant_genes, DiffExpParams, SignificantGeneTable, TTestKind};
use log::info;
use sc_types::{ExpressionMatrix, ScanError};
use std::fmt;

/// How the two clusters for differential expression are chosen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ComparisonPolicy {
    /// The largest cluster is the control, the second largest the case
    #[default]
    TopRanked,
    /// Explicit cluster ids
    Fixed {
        /// control cluster id
        control: usize,
        /// case cluster id
        case: usize,
    },
}

/// Parameters of [`run_pipeline`]
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    /// principal components fed to t-SNE
    pub n_components: usize,
    /// t-SNE perplexity
    pub perplexity: f64,
    /// SVD behind the PCA
    pub pca_solver: PcaSolver,
    /// t-SNE iterations
    pub tsne_max_iter: usize,
    /// k of k-means
    pub n_clusters: usize,
    /// k-means restarts
    pub n_init: usize,
    /// Lloyd iterations per restart
    pub max_iter: usize,
    /// how many clusters the size ranking keeps
    pub num_top_clusters: usize,
    /// significance threshold on the raw p-value
    pub p_value_threshold: f64,
    /// which t-test to run per gene
    pub t_test: TTestKind,
    /// seeds PCA, t-SNE and k-means
    pub seed: u64,
    /// which clusters to compare
    pub comparison: ComparisonPolicy,
    /// renumber clusters from largest to smallest before ranking; `Fixed` ids then
    /// refer to the new numbering
    pub relabel_by_size: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let reduction = ReductionParams::default();
        let kmeans = KMeans::default();
        let de = DiffExpParams::default();
        PipelineConfig {
            n_components: reduction.n_components,
            perplexity: reduction.perplexity,
            pca_solver: reduction.pca_solver,
            tsne_max_iter: reduction.tsne_max_iter,
            n_clusters: kmeans.n_clusters,
            n_init: kmeans.n_init,
            max_iter: kmeans.max_iter,
            num_top_clusters: 2,
            p_value_threshold: de.p_value_threshold,
            t_test: de.t_test,
            seed: 0,
            comparison: ComparisonPolicy::TopRanked,
            relabel_by_size: false,
        }
    }
}

impl PipelineConfig {
    /// Reject parameters that no input could satisfy. Limits that depend on the
    /// data, like `perplexity < n_cells`, are checked by the stages.
    pub fn validate(&self) -> Result<(), ScanError> {
        let fail = |msg: String| Err(ScanError::invalid(msg));
        if self.n_components == 0 {
            return fail("n_components must be at least 1".to_owned());
        }
        if !self.perplexity.is_finite() || self.perplexity <= 0.0 {
            return fail(format!("perplexity {} must be finite and positive", self.perplexity));
        }
        if self.tsne_max_iter == 0 {
            return fail("tsne_max_iter must be at least 1".to_owned());
        }
        if self.n_clusters == 0 {
            return fail("n_clusters must be at least 1".to_owned());
        }
        if self.n_init == 0 {
            return fail("n_init must be at least 1".to_owned());
        }
        if self.max_iter == 0 {
            return fail("max_iter must be at least 1".to_owned());
        }
        if !(self.p_value_threshold > 0.0 && self.p_value_threshold <= 1.0) {
            return fail(format!("p-value threshold {} must be in (0, 1]", self.p_value_threshold));
        }
        match self.comparison {
            ComparisonPolicy::TopRanked if self.num_top_clusters < 2 => fail(format!(
                "num_top_clusters = {} but the top two clusters are compared",
                self.num_top_clusters
            )),
            ComparisonPolicy::Fixed { control, case } if control == case => {
                fail(format!("control and case are both cluster {control}"))
            }
            _ => Ok(()),
        }
    }

    /// Settings of the PCA + t-SNE stage
    pub fn reduction_params(&self) -> ReductionParams {
        ReductionParams {
            n_components: self.n_components,
            perplexity: self.perplexity,
            pca_solver: self.pca_solver,
            tsne_max_iter: self.tsne_max_iter,
            seed: self.seed,
            ..Default::default()
        }
    }

    /// Settings of the clustering stage
    pub fn kmeans(&self) -> KMeans {
        KMeans {
            n_clusters: self.n_clusters,
            n_init: self.n_init,
            max_iter: self.max_iter,
            seed: self.seed,
            ..Default::default()
        }
    }

    /// Settings of the differential expression stage
    pub fn diff_exp_params(&self) -> DiffExpParams {
        DiffExpParams {
            p_value_threshold: self.p_value_threshold,
            t_test: self.t_test,
        }
    }
}

/// Pipeline stage, attached to errors as context
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// checking the configuration
    Configure,
    /// counts-per-million scaling
    Normalize,
    /// mean imputation
    Impute,
    /// PCA and t-SNE
    Reduce,
    /// k-means
    Cluster,
    /// picking the clusters to compare
    Select,
    /// per-gene t-tests
    DifferentialExpression,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Configure => "configuration",
            Stage::Normalize => "normalization",
            Stage::Impute => "imputation",
            Stage::Reduce => "dimensionality reduction",
            Stage::Cluster => "clustering",
            Stage::Select => "cluster selection",
            Stage::DifferentialExpression => "differential expression",
        };
        f.write_str(s)
    }
}

/// Everything a run produces
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    /// counts-per-million matrix, missing values kept
    pub normalized: ExpressionMatrix,
    /// normalized matrix with missing values imputed
    pub imputed: ExpressionMatrix,
    /// PCA scores and t-SNE coordinates, one row per cell
    pub embedding: EmbeddingResult,
    /// k-means labels, one per cell
    pub assignment: ClusterAssignment,
    /// cluster ids by descending size
    pub ranking: Vec<usize>,
    /// control cluster of the comparison
    pub control: usize,
    /// case cluster of the comparison
    pub case: usize,
    /// genes that differ significantly between `control` and `case`
    pub significant: SignificantGeneTable,
}

/// Run every stage on a gene-by-cell count matrix
pub fn run_pipeline(matrix: &ExpressionMatrix, config: &PipelineConfig) -> Result<PipelineOutput, Error> {
    config.validate().context(Stage::Configure)?;
    info!(
        "running pipeline on {} genes x {} cells",
        matrix.num_genes(),
        matrix.num_cells()
    );

    let normalized = normalize_cpm(matrix).context(Stage::Normalize)?;
    let imputed = impute_mean(&normalized).context(Stage::Impute)?;

    // cells are the observations
    let embedding = reduce_dimension(&imputed.matrix.t(), &config.reduction_params()).context(Stage::Reduce)?;
    let assignment = config
        .kmeans()
        .fit(&embedding.embedding.view())
        .context(Stage::Cluster)?;
    let assignment = if config.relabel_by_size {
        relabel_by_size(assignment)
    } else {
        assignment
    };

    let ranking = select_top_clusters(&assignment.labels, config.num_top_clusters);
    let (control, case) = match config.comparison {
        ComparisonPolicy::TopRanked => comparison_pair(&ranking).context(Stage::Select)?,
        ComparisonPolicy::Fixed { control, case } => (control, case),
    };

    let significant = significant_genes(
        &normalized,
        &assignment.labels,
        control,
        case,
        &config.diff_exp_params(),
    )
    .context(Stage::DifferentialExpression)?;

    info!(
        "pipeline finished: {} significant genes between clusters {} and {}",
        significant.len(),
        control,
        case
    );
    Ok(PipelineOutput {
        normalized,
        imputed,
        embedding,
        assignment,
        ranking,
        control,
        case,
        significant,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use rand_pcg::Pcg64Mcg;
    use sc_types::error::scan_error;
    use sc_types::ErrorKind;

    fn counts(genes: usize, cells: usize) -> ExpressionMatrix {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let low = Poisson::new(2.0).unwrap();
        let high = Poisson::new(30.0).unwrap();
        let m = Array2::from_shape_fn((genes, cells), |(g, c)| {
            if (g < genes / 2) == (c < cells / 2) {
                high.sample(&mut rng)
            } else {
                low.sample(&mut rng)
            }
        });
        ExpressionMatrix::new(
            (0..genes).map(|g| format!("gene{g}")).collect(),
            (0..cells).map(|c| format!("cell{c}")).collect(),
            m,
        )
        .unwrap()
    }

    fn quick() -> PipelineConfig {
        PipelineConfig {
            tsne_max_iter: 300,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.n_components, 6);
        assert_eq!(c.perplexity, 5.0);
        assert_eq!(c.n_clusters, 6);
        assert_eq!(c.n_init, 10);
        assert_eq!(c.max_iter, 300);
        assert_eq!(c.num_top_clusters, 2);
        assert_eq!(c.p_value_threshold, 0.05);
        assert_eq!(c.t_test, TTestKind::Student);
        assert_eq!(c.comparison, ComparisonPolicy::TopRanked);
        assert!(!c.relabel_by_size);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let bad = [
            PipelineConfig {
                n_components: 0,
                ..Default::default()
            },
            PipelineConfig {
                perplexity: -1.0,
                ..Default::default()
            },
            PipelineConfig {
                p_value_threshold: 0.0,
                ..Default::default()
            },
            PipelineConfig {
                num_top_clusters: 1,
                ..Default::default()
            },
            PipelineConfig {
                comparison: ComparisonPolicy::Fixed { control: 2, case: 2 },
                ..Default::default()
            },
        ];
        for c in bad {
            assert_eq!(c.validate().unwrap_err().kind(), ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn test_stage_context() {
        let mut x = counts(10, 20);
        x.matrix.column_mut(4).fill(0.0);
        let err = run_pipeline(&x, &quick()).unwrap_err();
        assert_eq!(err.to_string(), Stage::Normalize.to_string());
        assert_eq!(
            scan_error(&err),
            Some(&ScanError::ZeroTotalCount {
                cell: "cell4".to_owned()
            })
        );
    }

    #[test]
    fn test_perplexity_too_large() {
        let x = counts(10, 5);
        let config = PipelineConfig {
            n_components: 2,
            n_clusters: 2,
            ..quick()
        };
        let err = run_pipeline(&x, &config).unwrap_err();
        assert_eq!(err.to_string(), Stage::Reduce.to_string());
        assert_eq!(scan_error(&err).unwrap().kind(), ErrorKind::Dimensionality);
    }

    #[test]
    fn test_fixed_comparison_with_absent_cluster() {
        let x = counts(10, 20);
        let config = PipelineConfig {
            comparison: ComparisonPolicy::Fixed { control: 0, case: 17 },
            ..quick()
        };
        let err = run_pipeline(&x, &config).unwrap_err();
        assert_eq!(err.to_string(), Stage::DifferentialExpression.to_string());
        let e = scan_error(&err).unwrap();
        assert_eq!(e.kind(), ErrorKind::EmptyGroup);
    }

    #[test]
    fn test_run() {
        let x = counts(10, 20);
        let out = run_pipeline(&x, &quick()).unwrap();
        assert_eq!(out.embedding.embedding.dim(), (20, 2));
        assert_eq!(out.assignment.labels.len(), 20);
        assert!(out.assignment.labels.iter().all(|&l| l < 6));
        assert!(!out.imputed.has_missing());
        assert_eq!(out.ranking.first(), Some(&out.control));
        assert_eq!(out.ranking.get(1), Some(&out.case));
        assert!(out.significant.tests.iter().all(|t| t.p_value < 0.05));
        assert_eq!(out.significant.expression.num_cells(), 20);
    }

    #[test]
    fn test_relabel_by_size() {
        let x = counts(10, 20);
        let raw = run_pipeline(&x, &quick()).unwrap();
        let config = PipelineConfig {
            relabel_by_size: true,
            ..quick()
        };
        let out = run_pipeline(&x, &config).unwrap();
        assert_eq!(out.ranking, vec![0, 1]);
        assert_eq!((out.control, out.case), (0, 1));
        let sizes = crate::cluster_select::bincount(&out.assignment.labels, 6);
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
        // same partition, new names
        for i in 0..20 {
            for j in 0..20 {
                let same_raw = raw.assignment.labels[i] == raw.assignment.labels[j];
                assert_eq!(same_raw, out.assignment.labels[i] == out.assignment.labels[j]);
            }
        }
        assert_eq!(out.significant.expression.gene_ids, raw.significant.expression.gene_ids);
    }
}
