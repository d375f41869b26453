// Command line utility for running the sc-pipeline analysis on a CSV count matrix

use anyhow::{format_err, Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use diff_exp::TTestKind;
use itertools::Itertools;
use log::{error, info};
use sc_pipeline::cluster_select::summarize_clusters;
use sc_pipeline::csv_matrix::{finish_gz, gz_csv_writer, load_csv, write_csv};
use sc_pipeline::dim_red::PcaSolver;
use sc_pipeline::{run_pipeline, ComparisonPolicy, PipelineConfig, PipelineOutput};
use sc_types::error::scan_error;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

fn command() -> Command {
    Command::new("sc-pipeline-cmd")
        .about("Embed, cluster and test single-cell expression counts")
        .arg(
            Arg::new("INPUT")
                .help("CSV count matrix: genes as rows, cells as columns, optionally gzipped")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("NUM_PCS")
                .help("Number of PCA dimensions fed to t-SNE")
                .short('d')
                .long("num_pcs")
                .default_value("6")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("PCA_SOLVER")
                .help("SVD used for the PCA")
                .long("pca_solver")
                .default_value("auto")
                .value_parser(["auto", "exact", "randomized"]),
        )
        .arg(
            Arg::new("PERPLEXITY")
                .help("t-SNE perplexity")
                .short('p')
                .long("perplexity")
                .default_value("5")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("TSNE_ITER")
                .help("Number of t-SNE iterations")
                .long("tsne_iter")
                .default_value("1000")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("NUM_CLUSTERS")
                .help("Number of k-means clusters")
                .short('k')
                .long("num_clusters")
                .default_value("6")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("N_INIT")
                .help("Number of k-means restarts")
                .long("n_init")
                .default_value("10")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("MAX_ITER")
                .help("Maximum Lloyd iterations per restart")
                .long("max_iter")
                .default_value("300")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("TOP_CLUSTERS")
                .help("Number of clusters kept when ranking by size")
                .long("top_clusters")
                .default_value("2")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("P_VALUE")
                .help("Significance threshold on the t-test p-value")
                .long("p_value")
                .default_value("0.05")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("T_TEST")
                .help("Two-sample t-test")
                .long("t_test")
                .default_value("student")
                .value_parser(["student", "welch"]),
        )
        .arg(
            Arg::new("SEED")
                .help("Random seed")
                .short('s')
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("CONTROL")
                .help("Control cluster id; defaults to the largest cluster")
                .long("control")
                .requires("CASE")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("CASE")
                .help("Case cluster id; defaults to the second largest cluster")
                .long("case")
                .requires("CONTROL")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("RELABEL")
                .help("Number clusters from largest to smallest; --control/--case use the new ids")
                .long("relabel_by_size")
                .action(ArgAction::SetTrue),
        )
}

fn arg<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Result<T, Error> {
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| format_err!("missing argument {id}"))
}

fn config(matches: &ArgMatches) -> Result<PipelineConfig, Error> {
    let comparison = match (
        matches.get_one::<usize>("CONTROL"),
        matches.get_one::<usize>("CASE"),
    ) {
        (Some(&control), Some(&case)) => ComparisonPolicy::Fixed { control, case },
        _ => ComparisonPolicy::TopRanked,
    };
    Ok(PipelineConfig {
        n_components: arg(matches, "NUM_PCS")?,
        perplexity: arg(matches, "PERPLEXITY")?,
        pca_solver: arg::<String>(matches, "PCA_SOLVER")?.parse::<PcaSolver>()?,
        tsne_max_iter: arg(matches, "TSNE_ITER")?,
        n_clusters: arg(matches, "NUM_CLUSTERS")?,
        n_init: arg(matches, "N_INIT")?,
        max_iter: arg(matches, "MAX_ITER")?,
        num_top_clusters: arg(matches, "TOP_CLUSTERS")?,
        p_value_threshold: arg(matches, "P_VALUE")?,
        t_test: arg::<String>(matches, "T_TEST")?.parse::<TTestKind>()?,
        seed: arg(matches, "SEED")?,
        comparison,
        relabel_by_size: matches.get_flag("RELABEL"),
    })
}

fn write_embedding(out: &PipelineOutput, path: &Path) -> Result<(), Error> {
    let mut wtr = gz_csv_writer(path)?;
    wtr.write_record(["cell", "x", "y", "cluster"])?;
    for ((cell, row), label) in out
        .normalized
        .cell_ids
        .iter()
        .zip(out.embedding.embedding.rows())
        .zip(&out.assignment.labels)
    {
        wtr.write_record([cell.clone(), row[0].to_string(), row[1].to_string(), label.to_string()])?;
    }
    finish_gz(wtr)
}

fn write_clusters(out: &PipelineOutput, path: &Path) -> Result<(), Error> {
    let mut wtr = gz_csv_writer(path)?;
    wtr.write_record(["cluster", "count", "rank", "centroid_x", "centroid_y"])?;
    for s in summarize_clusters(&out.assignment) {
        wtr.write_record([
            s.id.to_string(),
            s.size.to_string(),
            s.rank.map(|r| r.to_string()).unwrap_or_default(),
            s.centroid[0].to_string(),
            s.centroid[1].to_string(),
        ])?;
    }
    finish_gz(wtr)
}

fn write_significant_genes(out: &PipelineOutput, path: &Path) -> Result<(), Error> {
    let mut wtr = gz_csv_writer(path)?;
    let table = &out.significant;
    wtr.write_record([
        "gene".to_owned(),
        format!("mean_cluster_{}", table.control),
        format!("mean_cluster_{}", table.case),
        "log_fold_change".to_owned(),
        "t_statistic".to_owned(),
        "p_value".to_owned(),
        "adjusted_p_value".to_owned(),
    ])?;
    for (gene, t) in table.expression.gene_ids.iter().zip(&table.tests) {
        wtr.write_record([
            gene.clone(),
            t.mean_control.to_string(),
            t.mean_case.to_string(),
            t.log_fold_change.to_string(),
            t.statistic.to_string(),
            t.p_value.to_string(),
            t.adjusted_p_value.to_string(),
        ])?;
    }
    finish_gz(wtr)
}

fn run(matches: &ArgMatches) -> Result<(), Error> {
    let input: PathBuf = arg(matches, "INPUT")?;
    let out_dir: PathBuf = arg(matches, "OUT_DIR")?;
    let config = config(matches)?;

    let matrix = load_csv(&input)?;
    let out = run_pipeline(&matrix, &config)?;

    create_dir_all(&out_dir).with_context(|| out_dir.display().to_string())?;
    write_embedding(&out, &out_dir.join("embedding.csv.gz"))?;
    write_clusters(&out, &out_dir.join("clusters.csv.gz"))?;
    write_significant_genes(&out, &out_dir.join("significant_genes.csv.gz"))?;

    let mut wtr = gz_csv_writer(out_dir.join("significant_expression.csv.gz"))?;
    write_csv(&out.significant.expression, "gene", &mut wtr)?;
    finish_gz(wtr)?;

    info!(
        "significant genes: {}",
        out.significant.expression.gene_ids.iter().take(20).join(", ")
    );
    info!("wrote results to {}", out_dir.display());
    Ok(())
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = command().get_matches();
    run(&matches).map_err(|e| {
        if let Some(kind) = scan_error(&e).map(|s| s.kind()) {
            error!("{:?} error: {:#}", kind, e);
        }
        e
    })
}
