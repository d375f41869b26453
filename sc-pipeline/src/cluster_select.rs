use crate::kmeans::ClusterAssignment;
use anyhow::Error;
use log::info;
use ndarray::{Array1, Axis};
use sc_types::ScanError;

/// Population of every label in `0..max(num_labels, max_label + 1)`
pub fn bincount(labels: &[usize], num_labels: usize) -> Vec<usize> {
    let len = labels.iter().map(|&l| l + 1).max().unwrap_or(0).max(num_labels);
    let mut counts = vec![0; len];
    for &l in labels {
        counts[l] += 1;
    }
    counts
}

/// Every cluster id in `0..counts.len()`, by descending population
fn size_order(counts: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..counts.len()).collect();
    // stable: equal counts keep ascending id order
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
    order
}

/// Cluster ids ordered by descending population (ties by ascending id), at most `num_clusters`
/// of them, with empty clusters left out.
pub fn select_top_from_counts(counts: &[usize], num_clusters: usize) -> Vec<usize> {
    size_order(counts)
        .into_iter()
        .take(num_clusters)
        .filter(|&c| counts[c] > 0)
        .collect()
}

/// Rank the clusters of `labels` by size and return the `num_clusters` largest
pub fn select_top_clusters(labels: &[usize], num_clusters: usize) -> Vec<usize> {
    let ranking = select_top_from_counts(&bincount(labels, 0), num_clusters);
    info!("top {} clusters by size: {:?}", num_clusters, ranking);
    ranking
}

/// The two clusters to compare: first ranked is the control, second the case
pub fn comparison_pair(ranking: &[usize]) -> Result<(usize, usize), Error> {
    match ranking {
        [control, case, ..] => Ok((*control, *case)),
        _ => Err(ScanError::TooFewClusters { found: ranking.len() }.into()),
    }
}

/// Relabel a clustering from greatest cluster size to least. Centroids move with
/// their clusters; empty clusters take the highest ids.
pub fn relabel_by_size(assignment: ClusterAssignment) -> ClusterAssignment {
    let order = size_order(&bincount(&assignment.labels, assignment.num_clusters()));
    let mut new_id = vec![0; order.len()];
    for (new, &old) in order.iter().enumerate() {
        new_id[old] = new;
    }
    info!("relabeling clusters by size: {:?}", order);
    ClusterAssignment {
        labels: assignment.labels.iter().map(|&l| new_id[l]).collect(),
        centroids: assignment.centroids.select(Axis(0), &order),
        ..assignment
    }
}

/// Size and centroid of one cluster
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterSummary {
    /// cluster id
    pub id: usize,
    /// number of points
    pub size: usize,
    /// 1-based position in the size ranking, `None` for empty clusters
    pub rank: Option<usize>,
    /// centroid in the clustered space
    pub centroid: Array1<f64>,
}

/// One summary per cluster of `assignment`, in id order
pub fn summarize_clusters(assignment: &ClusterAssignment) -> Vec<ClusterSummary> {
    let k = assignment.num_clusters();
    let counts = bincount(&assignment.labels, k);
    let ranking = select_top_from_counts(&counts, k);
    (0..k)
        .map(|id| ClusterSummary {
            id,
            size: counts[id],
            rank: ranking.iter().position(|&c| c == id).map(|r| r + 1),
            centroid: assignment.centroids.row(id).to_owned(),
        })
        .collect()
}
