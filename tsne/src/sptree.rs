//! Space-partitioning tree over the embedding (a quadtree for 2-D output) used
//! to approximate the repulsive forces.

use ndarray::{ArrayView2, ArrayViewMut1};

// Cells this deep are treated as leaves and summed exactly
const MAX_DEPTH: usize = 48;

#[derive(Clone, Debug)]
struct Node {
    mass_center: Vec<f64>,
    count: usize,
    /// widest side of the cell
    width: f64,
    children: Vec<usize>,
    /// range of `SpaceTree::order` holding the cell's points
    start: usize,
    end: usize,
}

/// Barnes-Hut tree over the rows of an embedding
#[derive(Clone, Debug)]
pub struct SpaceTree<'a> {
    y: ArrayView2<'a, f64>,
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl<'a> SpaceTree<'a> {
    pub fn new(y: ArrayView2<'a, f64>) -> Self {
        let (n, dims) = y.dim();
        let mut lo = vec![f64::INFINITY; dims];
        let mut hi = vec![f64::NEG_INFINITY; dims];
        for row in y.rows() {
            for d in 0..dims {
                lo[d] = lo[d].min(row[d]);
                hi[d] = hi[d].max(row[d]);
            }
        }
        let center: Vec<f64> = (0..dims).map(|d| (lo[d] + hi[d]) / 2.0).collect();
        let half: Vec<f64> = (0..dims).map(|d| (hi[d] - lo[d]) / 2.0 + 1e-5).collect();

        let mut tree = SpaceTree {
            y,
            nodes: Vec::new(),
            order: (0..n).collect(),
        };
        if n > 0 {
            tree.build(0, n, center, half, 0);
        }
        tree
    }

    /// Add the cell holding `order[start..end]` and its descendants; returns the cell's node id
    fn build(&mut self, start: usize, end: usize, center: Vec<f64>, half: Vec<f64>, depth: usize) -> usize {
        let y = self.y.clone();
        let dims = y.ncols();
        let count = end - start;

        let mut mass_center = vec![0.0; dims];
        for &i in &self.order[start..end] {
            for d in 0..dims {
                mass_center[d] += y[[i, d]] / count as f64;
            }
        }
        let width = 2.0 * half.iter().cloned().fold(0.0, f64::max);
        let id = self.nodes.len();
        self.nodes.push(Node {
            mass_center,
            count,
            width,
            children: Vec::new(),
            start,
            end,
        });

        let first = y.row(self.order[start]);
        let all_same = self.order[start..end].iter().all(|&i| y.row(i) == first);
        if count <= 1 || all_same || depth >= MAX_DEPTH {
            return id;
        }

        // bit d is set when coordinate d lies in the upper half of the cell
        let orthant = |i: usize| (0..dims).fold(0usize, |acc, d| acc | (usize::from(y[[i, d]] >= center[d]) << d));
        self.order[start..end].sort_by_key(|&i| orthant(i));

        let mut children = Vec::new();
        let mut s = start;
        while s < end {
            let o = orthant(self.order[s]);
            let mut e = s + 1;
            while e < end && orthant(self.order[e]) == o {
                e += 1;
            }
            let child_half: Vec<f64> = half.iter().map(|h| h / 2.0).collect();
            let child_center: Vec<f64> = (0..dims)
                .map(|d| {
                    if (o >> d) & 1 == 1 {
                        center[d] + child_half[d]
                    } else {
                        center[d] - child_half[d]
                    }
                })
                .collect();
            children.push(self.build(s, e, child_center, child_half, depth + 1));
            s = e;
        }
        self.nodes[id].children = children;
        id
    }

    /// Accumulate into `force` the unnormalized repulsion on point `i`,
    /// `sum_j q_ij^2 (y_i - y_j)` with `q_ij = (1 + |y_i - y_j|^2)^-1`, summarizing every
    /// cell with `width / distance < theta` by its center of mass.
    /// Returns `sum_j q_ij`, the point's share of the normalization of Q.
    pub fn repulsion(&self, i: usize, theta: f64, force: &mut ArrayViewMut1<f64>) -> f64 {
        let yi = self.y.row(i);
        let dims = yi.len();
        let mut sum_q = 0.0;
        let mut stack = if self.nodes.is_empty() { vec![] } else { vec![0] };

        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.children.is_empty() {
                for &j in &self.order[node.start..node.end] {
                    if j == i {
                        continue;
                    }
                    let yj = self.y.row(j);
                    let d2: f64 = (0..dims).map(|d| (yi[d] - yj[d]) * (yi[d] - yj[d])).sum();
                    let q = 1.0 / (1.0 + d2);
                    sum_q += q;
                    for d in 0..dims {
                        force[d] += q * q * (yi[d] - yj[d]);
                    }
                }
                continue;
            }

            let com = &node.mass_center;
            let d2: f64 = (0..dims).map(|d| (yi[d] - com[d]) * (yi[d] - com[d])).sum();
            if node.width * node.width < theta * theta * d2 {
                let q = 1.0 / (1.0 + d2);
                let mult = node.count as f64 * q;
                sum_q += mult;
                for d in 0..dims {
                    force[d] += mult * q * (yi[d] - com[d]);
                }
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        sum_q
    }
}
