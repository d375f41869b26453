use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use noisy_float::prelude::{n64, N64};
use num_traits::Bounded;
use vpsearch::{BestCandidate, MetricSpace, Tree};

#[derive(Clone, Debug)]
struct Point<'a> {
    coords: ArrayView1<'a, f64>,
    idx: usize,
}

fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl MetricSpace for Point<'_> {
    type UserData = ();
    type Distance = N64;

    fn distance(&self, other: &Self, _: &Self::UserData) -> Self::Distance {
        n64(squared_distance(&self.coords, &other.coords).sqrt())
    }
}

/// Keeps the `max_count` closest candidates seen so far, sorted by distance then index
struct Nearest {
    max_count: usize,
    max_distance: N64,
    found: Vec<(N64, usize)>,
}

impl Nearest {
    fn new(max_count: usize) -> Self {
        Nearest {
            max_count,
            max_distance: N64::max_value(),
            found: Vec::with_capacity(max_count + 1),
        }
    }

    fn clear(&mut self) {
        self.max_distance = N64::max_value();
        self.found.clear();
    }

    fn insert(&mut self, index: usize, distance: N64) {
        let val = (distance, index);
        let pos = self.found.binary_search(&val).unwrap_or_else(|x| x);
        self.found.insert(pos, val);
        if self.found.len() >= self.max_count {
            self.found.truncate(self.max_count);
            if let Some(&(d, _)) = self.found.last() {
                self.max_distance = d;
            }
        }
    }
}

impl<'a, 'p> BestCandidate<Point<'p>, ()> for &'a mut Nearest {
    type Output = std::iter::Cloned<std::slice::Iter<'a, (N64, usize)>>;

    #[inline]
    fn consider(&mut self, _: &Point<'p>, distance: N64, candidate_index: usize, _: &()) {
        if self.max_count == 0 {
            return;
        }
        if distance < self.max_distance || self.found.len() < self.max_count {
            self.insert(candidate_index, distance);
        }
    }

    #[inline]
    fn distance(&self) -> N64 {
        self.max_distance
    }

    fn result(self, _: &()) -> Self::Output {
        self.found.as_slice().iter().cloned()
    }
}

/// The `k` nearest rows of every row of `x` (itself excluded), closest first.
/// Returns the neighbour indices and their squared Euclidean distances, both `(n, k)`.
/// `k` must be below the number of rows.
pub fn nearest_neighbors(x: &ArrayView2<f64>, k: usize) -> (Array2<usize>, Array2<f64>) {
    let n = x.nrows();
    let points: Vec<Point> = x
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(idx, coords)| Point { coords, idx })
        .collect();
    let vp = Tree::new_with_user_data_ref(&points, &());

    let mut indices = Array2::from_elem((n, k), usize::MAX);
    let mut distances = Array2::from_elem((n, k), f64::INFINITY);

    indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip_eq(distances.axis_iter_mut(Axis(0)).into_par_iter())
        .enumerate()
        .for_each_init(
            || Nearest::new(k + 1),
            |nearest, (i, (mut idx_row, mut dist_row))| {
                nearest.clear();
                let query = &points[i];
                let mut m = 0;
                for (_, j) in vp.find_nearest_custom(query, &(), nearest) {
                    if j != query.idx && m < k {
                        idx_row[m] = j;
                        dist_row[m] = squared_distance(&query.coords, &points[j].coords);
                        m += 1;
                    }
                }
            },
        );

    (indices, distances)
}
