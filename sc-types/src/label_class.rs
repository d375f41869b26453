use std::collections::BTreeMap;

/// Cell indices grouped by cluster label, stored as one flat index list with per-label offsets.
/// Labels are kept in ascending order; cells within a label keep their original order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CellGroups {
    pub labels: Vec<usize>,
    pub offsets: Vec<usize>,
    pub indices: Vec<usize>,
}

impl CellGroups {
    /// Group cell positions `0..assignments.len()` by their label.
    pub fn from_assignments(assignments: &[usize]) -> CellGroups {
        let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (cell, &label) in assignments.iter().enumerate() {
            by_label.entry(label).or_default().push(cell);
        }

        let mut groups = CellGroups::default();
        for (label, cells) in by_label {
            groups.labels.push(label);
            groups.offsets.push(groups.indices.len());
            groups.indices.extend(cells);
        }
        groups
    }

    fn get_label_index(&self, label: usize) -> Option<usize> {
        self.labels.binary_search(&label).ok()
    }

    /// Cells carrying `label`, or None if no cell does.
    pub fn get_indices(&self, label: usize) -> Option<&[usize]> {
        self.get_label_index(label).map(|idx| {
            let offset = self.offsets[idx];
            if idx == self.offsets.len() - 1 {
                &self.indices[offset..]
            } else {
                &self.indices[offset..self.offsets[idx + 1]]
            }
        })
    }

    /// Number of cells carrying `label` (zero if absent)
    pub fn size(&self, label: usize) -> usize {
        self.get_indices(label).map_or(0, <[usize]>::len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_groups() {
        let g = CellGroups::from_assignments(&[2, 0, 2, 5, 0, 2]);
        assert_eq!(g.labels, vec![0, 2, 5]);
        assert_eq!(g.offsets, vec![0, 2, 5]);
        assert_eq!(g.indices, vec![1, 4, 0, 2, 5, 3]);

        assert_eq!(g.get_indices(0), Some(&[1, 4][..]));
        assert_eq!(g.get_indices(2), Some(&[0, 2, 5][..]));
        assert_eq!(g.get_indices(5), Some(&[3][..]));
        assert_eq!(g.get_indices(1), None);
        assert_eq!(g.size(1), 0);
        assert_eq!(g.size(2), 3);
    }

    #[test]
    fn test_empty() {
        let g = CellGroups::from_assignments(&[]);
        assert!(g.labels.is_empty());
        assert_eq!(g.get_indices(0), None);
    }
}
