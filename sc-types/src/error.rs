use thiserror::Error;

/// Broad category of a [`ScanError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// A zero-total cell or a feature with no observed values
    DegenerateInput,
    /// A requested dimensionality, perplexity or cluster count that the data cannot support
    Dimensionality,
    /// A comparison group that is missing or too small to test
    EmptyGroup,
    /// Malformed input or parameters
    InvalidInput,
}

/// Errors raised by the pipeline stages. All of them abort the run.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ScanError {
    /// The cell sums to zero, so its counts-per-million scaling factor is zero
    #[error("cell {cell:?} has a total count of zero; its scaling factor is undefined")]
    ZeroTotalCount {
        /// cell identifier
        cell: String,
    },

    /// The cell total overflows, or is so small that `total / target` is not a normal float
    #[error("cell {cell:?} has a total count of {total}, which gives no usable scaling factor")]
    DegenerateTotalCount {
        /// cell identifier
        cell: String,
        /// sum of the present values
        total: f64,
    },

    /// Every entry of the column is missing, so there is no mean to impute with
    #[error("column {column:?} has no observed values; its mean is undefined")]
    EmptyFeature {
        /// column identifier
        column: String,
    },

    /// A size parameter exceeds what the data allows
    #[error("{parameter} = {requested} is not supported by {available} {entity} (limit: {limit})")]
    Dimensionality {
        /// name of the offending parameter
        parameter: &'static str,
        /// the requested value
        requested: f64,
        /// number of points or features available
        available: usize,
        /// what `available` counts
        entity: &'static str,
        /// the rule that was violated
        limit: &'static str,
    },

    /// A comparison group has fewer than two cells
    #[error("{role} group (cluster {cluster}) has {size} cells; at least 2 are required")]
    EmptyGroup {
        /// "control" or "case"
        role: &'static str,
        /// cluster id of the group
        cluster: usize,
        /// number of cells carrying that label
        size: usize,
    },

    /// Not enough populated clusters to pick a comparison pair from
    #[error("found {found} non-empty clusters; two are needed for a comparison")]
    TooFewClusters {
        /// number of non-empty clusters in the ranking
        found: usize,
    },

    /// Anything else that is wrong with the input or the parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ScanError {
    /// The category this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::ZeroTotalCount { .. }
            | ScanError::DegenerateTotalCount { .. }
            | ScanError::EmptyFeature { .. } => ErrorKind::DegenerateInput,
            ScanError::Dimensionality { .. } => ErrorKind::Dimensionality,
            ScanError::EmptyGroup { .. } | ScanError::TooFewClusters { .. } => ErrorKind::EmptyGroup,
            ScanError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Convenience constructor for [`ScanError::InvalidInput`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        ScanError::InvalidInput(msg.into())
    }
}

/// Find the [`ScanError`] inside an `anyhow::Error`, looking through any attached context
pub fn scan_error(err: &anyhow::Error) -> Option<&ScanError> {
    err.chain().find_map(|e| e.downcast_ref::<ScanError>())
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_kind() {
        let e = ScanError::ZeroTotalCount { cell: "c1".into() };
        assert_eq!(e.kind(), ErrorKind::DegenerateInput);
        assert!(e.to_string().contains("c1"));

        let e = ScanError::EmptyGroup {
            role: "case",
            cluster: 4,
            size: 0,
        };
        assert_eq!(e.kind(), ErrorKind::EmptyGroup);
        assert!(e.to_string().contains("cluster 4"));
    }

    #[test]
    fn test_find_through_context() {
        let res: Result<(), anyhow::Error> = Err(ScanError::TooFewClusters { found: 1 }.into());
        let err = res.context("selecting clusters").unwrap_err();
        assert_eq!(scan_error(&err), Some(&ScanError::TooFewClusters { found: 1 }));
    }
}
