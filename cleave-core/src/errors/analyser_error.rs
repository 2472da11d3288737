//! Range-analyser errors.

use crate::types::timestamp::Timestamp;

/// Structural failures while reconstructing shard-range paths.
#[derive(Debug, thiserror::Error)]
pub enum AnalyserError {
    #[error("Malformed bounds for {name}: lower {lower:?} not below upper {upper:?}")]
    MalformedBounds {
        name: String,
        lower: String,
        upper: String,
    },

    #[error("Tied paths at {timestamp} have identical membership")]
    IndistinctPaths { timestamp: Timestamp },
}
