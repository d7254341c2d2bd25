//! Routing tensor handle
//!
//! `TopkIds` is the `[num_tokens, k]` output of an MoE gate: row `t` lists the
//! experts chosen for token `t` at the current layer. It stands for a tensor
//! that lives in device memory; reading it on the host goes through a
//! [`RoutingDevice`](crate::device::RoutingDevice).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DistributionError, Result};

/// Expert identifier within one MoE layer
pub type ExpertId = u32;

/// Top-k expert selections for a batch of tokens
///
/// # Examples
///
/// ```
/// use expert_distribution::TopkIds;
///
/// let ids = TopkIds::from_vec(2, 2, vec![1, 2, 2, 3]).unwrap();
/// assert_eq!(ids.shape(), [2, 2]);
/// assert_eq!(ids.data(), &[1, 2, 2, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopkIds {
    /// Flattened expert ids in row-major order
    data: Vec<ExpertId>,
    /// Number of tokens (rows)
    num_tokens: usize,
    /// Routing width (columns)
    k: usize,
}

impl TopkIds {
    /// Create from row-major data
    ///
    /// Empty batches (`num_tokens == 0`) are valid and record nothing.
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if `data.len() != num_tokens * k`, or if
    /// that product overflows `usize`.
    pub fn from_vec(num_tokens: usize, k: usize, data: Vec<ExpertId>) -> Result<Self> {
        let expected = num_tokens.checked_mul(k);
        if expected != Some(data.len()) {
            return Err(DistributionError::DataShapeMismatch {
                data_size: data.len(),
                shape: vec![num_tokens, k],
                expected: expected.unwrap_or(usize::MAX),
            });
        }
        Ok(Self {
            data,
            num_tokens,
            k,
        })
    }

    /// Create from one row per token
    ///
    /// # Errors
    ///
    /// Returns `RaggedRows` if the rows differ in width.
    pub fn from_rows<R: AsRef<[ExpertId]>>(rows: &[R]) -> Result<Self> {
        let k = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * k);
        for (row, ids) in rows.iter().enumerate() {
            let ids = ids.as_ref();
            if ids.len() != k {
                return Err(DistributionError::RaggedRows {
                    row,
                    expected: k,
                    actual: ids.len(),
                });
            }
            data.extend_from_slice(ids);
        }
        Ok(Self {
            data,
            num_tokens: rows.len(),
            k,
        })
    }

    /// `[num_tokens, k]`
    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        [self.num_tokens, self.k]
    }

    /// Number of tokens in the batch
    #[must_use]
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Routing width
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Row-major view of the ids
    #[must_use]
    pub fn data(&self) -> &[ExpertId] {
        &self.data
    }

    /// `true` when the batch holds no tokens
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }
}

impl fmt::Display for TopkIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopkIds(shape=[{}, {}])", self.num_tokens, self.k)
    }
}
