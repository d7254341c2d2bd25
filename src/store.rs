//! Activation store
//!
//! Append-only mapping from layer to the per-token expert selections observed
//! in the current session. Layers keep the order in which they were first
//! recorded; records within a layer keep token-arrival order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::layer::LayerKey;
use crate::tensor::ExpertId;

/// Experts selected for exactly one token at one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivationRecord(Vec<ExpertId>);

impl ActivationRecord {
    /// Wrap a top-k row
    #[must_use]
    pub fn new(experts: Vec<ExpertId>) -> Self {
        Self(experts)
    }

    /// Selected experts in gate order
    #[must_use]
    pub fn experts(&self) -> &[ExpertId] {
        &self.0
    }

    /// Routing width of this record
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` for a zero-width record
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-layer activation records for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationLog {
    layers: IndexMap<LayerKey, Vec<ActivationRecord>>,
}

impl ActivationLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record per row of a host-resident `[num_tokens, k]` batch
    ///
    /// Rows are appended in order. Widths are not checked against earlier
    /// batches; a layer may hold records of different lengths.
    ///
    /// # Panics
    ///
    /// Panics if `host_ids.len() != num_tokens * k`, or if that product
    /// overflows `usize`.
    pub fn append_batch(
        &mut self,
        key: LayerKey,
        num_tokens: usize,
        k: usize,
        host_ids: &[ExpertId],
    ) {
        assert_eq!(
            num_tokens.checked_mul(k),
            Some(host_ids.len()),
            "host batch does not match [num_tokens, k]"
        );
        if num_tokens == 0 {
            return;
        }
        let records = self.layers.entry(key).or_default();
        records.reserve(num_tokens);
        if k == 0 {
            records.extend((0..num_tokens).map(|_| ActivationRecord::new(Vec::new())));
        } else {
            records.extend(
                host_ids
                    .chunks_exact(k)
                    .map(|row| ActivationRecord::new(row.to_vec())),
            );
        }
    }

    /// Records filed under one layer
    #[must_use]
    pub fn layer(&self, key: &LayerKey) -> Option<&[ActivationRecord]> {
        self.layers.get(key).map(Vec::as_slice)
    }

    /// Layers in first-recorded order with their records
    pub fn iter(&self) -> impl Iterator<Item = (&LayerKey, &[ActivationRecord])> {
        self.layers.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Number of layers with at least one record
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Total records across all layers
    #[must_use]
    pub fn num_records(&self) -> usize {
        self.layers.values().map(Vec::len).sum()
    }

    /// `true` when nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.layers.clear();
    }
}
