//! Per-layer, per-expert activation counts
//!
//! Reduces an [`ActivationLog`] to one count per `(layer, expert)` pair. Every
//! position of every record contributes one increment, so an expert listed
//! twice in one token's top-k counts twice and each layer's counts sum to the
//! number of expert slots recorded for it.
//!
//! Order is encounter order, not numeric: layers in the order they were first
//! recorded, experts in the order they were first seen while scanning.

use std::io::Write;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use crate::layer::LayerKey;
use crate::store::ActivationLog;
use crate::tensor::ExpertId;

/// CSV header of the dump artifact
pub const CSV_HEADER: &str = "layer_id,expert_id,count";

/// One `(layer, expert, count)` triple, serialized as one CSV row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountRow {
    /// Layer key
    #[serde(rename = "layer_id", serialize_with = "serialize_layer_key")]
    pub layer: LayerKey,
    /// Expert id
    #[serde(rename = "expert_id")]
    pub expert: ExpertId,
    /// Occurrences across all records of the layer
    pub count: u64,
}

/// Layer ids as plain integers, the unset key as `unset`
fn serialize_layer_key<S: Serializer>(
    layer: &LayerKey,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(layer)
}

/// Aggregated expert activation counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpertCounts {
    layers: IndexMap<LayerKey, IndexMap<ExpertId, u64>>,
}

impl ExpertCounts {
    /// Reduce a log to counts
    #[must_use]
    pub fn from_log(log: &ActivationLog) -> Self {
        let mut layers: IndexMap<LayerKey, IndexMap<ExpertId, u64>> =
            IndexMap::with_capacity(log.num_layers());
        for (key, records) in log.iter() {
            let counts = layers.entry(*key).or_default();
            for record in records {
                for &expert in record.experts() {
                    *counts.entry(expert).or_insert(0) += 1;
                }
            }
        }
        Self { layers }
    }

    /// Count for one pair, zero if never seen
    #[must_use]
    pub fn count(&self, layer: LayerKey, expert: ExpertId) -> u64 {
        self.layers
            .get(&layer)
            .and_then(|experts| experts.get(&expert))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of all counts for one layer
    #[must_use]
    pub fn layer_total(&self, layer: LayerKey) -> u64 {
        self.layers
            .get(&layer)
            .map_or(0, |experts| experts.values().sum())
    }

    /// Sum of all counts
    #[must_use]
    pub fn total(&self) -> u64 {
        self.layers.values().flat_map(IndexMap::values).sum()
    }

    /// Number of layers
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of `(layer, expert)` rows
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.layers.values().map(IndexMap::len).sum()
    }

    /// Rows in dump order
    pub fn rows(&self) -> impl Iterator<Item = CountRow> + '_ {
        self.layers.iter().flat_map(|(layer, experts)| {
            experts.iter().map(move |(&expert, &count)| CountRow {
                layer: *layer,
                expert,
                count,
            })
        })
    }

    /// Write header and rows as CSV, then flush `writer`
    ///
    /// The header is written even when there are no rows.
    ///
    /// # Errors
    ///
    /// Returns the first I/O or serialization error from the CSV writer.
    pub fn write_csv<W: Write>(&self, writer: W) -> std::io::Result<()> {
        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        csv.write_record(CSV_HEADER.split(','))?;
        for row in self.rows() {
            csv.serialize(row)?;
        }
        csv.flush()
    }
}
