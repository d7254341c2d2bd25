//! Mixture-of-Experts top-k gating and a synthetic forward pass
//!
//! The recorder only consumes routing decisions. This module produces them for
//! the `simulate` command and for integration tests, and shows the contract a
//! real forward pass follows:
//!
//! ```text
//! for layer in 0..num_layers:
//!   1. recorder.set_current_layer(layer)
//!   2. topk_ids = gate(router_scores)          // [num_tokens, k]
//!   3. recorder.record_new_token(&topk_ids)    // no-op unless recording
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{DistributionError, Result};
use crate::recorder::ExpertDistributionRecorder;
use crate::tensor::{ExpertId, TopkIds};

/// Top-k gate over a fixed expert count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopKGate {
    num_experts: usize,
    k: usize,
}

impl TopKGate {
    /// Create a gate selecting `k` of `num_experts` experts per token
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `k` is zero or exceeds `num_experts`.
    pub fn new(num_experts: usize, k: usize) -> Result<Self> {
        if k == 0 || k > num_experts {
            return Err(DistributionError::InvalidConfig(format!(
                "top-k must be in 1..={num_experts}, got {k}"
            )));
        }
        Ok(Self { num_experts, k })
    }

    /// Number of experts scored per token
    #[must_use]
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Experts selected per token
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Route a `[num_tokens, num_experts]` score matrix
    ///
    /// Each token gets its highest-scoring `k` experts, best first. Ties go to
    /// the lower expert id. NaN scores are ordered by `f32::total_cmp`.
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if `scores.len() != num_tokens * num_experts`,
    /// or if that product overflows `usize`.
    pub fn route_batch(&self, scores: &[f32], num_tokens: usize) -> Result<TopkIds> {
        let expected = num_tokens.checked_mul(self.num_experts);
        if expected != Some(scores.len()) {
            return Err(DistributionError::DataShapeMismatch {
                data_size: scores.len(),
                shape: vec![num_tokens, self.num_experts],
                expected: expected.unwrap_or(usize::MAX),
            });
        }
        let mut ids = Vec::with_capacity(num_tokens * self.k);
        for token_scores in scores.chunks_exact(self.num_experts) {
            ids.extend(Self::top_k_indices(token_scores, self.k));
        }
        TopkIds::from_vec(num_tokens, self.k, ids)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn top_k_indices(scores: &[f32], k: usize) -> Vec<ExpertId> {
        let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        indexed
            .into_iter()
            .take(k)
            .map(|(i, _)| i as ExpertId)
            .collect()
    }
}

/// Run one forward step: for each layer, announce it, gate, and record
///
/// `layer_scores[l]` is the `[num_tokens, num_experts]` score matrix of layer
/// `l`. Returns the routing tensor emitted at each layer.
///
/// # Errors
///
/// Returns the first gating or recording error.
pub fn route_layers(
    recorder: &ExpertDistributionRecorder,
    gate: &TopKGate,
    layer_scores: &[Vec<f32>],
    num_tokens: usize,
) -> Result<Vec<TopkIds>> {
    let mut emitted = Vec::with_capacity(layer_scores.len());
    for (layer, scores) in layer_scores.iter().enumerate() {
        recorder.set_current_layer(layer);
        let ids = gate.route_batch(scores, num_tokens)?;
        recorder.record_new_token(&ids)?;
        emitted.push(ids);
    }
    Ok(emitted)
}

/// Parameters of a synthetic recording run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// MoE layers per forward step
    pub num_layers: usize,
    /// Experts per layer
    pub num_experts: usize,
    /// Experts selected per token
    pub top_k: usize,
    /// Tokens per step
    pub tokens_per_step: usize,
    /// Forward steps
    pub steps: usize,
    /// Bias toward higher expert ids; 0.0 is uniform
    pub skew: f32,
    /// RNG seed
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_layers: 4,
            num_experts: 8,
            top_k: 2,
            tokens_per_step: 16,
            steps: 8,
            skew: 0.5,
            seed: 42,
        }
    }
}

/// Drive `config.steps` synthetic forward steps through `recorder`
///
/// The recorder's lifecycle is left to the caller; this only emits routing
/// decisions. Returns the number of routing batches emitted.
///
/// # Errors
///
/// Returns `InvalidConfig` for an impossible gate, or the first recording error.
#[allow(clippy::cast_precision_loss)]
pub fn simulate(
    recorder: &ExpertDistributionRecorder,
    config: &SimulationConfig,
) -> Result<usize> {
    let gate = TopKGate::new(config.num_experts, config.top_k)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let bias: Vec<f32> = (0..config.num_experts)
        .map(|e| config.skew * e as f32 / config.num_experts as f32)
        .collect();

    let mut batches = 0;
    for _ in 0..config.steps {
        let layer_scores: Vec<Vec<f32>> = (0..config.num_layers)
            .map(|_| {
                (0..config.tokens_per_step * config.num_experts)
                    .map(|i| rng.gen_range(0.0f32..1.0) + bias[i % config.num_experts])
                    .collect()
            })
            .collect();
        let emitted = route_layers(recorder, &gate, &layer_scores, config.tokens_per_step)?;
        batches += emitted.len();
    }
    Ok(batches)
}
