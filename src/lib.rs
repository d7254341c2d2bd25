//! # Expert Distribution
//!
//! Records which experts a Mixture-of-Experts router selects, per layer and
//! per token, while an inference engine runs, and dumps the per-layer,
//! per-expert activation counts as a CSV artifact.
//!
//! ## Features
//!
//! - **Zero-overhead idle path**: `record_new_token` is one atomic load when
//!   no session is open
//! - **Session lifecycle**: start, stop, dump, reset, driven in-process or over
//!   HTTP
//! - **Device abstraction**: routing tensors are read through a
//!   [`device::RoutingDevice`], with a mock for tests
//!
//! ## Example
//!
//! ```rust
//! use expert_distribution::{ExpertDistributionRecorder, LayerId, LayerKey, RecorderConfig, TopkIds};
//!
//! let recorder = ExpertDistributionRecorder::with_host_device(RecorderConfig::default());
//!
//! recorder.start();
//! recorder.set_current_layer(0);
//! recorder
//!     .record_new_token(&TopkIds::from_rows(&[[1u32, 2], [2, 3]]).unwrap())
//!     .unwrap();
//! recorder.stop();
//!
//! let counts = recorder.counts();
//! assert_eq!(counts.count(LayerKey::Layer(LayerId(0)), 2), 2);
//! assert_eq!(counts.layer_total(LayerKey::Layer(LayerId(0))), 4);
//! ```
//!
//! ## Architecture
//!
//! - [`recorder`]: the shared context object and its lifecycle
//! - [`store`] and [`aggregate`]: raw records and their reduction to counts
//! - [`dump`]: artifact naming and writing
//! - `api`: axum control plane (feature `server`)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections

/// Request admission checks
pub mod admission;
/// Per-layer, per-expert counts
pub mod aggregate;
/// HTTP control plane
#[cfg(feature = "server")]
pub mod api;
/// Recorder configuration
pub mod config;
/// Device access for routing tensors
pub mod device;
/// Dump artifacts
pub mod dump;
/// Error types
pub mod error;
/// Layer context
pub mod layer;
/// Top-k gating and synthetic forward passes
pub mod moe;
/// The recorder context object
pub mod recorder;
/// Recording state machine
pub mod state;
/// Raw activation records
pub mod store;
/// Routing tensors
pub mod tensor;

pub use aggregate::ExpertCounts;
pub use config::{RecorderConfig, UnsetLayerPolicy};
pub use device::SyncScope;
pub use dump::DumpReport;
pub use error::{DistributionError, Result};
pub use layer::{LayerId, LayerKey};
pub use recorder::{ExpertDistributionRecorder, RecorderStatus};
pub use state::RecordingState;
pub use tensor::{ExpertId, TopkIds};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
