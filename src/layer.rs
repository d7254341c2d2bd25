//! Layer context tracking
//!
//! The forward pass announces which MoE layer is about to emit routing
//! decisions; the recorder files every subsequent batch under that layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a model layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub usize);

impl From<usize> for LayerId {
    fn from(idx: usize) -> Self {
        Self(idx)
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key under which activation records are filed
///
/// `Unset` collects batches recorded before any layer was announced, when the
/// recorder is configured to tolerate that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKey {
    /// A concrete layer
    Layer(LayerId),
    /// No layer context was set
    Unset,
}

impl From<Option<LayerId>> for LayerKey {
    fn from(layer: Option<LayerId>) -> Self {
        layer.map_or(Self::Unset, Self::Layer)
    }
}

impl From<LayerId> for LayerKey {
    fn from(layer: LayerId) -> Self {
        Self::Layer(layer)
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Layer(id) => write!(f, "{id}"),
            Self::Unset => write!(f, "unset"),
        }
    }
}

/// Holds the layer currently producing routing decisions
///
/// No validation or ordering: the last `set` wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerContext {
    current: Option<LayerId>,
}

impl LayerContext {
    /// Create a tracker with no layer set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the current layer
    pub fn set(&mut self, layer: impl Into<LayerId>) {
        self.current = Some(layer.into());
    }

    /// Current layer, if any has been set since the last clear
    #[must_use]
    pub fn current(&self) -> Option<LayerId> {
        self.current
    }

    /// Key for records filed right now
    #[must_use]
    pub fn key(&self) -> LayerKey {
        self.current.into()
    }

    /// Forget the current layer
    pub fn clear(&mut self) {
        self.current = None;
    }
}
