//! Recording state machine
//!
//! Two states, no terminal state. Every transition is accepted from every
//! state; redundant transitions are logged as warnings, never rejected.
//!
//! ```text
//!            start (warn if Recording)
//!   ┌──────┐ ─────────────────────────► ┌───────────┐
//!   │ Idle │                            │ Recording │
//!   └──────┘ ◄───────────────────────── └───────────┘
//!            stop (warn if Idle) / reset
//! ```

use serde::{Deserialize, Serialize};

/// Whether routing decisions are currently being captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    /// Calls into the activation store are no-ops
    #[default]
    Idle,
    /// Calls into the activation store append records
    Recording,
}

/// Result of applying a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the transition
    pub from: RecordingState,
    /// The transition had no effect on the state and was warned about
    pub redundant: bool,
}

impl RecordingState {
    /// `true` in `Recording`
    #[must_use]
    pub fn is_recording(self) -> bool {
        matches!(self, Self::Recording)
    }

    /// Enter `Recording`, warning if a session is already open
    ///
    /// The caller discards the previous session's data.
    pub fn start(&mut self) -> Transition {
        let from = *self;
        let redundant = from.is_recording();
        if redundant {
            tracing::warn!(
                "Already recording expert ids; the previous session is discarded. \
                 Did you forget to dump the expert ids recorded so far by sending requests \
                 to the `/stop_expert_distribution_record` and \
                 `/dump_expert_distribution_record` endpoints?"
            );
        }
        *self = Self::Recording;
        Transition {
            from,
            redundant,
        }
    }

    /// Enter `Idle`, warning if nothing was recording
    pub fn stop(&mut self) -> Transition {
        let from = *self;
        let redundant = !from.is_recording();
        if redundant {
            tracing::warn!(
                "Not recording expert ids. Did you forget to start recording by sending \
                 a request to the `/start_expert_distribution_record` endpoint?"
            );
        }
        *self = Self::Idle;
        Transition {
            from,
            redundant,
        }
    }

    /// Enter `Idle` unconditionally and silently
    pub fn reset(&mut self) -> Transition {
        let from = *self;
        *self = Self::Idle;
        Transition {
            from,
            redundant: false,
        }
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Recording => write!(f, "recording"),
        }
    }
}
