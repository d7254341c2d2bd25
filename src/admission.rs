//! Request admission: input length validation
//!
//! Requests whose prompt does not fit the KV cache pool or the context window
//! are either truncated in place or aborted with a client error, depending on
//! whether the server allows automatic truncation.

use serde::{Deserialize, Serialize};

/// HTTP status attached to an aborted request
pub const BAD_REQUEST_STATUS: u16 = 400;

/// Error type name attached to an aborted request
pub const BAD_REQUEST_ERROR: &str = "BadRequestError";

/// Why a request finished before generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinishReason {
    /// Rejected at admission
    Abort {
        /// Human-readable explanation returned to the client
        message: String,
        /// HTTP status code
        status_code: u16,
        /// Error class name
        err_type: String,
    },
}

/// The slice of a request that admission inspects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Prompt token ids
    pub origin_input_ids: Vec<u32>,
    /// Set when admission aborts the request
    pub finished_reason: Option<FinishReason>,
}

impl AdmissionRequest {
    /// Wrap a prompt
    #[must_use]
    pub fn new(origin_input_ids: Vec<u32>) -> Self {
        Self {
            origin_input_ids,
            finished_reason: None,
        }
    }
}

/// Validate the prompt length, truncating or aborting when it is too long
///
/// A prompt of `max_req_input_len` tokens or more is over the limit. With
/// `allow_auto_truncate` it is cut to `max_req_input_len` tokens and `None`
/// is returned; without it the request is marked aborted (400,
/// `BadRequestError`) and the message is returned. Shorter prompts are left
/// untouched.
pub fn validate_input_length(
    req: &mut AdmissionRequest,
    max_req_input_len: usize,
    allow_auto_truncate: bool,
) -> Option<String> {
    let input_len = req.origin_input_ids.len();
    if input_len < max_req_input_len {
        return None;
    }

    if allow_auto_truncate {
        tracing::warn!(
            input_len,
            max_req_input_len,
            "Request length is longer than the KV cache pool size or the max context length. \
             Truncated."
        );
        req.origin_input_ids.truncate(max_req_input_len);
        return None;
    }

    let message = format!(
        "Input length ({input_len} tokens) exceeds the maximum allowed length \
         ({max_req_input_len} tokens). Use a shorter input or enable --allow-auto-truncate."
    );
    tracing::error!("{message}");
    req.finished_reason = Some(FinishReason::Abort {
        message: message.clone(),
        status_code: BAD_REQUEST_STATUS,
        err_type: BAD_REQUEST_ERROR.to_string(),
    });
    Some(message)
}
