//! Retry policy and error classification.
//!
//! Item-level failures inside a batch either surface immediately (semantic
//! errors) or join a retry list (transient errors). Classification inspects
//! the typed failures the hub client buries in the report chain; there is no
//! string matching on error messages.

use std::time::Duration;

use bon::Builder;
use color_eyre::Report;
use rand::Rng as _;

use clients::hub::v1::{ApiFailure, TransportFailure};

/// Service error code the hub uses for "operation not allowed by tier".
/// A 403 carrying it is a hard failure, not a transient one.
const TIER_DENIED: u32 = 3193;

/// Service error code for "still referenced" delete rejections.
const DELETE_REFERENCED: u32 = 3008;

/// Service error code range for reference-not-found violations; transient
/// while a batch is still creating the referenced artifacts.
const REFERENCE_CODES: std::ops::Range<u32> = 6000..7000;

/// Backoff parameters for item-level retries.
#[derive(Clone, Debug, Builder)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_timeout: Duration,
    max_timeout: Duration,
    factor: f64,
    randomize: bool,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// The backoff before retry number `attempt` (1-based):
    /// `min(max, min · factor^(attempt-1) · jitter)` with jitter in `[1, 2)`
    /// when randomization is on. A factor of zero disables growth entirely.
    pub fn delay(&self, attempt: u32) -> Duration {
        let growth = if self.factor == 0.0 {
            1.0
        } else {
            self.factor.powi(attempt.saturating_sub(1) as i32)
        };
        let jitter = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        let millis = (self.min_timeout.as_millis() as f64 * growth * jitter)
            .min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Per-item retry record.
///
/// `attempt` counts attempts already made; it only advances when a retry is
/// actually scheduled, so the first failure of an item carries `attempt = 1`.
#[derive(Debug)]
pub struct RetryItem {
    pub name: String,
    pub attempt: u32,
    pub delay: Duration,
    pub error: Report,
}

/// Find the structured hub failure buried in a report chain, if any.
pub fn api_failure(err: &Report) -> Option<&ApiFailure> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

/// Whether the report stems from a network-level failure (connection reset,
/// timeout, DNS) rather than an HTTP response.
pub fn is_transport_error(err: &Report) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<TransportFailure>().is_some())
}

/// Classify a push failure as retriable.
///
/// `extra_status` is the per-service allow-list of additional HTTP codes;
/// `transient_codes` are the artifact type's reference-violation codes that
/// make a 400 retriable (for example 2504 for types, 2503 for content).
pub fn is_retriable_push(err: &Report, extra_status: &[u16], transient_codes: &[u32]) -> bool {
    if is_transport_error(err) {
        return true;
    }
    let Some(failure) = api_failure(err) else {
        return false;
    };
    match failure.status {
        403 => !failure.has_code(TIER_DENIED),
        429 | 500 | 502 | 503 | 504 => true,
        400 => {
            failure.has_code_in(REFERENCE_CODES)
                || transient_codes.iter().any(|code| failure.has_code(*code))
        }
        status => extra_status.contains(&status),
    }
}

/// Classify a delete failure as retriable: only reference violations are,
/// since breaking one link in a later pass may unblock this one.
pub fn is_retriable_delete(err: &Report) -> bool {
    let Some(failure) = api_failure(err) else {
        return false;
    };
    failure.status == 400
        && (failure.has_code(DELETE_REFERENCED) || failure.has_code_in(REFERENCE_CODES))
}
