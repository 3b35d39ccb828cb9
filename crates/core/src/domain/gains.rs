//! JSON gain-update messages
//!
//! A control collaborator sends a single JSON array with one number per band,
//! e.g. `[0, 3, -2, 0, 5, 0, -3, 2, 0, 1]`. A message is either applied whole
//! or rejected whole.

use crate::domain::dsp::{GainControl, BAND_COUNT};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a gain-update message was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GainUpdateError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Expected a JSON array of band gains")]
    NotAnArray,

    #[error("Expected {expected} gains, got {found}")]
    WrongLength { expected: usize, found: usize },

    #[error("Gain at index {0} is not a number")]
    NotANumber(usize),
}

/// Parse a gain-update message into a full gain vector
///
/// Surrounding whitespace (including the trailing newline of line-based
/// transports) is ignored. Values are returned as sent; clamping happens when
/// they are applied.
pub fn parse_gain_update(message: &str) -> Result<[f64; BAND_COUNT], GainUpdateError> {
    let value: Value = serde_json::from_str(message.trim())
        .map_err(|e| GainUpdateError::InvalidJson(e.to_string()))?;

    let items = value.as_array().ok_or(GainUpdateError::NotAnArray)?;
    if items.len() != BAND_COUNT {
        return Err(GainUpdateError::WrongLength {
            expected: BAND_COUNT,
            found: items.len(),
        });
    }

    let mut gains = [0.0; BAND_COUNT];
    for (index, (dst, item)) in gains.iter_mut().zip(items).enumerate() {
        *dst = item.as_f64().ok_or(GainUpdateError::NotANumber(index))?;
    }

    Ok(gains)
}

impl GainControl {
    /// Parse `message` and apply it as one gain-vector update
    pub fn apply_json(&self, message: &str) -> Result<(), GainUpdateError> {
        match parse_gain_update(message) {
            Ok(gains) => {
                self.set_all_gains(&gains);
                debug!(?gains, "Applied gain update");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Rejected gain update");
                Err(e)
            }
        }
    }
}
