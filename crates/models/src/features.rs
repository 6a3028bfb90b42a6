use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{EngineError, Result};

/// A flattened window of normalized per-bar features, oldest bar first.
/// Shape is `window` rows of `dims` columns; derived data, never mutated
/// after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    pub symbol: String,
    pub values: Vec<f64>,
    pub window: usize,
    pub dims: usize,
    pub as_of: DateTime<Utc>,
}

impl FeatureVector {
    pub fn new(
        symbol: String,
        values: Vec<f64>,
        window: usize,
        dims: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Self> {
        if window == 0 || dims == 0 {
            return Err(EngineError::InvalidFeatures(format!(
                "degenerate shape {window}x{dims} for {symbol}"
            )));
        }
        if values.len() != window * dims {
            return Err(EngineError::InvalidFeatures(format!(
                "expected {} values for {window}x{dims}, got {}",
                window * dims,
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::InvalidFeatures(format!(
                "non-finite feature value {bad} for {symbol}"
            )));
        }

        Ok(Self { symbol, values, window, dims, as_of })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Feature row for one bar, index 0 being the oldest in the window.
    pub fn bar(&self, index: usize) -> Option<&[f64]> {
        if index >= self.window {
            return None;
        }
        let start = index * self.dims;
        Some(&self.values[start..start + self.dims])
    }

    pub fn latest_bar(&self) -> &[f64] {
        let start = (self.window - 1) * self.dims;
        &self.values[start..]
    }
}

/// Short-horizon return estimate with a dispersion measure. A forecast past
/// the configured uncertainty ceiling is flagged low-confidence and the
/// policy treats it as carrying no information.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastEstimate {
    pub point: f64,
    pub uncertainty: f64,
    pub low_confidence: bool,
}

impl ForecastEstimate {
    pub fn new(point: f64, uncertainty: f64, ceiling: f64) -> Self {
        let low_confidence = !point.is_finite() || !uncertainty.is_finite() || uncertainty > ceiling;
        Self {
            point: if point.is_finite() { point } else { 0.0 },
            uncertainty,
            low_confidence,
        }
    }

    /// Placeholder used before the forecaster has seen enough samples.
    pub fn uninformed() -> Self {
        Self {
            point: 0.0,
            uncertainty: f64::INFINITY,
            low_confidence: true,
        }
    }

    /// The point estimate if trustworthy, zero otherwise. This is what the
    /// policy consumes so low confidence degrades to no signal, not an error.
    pub fn informative_point(&self) -> f64 {
        if self.low_confidence {
            0.0
        } else {
            self.point
        }
    }
}
