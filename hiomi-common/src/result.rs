//! Inference result data model
//!
//! The remote inference service reports results in an envelope:
//!
//! ```json
//! {
//!   "filename": "xray1.png",
//!   "userId": "1",
//!   "contentType": "image/png",
//!   "size": 48213,
//!   "result": {
//!     "prediction": "Pneumonia",
//!     "confidence": 0.93,
//!     "probabilities": { "pneumonia": 0.93, "normal": 0.05, "other": 0.02 }
//!   }
//! }
//! ```
//!
//! The same shape is used by the pull endpoint and by the push stream.
//! [`InferenceResult`] deserializes straight from it. Labels are read in any
//! case and always written back lowercase (`"pneumonia"`).

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Allowed deviation of the probability sum from 1.0
pub const PROBABILITY_SUM_TOLERANCE: f64 = 1e-3;

/// Predicted class label
///
/// Serialized lowercase, matching the probability keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Pneumonia,
    Normal,
    Other,
}

impl Prediction {
    /// All labels in display order
    pub const ALL: [Prediction; 3] = [Prediction::Pneumonia, Prediction::Normal, Prediction::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Prediction::Pneumonia => "pneumonia",
            Prediction::Normal => "normal",
            Prediction::Other => "other",
        }
    }

    /// Headline shown above the confidence figure
    pub fn headline(&self) -> &'static str {
        match self {
            Prediction::Pneumonia => "Pneumonia Likely",
            Prediction::Normal => "Normal",
            Prediction::Other => "Other Condition",
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prediction {
    type Err = Error;

    /// Labels are matched case-insensitively; the backend sends "Pneumonia".
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pneumonia" => Ok(Prediction::Pneumonia),
            "normal" => Ok(Prediction::Normal),
            "other" => Ok(Prediction::Other),
            other => Err(Error::InvalidResult(format!("unknown prediction label: {other:?}"))),
        }
    }
}

impl<'de> Deserialize<'de> for Prediction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-class probabilities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probabilities {
    pub pneumonia: f64,
    pub normal: f64,
    pub other: f64,
}

impl Probabilities {
    pub fn new(pneumonia: f64, normal: f64, other: f64) -> Self {
        Self { pneumonia, normal, other }
    }

    pub fn get(&self, label: Prediction) -> f64 {
        match label {
            Prediction::Pneumonia => self.pneumonia,
            Prediction::Normal => self.normal,
            Prediction::Other => self.other,
        }
    }

    pub fn sum(&self) -> f64 {
        self.pneumonia + self.normal + self.other
    }

    /// Check that every value is a finite non-negative number and that the
    /// three values sum to 1 within [`PROBABILITY_SUM_TOLERANCE`].
    pub fn validate(&self) -> Result<()> {
        for label in Prediction::ALL {
            let value = self.get(label);
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidResult(format!(
                    "probability for {label} is {value}"
                )));
            }
        }

        let sum = self.sum();
        if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
            return Err(Error::InvalidResult(format!(
                "probabilities sum to {sum:.4}, expected 1.0"
            )));
        }

        Ok(())
    }

    pub fn is_well_formed(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Model output block nested under `result` in the wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub prediction: Prediction,
    pub confidence: f64,
    pub probabilities: Probabilities,
}

/// Result envelope as sent by the result service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub filename: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub result: ModelOutput,
}

/// User ids are strings, but some backends emit them as bare numbers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// An inference result for one uploaded file
///
/// Immutable once received. Serializes to and from the wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ResultEnvelope", into = "ResultEnvelope")]
pub struct InferenceResult {
    pub user_id: String,
    pub filename: String,
    pub prediction: Prediction,
    pub confidence: f64,
    pub probabilities: Probabilities,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

impl InferenceResult {
    /// Parse a JSON payload from either delivery mechanism
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| Error::InvalidResult(format!("malformed result payload: {e}")))
    }

    /// Consistency check: confidence in [0, 1] and well-formed probabilities
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidResult(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        self.probabilities.validate()
    }
}

impl From<ResultEnvelope> for InferenceResult {
    fn from(envelope: ResultEnvelope) -> Self {
        Self {
            user_id: envelope.user_id,
            filename: envelope.filename,
            prediction: envelope.result.prediction,
            confidence: envelope.result.confidence,
            probabilities: envelope.result.probabilities,
            content_type: envelope.content_type,
            size: envelope.size,
        }
    }
}

impl From<InferenceResult> for ResultEnvelope {
    fn from(result: InferenceResult) -> Self {
        Self {
            filename: result.filename,
            user_id: result.user_id,
            content_type: result.content_type,
            size: result.size,
            result: ModelOutput {
                prediction: result.prediction,
                confidence: result.confidence,
                probabilities: result.probabilities,
            },
        }
    }
}

/// The (user, filename) pair currently awaited
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub user_id: String,
    pub filename: String,
}

impl PendingRequest {
    pub fn new(user_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            filename: filename.into(),
        }
    }

    /// Exact match on both user id and filename
    pub fn matches(&self, result: &InferenceResult) -> bool {
        self.user_id == result.user_id && self.filename == result.filename
    }
}

impl fmt::Display for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.filename)
    }
}
