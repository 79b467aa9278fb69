//! Presentation summary of a resolved result

use chrono::Utc;
use hiomi_common::{InferenceResult, Prediction};
use serde::Serialize;

/// Model label reported alongside every analysis
pub const MODEL_VERSION_LABEL: &str = "PneumoNet-v2.1";

/// Rounded class percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassPercentages {
    pub pneumonia: u8,
    pub normal: u8,
    pub other: u8,
}

/// What the results panel shows for a resolved request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub label: Prediction,
    /// "Pneumonia Likely", "Normal" or "Other Condition"
    pub headline: String,
    /// Probability of the predicted label, as a rounded percentage
    pub confidence_percent: u8,
    pub percentages: ClassPercentages,
    pub model_version: String,
    pub case_id: String,
    /// False when the probabilities fail the consistency check
    pub well_formed: bool,
}

impl AnalysisSummary {
    pub fn from_result(result: &InferenceResult) -> Self {
        let probabilities = &result.probabilities;

        Self {
            label: result.prediction,
            headline: result.prediction.headline().to_string(),
            confidence_percent: percent(probabilities.get(result.prediction)),
            percentages: ClassPercentages {
                pneumonia: percent(probabilities.pneumonia),
                normal: percent(probabilities.normal),
                other: percent(probabilities.other),
            },
            model_version: MODEL_VERSION_LABEL.to_string(),
            case_id: format!("case_{}", Utc::now().timestamp_millis()),
            well_formed: result.validate().is_ok(),
        }
    }
}

fn percent(probability: f64) -> u8 {
    (probability.clamp(0.0, 1.0) * 100.0).round() as u8
}
