use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCategory {
    Success,
    PartialSuccess,
    SemanticMismatch,
    ExecutionFailure,
    GoalDrift,
}

impl OutcomeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeCategory::Success => "success",
            OutcomeCategory::PartialSuccess => "partial_success",
            OutcomeCategory::SemanticMismatch => "semantic_mismatch",
            OutcomeCategory::ExecutionFailure => "execution_failure",
            OutcomeCategory::GoalDrift => "goal_drift",
        }
    }
}

/// A proposed interpretation rule derived by reflection. Confidence decays
/// over time; the sink only proposes, it never rewrites interpretation rules
/// in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationBias {
    pub bias_id: String,
    pub condition: String,
    pub preferred_interpretation: String,
    pub confidence: f64,
    pub source: String,
    pub half_life_s: u64,
    pub created_at: DateTime<Utc>,
}

impl InterpretationBias {
    pub fn new(
        condition: impl Into<String>,
        preferred_interpretation: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            bias_id: uuid::Uuid::new_v4().to_string(),
            condition: condition.into(),
            preferred_interpretation: preferred_interpretation.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source: source.into(),
            half_life_s: 7 * 24 * 3600,
            created_at: Utc::now(),
        }
    }

    /// Exponential decay of confidence with the configured half life.
    pub fn confidence_at(&self, now: DateTime<Utc>) -> f64 {
        let age_s = now
            .signed_duration_since(self.created_at)
            .num_seconds()
            .max(0) as f64;
        if self.half_life_s == 0 {
            return self.confidence;
        }
        self.confidence * 0.5_f64.powf(age_s / self.half_life_s as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn confidence_halves_per_half_life() {
        let mut bias = InterpretationBias::new("contains 'report'", "document_generation", 0.8, "reflection");
        bias.half_life_s = 100;
        let later = bias.created_at + Duration::seconds(100);
        let decayed = bias.confidence_at(later);
        assert!((decayed - 0.4).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_clamped() {
        let bias = InterpretationBias::new("x", "y", 1.7, "test");
        assert_eq!(bias.confidence, 1.0);
    }
}
