use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RiskAssessment {
    pub score: f64,
    #[serde(default)]
    pub factors: Vec<String>,
    pub step_count: usize,
    pub dependency_depth: usize,
    pub high_risk_steps: usize,
    pub external_actions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub workflow_id: String,
    pub plan_id: String,
    /// Set when the gate guards a single step rather than the whole plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub risk_assessment: RiskAssessment,
    pub recommendation: String,
    pub status: ApprovalStatus,
    pub decision_timeout_s: u64,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ApprovalRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        plan_id: impl Into<String>,
        risk_assessment: RiskAssessment,
        decision_timeout_s: u64,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            plan_id: plan_id.into(),
            step_id: None,
            risk_assessment,
            recommendation: String::new(),
            status: ApprovalStatus::Pending,
            decision_timeout_s,
            requested_at: Utc::now(),
            approved_by: None,
            decided_at: None,
            note: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending
            && now.signed_duration_since(self.requested_at).num_seconds()
                > self.decision_timeout_s as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pending_request_expires_after_timeout() {
        let request = ApprovalRequest::new("wf-1", "plan-1", RiskAssessment::default(), 60);
        assert!(!request.is_expired(Utc::now()));
        assert!(request.is_expired(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn decided_request_never_expires() {
        let mut request = ApprovalRequest::new("wf-1", "plan-1", RiskAssessment::default(), 60);
        request.status = ApprovalStatus::Approved;
        assert!(!request.is_expired(Utc::now() + Duration::seconds(3600)));
    }
}
