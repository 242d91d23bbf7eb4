use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use aard_types::{
    ApprovalRequest, ApprovalStatus, CapabilityRecord, ErrorKind, Plan, RiskAssessment, Step,
};

use crate::config::ApprovalConfig;

const TRUST_SAMPLE_PIVOT: f64 = 5.0;
const TRUST_RECENCY_WINDOW_DAYS: i64 = 30;
const TRUST_STALE_FACTOR: f64 = 0.85;

fn step_text(step: &Step) -> String {
    let mut text = step.description.to_lowercase();
    if let Some(call) = &step.function_call {
        text.push(' ');
        text.push_str(&call.name.to_lowercase());
        text.push(' ');
        text.push_str(&call.parameters.to_string().to_lowercase());
    }
    text.push(' ');
    text.push_str(&step.inputs.to_string().to_lowercase());
    text
}

fn step_is_high_risk(step: &Step, indicators: &[String]) -> bool {
    let text = step_text(step);
    indicators.iter().any(|needle| text.contains(needle.as_str()))
}

fn step_is_external(step: &Step, indicators: &[String]) -> bool {
    if step.tool_id.is_some() {
        return true;
    }
    let text = step_text(step);
    indicators.iter().any(|needle| text.contains(needle.as_str()))
}

/// Longest dependency chain in the step DAG.
fn dependency_depth(steps: &[Step]) -> usize {
    fn depth_of(
        step_id: &str,
        steps: &[Step],
        memo: &mut HashMap<String, usize>,
        guard: usize,
    ) -> usize {
        if guard == 0 {
            return 0;
        }
        if let Some(cached) = memo.get(step_id) {
            return *cached;
        }
        let Some(step) = steps.iter().find(|s| s.step_id == step_id) else {
            return 0;
        };
        let depth = 1 + step
            .dependencies
            .iter()
            .map(|dep| depth_of(dep, steps, memo, guard - 1))
            .max()
            .unwrap_or(0);
        memo.insert(step_id.to_string(), depth);
        depth
    }

    let mut memo = HashMap::new();
    steps
        .iter()
        .map(|s| depth_of(&s.step_id, steps, &mut memo, steps.len() + 1))
        .max()
        .unwrap_or(0)
}

/// Weighted risk over plan size, flagged steps, dependency depth, and
/// external-action indicators. Weights come from configuration.
pub fn assess_risk(plan: &Plan, cfg: &ApprovalConfig) -> RiskAssessment {
    let weights = &cfg.risk_weights;
    let high_risk_steps = plan
        .steps
        .iter()
        .filter(|s| step_is_high_risk(s, &cfg.risk_indicators))
        .count();
    let external_actions = plan
        .steps
        .iter()
        .filter(|s| step_is_external(s, &cfg.external_indicators))
        .count();
    let depth = dependency_depth(&plan.steps);

    let score = (plan.steps.len() as f64 * weights.step_count
        + high_risk_steps as f64 * weights.high_risk_step
        + depth as f64 * weights.dependency_depth
        + external_actions as f64 * weights.external_action)
        .clamp(0.0, 1.0);

    let mut factors = Vec::new();
    if high_risk_steps > 0 {
        factors.push(format!("{high_risk_steps} high-risk step(s)"));
    }
    if external_actions > 0 {
        factors.push(format!("{external_actions} external action(s)"));
    }
    if depth > 2 {
        factors.push(format!("dependency depth {depth}"));
    }

    RiskAssessment {
        score,
        factors,
        step_count: plan.steps.len(),
        dependency_depth: depth,
        high_risk_steps,
        external_actions,
    }
}

/// Risk of a single step, assessed with the same weights as a one-step
/// plan.
pub fn assess_step_risk(step: &Step, cfg: &ApprovalConfig) -> RiskAssessment {
    let weights = &cfg.risk_weights;
    let high_risk = step_is_high_risk(step, &cfg.risk_indicators);
    let external = step_is_external(step, &cfg.external_indicators);
    let score = (weights.step_count
        + if high_risk { weights.high_risk_step } else { 0.0 }
        + if external { weights.external_action } else { 0.0 })
    .clamp(0.0, 1.0);
    RiskAssessment {
        score,
        factors: Vec::new(),
        step_count: 1,
        dependency_depth: 0,
        high_risk_steps: high_risk as usize,
        external_actions: external as usize,
    }
}

/// Trust in the targeted agent: its success EMA shrunk toward neutral by
/// small sample sizes and staleness.
pub fn compute_trust(record: Option<&CapabilityRecord>, now: DateTime<Utc>) -> f64 {
    let Some(record) = record else {
        return 0.5;
    };
    let n = record.metrics.executions as f64;
    let sample_weight = n / (n + TRUST_SAMPLE_PIVOT);
    let recency = match record.metrics.last_used_at {
        Some(last)
            if now.signed_duration_since(last).num_days() <= TRUST_RECENCY_WINDOW_DAYS =>
        {
            1.0
        }
        Some(_) => TRUST_STALE_FACTOR,
        None => TRUST_STALE_FACTOR,
    };
    (0.5 + (record.trust_score - 0.5) * sample_weight * recency).clamp(0.0, 1.0)
}

/// Autonomy 0 always asks, autonomy 4 only for very high risk,
/// intermediate levels use per-level risk and trust thresholds.
pub fn requires_approval(
    autonomy_level: u8,
    risk: &RiskAssessment,
    trust: f64,
    cfg: &ApprovalConfig,
) -> bool {
    match autonomy_level {
        0 => true,
        4.. => risk.score >= cfg.very_high_threshold,
        level => {
            let idx = (level - 1) as usize;
            risk.score >= cfg.risk_thresholds[idx] || trust < cfg.trust_thresholds[idx]
        }
    }
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    AutoApproved,
    Pending(ApprovalRequest),
}

/// Store of approval requests plus the decide/expire surface. The gate is
/// process-wide; the pipeline owns the workflow transitions that follow a
/// decision.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    requests: Arc<RwLock<HashMap<String, ApprovalRequest>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates the decision rule; a `Pending` outcome is already stored
    /// when returned.
    pub async fn evaluate(
        &self,
        workflow_id: &str,
        plan: &Plan,
        step_id: Option<&str>,
        risk: RiskAssessment,
        trust: f64,
        cfg: &ApprovalConfig,
    ) -> GateDecision {
        if !requires_approval(plan.autonomy_level, &risk, trust, cfg) {
            return GateDecision::AutoApproved;
        }
        let recommendation = if risk.score >= cfg.very_high_threshold {
            "reject unless verified by a human".to_string()
        } else {
            format!("review: risk {:.2}, trust {:.2}", risk.score, trust)
        };
        let mut request =
            ApprovalRequest::new(workflow_id, plan.plan_id.clone(), risk, cfg.timeout_s);
        request.step_id = step_id.map(str::to_string);
        request.recommendation = recommendation;
        self.requests
            .write()
            .await
            .insert(request.request_id.clone(), request.clone());
        GateDecision::Pending(request)
    }

    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    pub async fn find_for_step(&self, plan_id: &str, step_id: &str) -> Option<ApprovalRequest> {
        self.requests
            .read()
            .await
            .values()
            .find(|r| r.plan_id == plan_id && r.step_id.as_deref() == Some(step_id))
            .cloned()
    }

    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.requests
            .read()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    /// Human decision. Terminal requests reject further decisions.
    pub async fn decide(
        &self,
        request_id: &str,
        approve: bool,
        actor: &str,
        note: Option<String>,
    ) -> Result<ApprovalRequest, ErrorKind> {
        let mut requests = self.requests.write().await;
        let Some(request) = requests.get_mut(request_id) else {
            return Err(ErrorKind::InvalidRequest(format!(
                "unknown approval request `{request_id}`"
            )));
        };
        if request.status.is_terminal() {
            return Err(ErrorKind::InvalidRequest(format!(
                "approval request `{request_id}` is already decided"
            )));
        }
        request.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        request.approved_by = Some(actor.to_string());
        request.decided_at = Some(Utc::now());
        request.note = note;
        Ok(request.clone())
    }

    /// Applies the timeout policy to overdue pending requests and returns
    /// the ones that changed.
    pub async fn expire_due(&self, now: DateTime<Utc>, policy: &str) -> Vec<ApprovalRequest> {
        let mut requests = self.requests.write().await;
        let mut expired = Vec::new();
        for request in requests.values_mut() {
            if !request.is_expired(now) {
                continue;
            }
            request.status = if policy == "auto_approve" {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Timeout
            };
            request.decided_at = Some(now);
            expired.push(request.clone());
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aard_types::{CapabilityKind, StepKind};

    fn plan_with_steps(descriptions: &[&str], autonomy: u8) -> Plan {
        let mut plan = Plan::new("task-1", "do the thing");
        plan.autonomy_level = autonomy;
        for description in descriptions {
            plan.steps
                .push(Step::new(*description, StepKind::Action));
        }
        plan
    }

    #[test]
    fn autonomy_zero_always_requires_approval() {
        let cfg = ApprovalConfig::default();
        let plan = plan_with_steps(&["trivial"], 0);
        let risk = assess_risk(&plan, &cfg);
        assert!(requires_approval(0, &risk, 1.0, &cfg));
    }

    #[test]
    fn autonomy_four_only_asks_for_very_high_risk() {
        let cfg = ApprovalConfig::default();
        let calm = assess_risk(&plan_with_steps(&["summarize text"], 4), &cfg);
        assert!(!requires_approval(4, &calm, 0.0, &cfg));

        let plan = plan_with_steps(
            &["delete all records", "delete all backups", "wipe cache"],
            4,
        );
        let risky = assess_risk(&plan, &cfg);
        assert!(risky.score >= cfg.very_high_threshold);
        assert!(requires_approval(4, &risky, 1.0, &cfg));
    }

    #[test]
    fn delete_all_task_trips_the_level_one_threshold() {
        let cfg = ApprovalConfig::default();
        let plan = plan_with_steps(&["delete all user files"], 1);
        let risk = assess_risk(&plan, &cfg);
        assert!(risk.score >= cfg.risk_thresholds[0]);
        assert!(requires_approval(1, &risk, 1.0, &cfg));
        assert_eq!(risk.high_risk_steps, 1);
    }

    #[test]
    fn small_plan_at_level_two_auto_approves_with_neutral_trust() {
        let cfg = ApprovalConfig::default();
        let plan = plan_with_steps(&["generate code", "validate output"], 2);
        let risk = assess_risk(&plan, &cfg);
        assert!(!requires_approval(2, &risk, 0.5, &cfg));
    }

    #[test]
    fn low_trust_forces_approval_at_intermediate_levels() {
        let cfg = ApprovalConfig::default();
        let plan = plan_with_steps(&["generate code"], 3);
        let risk = assess_risk(&plan, &cfg);
        assert!(requires_approval(3, &risk, 0.1, &cfg));
    }

    #[test]
    fn trust_shrinks_toward_neutral_for_small_samples() {
        let mut record = CapabilityRecord::new("coder", CapabilityKind::Agent);
        record.trust_score = 1.0;
        record.metrics.executions = 1;
        record.metrics.last_used_at = Some(Utc::now());
        let small_sample = compute_trust(Some(&record), Utc::now());
        record.metrics.executions = 100;
        let large_sample = compute_trust(Some(&record), Utc::now());
        assert!(small_sample < large_sample);
        assert_eq!(compute_trust(None, Utc::now()), 0.5);
    }

    #[tokio::test]
    async fn gate_stores_pending_requests_and_decides_once() {
        let cfg = ApprovalConfig::default();
        let gate = ApprovalGate::new();
        let plan = plan_with_steps(&["delete all the things"], 1);
        let risk = assess_risk(&plan, &cfg);

        let decision = gate
            .evaluate("wf-1", &plan, None, risk, 0.5, &cfg)
            .await;
        let GateDecision::Pending(request) = decision else {
            panic!("expected pending request");
        };

        let decided = gate
            .decide(&request.request_id, true, "operator", None)
            .await
            .expect("decide");
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.approved_by.as_deref(), Some("operator"));

        let again = gate
            .decide(&request.request_id, false, "operator", None)
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn expiry_applies_the_configured_policy() {
        let mut cfg = ApprovalConfig::default();
        cfg.timeout_s = 0;
        let gate = ApprovalGate::new();
        let plan = plan_with_steps(&["delete all rows"], 0);
        let risk = assess_risk(&plan, &cfg);
        let GateDecision::Pending(request) =
            gate.evaluate("wf-1", &plan, None, risk, 0.5, &cfg).await
        else {
            panic!("expected pending");
        };

        let later = Utc::now() + chrono::Duration::seconds(5);
        let expired = gate.expire_due(later, "fail").await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, request.request_id);
        assert_eq!(expired[0].status, ApprovalStatus::Timeout);
    }
}
