use serde::{Deserialize, Serialize};
use serde_json::Value;

use aard_types::{ErrorKind, FunctionCall, Plan, PlanStatus, Step, StepKind, StepStatus};

/// Structured output of the interpretation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub intent: String,
    pub task_type: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub needs_clarification: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    SimpleQuestion,
    Plan,
}

impl RoutingDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingDecision::SimpleQuestion => "simple_question",
            RoutingDecision::Plan => "plan",
        }
    }
}

/// Pulls the first JSON object out of model text; models wrap JSON in prose
/// more often than not.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

pub fn parse_interpretation(text: &str) -> Option<Interpretation> {
    let value = extract_json(text)?;
    let parsed: Interpretation = serde_json::from_value(value).ok()?;
    if parsed.intent.trim().is_empty() {
        return None;
    }
    Some(parsed)
}

/// Rule-based stand-in when the model output is not structured. Plans and
/// function calls are never guessed this way; plain request interpretation
/// is.
pub fn fallback_interpretation(request: &str) -> Interpretation {
    let trimmed = request.trim();
    let word_count = trimmed.split_whitespace().count();
    let lowered = trimmed.to_lowercase();
    let task_type = if trimmed.ends_with('?') && word_count <= 12 {
        "question"
    } else if (lowered.contains("write") || lowered.contains("generate") || lowered.contains("create"))
        && (lowered.contains("code")
            || lowered.contains("function")
            || lowered.contains("script")
            || lowered.contains("program"))
    {
        "code_generation"
    } else {
        "task"
    };
    Interpretation {
        intent: trimmed.to_string(),
        task_type: task_type.to_string(),
        entities: Vec::new(),
        confidence: 0.5,
        needs_clarification: trimmed.is_empty(),
    }
}

/// Validator A: the interpretation must be actionable.
pub fn validate_interpretation(interpretation: &Interpretation) -> Result<(), ErrorKind> {
    if interpretation.intent.trim().is_empty() {
        return Err(ErrorKind::ValidationFailed(
            "interpretation has no intent".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&interpretation.confidence) {
        return Err(ErrorKind::ValidationFailed(format!(
            "interpretation confidence {} out of range",
            interpretation.confidence
        )));
    }
    if interpretation.needs_clarification {
        return Err(ErrorKind::ValidationFailed(
            "interpretation needs clarification".to_string(),
        ));
    }
    Ok(())
}

pub fn parse_routing(text: &str) -> Option<RoutingDecision> {
    let value = extract_json(text)?;
    match value.get("route").and_then(|v| v.as_str())? {
        "simple_question" => Some(RoutingDecision::SimpleQuestion),
        "plan" => Some(RoutingDecision::Plan),
        _ => None,
    }
}

pub fn heuristic_route(interpretation: &Interpretation) -> RoutingDecision {
    if interpretation.task_type == "question" {
        RoutingDecision::SimpleQuestion
    } else {
        RoutingDecision::Plan
    }
}

/// Builds a plan from validated model JSON. Dynamic LLM output is rejected
/// with `ValidationFailed` rather than repaired.
pub fn build_plan(
    value: &Value,
    task_id: &str,
    goal: &str,
    autonomy_level: u8,
    parent: Option<(&str, u32)>,
) -> Result<Plan, ErrorKind> {
    let Some(raw_steps) = value.get("steps").and_then(|v| v.as_array()) else {
        return Err(ErrorKind::ValidationFailed(
            "plan JSON has no `steps` array".to_string(),
        ));
    };
    if raw_steps.is_empty() {
        return Err(ErrorKind::ValidationFailed(
            "plan has no steps".to_string(),
        ));
    }

    let mut plan = Plan::new(task_id, goal);
    plan.autonomy_level = autonomy_level;
    plan.strategy = value
        .get("strategy")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if let Some((parent_plan_id, attempt)) = parent {
        plan.parent_plan_id = Some(parent_plan_id.to_string());
        plan.attempt_count = attempt;
        plan.version = attempt + 1;
    }

    // First pass assigns ids so dependencies can refer backwards by id or
    // by zero-based index.
    let mut ids = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        let id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("step-{}", index + 1));
        ids.push(id);
    }

    for (index, raw) in raw_steps.iter().enumerate() {
        let Some(description) = raw
            .get("description")
            .and_then(|v| v.as_str())
            .filter(|d| !d.trim().is_empty())
        else {
            return Err(ErrorKind::ValidationFailed(format!(
                "step {} has no description",
                index + 1
            )));
        };

        let kind = match raw.get("type").and_then(|v| v.as_str()).unwrap_or("action") {
            "action" => StepKind::Action,
            "decision" => StepKind::Decision,
            "validation" => StepKind::Validation,
            "function_call" => StepKind::FunctionCall,
            other => {
                return Err(ErrorKind::ValidationFailed(format!(
                    "step {} has unknown type `{other}`",
                    index + 1
                )));
            }
        };

        let mut step = Step::new(description, kind);
        step.step_id = ids[index].clone();

        if let Some(deps) = raw.get("dependencies").and_then(|v| v.as_array()) {
            for dep in deps {
                let resolved = match dep {
                    Value::String(id) => {
                        if !ids.contains(id) {
                            return Err(ErrorKind::ValidationFailed(format!(
                                "step `{}` depends on unknown step `{id}`",
                                step.step_id
                            )));
                        }
                        id.clone()
                    }
                    Value::Number(n) => {
                        let Some(dep_index) = n.as_u64().map(|n| n as usize) else {
                            return Err(ErrorKind::ValidationFailed(format!(
                                "step `{}` has a non-integer dependency",
                                step.step_id
                            )));
                        };
                        let Some(id) = ids.get(dep_index) else {
                            return Err(ErrorKind::ValidationFailed(format!(
                                "step `{}` depends on out-of-range index {dep_index}",
                                step.step_id
                            )));
                        };
                        id.clone()
                    }
                    _ => {
                        return Err(ErrorKind::ValidationFailed(format!(
                            "step `{}` has a malformed dependency",
                            step.step_id
                        )));
                    }
                };
                step.dependencies.push(resolved);
            }
        }

        if let Some(raw_call) = raw.get("function_call") {
            let call: FunctionCall = serde_json::from_value(raw_call.clone()).map_err(|e| {
                ErrorKind::ValidationFailed(format!(
                    "step `{}` has a malformed function_call: {e}",
                    step.step_id
                ))
            })?;
            if call.name.trim().is_empty() {
                return Err(ErrorKind::ValidationFailed(format!(
                    "step `{}` function_call has no name",
                    step.step_id
                )));
            }
            step.function_call = Some(call);
            step.kind = StepKind::FunctionCall;
        }

        step.agent_id = raw
            .get("agent_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        step.tool_id = raw
            .get("tool_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        step.inputs = raw.get("inputs").cloned().unwrap_or(Value::Null);
        step.approval_required = raw
            .get("approval_required")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        plan.steps.push(step);
    }

    Ok(plan)
}

/// Validator B: size bound, known dependencies, acyclic DAG, draft status.
pub fn validate_plan(plan: &Plan, max_steps: usize) -> Result<(), ErrorKind> {
    if plan.steps.is_empty() {
        return Err(ErrorKind::ValidationFailed("plan has no steps".to_string()));
    }
    if plan.steps.len() > max_steps {
        return Err(ErrorKind::ValidationFailed(format!(
            "plan has {} steps, limit is {max_steps}",
            plan.steps.len()
        )));
    }
    if plan.status != PlanStatus::Draft {
        return Err(ErrorKind::ValidationFailed(format!(
            "plan entered validation in status {:?}",
            plan.status
        )));
    }

    for step in &plan.steps {
        if step.status != StepStatus::Pending {
            return Err(ErrorKind::ValidationFailed(format!(
                "step `{}` is not pending",
                step.step_id
            )));
        }
        for dep in &step.dependencies {
            if plan.step(dep).is_none() {
                return Err(ErrorKind::ValidationFailed(format!(
                    "step `{}` depends on unknown step `{dep}`",
                    step.step_id
                )));
            }
            if dep == &step.step_id {
                return Err(ErrorKind::ValidationFailed(format!(
                    "step `{}` depends on itself",
                    step.step_id
                )));
            }
        }
    }

    // Kahn-style check: if not every step can be peeled off, there is a
    // cycle.
    let mut resolved = std::collections::HashSet::new();
    loop {
        let before = resolved.len();
        for step in &plan.steps {
            if resolved.contains(&step.step_id) {
                continue;
            }
            if step.dependencies.iter().all(|d| resolved.contains(d)) {
                resolved.insert(step.step_id.clone());
            }
        }
        if resolved.len() == plan.steps.len() {
            return Ok(());
        }
        if resolved.len() == before {
            return Err(ErrorKind::ValidationFailed(
                "plan dependencies form a cycle".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_tolerates_surrounding_prose() {
        let value = extract_json("Sure! Here you go: {\"route\": \"plan\"} hope it helps")
            .expect("json");
        assert_eq!(value["route"], "plan");
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn fallback_interpretation_recognizes_questions_and_code() {
        assert_eq!(fallback_interpretation("What is 2+2?").task_type, "question");
        assert_eq!(
            fallback_interpretation("Write a Python function that returns the Fibonacci sequence up to n")
                .task_type,
            "code_generation"
        );
        assert_eq!(fallback_interpretation("Organize my notes").task_type, "task");
    }

    #[test]
    fn routing_parses_model_json_and_falls_back_by_task_type() {
        assert_eq!(
            parse_routing("{\"route\": \"simple_question\"}"),
            Some(RoutingDecision::SimpleQuestion)
        );
        assert_eq!(parse_routing("{\"route\": \"sideways\"}"), None);

        let question = fallback_interpretation("What time is it?");
        assert_eq!(heuristic_route(&question), RoutingDecision::SimpleQuestion);
        let task = fallback_interpretation("Summarize the report");
        assert_eq!(heuristic_route(&task), RoutingDecision::Plan);
    }

    #[test]
    fn build_plan_resolves_index_and_id_dependencies() {
        let value = json!({
            "strategy": "two phases",
            "steps": [
                {"id": "gen", "description": "generate code", "type": "function_call",
                 "function_call": {"name": "code_generation", "parameters": {"language": "python"}}},
                {"description": "validate output", "type": "validation", "dependencies": [0]},
                {"description": "summarize", "dependencies": ["gen"]}
            ]
        });
        let plan = build_plan(&value, "task-1", "fibonacci", 2, None).expect("plan");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[1].dependencies, vec!["gen".to_string()]);
        assert_eq!(plan.steps[2].dependencies, vec!["gen".to_string()]);
        assert_eq!(plan.steps[0].kind, StepKind::FunctionCall);
        validate_plan(&plan, 20).expect("valid");
    }

    #[test]
    fn build_plan_rejects_unknown_dependency() {
        let value = json!({"steps": [
            {"description": "a", "dependencies": ["ghost"]}
        ]});
        let err = build_plan(&value, "t", "g", 2, None).expect_err("unknown dep");
        assert!(matches!(err, ErrorKind::ValidationFailed(_)));
    }

    #[test]
    fn build_plan_rejects_missing_steps() {
        let err = build_plan(&json!({"notes": "?"}), "t", "g", 2, None).expect_err("no steps");
        assert!(matches!(err, ErrorKind::ValidationFailed(_)));
    }

    #[test]
    fn replan_carries_parent_and_attempt() {
        let value = json!({"steps": [{"description": "retry the thing"}]});
        let plan = build_plan(&value, "t", "g", 2, Some(("plan-0", 1))).expect("plan");
        assert_eq!(plan.parent_plan_id.as_deref(), Some("plan-0"));
        assert_eq!(plan.attempt_count, 1);
        assert_eq!(plan.version, 2);
    }

    #[test]
    fn validate_plan_enforces_size_budget() {
        let value = json!({"steps": [
            {"description": "a"}, {"description": "b"}, {"description": "c"}
        ]});
        let plan = build_plan(&value, "t", "g", 2, None).expect("plan");
        let err = validate_plan(&plan, 2).expect_err("too many steps");
        assert!(matches!(err, ErrorKind::ValidationFailed(_)));
    }

    #[test]
    fn validate_plan_detects_cycles() {
        let value = json!({"steps": [
            {"id": "a", "description": "a", "dependencies": ["b"]},
            {"id": "b", "description": "b", "dependencies": ["a"]}
        ]});
        let plan = build_plan(&value, "t", "g", 2, None).expect("plan");
        let err = validate_plan(&plan, 20).expect_err("cycle");
        assert!(matches!(err, ErrorKind::ValidationFailed(_)));
    }
}
