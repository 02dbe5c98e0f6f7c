//! Defaulting and validation logic for Rollout admission
//!
//! Pure functions over the parsed record; the server wraps them in
//! AdmissionReview plumbing. Defaults are emitted as JSON-Patch operations
//! against whole spec sections, so they apply cleanly whether or not the
//! user wrote the section at all.

use serde_json::{json, Value};

use crate::crd::{
    default_canary_steps, RolloutSpec, SpecValidationError, StrategyType,
};

/// JSON-Patch operations that bring a spec to its defaulted form. Empty
/// when nothing needs defaulting.
pub fn defaulting_ops(spec: &RolloutSpec) -> Vec<Value> {
    let mut ops = Vec::new();

    // Strategy: unset type means Canary; a canary with no steps gets the
    // standard 10 → 30 → 100 progression.
    let mut strategy = spec.strategy.clone();
    let mut strategy_changed = false;

    if strategy.type_.is_none() {
        strategy.type_ = Some(StrategyType::Canary);
        strategy_changed = true;
    }
    if strategy.type_ == Some(StrategyType::Canary) && strategy.steps.is_empty() {
        strategy.steps = default_canary_steps();
        strategy_changed = true;
    }
    if strategy_changed {
        ops.push(json!({
            "op": "add",
            "path": "/spec/strategy",
            "value": strategy,
        }));
    }

    // Analysis: fill the interval and streak thresholds.
    let mut analysis = spec.analysis.clone();
    let mut analysis_changed = false;

    if analysis.interval_seconds.is_none() {
        analysis.interval_seconds = Some(30);
        analysis_changed = true;
    }
    if analysis.success_threshold.is_none() {
        analysis.success_threshold = Some(2);
        analysis_changed = true;
    }
    if analysis.failure_threshold.is_none() {
        analysis.failure_threshold = Some(2);
        analysis_changed = true;
    }
    if analysis_changed {
        ops.push(json!({
            "op": "add",
            "path": "/spec/analysis",
            "value": analysis,
        }));
    }

    // Rollback defaults to true, but only when the user left it unset; an
    // explicit false is preserved.
    if spec.rollback_on_failure.is_none() {
        ops.push(json!({
            "op": "add",
            "path": "/spec/rollbackOnFailure",
            "value": true,
        }));
    }

    ops
}

/// One aggregated denial message for all violations.
pub fn denial_message(errors: &[SpecValidationError]) -> String {
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("Rollout rejected: {joined}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AnalysisSpec, CompareOp, MetricCheck, RolloutStep, RolloutStrategy, TargetRef, TrafficSpec,
    };

    fn bare_spec() -> RolloutSpec {
        RolloutSpec {
            target_ref: TargetRef {
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                port: 8080,
            },
            strategy: RolloutStrategy::default(),
            analysis: AnalysisSpec::default(),
            traffic: TrafficSpec {
                provider: "NginxIngress".to_string(),
                host: "web.example.com".to_string(),
                stable_service: "web-stable".to_string(),
                canary_service: "web-canary".to_string(),
            },
            rollback_on_failure: None,
        }
    }

    #[test]
    fn test_bare_spec_gets_all_defaults() {
        let ops = defaulting_ops(&bare_spec());
        assert_eq!(ops.len(), 3);

        let strategy = ops
            .iter()
            .find(|op| op["path"] == "/spec/strategy")
            .unwrap();
        assert_eq!(strategy["value"]["type"], "Canary");
        let steps = strategy["value"]["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0]["weight"], 10);
        assert_eq!(steps[2]["weight"], 100);

        let analysis = ops
            .iter()
            .find(|op| op["path"] == "/spec/analysis")
            .unwrap();
        assert_eq!(analysis["value"]["intervalSeconds"], 30);
        assert_eq!(analysis["value"]["successThreshold"], 2);
        assert_eq!(analysis["value"]["failureThreshold"], 2);

        let rollback = ops
            .iter()
            .find(|op| op["path"] == "/spec/rollbackOnFailure")
            .unwrap();
        assert_eq!(rollback["value"], true);
    }

    #[test]
    fn test_user_steps_are_preserved() {
        let mut spec = bare_spec();
        spec.strategy.steps = vec![RolloutStep {
            weight: 100,
            hold_seconds: 0,
        }];

        let ops = defaulting_ops(&spec);
        let strategy = ops
            .iter()
            .find(|op| op["path"] == "/spec/strategy")
            .unwrap();
        // Type still defaults, but the single user step survives.
        assert_eq!(strategy["value"]["type"], "Canary");
        assert_eq!(strategy["value"]["steps"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_blue_green_gets_no_default_steps() {
        let mut spec = bare_spec();
        spec.strategy.type_ = Some(StrategyType::BlueGreen);
        spec.analysis = AnalysisSpec {
            interval_seconds: Some(30),
            success_threshold: Some(2),
            failure_threshold: Some(2),
            metrics: vec![],
        };
        spec.rollback_on_failure = Some(true);

        let ops = defaulting_ops(&spec);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_explicit_false_rollback_is_preserved() {
        let mut spec = bare_spec();
        spec.rollback_on_failure = Some(false);

        let ops = defaulting_ops(&spec);
        assert!(!ops
            .iter()
            .any(|op| op["path"] == "/spec/rollbackOnFailure"));
    }

    #[test]
    fn test_fully_specified_spec_needs_nothing() {
        let mut spec = bare_spec();
        spec.strategy = RolloutStrategy {
            type_: Some(StrategyType::Canary),
            steps: default_canary_steps(),
        };
        spec.analysis = AnalysisSpec {
            interval_seconds: Some(15),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            metrics: vec![MetricCheck {
                name: "ready".to_string(),
                prom_ql: "readiness".to_string(),
                threshold: "1".to_string(),
                compare: CompareOp::GT,
            }],
        };
        spec.rollback_on_failure = Some(false);

        assert!(defaulting_ops(&spec).is_empty());
    }

    #[test]
    fn test_denial_message_aggregates() {
        let errors = vec![
            SpecValidationError::new("spec.strategy.steps", "steps required for canary"),
            SpecValidationError::new("spec.traffic", "host/stableService/canaryService required"),
        ];

        let msg = denial_message(&errors);
        assert!(msg.contains("steps required for canary"));
        assert!(msg.contains("spec.traffic"));
    }
}
