//! Rollout Custom Resource Definition
//!
//! A Rollout drives progressive delivery for a Deployment: Canary rollouts
//! shift traffic through weighted steps gated by analysis, Blue-Green
//! switches atomically. Defaulting and validation live here so the
//! admission webhook and tests share one implementation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StrategyType {
    #[default]
    Canary,
    BlueGreen,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
    /// Percent of traffic routed to the canary service, 0..=100.
    pub weight: i32,
    /// Pause after this step passes analysis before the next one starts.
    #[serde(default)]
    pub hold_seconds: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Unset means Canary; the mutating webhook writes the default back.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<StrategyType>,
    /// Canary steps. BlueGreen must leave this empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<RolloutStep>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CompareOp {
    LT,
    GT,
}

/// A metric gate for richer analysis engines. The reference readiness
/// engine only consumes the check labels.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricCheck {
    pub name: String,
    #[serde(rename = "promQL")]
    pub prom_ql: String,
    pub threshold: String,
    pub compare: CompareOp,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
    #[serde(default)]
    pub metrics: Vec<MetricCheck>,
}

impl AnalysisSpec {
    pub fn interval_seconds(&self) -> i32 {
        self.interval_seconds.unwrap_or(30)
    }

    pub fn success_threshold(&self) -> i32 {
        self.success_threshold.unwrap_or(2)
    }

    pub fn failure_threshold(&self) -> i32 {
        self.failure_threshold.unwrap_or(2)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSpec {
    /// Traffic-shaping data plane. Only NginxIngress is implemented.
    pub provider: String,
    pub host: String,
    pub stable_service: String,
    pub canary_service: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Fixed to Deployment for now.
    pub kind: String,
    pub name: String,
    pub port: i32,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "delivery.example.com",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced,
    status = "RolloutStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Step","type":"integer","jsonPath":".status.stepIndex"}"#,
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    pub target_ref: TargetRef,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    #[serde(default)]
    pub analysis: AnalysisSpec,
    #[serde(default)]
    pub traffic: TrafficSpec,
    /// Nullable so the defaulter can tell "unset" (defaults to true) from
    /// an explicit false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_on_failure: Option<bool>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RolloutPhase {
    Idle,
    Progressing,
    Analyzing,
    Succeeded,
    Failed,
    RolledBack,
}

impl RolloutPhase {
    /// Terminal phases admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutPhase::Succeeded | RolloutPhase::Failed | RolloutPhase::RolledBack
        )
    }
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutPhase::Idle => "Idle",
            RolloutPhase::Progressing => "Progressing",
            RolloutPhase::Analyzing => "Analyzing",
            RolloutPhase::Succeeded => "Succeeded",
            RolloutPhase::Failed => "Failed",
            RolloutPhase::RolledBack => "RolledBack",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RolloutPhase>,
    #[serde(default)]
    pub step_index: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Structured validation error for `RolloutSpec`. Violations are collected
/// and aggregated into a single admission denial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Default canary progression when the user supplies none: 10% → 30% → 100%.
pub fn default_canary_steps() -> Vec<RolloutStep> {
    vec![
        RolloutStep {
            weight: 10,
            hold_seconds: 60,
        },
        RolloutStep {
            weight: 30,
            hold_seconds: 60,
        },
        RolloutStep {
            weight: 100,
            hold_seconds: 0,
        },
    ]
}

impl RolloutSpec {
    /// Effective strategy type; unset means Canary.
    pub fn strategy_type(&self) -> StrategyType {
        self.strategy.type_.unwrap_or_default()
    }

    /// Effective rollback toggle; unset means true.
    pub fn rollback_on_failure(&self) -> bool {
        self.rollback_on_failure.unwrap_or(true)
    }

    /// Validate the spec, collecting every violation.
    ///
    /// Canary step weights must be non-decreasing, within 0..=100 and end
    /// at 100; BlueGreen must not define steps; the analysis and traffic
    /// sections must be populated.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();
        let steps = &self.strategy.steps;

        match self.strategy_type() {
            StrategyType::BlueGreen => {
                if !steps.is_empty() {
                    errors.push(SpecValidationError::new(
                        "spec.strategy.steps",
                        "BlueGreen must not define steps",
                    ));
                }
            }
            StrategyType::Canary => {
                if steps.is_empty() {
                    errors.push(SpecValidationError::new(
                        "spec.strategy.steps",
                        "steps required for canary",
                    ));
                } else {
                    let mut prev = -1;
                    for (i, step) in steps.iter().enumerate() {
                        if step.weight < 0 || step.weight > 100 {
                            errors.push(SpecValidationError::new(
                                format!("spec.strategy.steps[{i}].weight"),
                                "weight must be within 0..100",
                            ));
                        }
                        if step.weight < prev {
                            errors.push(SpecValidationError::new(
                                "spec.strategy.steps",
                                "weights must be non-decreasing",
                            ));
                        }
                        if step.hold_seconds < 0 {
                            errors.push(SpecValidationError::new(
                                format!("spec.strategy.steps[{i}].holdSeconds"),
                                "holdSeconds must not be negative",
                            ));
                        }
                        prev = step.weight;
                    }
                    if steps.last().map(|s| s.weight) != Some(100) {
                        errors.push(SpecValidationError::new(
                            "spec.strategy.steps",
                            "final canary step must reach weight 100",
                        ));
                    }
                }
            }
        }

        if self.analysis.metrics.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.analysis.metrics",
                "at least 1 metric is required",
            ));
        }

        if self.traffic.host.is_empty()
            || self.traffic.stable_service.is_empty()
            || self.traffic.canary_service.is_empty()
        {
            errors.push(SpecValidationError::new(
                "spec.traffic",
                "host/stableService/canaryService required",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Rollout {
    /// Name of the Deployment backing the given track.
    pub fn track_deployment_name(&self, track: &str) -> String {
        use kube::ResourceExt;
        format!("{}-{}", self.name_any(), track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canary_spec(steps: Vec<RolloutStep>) -> RolloutSpec {
        RolloutSpec {
            target_ref: TargetRef {
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                port: 8080,
            },
            strategy: RolloutStrategy {
                type_: Some(StrategyType::Canary),
                steps,
            },
            analysis: AnalysisSpec {
                metrics: vec![MetricCheck {
                    name: "ready".to_string(),
                    prom_ql: "readiness".to_string(),
                    threshold: "1".to_string(),
                    compare: CompareOp::GT,
                }],
                ..Default::default()
            },
            traffic: TrafficSpec {
                provider: "NginxIngress".to_string(),
                host: "web.example.com".to_string(),
                stable_service: "web-stable".to_string(),
                canary_service: "web-canary".to_string(),
            },
            rollback_on_failure: None,
        }
    }

    fn step(weight: i32, hold_seconds: i32) -> RolloutStep {
        RolloutStep {
            weight,
            hold_seconds,
        }
    }

    #[test]
    fn test_valid_canary_spec_passes() {
        let spec = canary_spec(vec![step(10, 60), step(30, 60), step(100, 0)]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_canary_without_steps_fails() {
        let spec = canary_spec(vec![]);
        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "spec.strategy.steps"));
    }

    #[test]
    fn test_blue_green_with_steps_fails() {
        let mut spec = canary_spec(vec![step(10, 60)]);
        spec.strategy.type_ = Some(StrategyType::BlueGreen);
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors[0].message, "BlueGreen must not define steps");
    }

    #[test]
    fn test_blue_green_without_steps_passes() {
        let mut spec = canary_spec(vec![]);
        spec.strategy.type_ = Some(StrategyType::BlueGreen);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_decreasing_weights_fail() {
        let spec = canary_spec(vec![step(30, 60), step(10, 60), step(100, 0)]);
        let errors = spec.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message == "weights must be non-decreasing"));
    }

    #[test]
    fn test_weight_out_of_range_fails() {
        let spec = canary_spec(vec![step(10, 60), step(101, 0)]);
        let errors = spec.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message == "weight must be within 0..100"));
    }

    #[test]
    fn test_final_step_must_reach_100() {
        let spec = canary_spec(vec![step(10, 60), step(50, 60)]);
        let errors = spec.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message == "final canary step must reach weight 100"));
    }

    #[test]
    fn test_empty_metrics_fails() {
        let mut spec = canary_spec(vec![step(100, 0)]);
        spec.analysis.metrics.clear();
        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "spec.analysis.metrics"));
    }

    #[test]
    fn test_empty_traffic_fields_fail() {
        let mut spec = canary_spec(vec![step(100, 0)]);
        spec.traffic.host.clear();
        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "spec.traffic"));
    }

    #[test]
    fn test_unset_strategy_validates_as_canary() {
        let mut spec = canary_spec(vec![]);
        spec.strategy.type_ = None;
        let errors = spec.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message == "steps required for canary"));
    }

    #[test]
    fn test_default_steps_are_monotone_and_end_at_100() {
        let steps = default_canary_steps();
        let spec = canary_spec(steps.clone());
        assert!(spec.validate().is_ok());
        assert_eq!(steps.last().unwrap().weight, 100);
    }

    #[test]
    fn test_rollback_on_failure_resolution() {
        let mut spec = canary_spec(vec![step(100, 0)]);
        assert!(spec.rollback_on_failure());

        spec.rollback_on_failure = Some(false);
        assert!(!spec.rollback_on_failure());

        spec.rollback_on_failure = Some(true);
        assert!(spec.rollback_on_failure());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RolloutPhase::Succeeded.is_terminal());
        assert!(RolloutPhase::Failed.is_terminal());
        assert!(RolloutPhase::RolledBack.is_terminal());
        assert!(!RolloutPhase::Progressing.is_terminal());
        assert!(!RolloutPhase::Analyzing.is_terminal());
        assert!(!RolloutPhase::Idle.is_terminal());
    }

    #[test]
    fn test_analysis_defaults() {
        let analysis = AnalysisSpec::default();
        assert_eq!(analysis.interval_seconds(), 30);
        assert_eq!(analysis.success_threshold(), 2);
        assert_eq!(analysis.failure_threshold(), 2);
    }
}
