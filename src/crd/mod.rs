//! Custom Resource Definitions for the AIOps operator
//!
//! Three APIs: Remediation (aiops.example.com), Rollout
//! (delivery.example.com) and Nginx (nginx.example.com).

mod nginx;
mod remediation;
mod rollout;
pub mod types;

pub use nginx::{Nginx, NginxSpec, NginxStatus};
pub use remediation::{
    Remediation, RemediationSpec, RemediationStatus, TargetObjectRef, COND_APPLIED,
    COND_DIAGNOSING, COND_FAILED, COND_PROPOSED, COND_READY_FOR_REVIEW,
};
pub use rollout::{
    default_canary_steps, AnalysisSpec, CompareOp, MetricCheck, Rollout, RolloutPhase,
    RolloutSpec, RolloutStatus, RolloutStep, RolloutStrategy, SpecValidationError, StrategyType,
    TargetRef, TrafficSpec,
};
pub use types::Condition;
