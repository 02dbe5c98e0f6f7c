//! AIOps Operator: LLM-assisted remediation and progressive delivery
//!
//! This crate provides a Kubernetes operator with three cooperating
//! controllers: an AIOps remediation workflow (detect, propose, approve,
//! apply), a Canary/Blue-Green rollout engine, and a small illustrative
//! nginx workload controller.

pub mod analysis;
pub mod controller;
pub mod crd;
pub mod error;
pub mod evidence;
pub mod llm;
pub mod traffic;
pub mod webhook;

pub use crate::error::{Error, Result};

/// The field-manager identity used for every server-side apply issued by
/// this operator. Successive applies under the same owner converge instead
/// of conflicting.
pub const FIELD_MANAGER: &str = "aiops-operator";
