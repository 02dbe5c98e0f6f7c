//! Admission webhooks for Rollout records
//!
//! Mutating hook: fills strategy/analysis/rollback defaults on create and
//! update. Validating hook: rejects records that break the rollout
//! invariants, with every violation aggregated into one denial.

pub mod rollout;
pub mod server;

pub use rollout::{defaulting_ops, denial_message};
pub use server::{TlsConfig, WebhookServer};
