//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Update or add a condition in the list.
///
/// At most one condition per type exists; a condition with the same type is
/// superseded in place, refreshing the transition time only when the status
/// actually changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{COND_APPLIED, COND_PROPOSED};

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            COND_PROPOSED,
            CONDITION_STATUS_TRUE,
            "OK",
            "PatchProposed",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, COND_PROPOSED);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_set_condition_supersedes_in_place() {
        let mut conditions = vec![Condition {
            type_: COND_APPLIED.to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "Pending".to_string(),
            message: "awaiting approval".to_string(),
        }];

        let old_time = conditions[0].last_transition_time.clone();
        set_condition(
            &mut conditions,
            COND_APPLIED,
            CONDITION_STATUS_TRUE,
            "OK",
            "PatchApplied",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_ne!(conditions[0].last_transition_time, old_time);
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut conditions = vec![Condition {
            type_: COND_PROPOSED.to_string(),
            status: CONDITION_STATUS_TRUE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "OK".to_string(),
            message: "PatchProposed".to_string(),
        }];

        set_condition(
            &mut conditions,
            COND_PROPOSED,
            CONDITION_STATUS_TRUE,
            "OK",
            "PatchProposed again",
        );

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "PatchProposed again");
    }

    #[test]
    fn test_is_condition_true() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            COND_PROPOSED,
            CONDITION_STATUS_TRUE,
            "OK",
            "PatchProposed",
        );
        set_condition(
            &mut conditions,
            COND_APPLIED,
            CONDITION_STATUS_UNKNOWN,
            "Pending",
            "",
        );

        assert!(is_condition_true(&conditions, COND_PROPOSED));
        assert!(!is_condition_true(&conditions, COND_APPLIED));
        assert!(!is_condition_true(&conditions, "Missing"));
    }
}
