//! Action-specific retention policy
//!
//! Retention is classified by action prefix, longest interest first.
//! Security-relevant events keep the regulatory seven years; routine
//! indexing noise ages out in months.

use chrono::{DateTime, Duration, Utc};

/// Prefix rules checked in order; first match wins.
///
/// `branch.merge` must precede the generic `branch.` rule, and
/// `indexing.failed` the generic `indexing.` rule.
const RETENTION_RULES: &[(&str, i64)] = &[
    ("auth.", 2555),
    ("acl.", 2555),
    ("schema.", 1825),
    ("object_type.", 1825),
    ("link_type.", 1825),
    ("action_type.", 1825),
    ("function_type.", 1825),
    ("property.", 1825),
    ("interface.", 1825),
    ("branch.merge", 730),
    ("merge.", 730),
    ("branch.", 365),
    ("indexing.failed", 180),
    ("indexing.", 90),
];

/// Maps actions to retention periods.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    default_days: i64,
}

impl RetentionPolicy {
    /// Policy with the given fallback for unclassified actions.
    pub fn new(default_days: i64) -> Self {
        RetentionPolicy { default_days }
    }

    /// Retention period in days for an action.
    pub fn retention_days(&self, action: &str) -> i64 {
        for (prefix, days) in RETENTION_RULES {
            if action.starts_with(prefix) {
                return *days;
            }
        }
        self.default_days
    }

    /// When an event for this action stops being retained.
    pub fn retention_until(&self, action: &str, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::days(self.retention_days(action))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy { default_days: 2555 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_events_keep_seven_years() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.retention_days("auth.login"), 2555);
        assert_eq!(policy.retention_days("auth.failed"), 2555);
        assert_eq!(policy.retention_days("acl.update"), 2555);
    }

    #[test]
    fn test_schema_changes_keep_five_years() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.retention_days("schema.create"), 1825);
        assert_eq!(policy.retention_days("object_type.delete"), 1825);
        assert_eq!(policy.retention_days("link_type.update"), 1825);
    }

    #[test]
    fn test_branch_ops_keep_one_year_merges_two() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.retention_days("branch.create"), 365);
        assert_eq!(policy.retention_days("branch.update"), 365);
        assert_eq!(policy.retention_days("branch.merge"), 730);
        assert_eq!(policy.retention_days("merge.completed"), 730);
    }

    #[test]
    fn test_indexing_short_retention_failures_longer() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.retention_days("indexing.started"), 90);
        assert_eq!(policy.retention_days("indexing.completed"), 90);
        assert_eq!(policy.retention_days("indexing.failed"), 180);
    }

    #[test]
    fn test_unclassified_falls_back_to_default() {
        let policy = RetentionPolicy::new(100);
        assert_eq!(policy.retention_days("lock.acquired"), 100);
        assert_eq!(policy.retention_days("outbox.dead_letter"), 100);
    }

    #[test]
    fn test_retention_until_is_monotonic_per_action() {
        let policy = RetentionPolicy::default();
        let t0 = Utc::now();
        let t1 = t0 + Duration::hours(1);
        let u0 = policy.retention_until("branch.create", t0);
        let u1 = policy.retention_until("branch.create", t1);
        assert!(u1 > u0);
        assert_eq!(u0, t0 + Duration::days(365));
    }
}
