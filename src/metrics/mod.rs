//! Metrics for migration observability.
//!
//! Per-token retries and partial failures never surface to the orchestrator;
//! they are visible only here and in the logs.

mod counters;

pub use counters::{Counter, Gauge, LabeledCounter};

use std::fmt::Write as _;

use crate::error::ErrorKind;

/// Counters and gauges maintained by the coordinator, executors and clients.
#[derive(Debug)]
pub struct MigrationMetrics {
    /// Migrations started on this node.
    pub migrations_started: Counter,
    /// Migrations that acknowledged OK.
    pub migrations_completed: Counter,
    /// Migrations fully aborted.
    pub migrations_aborted: Counter,
    /// Token groups torn down by a localized abort.
    pub groups_aborted: Counter,
    /// Executors created (including retries).
    pub executors_created: Counter,
    /// Executors created to retry failed tokens.
    pub executors_retried: Counter,
    /// Tokens that failed against a source.
    pub token_failures: LabeledCounter,
    /// Tokens scheduled for retry against an alternate source.
    pub tokens_retried: Counter,
    /// Filter-set messages sent by executors.
    pub filter_sets_sent: Counter,
    /// Delta-set messages sent by clients.
    pub delta_sets_sent: Counter,
    /// Delta-set messages applied by executors.
    pub delta_sets_applied: Counter,
    /// Delta-set messages ignored as duplicates or stale.
    pub delta_sets_duplicate: Counter,
    /// Objects written by applying delta sets.
    pub objects_applied: Counter,
    /// Live writes relayed to a destination.
    pub writes_forwarded: Counter,
    /// Relay attempts that failed.
    pub forward_failures: Counter,
    /// Executors currently alive.
    pub active_executors: Gauge,
    /// Clients currently alive.
    pub active_clients: Gauge,
}

impl MigrationMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self {
            migrations_started: Counter::new("migrations_started", "Migrations started"),
            migrations_completed: Counter::new("migrations_completed", "Migrations acknowledged OK"),
            migrations_aborted: Counter::new("migrations_aborted", "Migrations fully aborted"),
            groups_aborted: Counter::new("migration_groups_aborted", "Token groups aborted"),
            executors_created: Counter::new("migration_executors_created", "Executors created"),
            executors_retried: Counter::new(
                "migration_executors_retried",
                "Executors created to retry failed tokens",
            ),
            token_failures: LabeledCounter::new(
                "migration_token_failures",
                "Tokens failed against a source",
                "kind",
            ),
            tokens_retried: Counter::new("migration_tokens_retried", "Tokens retried"),
            filter_sets_sent: Counter::new("migration_filter_sets_sent", "Filter sets sent"),
            delta_sets_sent: Counter::new("migration_delta_sets_sent", "Delta sets sent"),
            delta_sets_applied: Counter::new("migration_delta_sets_applied", "Delta sets applied"),
            delta_sets_duplicate: Counter::new(
                "migration_delta_sets_duplicate",
                "Delta sets ignored as duplicate or stale",
            ),
            objects_applied: Counter::new("migration_objects_applied", "Objects merged locally"),
            writes_forwarded: Counter::new("migration_writes_forwarded", "Live writes relayed"),
            forward_failures: Counter::new("migration_forward_failures", "Relay attempts failed"),
            active_executors: Gauge::new("migration_active_executors", "Live executors"),
            active_clients: Gauge::new("migration_active_clients", "Live clients"),
        }
    }

    /// Record one token failing with the given kind.
    pub fn record_token_failure(&self, kind: ErrorKind) {
        self.token_failures.inc(kind.as_str());
    }

    /// Point-in-time copy of the headline values.
    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            started: self.migrations_started.get(),
            completed: self.migrations_completed.get(),
            aborted: self.migrations_aborted.get(),
            groups_aborted: self.groups_aborted.get(),
            executors_created: self.executors_created.get(),
            executors_retried: self.executors_retried.get(),
            tokens_retried: self.tokens_retried.get(),
            token_failures: self.token_failures.get_all().iter().map(|(_, v)| v).sum(),
            delta_sets_applied: self.delta_sets_applied.get(),
            delta_sets_duplicate: self.delta_sets_duplicate.get(),
            objects_applied: self.objects_applied.get(),
            writes_forwarded: self.writes_forwarded.get(),
            forward_failures: self.forward_failures.get(),
            active_executors: self.active_executors.get().max(0) as u64,
            active_clients: self.active_clients.get().max(0) as u64,
        }
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters = [
            &self.migrations_started,
            &self.migrations_completed,
            &self.migrations_aborted,
            &self.groups_aborted,
            &self.executors_created,
            &self.executors_retried,
            &self.tokens_retried,
            &self.filter_sets_sent,
            &self.delta_sets_sent,
            &self.delta_sets_applied,
            &self.delta_sets_duplicate,
            &self.objects_applied,
            &self.writes_forwarded,
            &self.forward_failures,
        ];
        for c in counters {
            let _ = writeln!(out, "# HELP {} {}", c.name(), c.help());
            let _ = writeln!(out, "# TYPE {} counter", c.name());
            let _ = writeln!(out, "{} {}", c.name(), c.get());
        }

        for g in [&self.active_executors, &self.active_clients] {
            let _ = writeln!(out, "# HELP {} {}", g.name(), g.help());
            let _ = writeln!(out, "# TYPE {} gauge", g.name());
            let _ = writeln!(out, "{} {}", g.name(), g.get());
        }

        let lc = &self.token_failures;
        let _ = writeln!(out, "# HELP {} {}", lc.name(), lc.help());
        let _ = writeln!(out, "# TYPE {} counter", lc.name());
        for (label, value) in lc.get_all() {
            let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", lc.name(), lc.label_name(), label, value);
        }
        out
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of migration metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationMetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub groups_aborted: u64,
    pub executors_created: u64,
    pub executors_retried: u64,
    pub tokens_retried: u64,
    pub token_failures: u64,
    pub delta_sets_applied: u64,
    pub delta_sets_duplicate: u64,
    pub objects_applied: u64,
    pub writes_forwarded: u64,
    pub forward_failures: u64,
    pub active_executors: u64,
    pub active_clients: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_sums_token_failures() {
        let metrics = MigrationMetrics::new();
        metrics.record_token_failure(ErrorKind::SourceNotReady);
        metrics.record_token_failure(ErrorKind::Timeout);
        metrics.record_token_failure(ErrorKind::Timeout);
        metrics.executors_created.inc_by(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.token_failures, 3);
        assert_eq!(snap.executors_created, 3);
        assert_eq!(metrics.token_failures.get("timeout"), 2);
    }

    #[test]
    fn test_render_contains_labeled_series() {
        let metrics = MigrationMetrics::new();
        metrics.record_token_failure(ErrorKind::SourceNotReady);
        metrics.active_executors.inc();

        let text = metrics.render();
        assert!(text.contains("migration_token_failures{kind=\"source_not_ready\"} 1"));
        assert!(text.contains("migration_active_executors 1"));
        assert!(text.contains("# TYPE migrations_started counter"));
    }
}
