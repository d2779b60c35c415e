//! Migration metrics.
//!
//! Counters for what validation finds and what the fixer does about it. They are
//! no-ops until the embedding binary installs a recorder.

use metrics::{counter, describe_counter};
use migrator_core::{Direction, InconsistencyType};

use crate::fixer::FixOutcome;

/// Inconsistencies published by validation runs.
pub const INCONSISTENCIES: &str = "migrator_inconsistencies_total";

/// Inconsistencies that could not be published in time or at all.
pub const PUBLISH_FAILURES: &str = "migrator_publish_failures_total";

/// Rows repaired by the fixer.
pub const FIXES: &str = "migrator_fixes_total";

/// Failed fixes handed back for redelivery.
pub const FIX_RETRIES: &str = "migrator_fix_retries_total";

/// Outbox rows dropped because they could not be decoded.
pub const OUTBOX_DROPPED: &str = "migrator_outbox_dropped_total";

/// Registers all migration metric descriptions.
///
/// Call this once after the metrics recorder is installed.
pub fn register_metrics() {
    describe_counter!(INCONSISTENCIES, "Total inconsistencies published by validation");
    describe_counter!(PUBLISH_FAILURES, "Total inconsistencies that failed to publish");
    describe_counter!(FIXES, "Total rows repaired by the fixer");
    describe_counter!(FIX_RETRIES, "Total fixes scheduled for redelivery");
    describe_counter!(OUTBOX_DROPPED, "Total undecodable outbox rows dropped");
}

pub fn record_inconsistency(direction: Direction, kind: InconsistencyType) {
    let labels = [("direction", direction.to_string()), ("type", kind.to_string())];
    counter!(INCONSISTENCIES, &labels).increment(1);
}

pub fn record_publish_failure(direction: Direction, reason: &'static str) {
    let labels = [("direction", direction.to_string()), ("reason", reason.to_string())];
    counter!(PUBLISH_FAILURES, &labels).increment(1);
}

pub fn record_fix(direction: Direction, outcome: FixOutcome) {
    let labels = [("direction", direction.to_string()), ("outcome", outcome.as_str().to_string())];
    counter!(FIXES, &labels).increment(1);
}

pub fn record_fix_retry(direction: Direction) {
    counter!(FIX_RETRIES, "direction" => direction.to_string()).increment(1);
}

pub fn record_outbox_dropped(topic: &str) {
    counter!(OUTBOX_DROPPED, "topic" => topic.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;

    fn metric_lines<'a>(rendered: &'a str, name: &str) -> Vec<&'a str> {
        rendered.lines().filter(|line| line.starts_with(name)).collect()
    }

    #[test]
    fn counters_carry_direction_and_outcome_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            record_inconsistency(Direction::Src, InconsistencyType::TargetMissing);
            record_inconsistency(Direction::Src, InconsistencyType::TargetMissing);
            record_fix(Direction::Dst, FixOutcome::Deleted);
            record_fix_retry(Direction::Src);
            record_outbox_dropped("inconsistent_interactive");
        });

        let rendered = handle.render();
        let inconsistencies = metric_lines(&rendered, INCONSISTENCIES);
        assert!(inconsistencies
            .iter()
            .any(|line| line.contains("direction=\"SRC\"") && line.ends_with(" 2")));
        assert!(metric_lines(&rendered, FIXES)
            .iter()
            .any(|line| line.contains("outcome=\"deleted\"")));
        assert_eq!(metric_lines(&rendered, FIX_RETRIES).len(), 1);
        assert!(metric_lines(&rendered, OUTBOX_DROPPED)
            .iter()
            .any(|line| line.contains("topic=\"inconsistent_interactive\"")));
        assert!(metric_lines(&rendered, PUBLISH_FAILURES).is_empty());
    }
}
