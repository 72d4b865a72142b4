use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

use super::rules::{MetricRules, RuleResult};

/// Maximum consecutive failed delivery attempts before a metric table is
/// dropped instead of being merged back for retry.
pub const MAX_FAILED_METRIC_ATTEMPTS: u32 = 5;

/// Identity of one aggregated metric: name plus optional scope
/// (empty string means unscoped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MetricId {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl MetricId {
    pub fn unscoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: String::new(),
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: scope.into(),
        }
    }
}

/// Aggregated statistics for one metric, in wire order:
/// `[count, total, exclusive, min, max, sum_squares]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricData {
    pub count: f64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_squares: f64,
}

impl MetricData {
    /// A single timed observation, in seconds.
    pub fn from_duration(total: f64, exclusive: f64) -> Self {
        Self {
            count: 1.0,
            total,
            exclusive,
            min: total,
            max: total,
            sum_squares: total * total,
        }
    }

    /// A bare occurrence count with no timing.
    pub fn from_count(count: f64) -> Self {
        Self {
            count,
            total: 0.0,
            exclusive: 0.0,
            min: 0.0,
            max: 0.0,
            sum_squares: 0.0,
        }
    }

    /// Element-wise aggregation: sums for count/total/exclusive/sum_squares,
    /// min/max update for the extrema.
    pub fn aggregate(&mut self, other: &MetricData) {
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_squares += other.sum_squares;
    }

    fn as_tuple(&self) -> [f64; 6] {
        [
            self.count,
            self.total,
            self.exclusive,
            self.min,
            self.max,
            self.sum_squares,
        ]
    }
}

#[derive(Debug, Clone)]
struct MetricEntry {
    forced: bool,
    data: MetricData,
}

/// Aggregation table mapping (name, scope) to six-tuple statistics.
///
/// Once the table is at capacity, creations of new unforced names are
/// dropped and counted; forced entries are never capped. Aggregated fields
/// only reset when the whole table is replaced at a harvest boundary.
#[derive(Debug)]
pub struct MetricTable {
    capacity: usize,
    dropped: u64,
    failed_attempts: u32,
    period_start: SystemTime,
    metrics: HashMap<MetricId, MetricEntry>,
}

impl MetricTable {
    /// Creates an empty table capped at `capacity` unforced names.
    pub fn new(capacity: usize, period_start: SystemTime) -> Self {
        Self {
            capacity,
            dropped: 0,
            failed_attempts: 0,
            period_start,
            metrics: HashMap::new(),
        }
    }

    /// Adds one observation, creating or aggregating into the entry.
    pub fn add(&mut self, id: MetricId, data: MetricData, forced: bool) {
        if let Some(entry) = self.metrics.get_mut(&id) {
            entry.forced = entry.forced || forced;
            entry.data.aggregate(&data);
            return;
        }

        if !forced && self.metrics.len() >= self.capacity {
            self.dropped += 1;
            return;
        }

        self.metrics.insert(id, MetricEntry { forced, data });
    }

    /// Folds every entry of `other` into this table.
    pub fn merge(&mut self, other: MetricTable) {
        self.dropped += other.dropped;
        for (id, entry) in other.metrics {
            self.add(id, entry.data, entry.forced);
        }
    }

    /// Merges back a table whose delivery failed.
    ///
    /// Returns false (and keeps `self` untouched) when `other` has already
    /// exhausted its retry budget; otherwise the incremented attempt counter
    /// propagates to this table and the contents merge normally.
    pub fn merge_failed(&mut self, other: MetricTable) -> bool {
        if other.failed_attempts >= MAX_FAILED_METRIC_ATTEMPTS {
            warn!(
                attempts = other.failed_attempts,
                metrics = other.metrics.len(),
                "metric table exceeded retry budget, dropping",
            );
            return false;
        }

        self.failed_attempts = other.failed_attempts + 1;
        self.merge(other);
        true
    }

    /// Produces a new table with names rewritten through `rules`.
    ///
    /// Names killed by an `ignore` rule are returned alongside the rewritten
    /// table so the caller can account for (or act on) every dropped name.
    pub fn apply_rules(&self, rules: &MetricRules) -> (MetricTable, Vec<String>) {
        let mut rewritten = MetricTable::new(self.capacity, self.period_start);
        rewritten.dropped = self.dropped;
        rewritten.failed_attempts = self.failed_attempts;

        let mut ignored = Vec::new();

        for (id, entry) in &self.metrics {
            match rules.apply(&id.name) {
                RuleResult::Ignored => ignored.push(id.name.clone()),
                RuleResult::Renamed(name) => rewritten.add(
                    MetricId {
                        name,
                        scope: id.scope.clone(),
                    },
                    entry.data,
                    entry.forced,
                ),
                RuleResult::Unchanged => rewritten.add(id.clone(), entry.data, entry.forced),
            }
        }

        (rewritten, ignored)
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Observations dropped because the table was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Consecutive failed delivery attempts carried by this table.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Start of the reporting period this table covers.
    pub fn period_start(&self) -> SystemTime {
        self.period_start
    }

    /// Looks up aggregated data for an identity. Test and diagnostics helper.
    pub fn get(&self, id: &MetricId) -> Option<&MetricData> {
        self.metrics.get(id).map(|e| &e.data)
    }

    /// Builds the harvest envelope:
    /// `[run_id, period_start_unix, period_end_unix,
    ///   [[{"name": n, "scope"?: s}, [count, total, exclusive, min, max,
    ///   sum_squares]], ...]]`.
    ///
    /// Returns None when the table is empty.
    pub fn payload(&self, run_id: &str, period_end: SystemTime) -> Option<Vec<u8>> {
        if self.metrics.is_empty() {
            return None;
        }

        let rows: Vec<(&MetricId, [f64; 6])> = self
            .metrics
            .iter()
            .map(|(id, entry)| (id, entry.data.as_tuple()))
            .collect();

        let envelope = (
            run_id,
            unix_seconds(self.period_start),
            unix_seconds(period_end),
            rows,
        );

        match serde_json::to_vec(&envelope) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(error = %e, "serializing metric payload failed");
                None
            }
        }
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn table(capacity: usize) -> MetricTable {
        MetricTable::new(capacity, UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    #[test]
    fn test_add_aggregates_existing() {
        let mut t = table(10);
        t.add(
            MetricId::unscoped("WebTransaction"),
            MetricData::from_duration(2.0, 1.0),
            false,
        );
        t.add(
            MetricId::unscoped("WebTransaction"),
            MetricData::from_duration(4.0, 3.0),
            false,
        );

        let data = t
            .get(&MetricId::unscoped("WebTransaction"))
            .expect("entry exists");
        assert_eq!(data.count, 2.0);
        assert_eq!(data.total, 6.0);
        assert_eq!(data.exclusive, 4.0);
        assert_eq!(data.min, 2.0);
        assert_eq!(data.max, 4.0);
        assert_eq!(data.sum_squares, 20.0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_unforced_add_at_capacity_drops() {
        let mut t = table(1);
        t.add(
            MetricId::unscoped("first"),
            MetricData::from_count(1.0),
            false,
        );
        t.add(
            MetricId::unscoped("second"),
            MetricData::from_count(1.0),
            false,
        );

        assert_eq!(t.len(), 1);
        assert_eq!(t.dropped(), 1);
        assert!(t.get(&MetricId::unscoped("second")).is_none());
    }

    #[test]
    fn test_forced_add_at_capacity_inserts() {
        let mut t = table(1);
        t.add(
            MetricId::unscoped("first"),
            MetricData::from_count(1.0),
            false,
        );
        t.add(
            MetricId::unscoped("forced"),
            MetricData::from_count(1.0),
            true,
        );

        assert_eq!(t.len(), 2);
        assert_eq!(t.dropped(), 0);
    }

    #[test]
    fn test_existing_entry_aggregates_even_at_capacity() {
        let mut t = table(1);
        t.add(
            MetricId::unscoped("only"),
            MetricData::from_count(1.0),
            false,
        );
        t.add(
            MetricId::unscoped("only"),
            MetricData::from_count(2.0),
            false,
        );

        let data = t.get(&MetricId::unscoped("only")).expect("entry exists");
        assert_eq!(data.count, 3.0);
        assert_eq!(t.dropped(), 0);
    }

    #[test]
    fn test_scoped_and_unscoped_are_distinct() {
        let mut t = table(10);
        t.add(MetricId::unscoped("db"), MetricData::from_count(1.0), false);
        t.add(
            MetricId::scoped("db", "WebTransaction/index"),
            MetricData::from_count(5.0),
            false,
        );

        assert_eq!(t.len(), 2);
        let scoped = t
            .get(&MetricId::scoped("db", "WebTransaction/index"))
            .expect("scoped entry exists");
        assert_eq!(scoped.count, 5.0);
    }

    #[test]
    fn test_merge_folds_entries() {
        let mut a = table(10);
        a.add(MetricId::unscoped("x"), MetricData::from_count(1.0), false);

        let mut b = table(10);
        b.add(MetricId::unscoped("x"), MetricData::from_count(2.0), false);
        b.add(MetricId::unscoped("y"), MetricData::from_count(7.0), true);

        a.merge(b);

        assert_eq!(a.len(), 2);
        assert_eq!(a.get(&MetricId::unscoped("x")).expect("x").count, 3.0);
        assert_eq!(a.get(&MetricId::unscoped("y")).expect("y").count, 7.0);
    }

    #[test]
    fn test_merge_failed_propagates_counter() {
        let mut current = table(10);
        let mut failed = table(10);
        failed.add(MetricId::unscoped("m"), MetricData::from_count(1.0), false);

        assert!(current.merge_failed(failed));
        assert_eq!(current.failed_attempts(), 1);
        assert_eq!(current.len(), 1);
    }

    #[test]
    fn test_merge_failed_at_ceiling_discards() {
        let mut current = table(10);
        current.add(MetricId::unscoped("kept"), MetricData::from_count(1.0), false);

        let mut failed = table(10);
        failed.add(MetricId::unscoped("lost"), MetricData::from_count(1.0), false);
        failed.failed_attempts = MAX_FAILED_METRIC_ATTEMPTS;

        assert!(!current.merge_failed(failed));
        assert_eq!(current.len(), 1);
        assert!(current.get(&MetricId::unscoped("lost")).is_none());
        assert_eq!(current.failed_attempts(), 0);
    }

    #[test]
    fn test_apply_rules_rewrites_and_surfaces_ignored() {
        use super::super::rules::RuleSpec;

        let rules = MetricRules::compile(vec![
            RuleSpec {
                match_expression: "^secret/".to_string(),
                replacement: String::new(),
                ignore: true,
                eval_order: 0,
                each_segment: false,
                replace_all: false,
                terminate_chain: false,
            },
            RuleSpec {
                match_expression: "[0-9]+".to_string(),
                replacement: "*".to_string(),
                ignore: false,
                eval_order: 1,
                each_segment: false,
                replace_all: true,
                terminate_chain: false,
            },
        ])
        .expect("rules compile");

        let mut t = table(10);
        t.add(
            MetricId::unscoped("users/123"),
            MetricData::from_count(1.0),
            false,
        );
        t.add(
            MetricId::unscoped("users/456"),
            MetricData::from_count(2.0),
            false,
        );
        t.add(
            MetricId::unscoped("secret/key"),
            MetricData::from_count(1.0),
            false,
        );

        let (rewritten, ignored) = t.apply_rules(&rules);

        assert_eq!(ignored, vec!["secret/key".to_string()]);
        // Both rewritten names collide on "users/*" and aggregate.
        assert_eq!(rewritten.len(), 1);
        assert_eq!(
            rewritten
                .get(&MetricId::unscoped("users/*"))
                .expect("merged entry")
                .count,
            3.0,
        );
    }

    #[test]
    fn test_payload_envelope_shape() {
        let mut t = table(10);
        t.add(
            MetricId::unscoped("WebTransaction"),
            MetricData::from_duration(1.5, 1.0),
            false,
        );

        let end = t.period_start() + Duration::from_secs(60);
        let body = t.payload("R1", end).expect("payload present");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("valid json");

        assert_eq!(parsed[0], "R1");
        assert_eq!(parsed[1], 1_700_000_000u64);
        assert_eq!(parsed[2], 1_700_000_060u64);

        let rows = parsed[3].as_array().expect("rows array");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0]["name"], "WebTransaction");
        assert!(rows[0][0].get("scope").is_none());
        assert_eq!(
            rows[0][1],
            serde_json::json!([1.0, 1.5, 1.0, 1.5, 1.5, 2.25])
        );
    }

    #[test]
    fn test_empty_payload_is_none() {
        let t = table(10);
        assert!(t.payload("R1", SystemTime::now()).is_none());
    }
}
