//! Result records and their on-disk form.
//!
//! Every workload produces the same two records: one [`DetailRecord`] per
//! target and one [`SummaryRecord`] per run. Field names are camelCase and
//! the per-metric stats shape is shared, so one downstream reader handles
//! creation, migration and capacity results alike.

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::aggregate::{FailureReason, Outcome, RunSummary, TerminalReason};
use crate::error::{ErrorContext, Result};

/// Per-target row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailRecord {
    pub target: String,
    pub scope: String,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
    pub durations_by_metric: IndexMap<String, f64>,
    pub source_location: Option<String>,
    pub dest_location: Option<String>,
    #[serde(default)]
    pub inferred_metrics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&Outcome> for DetailRecord {
    fn from(outcome: &Outcome) -> Self {
        Self {
            target: outcome.target.id.clone(),
            scope: outcome.target.scope.clone(),
            success: outcome.success,
            failure_reason: outcome.failure_reason,
            durations_by_metric: outcome.durations.clone(),
            source_location: outcome.source_location.as_ref().map(|l| l.0.clone()),
            dest_location: outcome.dest_location.as_ref().map(|l| l.0.clone()),
            inferred_metrics: outcome.inferred_metrics.clone(),
            message: outcome.message.clone(),
        }
    }
}

/// One entry of `perMetricStats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub metric: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

/// Per-run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    pub run_id: Uuid,
    pub workload: String,
    pub started_at: DateTime<Utc>,
    pub total_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub skipped_count: usize,
    pub total_run_duration_sec: f64,
    pub terminal_reason: TerminalReason,
    pub per_metric_stats: Vec<MetricRecord>,
    pub failures_by_reason: BTreeMap<FailureReason, usize>,
}

impl SummaryRecord {
    pub fn new(
        workload: impl Into<String>,
        summary: &RunSummary,
        started_at: DateTime<Utc>,
        total_run_duration_sec: f64,
    ) -> Self {
        let per_metric_stats = summary
            .per_metric
            .iter()
            .map(|(metric, stats)| MetricRecord {
                metric: metric.clone(),
                avg: stats.avg(),
                min: stats.min,
                max: stats.max,
                count: stats.count,
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            workload: workload.into(),
            started_at,
            total_count: summary.total,
            success_count: summary.successful,
            fail_count: summary.failed,
            skipped_count: summary.skipped,
            total_run_duration_sec,
            terminal_reason: summary.terminal_reason,
            per_metric_stats,
            failures_by_reason: summary.failures_by_reason.clone(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricRecord> {
        self.per_metric_stats.iter().find(|m| m.metric == name)
    }
}

/// Writes one run's records into `{root}/{workload}/{YYYYmmdd-HHMMSS}/`.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    pub fn new(results_dir: impl AsRef<Path>, workload: &str, started_at: DateTime<Utc>) -> Self {
        let stamp = started_at.format("%Y%m%d-%H%M%S").to_string();
        Self {
            dir: results_dir.as_ref().join(workload).join(stamp),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .context(format!("Failed to create results directory {}", self.dir.display()))
    }

    /// `details.json` and `details.csv`.
    pub fn write_details(&self, records: &[DetailRecord]) -> Result<Vec<PathBuf>> {
        let json_path = self.write_json("details.json", records)?;
        let csv_path = self.dir.join("details.csv");
        write_details_csv(&csv_path, records)?;
        Ok(vec![json_path, csv_path])
    }

    /// `summary.json`.
    pub fn write_summary(&self, summary: &SummaryRecord) -> Result<PathBuf> {
        self.write_json("summary.json", summary)
    }

    /// Any other JSON document, e.g. `iterations.json`.
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(name);
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, content)?;
        tracing::debug!(path = %path.display(), "Wrote results file");
        Ok(path)
    }
}

/// CSV with one column per metric seen in any record, in first-seen order.
fn write_details_csv(path: &Path, records: &[DetailRecord]) -> Result<()> {
    let metrics: IndexSet<&str> = records
        .iter()
        .flat_map(|r| r.durations_by_metric.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["target", "scope", "success", "failureReason"];
    header.extend(metrics.iter().copied());
    header.extend(["sourceLocation", "destLocation", "inferredMetrics"]);
    writer.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.target.clone(),
            record.scope.clone(),
            record.success.to_string(),
            record
                .failure_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
        ];
        for metric in &metrics {
            row.push(
                record
                    .durations_by_metric
                    .get(*metric)
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_default(),
            );
        }
        row.push(record.source_location.clone().unwrap_or_default());
        row.push(record.dest_location.clone().unwrap_or_default());
        row.push(record.inferred_metrics.join(";"));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::summarize;
    use crate::controller::Location;
    use crate::target::Target;
    use chrono::TimeZone;

    fn outcomes() -> Vec<Outcome> {
        vec![
            Outcome::succeeded(Target::vm("vm", "ns-1"))
                .with_duration("clone", 12.0)
                .with_duration("running", 40.0)
                .with_inferred("clone"),
            Outcome::succeeded(Target::vm("vm", "ns-2")).with_duration("running", 60.0),
            Outcome::failed(Target::vm("vm", "ns-3"), FailureReason::Timeout, "no Running")
                .with_locations(Some(Location::new("worker-1")), None),
        ]
    }

    #[test]
    fn test_summary_shape() {
        let summary = summarize(&outcomes());
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = SummaryRecord::new("creation", &summary, started, 75.5);

        assert_eq!(record.total_count, 3);
        assert_eq!(record.success_count, 2);
        assert_eq!(record.fail_count, 1);
        assert_eq!(record.terminal_reason, TerminalReason::Timeout);
        let running = record.metric("running").unwrap();
        assert_eq!(running.count, 2);
        assert_eq!(running.avg, 50.0);
        assert_eq!(record.metric("clone").unwrap().count, 1);

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("totalRunDurationSec").is_some());
        assert_eq!(json["perMetricStats"][0]["metric"], "clone");
        assert_eq!(json["terminalReason"], "timeout");
    }

    #[test]
    fn test_detail_from_outcome() {
        let records: Vec<DetailRecord> = outcomes().iter().map(DetailRecord::from).collect();
        assert_eq!(records[0].target, "vm");
        assert_eq!(records[0].scope, "ns-1");
        assert_eq!(records[0].inferred_metrics, vec!["clone"]);
        assert_eq!(records[2].failure_reason, Some(FailureReason::Timeout));
        assert_eq!(records[2].source_location.as_deref(), Some("worker-1"));

        let json = serde_json::to_value(&records[2]).unwrap();
        assert_eq!(json["failureReason"], "timeout");
        assert!(json.get("durationsByMetric").is_some());
    }

    #[test]
    fn test_writer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        let writer = ResultWriter::new(dir.path(), "creation", started);
        assert!(writer.dir().ends_with("creation/20240501-123005"));

        let records: Vec<DetailRecord> = outcomes().iter().map(DetailRecord::from).collect();
        writer.write_details(&records).unwrap();
        let summary = SummaryRecord::new("creation", &summarize(&outcomes()), started, 1.0);
        writer.write_summary(&summary).unwrap();

        let csv = std::fs::read_to_string(writer.dir().join("details.csv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "target,scope,success,failureReason,clone,running,sourceLocation,destLocation,inferredMetrics"
        );
        assert_eq!(lines.next().unwrap(), "vm,ns-1,true,,12.000,40.000,,,clone");
        assert_eq!(lines.nth(1).unwrap(), "vm,ns-3,false,timeout,,,worker-1,,");

        let back: SummaryRecord = serde_json::from_str(
            &std::fs::read_to_string(writer.dir().join("summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(back, summary);
    }
}
