//! Execution analytics aggregated while a plan runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ExecutionReport, StepErrorKind};
use crate::plan::StepStatus;

/// Failure breakdown attached to analytics once an execution ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureAnalysis {
    /// Steps that ended in failure (`done-failed` or the fatal step).
    pub failed_steps: Vec<String>,
    /// Steps skipped or cancelled because of upstream failures.
    pub cascade_cancelled: Vec<String>,
    /// Message of the first failure observed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

/// Rolling analytics for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionAnalytics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub cancelled_steps: usize,
    pub retries: u64,
    /// Percentage of terminal steps that succeeded, in `[0, 100]`.
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_step_duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    /// Data points reported by tool runners, summed.
    pub data_points: u64,
    /// Mean number of concurrently running steps, sampled per scheduling tick.
    pub average_parallelism: f64,
    pub per_step_durations_ms: HashMap<String, u64>,
    pub failure_analysis: FailureAnalysis,
}

impl ExecutionAnalytics {
    /// Recompute the aggregate view from an execution report.
    ///
    /// `parallelism_samples` are per-tick counts of running steps collected
    /// by the driver; `retries` is the cumulative retry count.
    pub fn from_report(
        report: &ExecutionReport,
        retries: u64,
        parallelism_samples: &[usize],
    ) -> Self {
        let mut analytics = Self {
            total_steps: report.records.len(),
            retries,
            ..Default::default()
        };

        let mut durations = Vec::new();
        let mut first_error: Option<(u64, String)> = None;
        for record in report.records.values() {
            match record.status {
                StepStatus::Done => analytics.completed_steps += 1,
                StepStatus::DoneFailed => {
                    analytics.failed_steps += 1;
                    analytics.failure_analysis.failed_steps.push(record.step_id.clone());
                }
                StepStatus::Skipped => {
                    analytics.skipped_steps += 1;
                    analytics
                        .failure_analysis
                        .cascade_cancelled
                        .push(record.step_id.clone());
                }
                StepStatus::Cancelled => {
                    analytics.cancelled_steps += 1;
                    analytics
                        .failure_analysis
                        .cascade_cancelled
                        .push(record.step_id.clone());
                }
                StepStatus::Pending | StepStatus::Running => {}
            }
            if let Some(error) = &record.error {
                if error.kind != StepErrorKind::Cancelled {
                    let at = record.ended_at.unwrap_or(u64::MAX);
                    if first_error.as_ref().is_none_or(|(t, _)| at < *t) {
                        first_error = Some((at, error.message.clone()));
                    }
                    if record.status != StepStatus::DoneFailed
                        && !analytics
                            .failure_analysis
                            .failed_steps
                            .contains(&record.step_id)
                    {
                        analytics.failure_analysis.failed_steps.push(record.step_id.clone());
                        analytics.failed_steps += 1;
                    }
                }
            }
            if let Some(duration) = record.duration_ms {
                durations.push(duration);
                analytics
                    .per_step_durations_ms
                    .insert(record.step_id.clone(), duration);
            }
            if let Some(output) = &record.output {
                analytics.data_points += output.data_points.unwrap_or(0);
            }
        }
        analytics.failure_analysis.first_error = first_error.map(|(_, msg)| msg);
        analytics.failure_analysis.failed_steps.sort_unstable();
        analytics.failure_analysis.cascade_cancelled.sort_unstable();

        let terminal =
            analytics.completed_steps + analytics.failed_steps + analytics.skipped_steps
                + analytics.cancelled_steps;
        analytics.success_rate = if terminal == 0 {
            0.0
        } else {
            analytics.completed_steps as f64 / terminal as f64 * 100.0
        };

        if !durations.is_empty() {
            analytics.average_step_duration_ms =
                Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64);
        }
        analytics.total_duration_ms = report
            .ended_at
            .map(|end| end.saturating_sub(report.started_at));

        if !parallelism_samples.is_empty() {
            analytics.average_parallelism = parallelism_samples.iter().sum::<usize>() as f64
                / parallelism_samples.len() as f64;
        }

        analytics
    }
}
