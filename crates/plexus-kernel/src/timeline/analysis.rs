//! Timeline analysis — distributions, durations, filters.

use std::collections::HashMap;

use super::{Timeline, TimelineEntry, TimelinePhase};

/// Count of entries per phase.
pub fn state_distribution(timeline: &Timeline) -> HashMap<TimelinePhase, usize> {
    let mut distribution = HashMap::new();
    for entry in &timeline.entries {
        *distribution.entry(entry.state).or_insert(0) += 1;
    }
    distribution
}

/// Total milliseconds attributed to each phase.
///
/// An entry's `duration_ms` measures the time spent *reaching* it, so the
/// time is charged to the previous entry's state.
pub fn time_in_state(timeline: &Timeline) -> HashMap<TimelinePhase, u64> {
    let mut totals = HashMap::new();
    for pair in timeline.entries.windows(2) {
        if let Some(duration) = pair[1].duration_ms {
            *totals.entry(pair[0].state).or_insert(0) += duration;
        }
    }
    totals
}

/// Average milliseconds spent in [`TimelinePhase::Acting`] segments — the
/// closest timeline-level proxy for step duration.
pub fn average_step_duration_ms(timeline: &Timeline) -> Option<f64> {
    let mut durations = Vec::new();
    for pair in timeline.entries.windows(2) {
        if pair[0].state == TimelinePhase::Acting {
            if let Some(duration) = pair[1].duration_ms {
                durations.push(duration);
            }
        }
    }
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
}

/// Reconstruct where execution time went: the entries that consumed time,
/// sorted by descending duration. The head of this list is the critical
/// stretch of the execution.
pub fn critical_path(timeline: &Timeline) -> Vec<&TimelineEntry> {
    let mut entries: Vec<&TimelineEntry> = timeline
        .entries
        .iter()
        .filter(|e| e.duration_ms.is_some())
        .collect();
    entries.sort_by_key(|e| std::cmp::Reverse(e.duration_ms.unwrap_or(0)));
    entries
}

/// Entries currently in the given phase.
pub fn filter_by_state(timeline: &Timeline, state: TimelinePhase) -> Vec<&TimelineEntry> {
    timeline
        .entries
        .iter()
        .filter(|e| e.state == state)
        .collect()
}

/// Entries recorded for the given event type.
pub fn filter_by_event_type<'a>(
    timeline: &'a Timeline,
    event_type: &str,
) -> Vec<&'a TimelineEntry> {
    timeline
        .entries
        .iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::{TimelineConfig, TimelineManager, tests::FakeClock};
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    async fn sample_timeline() -> Timeline {
        let manager = TimelineManager::new(TimelineConfig::default())
            .with_clock(Arc::new(FakeClock(AtomicU64::new(0))));
        for event in [
            "agent:started",
            "agent:thinking",
            "tool:called",
            "tool:result",
            "agent:thinking",
            "tool:called",
            "tool:result",
            "agent:completed",
        ] {
            manager
                .record("exec-1", event, json!(null), None)
                .await
                .unwrap();
        }
        manager.timeline("exec-1").await.unwrap()
    }

    #[tokio::test]
    async fn distribution_counts_phases() {
        let timeline = sample_timeline().await;
        let distribution = state_distribution(&timeline);
        assert_eq!(distribution[&TimelinePhase::Acting], 2);
        assert_eq!(distribution[&TimelinePhase::Observing], 2);
        assert_eq!(distribution[&TimelinePhase::Thinking], 2);
        assert_eq!(distribution[&TimelinePhase::Completed], 1);
    }

    #[tokio::test]
    async fn time_in_state_charges_previous_phase() {
        let timeline = sample_timeline().await;
        let totals = time_in_state(&timeline);
        // FakeClock advances 10ms per record; two acting segments.
        assert_eq!(totals[&TimelinePhase::Acting], 20);
    }

    #[tokio::test]
    async fn average_step_duration() {
        let timeline = sample_timeline().await;
        let avg = average_step_duration_ms(&timeline).unwrap();
        assert!((avg - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn critical_path_sorted_descending() {
        let timeline = sample_timeline().await;
        let path = critical_path(&timeline);
        assert!(!path.is_empty());
        for pair in path.windows(2) {
            assert!(pair[0].duration_ms >= pair[1].duration_ms);
        }
    }

    #[tokio::test]
    async fn filters() {
        let timeline = sample_timeline().await;
        assert_eq!(filter_by_state(&timeline, TimelinePhase::Acting).len(), 2);
        assert_eq!(filter_by_event_type(&timeline, "tool:result").len(), 2);
        assert!(filter_by_event_type(&timeline, "missing:event").is_empty());
    }
}
