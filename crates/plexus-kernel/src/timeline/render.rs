//! Timeline export and rendering — JSON, CSV, and plain-text views.

use thiserror::Error;

use super::{Timeline, TimelinePhase};

/// Errors from export/import.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    #[error("Timeline JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a timeline to pretty JSON.
///
/// Export → import → export is byte-stable: entry metadata uses a sorted
/// map, so key order never varies.
pub fn to_json(timeline: &Timeline) -> Result<String, ExportError> {
    Ok(serde_json::to_string_pretty(timeline)?)
}

/// Deserialize a timeline from JSON.
pub fn from_json(json: &str) -> Result<Timeline, ExportError> {
    Ok(serde_json::from_str(json)?)
}

/// Render entries as CSV with a fixed header.
pub fn to_csv(timeline: &Timeline) -> String {
    let mut out = String::from("id,timestamp,state,event_type,duration_ms,correlation_id,anomaly\n");
    for entry in &timeline.entries {
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            entry.id,
            entry.timestamp,
            entry.state,
            entry.event_type,
            entry
                .duration_ms
                .map(|d| d.to_string())
                .unwrap_or_default(),
            entry.correlation_id.clone().unwrap_or_default(),
            entry.anomaly,
        ));
    }
    out
}

/// Single-line rendering: the state sequence with the current state last.
pub fn render_compact(timeline: &Timeline) -> String {
    let states: Vec<String> = timeline.entries.iter().map(|e| e.state.to_string()).collect();
    format!("[{}] {}", timeline.execution_id, states.join(" > "))
}

/// Fixed-width ASCII rendering with duration bars.
///
/// ```text
/// exec-1 (5 entries, 2 anomalies)
///   initialized agent:started
///   thinking    agent:thinking  ########   80ms
/// ```
pub fn render_ascii(timeline: &Timeline) -> String {
    let max_duration = timeline
        .entries
        .iter()
        .filter_map(|e| e.duration_ms)
        .max()
        .unwrap_or(0)
        .max(1);

    let mut out = format!(
        "{} ({} entries, {} anomalies)\n",
        timeline.execution_id,
        timeline.entries.len(),
        timeline.anomaly_count()
    );
    for entry in &timeline.entries {
        let bar = match entry.duration_ms {
            Some(duration) => {
                let width = ((duration * 20) / max_duration).max(1) as usize;
                format!("{} {}ms", "#".repeat(width), duration)
            }
            None => String::new(),
        };
        let marker = if entry.anomaly { "!" } else { " " };
        out.push_str(&format!(
            "{marker} {:<11} {:<24} {bar}\n",
            entry.state.to_string(),
            entry.event_type
        ));
    }
    out
}

/// Multi-line rendering including payloads and transition validity.
pub fn render_detailed(timeline: &Timeline) -> String {
    let mut out = format!(
        "Timeline {}\n  current: {}\n  created: {}\n  updated: {}\n",
        timeline.execution_id, timeline.current_state, timeline.created_at, timeline.updated_at
    );
    for entry in &timeline.entries {
        out.push_str(&format!(
            "  [{}] {} <- {}{}\n",
            entry.timestamp,
            entry.state,
            entry.event_type,
            if entry.anomaly { " (anomaly)" } else { "" }
        ));
        if !entry.event_data.is_null() {
            out.push_str(&format!("      data: {}\n", entry.event_data));
        }
    }
    out.push_str("  transitions:\n");
    for t in &timeline.transitions {
        out.push_str(&format!(
            "    {} -> {} at {}{}\n",
            t.from,
            t.to,
            t.timestamp,
            if t.valid { "" } else { " (invalid)" }
        ));
    }
    out
}

/// Phase glyph used by dashboards; kept here with the other renderings.
pub fn phase_glyph(phase: TimelinePhase) -> char {
    match phase {
        TimelinePhase::Initialized => 'I',
        TimelinePhase::Thinking => 'T',
        TimelinePhase::Acting => 'A',
        TimelinePhase::Observing => 'O',
        TimelinePhase::Completed => 'C',
        TimelinePhase::Failed => 'F',
        TimelinePhase::Paused => 'P',
    }
}
