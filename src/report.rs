use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{GestureLabel, GestureSummary, IncidentRecord, IncidentState};

pub fn summarize_by_gesture(records: &[IncidentRecord]) -> Vec<GestureSummary> {
    let mut map: HashMap<GestureLabel, (usize, usize, f64)> = HashMap::new();

    for record in records {
        let entry = map.entry(record.incident.gesture).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if record.incident.state == IncidentState::Delivered {
            entry.1 += 1;
        }
        entry.2 += f64::from(record.incident.confidence);
    }

    let mut summaries: Vec<GestureSummary> = map
        .into_iter()
        .map(|(gesture, (count, delivered, total_confidence))| GestureSummary {
            gesture,
            count,
            delivered,
            avg_confidence: if count == 0 {
                0.0
            } else {
                total_confidence / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(b.gesture.priority().cmp(&a.gesture.priority()))
    });
    summaries
}

fn outcome_counts(records: &[IncidentRecord]) -> Vec<(IncidentState, usize)> {
    let states = [
        IncidentState::Delivered,
        IncidentState::Failed,
        IncidentState::Suppressed,
        IncidentState::Dispatching,
        IncidentState::EvidenceGathered,
        IncidentState::Confirmed,
    ];
    states
        .into_iter()
        .map(|state| {
            let count = records.iter().filter(|r| r.incident.state == state).count();
            (state, count)
        })
        .filter(|(_, count)| *count > 0)
        .collect()
}

pub fn build_report(generated_at: DateTime<Utc>, records: &[IncidentRecord]) -> String {
    let summaries = summarize_by_gesture(records);

    let mut output = String::new();

    let _ = writeln!(output, "# Distress Signal Incident Report");
    let _ = writeln!(
        output,
        "Generated {} across {} incidents",
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        records.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Gesture Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No incidents recorded.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} incidents, {} delivered (avg confidence {:.2})",
                summary.gesture, summary.count, summary.delivered, summary.avg_confidence
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Outcomes");

    let outcomes = outcome_counts(records);
    if outcomes.is_empty() {
        let _ = writeln!(output, "No incidents recorded.");
    } else {
        for (state, count) in outcomes {
            let _ = writeln!(output, "- {state}: {count}");
        }
    }

    let mut recent: Vec<&IncidentRecord> = records.iter().collect();
    recent.sort_by(|a, b| b.incident.confirmed_at.cmp(&a.incident.confirmed_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Incidents");

    if recent.is_empty() {
        let _ = writeln!(output, "No incidents recorded.");
    } else {
        for record in recent.iter().take(10) {
            let incident = &record.incident;
            let _ = writeln!(
                output,
                "- {} {} at {}: {}",
                incident.id,
                incident.gesture,
                incident.confirmed_at.format("%Y-%m-%d %H:%M:%S"),
                incident.state
            );
            if let Some(by) = incident.suppressed_by {
                let _ = writeln!(output, "  - suppressed by {by}");
            }
            if let Some(location) = &incident.location {
                let _ = writeln!(output, "  - location: {}", location.map_link());
            }
            if let Some(snapshot) = &incident.snapshot {
                let _ = writeln!(output, "  - snapshot: {snapshot}");
            }
            for attempt in &record.attempts {
                let _ = writeln!(
                    output,
                    "  - {} attempt {} at {}: {}{}",
                    attempt.channel,
                    attempt.attempt,
                    attempt.attempted_at.format("%H:%M:%S"),
                    attempt.outcome.as_str(),
                    attempt
                        .detail
                        .as_deref()
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                );
            }
        }
    }

    output
}
