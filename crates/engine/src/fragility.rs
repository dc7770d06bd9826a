//! Selector fragility analyzer
//!
//! Offline reporting pass over a project's healing history. For each test
//! it combines how often the test needed healing with how recently those
//! events happened, over a trailing window of runs. Read-only: never
//! touches live decisions.

use crate::orchestrator::HISTORY_WINDOW_RUNS;
use selfheal_common::{Database, HealingStatus, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fragility verdict for one test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFragility {
    pub test_name: String,
    /// 0.0 (stable) to 1.0 (heals constantly, recently)
    pub fragility_score: f64,
    pub last_healed_at: Option<i64>,
    pub healing_events: u32,
    pub runs_observed: u32,
}

/// Statuses that indicate the selector drifted rather than the app broke
fn is_drift(status: HealingStatus) -> bool {
    matches!(
        status,
        HealingStatus::HealedAuto | HealingStatus::HealedManual | HealingStatus::NeedsReview
    )
}

/// Analyze a project's trailing window, most fragile tests first.
/// Deterministic: ties sort by test name.
pub fn analyze(db: &Database, project_id: &str) -> Result<Vec<TestFragility>> {
    let runs = db.list_runs(project_id, HISTORY_WINDOW_RUNS)?;
    if runs.is_empty() {
        return Ok(vec![]);
    }
    let window = runs.len() as f64;

    // Rank runs by recency: 0 = newest
    let rank: HashMap<&str, usize> = runs
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.as_str(), i))
        .collect();

    let events = db.list_project_events(project_id, HISTORY_WINDOW_RUNS)?;

    struct Acc {
        events: u32,
        recency_weight: f64,
        last_healed_at: Option<i64>,
    }
    let mut per_test: HashMap<String, Acc> = HashMap::new();

    for event in &events {
        let acc = per_test.entry(event.test_name.clone()).or_insert(Acc {
            events: 0,
            recency_weight: 0.0,
            last_healed_at: None,
        });
        acc.events += 1;

        if is_drift(event.status) {
            if let Some(&r) = rank.get(event.run_id.as_str()) {
                // Newest run contributes 1.0, the oldest in the window ~0
                acc.recency_weight += (window - r as f64) / window;
            }
        }
        if event.status.is_healed() {
            acc.last_healed_at = Some(
                acc.last_healed_at
                    .map_or(event.updated_at, |t| t.max(event.updated_at)),
            );
        }
    }

    let mut out: Vec<TestFragility> = per_test
        .into_iter()
        .map(|(test_name, acc)| {
            let ratio = acc.events as f64 / window;
            let recency = acc.recency_weight / window;
            TestFragility {
                test_name,
                fragility_score: (0.5 * ratio + 0.5 * recency).clamp(0.0, 1.0),
                last_healed_at: acc.last_healed_at,
                healing_events: acc.events,
                runs_observed: window as u32,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.fragility_score
            .partial_cmp(&a.fragility_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.test_name.cmp(&b.test_name))
    });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfheal_common::{
        HealingEvent, Project, ReasonCode, RunTrigger, TestRun,
    };

    fn event(run_id: &str, test: &str, status: HealingStatus) -> HealingEvent {
        let now = chrono::Utc::now().timestamp();
        HealingEvent {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            test_name: test.to_string(),
            test_file: None,
            original_selector: "#x".into(),
            error_message: None,
            snapshot_digest: None,
            confidence: 0.9,
            healed_selector: None,
            status,
            reason: ReasonCode::HighConfidenceMatch,
            candidates: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn frequent_healer_ranks_above_stable_test() {
        let db = Database::open_memory().unwrap();
        let project = Project::new("app".into(), "k".into());
        db.insert_project(&project).unwrap();

        for i in 0..4i64 {
            let mut run = TestRun::new(project.id.clone(), "main".into(), RunTrigger::Ci);
            run.created_at += i;
            db.insert_run(&run).unwrap();
            // "Flaky search" heals every run; "Solid nav" healed once, long ago
            db.record_failure(&event(&run.id, "Flaky search", HealingStatus::HealedAuto))
                .unwrap();
            if i == 0 {
                db.record_failure(&event(&run.id, "Solid nav", HealingStatus::HealedAuto))
                    .unwrap();
            }
        }

        let report = analyze(&db, &project.id).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].test_name, "Flaky search");
        assert!(report[0].fragility_score > report[1].fragility_score);
        assert_eq!(report[0].healing_events, 4);
        assert!(report[0].last_healed_at.is_some());
        assert!((0.0..=1.0).contains(&report[0].fragility_score));
    }

    #[test]
    fn bug_detections_count_as_events_but_not_drift() {
        let db = Database::open_memory().unwrap();
        let project = Project::new("app".into(), "k".into());
        db.insert_project(&project).unwrap();

        let run = TestRun::new(project.id.clone(), "main".into(), RunTrigger::Ci);
        db.insert_run(&run).unwrap();
        db.record_failure(&event(&run.id, "Broken thing", HealingStatus::BugDetected))
            .unwrap();

        let report = analyze(&db, &project.id).unwrap();
        assert_eq!(report.len(), 1);
        // Ratio contributes, recency of drift does not
        assert!(report[0].fragility_score > 0.0);
        assert!(report[0].last_healed_at.is_none());
    }

    #[test]
    fn empty_project_yields_empty_report() {
        let db = Database::open_memory().unwrap();
        let project = Project::new("app".into(), "k".into());
        db.insert_project(&project).unwrap();
        assert!(analyze(&db, &project.id).unwrap().is_empty());
    }
}
