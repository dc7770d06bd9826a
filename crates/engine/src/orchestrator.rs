//! Test run orchestrator
//!
//! Owns the lifecycle of a run: aggregates per-test outcomes, invokes the
//! healing pipeline on failures, and keeps the run counters consistent with
//! the event log. Healing decisions for the same (run, test) pair are
//! serialized through a keyed lock table; different keys proceed fully in
//! parallel.

use crate::dom::DomTree;
use crate::matcher::{match_candidates, SelectorHistory};
use crate::policy::{self, Decision};
use crate::selector::SelectorPredicate;
use dashmap::DashMap;
use selfheal_common::{
    BlobStore, Database, Error, HealingEvent, HealingStatus, InsertOutcome, ReasonCode, Result,
    RunStatus, RunTrigger, Screenshot, TestOutcome, TestRun,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Trailing run window consulted for selector history and fragility
pub const HISTORY_WINDOW_RUNS: u32 = 50;

/// Statuses from which a run can still accept reports or complete
const ACTIVE: &[RunStatus] = &[RunStatus::Pending, RunStatus::Running];

/// A failure or pass report from an external test runner
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub test_name: String,
    pub test_file: Option<String>,
    pub failed_selector: Option<String>,
    pub error_message: Option<String>,
    pub dom_snapshot: Option<String>,
}

/// Acknowledgement for a report: the run's current aggregates plus the
/// healing event when the outcome was a failure.
#[derive(Debug, Clone)]
pub struct ReportAck {
    pub run: TestRun,
    pub event: Option<HealingEvent>,
}

/// Human-review boundary action for a NeedsReview event
#[derive(Debug, Clone)]
pub enum ReviewAction {
    /// Resolve as healed with an explicit selector or a persisted candidate
    Heal {
        selector: Option<String>,
        candidate_index: Option<usize>,
    },
    Ignore,
}

/// Orchestrates run lifecycle and healing decisions
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    blobs: BlobStore,
    /// Mutual-exclusion scope per (run_id, test_name). Entries are dropped
    /// once a decision is persisted; the unique index on healing_events is
    /// the backstop if a fresh entry races an old one.
    locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(db: Database, blobs: BlobStore) -> Self {
        Self {
            db,
            blobs,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Start a new run for a project. The run begins Pending and flips to
    /// Running on its first report.
    pub fn begin_run(
        &self,
        project_id: &str,
        branch: String,
        trigger: RunTrigger,
        commit_sha: Option<String>,
    ) -> Result<TestRun> {
        let project = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| Error::NotFound {
                kind: "project".to_string(),
                id: project_id.to_string(),
            })?;

        let mut run = TestRun::new(project.id, branch, trigger);
        run.commit_sha = commit_sha;
        self.db.insert_run(&run)?;
        info!("Began test run {} for project {}", run.id, run.project_id);
        Ok(run)
    }

    /// Report one test outcome. Failures run the healing pipeline
    /// synchronously so the caller gets the repaired selector in the ack.
    /// At most one healing attempt happens per (run, test); duplicates
    /// observe the recorded decision.
    pub async fn report_result(
        &self,
        run_id: &str,
        outcome: TestOutcome,
        req: ReportRequest,
    ) -> Result<ReportAck> {
        let run = self.get_run(run_id)?;
        if run.status.is_terminal() {
            return Err(Error::RunNotActive {
                id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }
        if run.status == RunStatus::Pending {
            // First report activates the run; losing this race to another
            // report or to completion is fine either way.
            if let Err(e) = self.db.transition_run(run_id, ACTIVE, RunStatus::Running) {
                debug!("Run {} activation skipped: {}", run_id, e);
            }
        }

        match outcome {
            TestOutcome::Passed => {
                self.db.record_pass(run_id, &req.test_name)?;
                Ok(ReportAck {
                    run: self.get_run(run_id)?,
                    event: None,
                })
            }
            TestOutcome::Failed => self.heal_failure(&run, req).await,
        }
    }

    async fn heal_failure(&self, run: &TestRun, req: ReportRequest) -> Result<ReportAck> {
        let key = (run.id.clone(), req.test_name.clone());
        let gate = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Fast path: a concurrent or earlier caller already decided
        if let Some(existing) = self.db.get_event_for_test(&run.id, &req.test_name)? {
            self.locks.remove(&key);
            return Ok(ReportAck {
                run: self.get_run(&run.id)?,
                event: Some(existing),
            });
        }

        let history = self.build_history(run, &req.test_name)?;
        let (decision, snapshot_digest) = self.evaluate(&req, &history).await?;

        let now = chrono::Utc::now().timestamp();
        let event = HealingEvent {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            test_name: req.test_name.clone(),
            test_file: req.test_file.clone(),
            original_selector: req.failed_selector.clone().unwrap_or_default(),
            error_message: req.error_message.clone(),
            snapshot_digest,
            confidence: decision.confidence,
            healed_selector: decision.healed_selector.clone(),
            status: decision.status,
            reason: decision.reason,
            candidates: decision.candidates.clone(),
            created_at: now,
            updated_at: now,
        };

        let result = self.db.record_failure(&event);
        self.locks.remove(&key);
        let recorded = match result? {
            InsertOutcome::Inserted(e) => {
                info!(
                    "Healing decision for ({}, {}): {} (confidence {:.2})",
                    run.id, req.test_name, e.status, e.confidence
                );
                e
            }
            // Unique-index backstop fired: another writer got there first
            InsertOutcome::Existing(e) => e,
        };

        Ok(ReportAck {
            run: self.get_run(&run.id)?,
            event: Some(recorded),
        })
    }

    /// Run the parse/match/decide pipeline. Parse failures never escape:
    /// they degrade the decision to NeedsReview with a reason code.
    async fn evaluate(
        &self,
        req: &ReportRequest,
        history: &SelectorHistory,
    ) -> Result<(Decision, Option<String>)> {
        let Some(selector) = req.failed_selector.as_deref().filter(|s| !s.trim().is_empty())
        else {
            return Ok((
                policy::decide_unevaluable(ReasonCode::SelectorUnsupported),
                None,
            ));
        };

        let predicate = match SelectorPredicate::parse(selector) {
            Ok(p) => p,
            Err(e) => {
                warn!("Cannot evaluate selector {:?}: {}", selector, e);
                return Ok((
                    policy::decide_unevaluable(ReasonCode::SelectorUnsupported),
                    None,
                ));
            }
        };

        let Some(snapshot) = req.dom_snapshot.as_deref() else {
            return Ok((
                policy::decide_unevaluable(ReasonCode::SnapshotUnreadable),
                None,
            ));
        };

        let tree = match DomTree::parse(snapshot) {
            Ok(t) => t,
            Err(Error::SnapshotTooLarge { size, limit }) => {
                warn!(
                    "Snapshot rejected: {} bytes exceeds limit of {} bytes",
                    size, limit
                );
                return Ok((
                    policy::decide_unevaluable(ReasonCode::SnapshotTooLarge),
                    None,
                ));
            }
            Err(e) => {
                warn!("Snapshot unreadable: {}", e);
                return Ok((
                    policy::decide_unevaluable(ReasonCode::SnapshotUnreadable),
                    None,
                ));
            }
        };

        // Snapshot accepted: keep it for review tooling
        let digest = self.blobs.put(snapshot.as_bytes()).await?;

        let candidates = match_candidates(&tree, &predicate, Some(history));
        let decision = policy::decide(&tree, &candidates, Some(history));
        Ok((decision, Some(digest)))
    }

    /// Reconstruct what history knows about a test's selector from the
    /// trailing run window.
    fn build_history(&self, run: &TestRun, test_name: &str) -> Result<SelectorHistory> {
        let events =
            self.db
                .list_test_history(&run.project_id, test_name, HISTORY_WINDOW_RUNS)?;

        // Leading (newest-first) streak of runs where nothing matched
        let mut consecutive_misses = 0;
        for event in &events {
            match event.reason {
                ReasonCode::NoCandidates | ReasonCode::PresumedRemoved => {
                    consecutive_misses += 1
                }
                _ => break,
            }
        }

        // Most recent healed event carries the element's last-known path
        let last_known_path = events
            .iter()
            .find(|e| e.status.is_healed())
            .and_then(|e| e.candidates.first())
            .map(|c| c.path.clone());

        // UI change signal: the commit moved since the previous run. Absent
        // commit data on either side means no signal.
        let previous_commit = self
            .db
            .list_runs(&run.project_id, 10)?
            .into_iter()
            .filter(|r| r.id != run.id && r.created_at <= run.created_at)
            .map(|r| r.commit_sha)
            .next()
            .flatten();
        let ui_change_signal = match (&previous_commit, &run.commit_sha) {
            (Some(prev), Some(cur)) => prev != cur,
            _ => false,
        };

        Ok(SelectorHistory {
            last_known_path,
            consecutive_misses,
            ui_change_signal,
        })
    }

    /// Mark a run completed. Fails with RunNotActive once terminal.
    pub fn complete_run(&self, run_id: &str) -> Result<TestRun> {
        let run = self.db.transition_run(run_id, ACTIVE, RunStatus::Completed)?;
        info!(
            "Completed run {}: {}/{} passed, {} failed, {} healed",
            run.id, run.counters.passed, run.counters.total, run.counters.failed,
            run.counters.healed
        );
        Ok(run)
    }

    /// Mark a run failed (run-level timeout collaborator). Stops further
    /// healing for the run; already-recorded events stand.
    pub fn fail_run(&self, run_id: &str) -> Result<TestRun> {
        self.db.transition_run(run_id, ACTIVE, RunStatus::Failed)
    }

    /// Human-review boundary: resolve a NeedsReview event.
    pub fn resolve_review(&self, event_id: &str, action: ReviewAction) -> Result<HealingEvent> {
        match action {
            ReviewAction::Heal {
                selector,
                candidate_index,
            } => {
                let selector = match (selector, candidate_index) {
                    (Some(s), _) => s,
                    (None, Some(i)) => {
                        let event = self.db.get_event(event_id)?.ok_or_else(|| {
                            Error::NotFound {
                                kind: "healing_event".to_string(),
                                id: event_id.to_string(),
                            }
                        })?;
                        if event.candidates.is_empty() {
                            // Unevaluable events store no candidates to pick
                            return Err(Error::NoCandidatesFound(event.original_selector));
                        }
                        event
                            .candidates
                            .get(i)
                            .map(|c| c.selector.clone())
                            .ok_or_else(|| {
                                Error::InvalidConfig(format!(
                                    "candidate index {} out of range",
                                    i
                                ))
                            })?
                    }
                    (None, None) => {
                        return Err(Error::InvalidConfig(
                            "manual heal requires a selector or candidate index".to_string(),
                        ))
                    }
                };
                self.db
                    .resolve_event(event_id, HealingStatus::HealedManual, Some(&selector))
            }
            ReviewAction::Ignore => self.db.resolve_event(event_id, HealingStatus::Ignored, None),
        }
    }

    /// Attach an opaque screenshot artifact to a run
    pub async fn attach_screenshot(
        &self,
        run_id: &str,
        name: String,
        data: &[u8],
    ) -> Result<Screenshot> {
        let _run = self.get_run(run_id)?;
        let digest = self.blobs.put(data).await?;
        let shot = Screenshot {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            name,
            blob_digest: digest,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.db.insert_screenshot(&shot)?;
        Ok(shot)
    }

    fn get_run(&self, run_id: &str) -> Result<TestRun> {
        self.db.get_run(run_id)?.ok_or_else(|| Error::NotFound {
            kind: "test_run".to_string(),
            id: run_id.to_string(),
        })
    }
}
