//! Core types for SelfHeal

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A client application under test. Identity plus an opaque credential;
/// credential validation happens upstream of this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Opaque API credential, never interpreted here
    pub api_key: String,
    pub created_at: i64,
}

impl Project {
    pub fn new(name: String, api_key: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            api_key,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Test run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Terminal runs accept no further reports and freeze their counters.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What triggered a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Ci,
    Manual,
    Scheduled,
    Webhook,
}

impl Default for RunTrigger {
    fn default() -> Self {
        Self::Ci
    }
}

/// Aggregate counters for a run. Monotonic while the run is active;
/// invariant: healed <= failed <= total.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub healed: u32,
}

/// One execution batch of a project's test suite
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub branch: String,
    pub trigger: RunTrigger,
    pub commit_sha: Option<String>,
    pub counters: RunCounters,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TestRun {
    pub fn new(project_id: String, branch: String, trigger: RunTrigger) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id,
            status: RunStatus::Pending,
            branch,
            trigger,
            commit_sha: None,
            counters: RunCounters::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Healing event lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStatus {
    Pending,
    HealedAuto,
    HealedManual,
    NeedsReview,
    BugDetected,
    Ignored,
}

impl HealingStatus {
    /// NeedsReview is the only non-terminal post-decision state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HealingStatus::HealedAuto
                | HealingStatus::HealedManual
                | HealingStatus::BugDetected
                | HealingStatus::Ignored
        )
    }

    /// Whether the event counts as healed for run counters and reporting.
    pub fn is_healed(&self) -> bool {
        matches!(self, HealingStatus::HealedAuto | HealingStatus::HealedManual)
    }

    /// Validate a state machine transition
    pub fn can_transition_to(&self, next: HealingStatus) -> bool {
        use HealingStatus::*;
        matches!(
            (self, next),
            (Pending, HealedAuto)
                | (Pending, NeedsReview)
                | (Pending, BugDetected)
                | (Pending, Ignored)
                | (NeedsReview, HealedManual)
                | (NeedsReview, Ignored)
        )
    }

    /// Checked transition, errors on anything the state machine forbids
    pub fn transition_to(&self, next: HealingStatus) -> Result<HealingStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl Default for HealingStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for HealingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealingStatus::Pending => write!(f, "pending"),
            HealingStatus::HealedAuto => write!(f, "healed_auto"),
            HealingStatus::HealedManual => write!(f, "healed_manual"),
            HealingStatus::NeedsReview => write!(f, "needs_review"),
            HealingStatus::BugDetected => write!(f, "bug_detected"),
            HealingStatus::Ignored => write!(f, "ignored"),
        }
    }
}

/// Why a decision landed where it did. Recorded so ambiguous outcomes
/// always leave an actionable trail for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    HighConfidenceMatch,
    AmbiguousMatch,
    NoCandidates,
    LowConfidence,
    PresumedRemoved,
    SnapshotTooLarge,
    SnapshotUnreadable,
    SelectorUnsupported,
    ManualResolution,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::HighConfidenceMatch => "high_confidence_match",
            ReasonCode::AmbiguousMatch => "ambiguous_match",
            ReasonCode::NoCandidates => "no_candidates",
            ReasonCode::LowConfidence => "low_confidence",
            ReasonCode::PresumedRemoved => "presumed_removed",
            ReasonCode::SnapshotTooLarge => "snapshot_too_large",
            ReasonCode::SnapshotUnreadable => "snapshot_unreadable",
            ReasonCode::SelectorUnsupported => "selector_unsupported",
            ReasonCode::ManualResolution => "manual_resolution",
        };
        write!(f, "{}", s)
    }
}

/// Serialized summary of a scored candidate, persisted with NeedsReview
/// events so a human can disambiguate later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub selector: String,
    pub tag: String,
    pub path: Vec<String>,
    pub score: f64,
}

/// One failure-and-decision record, owned by exactly one TestRun
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingEvent {
    pub id: String,
    pub run_id: String,
    pub test_name: String,
    pub test_file: Option<String>,
    pub original_selector: String,
    pub error_message: Option<String>,
    /// Content digest of the DOM snapshot in the blob store
    pub snapshot_digest: Option<String>,
    pub confidence: f64,
    pub healed_selector: Option<String>,
    pub status: HealingStatus,
    pub reason: ReasonCode,
    /// Top candidates kept for human disambiguation (NeedsReview only)
    #[serde(default)]
    pub candidates: Vec<CandidateSummary>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Opaque artifact reference attached to a run; pure storage pointer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub blob_digest: String,
    pub created_at: i64,
}

/// Per-test outcome reported by an external test runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
}

/// Summary counts over a run's healing events, exposed on the
/// reporting boundary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub auto_healed: u32,
    pub manual_healed: u32,
    pub needs_review: u32,
    pub bug_detected: u32,
    pub ignored: u32,
}

impl EventSummary {
    pub fn tally(events: &[HealingEvent]) -> Self {
        let mut s = Self::default();
        for e in events {
            match e.status {
                HealingStatus::HealedAuto => s.auto_healed += 1,
                HealingStatus::HealedManual => s.manual_healed += 1,
                HealingStatus::NeedsReview => s.needs_review += 1,
                HealingStatus::BugDetected => s.bug_detected += 1,
                HealingStatus::Ignored => s.ignored += 1,
                HealingStatus::Pending => {}
            }
        }
        s
    }
}
