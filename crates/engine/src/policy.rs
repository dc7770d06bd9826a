//! Healing decision policy
//!
//! Turns ranked candidates into a decision: auto-heal, escalate for human
//! review, flag a real bug, or ignore a presumed-removed element. Selector
//! synthesis is a data-driven strategy table ordered by attribute
//! stability, so new test-id conventions slot in without touching the
//! decision logic.

use crate::dom::DomTree;
use crate::matcher::{CandidateMatch, SelectorHistory, TEST_ID_ATTRS};
use selfheal_common::{CandidateSummary, HealingStatus, ReasonCode};

/// Top score at or above this heals automatically
pub const AUTO_HEAL_THRESHOLD: f64 = 0.85;
/// Top score at or above this (but below auto-heal) goes to review
pub const REVIEW_THRESHOLD: f64 = 0.5;
/// Consecutive no-match runs before a selector is presumed removed
pub const PRESUMED_REMOVED_RUNS: u32 = 3;
/// How many candidates are persisted for human disambiguation
pub const REVIEW_CANDIDATES: usize = 3;

/// The policy's verdict for one failure
#[derive(Debug, Clone)]
pub struct Decision {
    pub status: HealingStatus,
    pub confidence: f64,
    pub healed_selector: Option<String>,
    pub reason: ReasonCode,
    /// Candidate summaries persisted with the event
    pub candidates: Vec<CandidateSummary>,
}

/// One entry in the selector synthesis strategy table
pub struct SynthesisRule {
    pub name: &'static str,
    pub synthesize: fn(&CandidateMatch, &DomTree) -> Option<String>,
}

/// Ordered by stability: explicit test ids survive refactors better than
/// DOM ids, which beat class combinations, which beat tag+text.
pub const SYNTHESIS_RULES: &[SynthesisRule] = &[
    SynthesisRule {
        name: "test_id",
        synthesize: |c, _| {
            TEST_ID_ATTRS.iter().find_map(|attr| {
                c.attrs
                    .get(*attr)
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("[{}={}]", attr, v))
            })
        },
    },
    SynthesisRule {
        name: "id",
        synthesize: |c, _| c.id.as_ref().filter(|v| !v.is_empty()).map(|v| format!("#{}", v)),
    },
    SynthesisRule {
        name: "unique_class_combo",
        synthesize: |c, tree| {
            if !c.classes.is_empty() && tree.count_with_classes(&c.classes) == 1 {
                Some(
                    c.classes
                        .iter()
                        .map(|cls| format!(".{}", cls))
                        .collect::<String>(),
                )
            } else {
                None
            }
        },
    },
    SynthesisRule {
        name: "tag_text",
        synthesize: |c, _| {
            if c.text.is_empty() {
                None
            } else {
                Some(format!("{}:text({})", c.tag, c.text))
            }
        },
    },
];

/// Derive the most stable selector for a candidate, walking the strategy
/// table in priority order. Deterministic: depends only on the candidate's
/// attributes and the snapshot tree.
pub fn synthesize_selector(candidate: &CandidateMatch, tree: &DomTree) -> Option<String> {
    SYNTHESIS_RULES
        .iter()
        .find_map(|rule| (rule.synthesize)(candidate, tree))
}

/// Decide the outcome for a failure given ranked candidates.
pub fn decide(
    tree: &DomTree,
    candidates: &[CandidateMatch],
    history: Option<&SelectorHistory>,
) -> Decision {
    if candidates.is_empty() {
        if presumed_removed(history) {
            return Decision {
                status: HealingStatus::Ignored,
                confidence: 0.0,
                healed_selector: None,
                reason: ReasonCode::PresumedRemoved,
                candidates: vec![],
            };
        }
        return Decision {
            status: HealingStatus::BugDetected,
            confidence: 0.0,
            healed_selector: None,
            reason: ReasonCode::NoCandidates,
            candidates: vec![],
        };
    }

    let top = &candidates[0];
    let score = top.score;

    if score >= AUTO_HEAL_THRESHOLD {
        if let Some(selector) = synthesize_selector(top, tree) {
            return Decision {
                status: HealingStatus::HealedAuto,
                confidence: score,
                healed_selector: Some(selector),
                // Winning candidate kept so history knows the new path
                candidates: summarize(tree, &candidates[..1]),
                reason: ReasonCode::HighConfidenceMatch,
            };
        }
        // Confident match but no stable identifying attribute to heal to:
        // a human has to pick, never a silent guess.
        return Decision {
            status: HealingStatus::NeedsReview,
            confidence: score,
            healed_selector: None,
            reason: ReasonCode::AmbiguousMatch,
            candidates: summarize(tree, top_n(candidates)),
        };
    }

    if score >= REVIEW_THRESHOLD {
        return Decision {
            status: HealingStatus::NeedsReview,
            confidence: score,
            healed_selector: None,
            reason: ReasonCode::AmbiguousMatch,
            candidates: summarize(tree, top_n(candidates)),
        };
    }

    if presumed_removed(history) {
        return Decision {
            status: HealingStatus::Ignored,
            confidence: score,
            healed_selector: None,
            reason: ReasonCode::PresumedRemoved,
            candidates: vec![],
        };
    }

    Decision {
        status: HealingStatus::BugDetected,
        confidence: score,
        healed_selector: None,
        reason: ReasonCode::LowConfidence,
        candidates: summarize(tree, top_n(candidates)),
    }
}

/// A parse failure on either input cannot be evaluated; it degrades to
/// review with the reason recorded, never to a silent default and never
/// to an auto-heal.
pub fn decide_unevaluable(reason: ReasonCode) -> Decision {
    Decision {
        status: HealingStatus::NeedsReview,
        confidence: 0.0,
        healed_selector: None,
        reason,
        candidates: vec![],
    }
}

fn presumed_removed(history: Option<&SelectorHistory>) -> bool {
    history
        .map(|h| h.consecutive_misses >= PRESUMED_REMOVED_RUNS && !h.ui_change_signal)
        .unwrap_or(false)
}

fn top_n(candidates: &[CandidateMatch]) -> &[CandidateMatch] {
    &candidates[..candidates.len().min(REVIEW_CANDIDATES)]
}

fn summarize(tree: &DomTree, candidates: &[CandidateMatch]) -> Vec<CandidateSummary> {
    candidates
        .iter()
        .map(|c| CandidateSummary {
            selector: synthesize_selector(c, tree).unwrap_or_else(|| c.path.join(" > ")),
            tag: c.tag.clone(),
            path: c.path.clone(),
            score: c.score,
        })
        .collect()
}
