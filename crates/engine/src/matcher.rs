//! Candidate matcher
//!
//! Scores every element in a snapshot tree against a parsed selector
//! predicate and returns ranked candidates. Scoring is a weighted sum of
//! normalized similarity terms and is pure: the same tree, predicate, and
//! history always produce the same ordered list.

use crate::dom::{DomNode, DomTree};
use crate::selector::SelectorPredicate;
use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices, get_diff_ratio, Algorithm, TextDiff};
use std::collections::BTreeMap;

/// Term weights. When a term is inapplicable (predicate omits the
/// component, or no history is available for the structural term) its
/// weight is redistributed proportionally across the applicable terms.
pub const WEIGHT_TAG: f64 = 0.15;
pub const WEIGHT_ID: f64 = 0.25;
pub const WEIGHT_CLASS: f64 = 0.20;
pub const WEIGHT_ATTRS: f64 = 0.25;
pub const WEIGHT_TEXT: f64 = 0.10;
pub const WEIGHT_STRUCTURAL: f64 = 0.05;

/// Candidates below this score are discarded entirely
pub const CANDIDATE_FLOOR: f64 = 0.05;

/// Attribute names treated as explicit test ids, in priority order.
/// Shared with selector synthesis.
pub const TEST_ID_ATTRS: &[&str] = &["data-testid", "data-test-id", "data-test", "data-cy"];

/// What the healing history knows about a test's selector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorHistory {
    /// Root path of the element the selector last resolved to
    pub last_known_path: Option<Vec<String>>,
    /// Runs in a row where the selector matched nothing
    pub consecutive_misses: u32,
    /// Whether the UI changed since the previous run (commit moved)
    pub ui_change_signal: bool,
}

/// Per-term similarity values, each in [0, 1]. `None` means the term was
/// inapplicable and its weight was redistributed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub tag: Option<f64>,
    pub id: Option<f64>,
    pub class: Option<f64>,
    pub attrs: Option<f64>,
    pub text: Option<f64>,
    pub structural: Option<f64>,
}

/// A scored element. Transient: lives only for one healing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub node_index: usize,
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub path: Vec<String>,
    pub depth: usize,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Score all elements of `tree` against `predicate`, highest score first.
///
/// Tie-break on equal score: smaller absolute depth difference from the
/// last known position wins, then document (pre-order) position. This
/// guarantees a single canonical ranking for reproducible decisions.
pub fn match_candidates(
    tree: &DomTree,
    predicate: &SelectorPredicate,
    history: Option<&SelectorHistory>,
) -> Vec<CandidateMatch> {
    let last_path = history.and_then(|h| h.last_known_path.as_deref());
    let last_depth = last_path.map(|p| p.len().saturating_sub(1));

    let mut candidates: Vec<CandidateMatch> = tree
        .nodes()
        .iter()
        .filter_map(|node| {
            let (score, breakdown) = score_node(tree, node, predicate, last_path);
            if score < CANDIDATE_FLOOR {
                return None;
            }
            Some(CandidateMatch {
                node_index: node.index,
                tag: node.tag.clone(),
                id: node.id.clone(),
                classes: node.classes.clone(),
                attrs: node.attrs.clone(),
                text: node.text.clone(),
                path: tree.path(node.index),
                depth: node.depth,
                score,
                breakdown,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        // total_cmp keeps the comparator a strict weak ordering; scores are
        // already clamped so NaN never reaches the sort.
        match b.score.total_cmp(&a.score) {
            std::cmp::Ordering::Equal => {}
            other => return other,
        }
        if let Some(last) = last_depth {
            let da = a.depth.abs_diff(last);
            let db = b.depth.abs_diff(last);
            match da.cmp(&db) {
                std::cmp::Ordering::Equal => {}
                other => return other,
            }
        }
        a.node_index.cmp(&b.node_index)
    });

    candidates
}

fn score_node(
    tree: &DomTree,
    node: &DomNode,
    predicate: &SelectorPredicate,
    last_path: Option<&[String]>,
) -> (f64, ScoreBreakdown) {
    let mut breakdown = ScoreBreakdown::default();
    let mut terms: Vec<(f64, f64)> = Vec::with_capacity(6);

    if let Some(tag) = &predicate.tag {
        let v = if node.tag == *tag { 1.0 } else { 0.0 };
        breakdown.tag = Some(v);
        terms.push((WEIGHT_TAG, v));
    }

    if let Some(id) = &predicate.id {
        // An exact or near match on an explicit test-id attribute counts as
        // id similarity too: test ids are the successor of lost DOM ids.
        let mut v = edit_ratio(id, node.id.as_deref().unwrap_or(""));
        for attr in TEST_ID_ATTRS {
            if let Some(value) = node.attr(attr) {
                v = v.max(edit_ratio(id, value));
            }
        }
        breakdown.id = Some(v);
        terms.push((WEIGHT_ID, v));
    }

    if !predicate.classes.is_empty() {
        let v = jaccard(&predicate.classes, &node.classes);
        breakdown.class = Some(v);
        terms.push((WEIGHT_CLASS, v));
    }

    if !predicate.attrs.is_empty() {
        let satisfied = predicate
            .attrs
            .iter()
            .filter(|a| a.matches(node.attr(&a.name)))
            .count();
        let v = satisfied as f64 / predicate.attrs.len() as f64;
        breakdown.attrs = Some(v);
        terms.push((WEIGHT_ATTRS, v));
    }

    if let Some(text) = &predicate.text {
        let v = edit_ratio(text, &node.text);
        breakdown.text = Some(v);
        terms.push((WEIGHT_TEXT, v));
    }

    if let Some(last) = last_path {
        let current = tree.path(node.index);
        let v = path_similarity(last, &current);
        breakdown.structural = Some(v);
        terms.push((WEIGHT_STRUCTURAL, v));
    }

    let total_weight: f64 = terms.iter().map(|(w, _)| w).sum();
    if total_weight == 0.0 {
        return (0.0, breakdown);
    }
    let score = terms.iter().map(|(w, v)| w * v).sum::<f64>() / total_weight;
    (score.clamp(0.0, 1.0), breakdown)
}

/// Normalized edit-distance ratio of two strings, 1.0 for identical
pub fn edit_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    TextDiff::from_chars(a, b).ratio() as f64
}

/// Jaccard similarity of two class lists
fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.iter().filter(|c| b.contains(c)).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Similarity of two root paths: 1 minus the normalized segment-level
/// edit distance.
pub fn path_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let ops = capture_diff_slices(Algorithm::Myers, a, b);
    get_diff_ratio(&ops, a.len(), b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomTree;
    use crate::selector::SelectorPredicate;

    fn tree(html: &str) -> DomTree {
        DomTree::parse(html).unwrap()
    }

    #[test]
    fn ranking_is_deterministic() {
        let t = tree(
            r#"<div><button class="btn">Save</button><button class="btn">Save</button><button class="btn">Save</button></div>"#,
        );
        let p = SelectorPredicate::parse("button.btn").unwrap();
        let first = match_candidates(&t, &p, None);
        let second = match_candidates(&t, &p, None);
        let idx1: Vec<usize> = first.iter().map(|c| c.node_index).collect();
        let idx2: Vec<usize> = second.iter().map(|c| c.node_index).collect();
        assert_eq!(idx1, idx2);
        // Equal scores: document order breaks the tie across the whole group
        assert!(idx1.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn near_equal_scores_order_strictly() {
        // Scores a hair apart must still produce one canonical order, not
        // an equivalence class that depends on comparison sequence.
        let t = tree(
            r#"<div>
                <button id="pay-nov" class="btn">Pay</button>
                <button id="pay-now" class="btn">Pay</button>
                <button id="pay-nowx" class="btn">Pay</button>
            </div>"#,
        );
        let p = SelectorPredicate::parse("#pay-now").unwrap();
        let c = match_candidates(&t, &p, None);
        assert_eq!(c[0].id.as_deref(), Some("pay-now"));
        for pair in c.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        let again = match_candidates(&t, &p, None);
        let order: Vec<usize> = c.iter().map(|m| m.node_index).collect();
        let order2: Vec<usize> = again.iter().map(|m| m.node_index).collect();
        assert_eq!(order, order2);
    }

    #[test]
    fn exact_match_scores_one() {
        let t = tree(r#"<button id="save" class="btn primary">Save</button>"#);
        let p = SelectorPredicate::parse("button#save.btn.primary").unwrap();
        let c = match_candidates(&t, &p, None);
        assert!((c[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_id_attribute_counts_toward_id_similarity() {
        // Scenario A: #login-btn is gone, but a test id carries the name
        let t = tree(
            r#"<html><body><button id="btn-login-new" data-testid="login-btn">Login</button></body></html>"#,
        );
        let p = SelectorPredicate::parse("#login-btn").unwrap();
        let c = match_candidates(&t, &p, None);
        assert!(!c.is_empty());
        assert!(c[0].score >= 0.85, "score was {}", c[0].score);
        assert_eq!(c[0].attrs.get("data-testid").unwrap(), "login-btn");
    }

    #[test]
    fn unrelated_elements_fall_below_floor() {
        // Scenario B: neither class exists, nothing similar
        let t = tree(r#"<html><body><table><tr><td>1</td></tr></table></body></html>"#);
        let p = SelectorPredicate::parse(".card.featured").unwrap();
        let c = match_candidates(&t, &p, None);
        assert!(c.is_empty());
    }

    #[test]
    fn partial_class_overlap_scores_between() {
        let t = tree(r#"<div class="card">x</div>"#);
        let p = SelectorPredicate::parse(".card.featured").unwrap();
        let c = match_candidates(&t, &p, None);
        assert_eq!(c.len(), 1);
        // Jaccard {card} vs {card, featured} = 1/2
        assert!((c[0].score - 0.5).abs() < 1e-9);
        assert_eq!(c[0].breakdown.class, Some(0.5));
    }

    #[test]
    fn attribute_fraction_is_weighted() {
        let t = tree(r#"<a href="/checkout/cart" rel="next">Go</a>"#);
        let p = SelectorPredicate::parse("[href^=/checkout][rel=prev]").unwrap();
        let c = match_candidates(&t, &p, None);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].breakdown.attrs, Some(0.5));
    }

    #[test]
    fn structural_term_requires_history() {
        let t = tree(r#"<div><section><button id="go">Go</button></section></div>"#);
        let p = SelectorPredicate::parse("#go").unwrap();

        let without = match_candidates(&t, &p, None);
        assert!(without[0].breakdown.structural.is_none());

        let history = SelectorHistory {
            last_known_path: Some(vec![
                "div[0]".to_string(),
                "section[0]".to_string(),
                "button[0]".to_string(),
            ]),
            ..Default::default()
        };
        let with = match_candidates(&t, &p, Some(&history));
        assert_eq!(with[0].breakdown.structural, Some(1.0));
    }

    #[test]
    fn depth_tie_break_prefers_last_known_depth() {
        // Two identical buttons at different depths
        let t = tree(
            r#"<div><button class="b">Go</button><div><div><button class="b">Go</button></div></div></div>"#,
        );
        let p = SelectorPredicate::parse("button.b").unwrap();
        // History path of depth 4 (deep button is depth 3, shallow is depth 1).
        // The structural term also differs, so check scores first.
        let history = SelectorHistory {
            last_known_path: Some(vec![
                "div[0]".into(),
                "div[1]".into(),
                "div[0]".into(),
                "button[0]".into(),
            ]),
            ..Default::default()
        };
        let c = match_candidates(&t, &p, Some(&history));
        assert_eq!(c.len(), 2);
        // Deep button matches the historical path better
        assert_eq!(c[0].depth, 3);
    }

    #[test]
    fn scores_are_bounded() {
        let t = tree(r#"<div id="x" class="a b" data-testid="x">hello world</div>"#);
        for sel in ["#x", ".a.b", "div", "text=hello world", "div#x.a.b:text(hello)"] {
            let p = SelectorPredicate::parse(sel).unwrap();
            for c in match_candidates(&t, &p, None) {
                assert!((0.0..=1.0).contains(&c.score), "{} out of bounds", c.score);
            }
        }
    }
}
