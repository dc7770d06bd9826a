//! SelfHeal Engine
//!
//! The self-healing selector engine: parses DOM snapshots and locator
//! strings, scores candidate elements, decides whether a failure is
//! selector drift or a real regression, and orchestrates the test-run
//! lifecycle around those decisions.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │   report_result(run, test, outcome, selector, snapshot)      │
//! │     │                                                        │
//! │     ├── dom::DomTree::parse(snapshot)                        │
//! │     ├── selector::SelectorPredicate::parse(selector)         │
//! │     ├── matcher::match_candidates(tree, predicate, history)  │
//! │     ├── policy::decide(tree, candidates, history)            │
//! │     └── persist event + counters atomically, ack decision    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Matching and policy are pure and deterministic; only persistence and
//! snapshot storage touch I/O.

pub mod dom;
pub mod fragility;
pub mod matcher;
pub mod orchestrator;
pub mod policy;
pub mod selector;

pub use dom::{DomNode, DomTree, MAX_SNAPSHOT_BYTES};
pub use fragility::TestFragility;
pub use matcher::{match_candidates, CandidateMatch, SelectorHistory};
pub use orchestrator::{Orchestrator, ReportAck, ReportRequest, ReviewAction};
pub use policy::{decide, synthesize_selector, Decision};
pub use selector::{AttrOp, AttrPredicate, SelectorPredicate};
