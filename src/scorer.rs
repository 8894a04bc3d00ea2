//! Interestingness: map one run result to a score in [0, 1]
//!
//! The base score is the max of the status, differential, and coverage
//! sub-scores. With a store handle, the score is multiplied by the max of
//! itself, the novel-edge score, and 0.9x the rare-bug score, then clamped.
//! The scorer only reads; the controller inserts edges after scoring.

use crate::store::{CoveredEdge, RunStore};
use crate::target::{is_bug_class, value_as_i64, BugSignature, ParserResult, TargetResult};
use std::collections::HashSet;

/// Read-only store access for the novel-edge and rare-bug sub-scores.
pub struct ScoreContext<'a> {
    pub store: &'a RunStore,
    pub target: &'a str,
}

/// Compute the final interestingness score for one run.
pub fn compute_interestingness(result: &ParserResult, context: Option<&ScoreContext<'_>>) -> f64 {
    let closed = &result.closed;
    let open = result.open.as_ref();

    let closed_status = closed.normalized_status();
    let open_status = open.map(|o| o.normalized_status());

    let s_status = status_score(&closed_status);
    let s_diff = differential_score(
        &closed_status,
        open_status.as_deref(),
        closed.bug_signature.as_ref(),
        open.and_then(|o| o.bug_signature.as_ref()),
    );
    let s_cov = coverage_score(closed.covered_branches, closed.missing_branches);

    let mut score = s_status.max(s_diff).max(s_cov).max(0.0);

    if let Some(context) = context {
        match store_boost(closed, &closed_status, context) {
            Ok(boost) => score *= score.max(boost),
            Err(err) => {
                // Degrade to the base formula; the campaign keeps running.
                tracing::warn!(target_name = context.target, error = %err, "store unavailable for scoring");
            }
        }
    }

    score.clamp(0.0, 1.0)
}

fn store_boost(
    closed: &TargetResult,
    closed_status: &str,
    context: &ScoreContext<'_>,
) -> Result<f64, crate::store::StoreError> {
    let edges = covered_edges_from_result(closed);
    let s_new = new_edges_score(context.store, &edges)?;
    let s_rare = rare_bug_score(
        context.store,
        closed_status,
        closed.bug_signature.as_ref(),
        context.target,
    )?;
    Ok(s_new.max(s_rare * 0.9).max(0.0))
}

fn status_score(closed_status: &str) -> f64 {
    match closed_status {
        "bug" | "crash" => 0.9,
        "timeout" => 0.7,
        "error" => 0.6,
        _ => 0.0,
    }
}

fn differential_score(
    closed_status: &str,
    open_status: Option<&str>,
    closed_bug: Option<&BugSignature>,
    open_bug: Option<&BugSignature>,
) -> f64 {
    // No oracle, no differential signal.
    if open_status.map_or(true, str::is_empty) && open_bug.is_none() {
        return 0.0;
    }
    let open_status = open_status.unwrap_or("");

    // Strong signal: closed finds a problem while the oracle looks fine.
    if is_bug_class(closed_status) && open_status == "ok" {
        return 1.0;
    }

    if closed_status != open_status {
        return 0.75;
    }

    // Same status; disagree on the detailed bug identity.
    if matches!(closed_status, "bug" | "crash" | "error") && !signatures_equal(closed_bug, open_bug)
    {
        return 0.5;
    }

    0.0
}

fn signatures_equal(a: Option<&BugSignature>, b: Option<&BugSignature>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_identity(b),
        (None, None) => true,
        _ => false,
    }
}

fn coverage_score(covered: Option<i64>, missing: Option<i64>) -> f64 {
    let (Some(covered), Some(missing)) = (covered, missing) else {
        return 0.0;
    };
    if covered < 0 || missing < 0 {
        return 0.0;
    }
    let total = covered + missing;
    if total <= 0 {
        return 0.0;
    }
    (covered as f64 / total as f64).clamp(0.0, 1.0)
}

/// Extract `(file, from_line, to_line)` for every covered branch in the
/// closed result. Arcs with a non-positive from-line or malformed fields
/// are dropped.
pub fn covered_edges_from_result(closed: &TargetResult) -> HashSet<CoveredEdge> {
    match &closed.branch_details_by_file {
        Some(details) => covered_edges_from_value(details),
        None => HashSet::new(),
    }
}

pub fn covered_edges_from_value(details: &serde_json::Value) -> HashSet<CoveredEdge> {
    let mut edges = HashSet::new();
    let Some(file_entries) = details.as_array() else {
        return edges;
    };
    for entry in file_entries {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let Some(file) = entry.get("file").and_then(|f| f.as_str()).filter(|f| !f.is_empty())
        else {
            continue;
        };
        let Some(covered) = entry.get("covered_branches").and_then(|c| c.as_array()) else {
            continue;
        };
        for arc in covered {
            let Some(arc) = arc.as_object() else {
                continue;
            };
            let from_line = arc.get("from_line").and_then(value_as_i64).unwrap_or(0);
            let to_line = arc.get("to_line").and_then(value_as_i64).unwrap_or(0);
            if from_line <= 0 {
                continue;
            }
            edges.insert(CoveredEdge {
                file: file.to_string(),
                from_line,
                to_line,
            });
        }
    }
    edges
}

fn new_edges_score(
    store: &RunStore,
    edges: &HashSet<CoveredEdge>,
) -> Result<f64, crate::store::StoreError> {
    if edges.is_empty() {
        return Ok(0.0);
    }
    let seen = store.list_seen_edges()?;
    let new_count = edges.difference(&seen).count();
    let new_ratio = new_count as f64 / edges.len() as f64;
    if new_ratio <= 0.0 {
        return Ok(0.0);
    }
    Ok(0.5 + 0.5 * new_ratio.min(1.0))
}

fn rare_bug_score(
    store: &RunStore,
    closed_status: &str,
    closed_bug: Option<&BugSignature>,
    target: &str,
) -> Result<f64, crate::store::StoreError> {
    if !is_bug_class(closed_status) {
        return Ok(0.0);
    }
    let Some(bug) = closed_bug else {
        return Ok(0.0);
    };
    let exception = bug.exception.as_deref().unwrap_or("");
    let file = bug.file.as_deref().unwrap_or("");
    let count = store.count_matching_bugs(target, exception, file, bug.line)?;
    Ok(1.0 / (1.0 + count as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{now_iso8601, RunRecord};

    fn closed(status: &str) -> TargetResult {
        TargetResult::with_status(status)
    }

    fn bug_sig(exception: &str, file: &str, line: Option<i64>) -> BugSignature {
        BugSignature {
            exception: Some(exception.to_string()),
            file: Some(file.to_string()),
            line,
            ..BugSignature::default()
        }
    }

    #[test]
    fn test_status_scores() {
        assert_eq!(status_score("bug"), 0.9);
        assert_eq!(status_score("crash"), 0.9);
        assert_eq!(status_score("timeout"), 0.7);
        assert_eq!(status_score("error"), 0.6);
        assert_eq!(status_score("ok"), 0.0);
        assert_eq!(status_score("weird"), 0.0);
        assert_eq!(status_score(""), 0.0);
    }

    #[test]
    fn test_differential_ladder() {
        // closed failure, oracle fine
        assert_eq!(differential_score("bug", Some("ok"), None, None), 1.0);
        assert_eq!(differential_score("error", Some("ok"), None, None), 1.0);
        // any other status disagreement
        assert_eq!(differential_score("ok", Some("bug"), None, None), 0.75);
        assert_eq!(differential_score("timeout", Some("crash"), None, None), 0.75);
        // same status, differing signatures
        let a = bug_sig("X", "f", Some(1));
        let b = bug_sig("Y", "f", Some(1));
        assert_eq!(
            differential_score("bug", Some("bug"), Some(&a), Some(&b)),
            0.5
        );
        assert_eq!(
            differential_score("bug", Some("bug"), Some(&a), Some(&a.clone())),
            0.0
        );
        // signature present on only one side
        assert_eq!(
            differential_score("crash", Some("crash"), Some(&a), None),
            0.5
        );
        // no oracle at all
        assert_eq!(differential_score("bug", None, Some(&a), None), 0.0);
    }

    #[test]
    fn test_coverage_score_clamps() {
        assert_eq!(coverage_score(Some(10), Some(0)), 1.0);
        assert_eq!(coverage_score(Some(3), Some(1)), 0.75);
        assert_eq!(coverage_score(Some(0), Some(10)), 0.0);
        assert_eq!(coverage_score(None, Some(10)), 0.0);
        assert_eq!(coverage_score(Some(10), None), 0.0);
        assert_eq!(coverage_score(Some(-1), Some(10)), 0.0);
        assert_eq!(coverage_score(Some(0), Some(0)), 0.0);
    }

    #[test]
    fn test_base_score_without_store() {
        let mut result = ParserResult {
            closed: closed("ok"),
            open: None,
        };
        result.closed.covered_branches = Some(6);
        result.closed.missing_branches = Some(2);
        assert_eq!(compute_interestingness(&result, None), 0.75);

        let result = ParserResult {
            closed: closed("timeout"),
            open: None,
        };
        assert_eq!(compute_interestingness(&result, None), 0.7);
    }

    #[test]
    fn test_differential_bug_with_full_coverage_scores_one() {
        // closed bug vs open ok, full coverage, empty store: final = 1.0.
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("runs.sqlite")).unwrap();

        let mut result = ParserResult {
            closed: closed("bug"),
            open: Some(closed("ok")),
        };
        result.closed.bug_signature = Some(bug_sig("X", "f", Some(1)));
        result.closed.covered_branches = Some(10);
        result.closed.missing_branches = Some(0);

        let context = ScoreContext {
            store: &store,
            target: "json-decoder",
        };
        let score = compute_interestingness(&result, Some(&context));
        assert!((score - 1.0).abs() < 1e-12, "got {score}");
    }

    #[test]
    fn test_rare_bug_decays_with_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("runs.sqlite")).unwrap();
        for i in 0..3u64 {
            store
                .insert_run(&RunRecord {
                    iteration: i,
                    seed_id: "s1".to_string(),
                    seed_text: String::new(),
                    mutated_input: format!("in{i}"),
                    status: "bug".to_string(),
                    bug_signature: Some(bug_sig("X", "f", Some(1))),
                    interesting_score: 0.9,
                    target: "json-decoder".to_string(),
                    created_at: now_iso8601(),
                })
                .unwrap();
        }
        let score =
            rare_bug_score(&store, "bug", Some(&bug_sig("X", "f", Some(1))), "json-decoder")
                .unwrap();
        assert!((score - 0.25).abs() < 1e-12);
        // Different line: no matches, full rarity.
        let score =
            rare_bug_score(&store, "bug", Some(&bug_sig("X", "f", Some(2))), "json-decoder")
                .unwrap();
        assert!((score - 1.0).abs() < 1e-12);
        // Non-failure status contributes nothing.
        assert_eq!(
            rare_bug_score(&store, "ok", Some(&bug_sig("X", "f", None)), "json-decoder").unwrap(),
            0.0
        );
        assert_eq!(rare_bug_score(&store, "bug", None, "json-decoder").unwrap(), 0.0);
    }

    #[test]
    fn test_new_edges_score_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("runs.sqlite")).unwrap();

        let edge = |from: i64| CoveredEdge {
            file: "a.py".to_string(),
            from_line: from,
            to_line: from + 1,
        };
        let known: HashSet<CoveredEdge> = [edge(1)].into_iter().collect();
        store.insert_covered_edges(&known).unwrap();

        // Half the edges are new: 0.5 + 0.5 * 0.5 = 0.75.
        let edges: HashSet<CoveredEdge> = [edge(1), edge(5)].into_iter().collect();
        let score = new_edges_score(&store, &edges).unwrap();
        assert!((score - 0.75).abs() < 1e-12);

        // All seen: zero.
        assert_eq!(new_edges_score(&store, &known).unwrap(), 0.0);
        // No edges at all: zero.
        assert_eq!(new_edges_score(&store, &HashSet::new()).unwrap(), 0.0);
    }

    #[test]
    fn test_multiplicative_boost_shrinks_weak_scores() {
        // Base 0.6 with no store boost: 0.6 * max(0.6, 0, 0) = 0.36.
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("runs.sqlite")).unwrap();
        let result = ParserResult {
            closed: closed("error"),
            open: None,
        };
        let context = ScoreContext {
            store: &store,
            target: "json-decoder",
        };
        let score = compute_interestingness(&result, Some(&context));
        assert!((score - 0.36).abs() < 1e-12, "got {score}");
    }

    #[test]
    fn test_edge_extraction_skips_malformed_arcs() {
        let mut result = closed("ok");
        result.branch_details_by_file = Some(serde_json::json!([
            {
                "file": "decoder.py",
                "covered_branches": [
                    {"from_line": 3, "to_line": 4},
                    {"from_line": 0, "to_line": 9},
                    {"from_line": "7", "to_line": "8"},
                    {"from_line": "junk", "to_line": 1},
                ],
                "missing_branches": [],
            },
            {"covered_branches": [{"from_line": 1, "to_line": 2}]},
            "not an object",
        ]));
        let edges = covered_edges_from_result(&result);
        let expected: HashSet<CoveredEdge> = [
            CoveredEdge { file: "decoder.py".to_string(), from_line: 3, to_line: 4 },
            CoveredEdge { file: "decoder.py".to_string(), from_line: 7, to_line: 8 },
        ]
        .into_iter()
        .collect();
        assert_eq!(edges, expected);
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("runs.sqlite")).unwrap();
        let context = ScoreContext {
            store: &store,
            target: "json-decoder",
        };
        for status in ["ok", "bug", "crash", "timeout", "error", "garbage"] {
            for open in [None, Some("ok"), Some("bug")] {
                let mut result = ParserResult {
                    closed: closed(status),
                    open: open.map(closed),
                };
                result.closed.covered_branches = Some(5);
                result.closed.missing_branches = Some(5);
                let score = compute_interestingness(&result, Some(&context));
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
