//! UCB1 tree scheduler: root -> coverage bucket -> bug bucket -> seeds
//!
//! Internal nodes carry visit counts and incremental mean rewards; UCB1
//! picks the child at each level, treating unvisited children as infinitely
//! promising. Nodes live in an arena indexed by position, with child order
//! fixed at insertion so ties resolve deterministically.

use crate::corpus::Seed;
use crate::scheduler::{
    ScheduledSeed, SchedulerError, SchedulerStats, SeedScheduler, Signals,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const DEFAULT_UCB_C: f64 = 1.0;
const DEFAULT_MAX_SEEDS_PER_LEAF: usize = 8;

const NO_COVERAGE_KEY: &str = "NO_COVERAGE";
const NO_BUG_KEY: &str = "NO_BUG";
const CRASH_OR_TIMEOUT_KEY: &str = "BUG:CRASH_OR_TIMEOUT";

/// Serialize with sorted object keys and compact separators, so the hash
/// is stable under key-order permutation.
pub fn canonical_json(value: &Value) -> String {
    fn write_value(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write_value(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// First 16 hex chars of SHA-256 over the canonical JSON form.
pub fn short_hash(value: &Value) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Coverage bucket for a set of signals, via the fallback chain: explicit
/// key, explicit signature, branch details hash, aggregate counts hash.
pub fn coverage_bucket_key(signals: Option<&Signals>) -> String {
    let Some(signals) = signals else {
        return NO_COVERAGE_KEY.to_string();
    };
    if let Some(key) = signals.coverage_key.as_deref().filter(|k| !k.is_empty()) {
        return key.to_string();
    }
    if let Some(sig) = signals.coverage_signature.as_deref().filter(|s| !s.is_empty()) {
        return sig.to_string();
    }
    if let Some(details) = &signals.branch_details {
        return format!("COV:{}", short_hash(details));
    }
    if let Some((covered, missing)) = &signals.branch_counts {
        let value = serde_json::json!({
            "covered_branches": covered,
            "missing_branches": missing,
        });
        return format!("COV:{}", short_hash(&value));
    }
    NO_COVERAGE_KEY.to_string()
}

/// Bug bucket for a set of signals: explicit key, meaningful signature
/// hash, crash/timeout class, output-signature hash.
pub fn bug_bucket_key(signals: Option<&Signals>) -> String {
    let Some(signals) = signals else {
        return NO_BUG_KEY.to_string();
    };
    if let Some(key) = signals.bug_key.as_deref().filter(|k| !k.is_empty()) {
        return key.to_string();
    }

    if let Some(bug) = &signals.bug_signature {
        let mut meaningful = serde_json::Map::new();
        for (name, field) in [
            ("type", &bug.kind),
            ("exception", &bug.exception),
            ("message", &bug.message),
            ("file", &bug.file),
        ] {
            if let Some(text) = field.as_deref().filter(|t| !t.is_empty()) {
                meaningful.insert(name.to_string(), Value::String(text.to_string()));
            }
        }
        if let Some(line) = bug.line {
            meaningful.insert("line".to_string(), Value::from(line));
        }
        if !meaningful.is_empty() {
            return format!("BUG:{}", short_hash(&Value::Object(meaningful)));
        }
    }

    if signals.is_crash_or_timeout() {
        return CRASH_OR_TIMEOUT_KEY.to_string();
    }

    if signals.stdout_signature.is_some() || signals.stderr_signature.is_some() {
        let value = serde_json::json!({
            "stdout_signature": signals.stdout_signature,
            "stderr_signature": signals.stderr_signature,
        });
        return format!("OUT:{}", short_hash(&value));
    }
    NO_BUG_KEY.to_string()
}

/// Reward fed back along the selection path.
pub fn reward_from_signals(signals: Option<&Signals>) -> f64 {
    let Some(signals) = signals else {
        return 0.0;
    };
    let mut reward = 0.0;
    if signals.new_coverage == Some(true) {
        reward += 1.0;
    }
    if signals.new_bug == Some(true) {
        reward += 2.0;
    }
    if signals.is_crash_or_timeout() {
        reward += 3.0;
    }
    reward
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Root,
    Coverage,
    Bug,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    key: String,
    children: Vec<usize>,
    /// Leaf payload, ordered by `(text length, item_id)`.
    seeds: Vec<String>,
    n_selected: u64,
    q_avg_reward: f64,
}

impl Node {
    fn new(kind: NodeKind, key: String) -> Self {
        Self {
            kind,
            key,
            children: Vec::new(),
            seeds: Vec::new(),
            n_selected: 0,
            q_avg_reward: 0.0,
        }
    }

    fn update_stats(&mut self, reward: f64) {
        self.n_selected += 1;
        self.q_avg_reward += (reward - self.q_avg_reward) / self.n_selected as f64;
    }
}

fn ucb_score(parent_n: u64, child_n: u64, child_q: f64, c: f64) -> f64 {
    if child_n == 0 {
        return f64::INFINITY;
    }
    let parent_n = parent_n.max(1) as f64;
    child_q + c * (parent_n.ln() / child_n as f64).sqrt()
}

pub struct UcbTreeScheduler {
    ucb_c: f64,
    max_seeds_per_leaf: usize,
    nodes: Vec<Node>,
    items: HashMap<String, ScheduledSeed>,
    /// Selection path recorded by `next`, consumed by `update`.
    in_flight: HashMap<String, Vec<usize>>,
    /// Leaf keys an item was last handed out from, and its add-time home.
    last_leaf: HashMap<String, (String, String)>,
    home: HashMap<String, (String, String)>,
    seq: u64,
}

impl UcbTreeScheduler {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_UCB_C, DEFAULT_MAX_SEEDS_PER_LEAF)
    }

    pub fn with_params(ucb_c: f64, max_seeds_per_leaf: usize) -> Self {
        Self {
            ucb_c,
            max_seeds_per_leaf: max_seeds_per_leaf.max(1),
            nodes: vec![Node::new(NodeKind::Root, "root".to_string())],
            items: HashMap::new(),
            in_flight: HashMap::new(),
            last_leaf: HashMap::new(),
            home: HashMap::new(),
            seq: 0,
        }
    }

    const ROOT: usize = 0;

    fn child_by_key(&self, parent: usize, key: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].key == key)
    }

    fn ensure_leaf(&mut self, cov_key: &str, bug_key: &str) -> usize {
        let cov = match self.child_by_key(Self::ROOT, cov_key) {
            Some(index) => index,
            None => {
                let index = self.nodes.len();
                self.nodes.push(Node::new(NodeKind::Coverage, cov_key.to_string()));
                self.nodes[Self::ROOT].children.push(index);
                index
            }
        };
        match self.child_by_key(cov, bug_key) {
            Some(index) => index,
            None => {
                let index = self.nodes.len();
                self.nodes.push(Node::new(NodeKind::Bug, bug_key.to_string()));
                self.nodes[cov].children.push(index);
                index
            }
        }
    }

    fn leaf_sort_key(&self, item_id: &str) -> (usize, String) {
        let length = self
            .items
            .get(item_id)
            .map(|item| item.seed.text.chars().count())
            .unwrap_or(usize::MAX);
        (length, item_id.to_string())
    }

    fn insert_into_leaf(&mut self, leaf: usize, item_id: String) {
        self.nodes[leaf].seeds.push(item_id);
        let mut seeds = std::mem::take(&mut self.nodes[leaf].seeds);
        seeds.sort_by_key(|id| self.leaf_sort_key(id));
        if seeds.len() > self.max_seeds_per_leaf {
            for evicted in seeds.split_off(self.max_seeds_per_leaf) {
                // Evicted items leave the registry entirely, even when the
                // just-added item is the one pushed out.
                self.items.remove(&evicted);
                self.in_flight.remove(&evicted);
                self.last_leaf.remove(&evicted);
                self.home.remove(&evicted);
            }
        }
        self.nodes[leaf].seeds = seeds;
    }

    fn available_count(&self, node: usize) -> usize {
        let node_ref = &self.nodes[node];
        if node_ref.kind == NodeKind::Bug {
            return node_ref.seeds.len();
        }
        node_ref
            .children
            .iter()
            .map(|&child| self.available_count(child))
            .sum()
    }

    fn select_child(&self, parent: usize) -> Option<usize> {
        let parent_n = self.nodes[parent].n_selected;
        let mut best: Option<usize> = None;
        let mut best_score = f64::NEG_INFINITY;
        for &child in &self.nodes[parent].children {
            if self.available_count(child) == 0 {
                continue;
            }
            let node = &self.nodes[child];
            let score = ucb_score(parent_n, node.n_selected, node.q_avg_reward, self.ucb_c);
            if score > best_score {
                best_score = score;
                best = Some(child);
            }
        }
        best
    }
}

impl Default for UcbTreeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedScheduler for UcbTreeScheduler {
    fn add(&mut self, seed: Seed, signals: Option<&Signals>) -> ScheduledSeed {
        let cov_key = coverage_bucket_key(signals);
        let bug_key = bug_bucket_key(signals);
        let leaf = self.ensure_leaf(&cov_key, &bug_key);

        self.seq += 1;
        let item_id = format!("u{:06}", self.seq);
        let mut item = ScheduledSeed::new(item_id.clone(), seed, 0.0);
        if let Some(signals) = signals {
            item.last_signals = Some(signals.clone());
        }
        self.items.insert(item_id.clone(), item.clone());
        self.home.insert(item_id.clone(), (cov_key, bug_key));
        self.insert_into_leaf(leaf, item_id.clone());
        // The add may have evicted its own item on a full leaf.
        self.items.get(&item_id).cloned().unwrap_or(item)
    }

    fn next(&mut self) -> Result<ScheduledSeed, SchedulerError> {
        if self.is_empty() {
            return Err(SchedulerError::Empty);
        }

        let mut path = vec![Self::ROOT];
        let mut node = Self::ROOT;
        while self.nodes[node].kind != NodeKind::Bug {
            let child = self.select_child(node).ok_or(SchedulerError::Empty)?;
            path.push(child);
            node = child;
        }

        if self.nodes[node].seeds.is_empty() {
            return Err(SchedulerError::Empty);
        }
        let item_id = self.nodes[node].seeds.remove(0);
        let leaf_keys = {
            let cov_index = path[path.len() - 2];
            (
                self.nodes[cov_index].key.clone(),
                self.nodes[node].key.clone(),
            )
        };
        self.last_leaf.insert(item_id.clone(), leaf_keys);
        self.in_flight.insert(item_id.clone(), path);

        let item = self
            .items
            .get_mut(&item_id)
            .expect("leaf item is registered");
        item.times_selected += 1;
        Ok(item.clone())
    }

    fn update(
        &mut self,
        item_id: &str,
        interesting_score: f64,
        signals: Option<&Signals>,
    ) -> Result<ScheduledSeed, SchedulerError> {
        if !self.items.contains_key(item_id) {
            return Err(SchedulerError::UnknownItem(item_id.to_string()));
        }
        let path = self
            .in_flight
            .remove(item_id)
            .ok_or_else(|| SchedulerError::UpdateBeforeNext(item_id.to_string()))?;

        let item = self.items.get_mut(item_id).expect("checked above");
        item.record_update(interesting_score, signals);
        let snapshot = item.clone();

        let reward = reward_from_signals(signals);
        for node in path {
            self.nodes[node].update_stats(reward);
        }

        // Fresh signals re-bucket the item; without them it goes back where
        // it came from.
        let (cov_key, bug_key) = match signals {
            Some(signals) => (
                coverage_bucket_key(Some(signals)),
                bug_bucket_key(Some(signals)),
            ),
            None => self
                .last_leaf
                .get(item_id)
                .cloned()
                .or_else(|| self.home.get(item_id).cloned())
                .unwrap_or((NO_COVERAGE_KEY.to_string(), NO_BUG_KEY.to_string())),
        };
        let leaf = self.ensure_leaf(&cov_key, &bug_key);
        self.insert_into_leaf(leaf, item_id.to_string());
        Ok(snapshot)
    }

    fn is_empty(&self) -> bool {
        self.available_count(Self::ROOT) == 0
    }

    fn len(&self) -> usize {
        self.available_count(Self::ROOT)
    }

    fn stats(&self) -> SchedulerStats {
        let coverage_buckets = self.nodes[Self::ROOT].children.len();
        let bug_buckets: usize = self.nodes[Self::ROOT]
            .children
            .iter()
            .map(|&cov| self.nodes[cov].children.len())
            .sum();
        SchedulerStats {
            kind: "ucb_tree",
            ready: self.len(),
            total_items: self.items.len(),
            detail: serde_json::json!({
                "coverage_buckets": coverage_buckets,
                "bug_buckets": bug_buckets,
                "ucb_c": self.ucb_c,
                "max_seeds_per_leaf": self.max_seeds_per_leaf,
            }),
        }
    }

    fn debug_dump(&self, limit: usize) -> Value {
        let mut leaves = Vec::new();
        for &cov in &self.nodes[Self::ROOT].children {
            for &bug in &self.nodes[cov].children {
                let leaf = &self.nodes[bug];
                if leaf.seeds.is_empty() {
                    continue;
                }
                let seed_ids: Vec<&str> = leaf
                    .seeds
                    .iter()
                    .take(5)
                    .filter_map(|id| self.items.get(id).map(|item| item.seed.seed_id.as_str()))
                    .collect();
                leaves.push((
                    self.nodes[cov].key.clone(),
                    leaf.key.clone(),
                    leaf.n_selected,
                    leaf.q_avg_reward,
                    leaf.seeds.len(),
                    seed_ids
                        .into_iter()
                        .map(String::from)
                        .collect::<Vec<String>>(),
                ));
            }
        }
        // Highest current Q first, then most visited.
        leaves.sort_by(|a, b| {
            b.3.total_cmp(&a.3)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(&b.0))
                .then(a.1.cmp(&b.1))
        });
        let shown = leaves.len().min(limit);
        let entries: Vec<Value> = leaves
            .iter()
            .take(limit)
            .map(|(cov, bug, n, q, count, ids)| {
                serde_json::json!({
                    "coverage_key": cov,
                    "bug_key": bug,
                    "leaf_n_selected": n,
                    "leaf_q_avg_reward": (q * 10_000.0).round() / 10_000.0,
                    "seed_count": count,
                    "seed_ids": ids,
                })
            })
            .collect();
        serde_json::json!({
            "stats": self.stats(),
            "leaves": entries,
            "truncated": leaves.len() > shown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_seed;

    fn signals_with(status: &str, coverage_key: &str) -> Signals {
        Signals {
            status: Some(status.to_string()),
            coverage_key: Some(coverage_key.to_string()),
            ..Signals::default()
        }
    }

    #[test]
    fn test_canonical_json_key_order_stable() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": null, "y": [1, 2]}, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(short_hash(&a), short_hash(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
        assert_eq!(short_hash(&a).len(), 16);
    }

    #[test]
    fn test_ucb_prefers_undersampled_bucket() {
        // Bucket A: n=10, q=0.2; bucket B: n=1, q=1.0; parent_n=11, c=1.
        let score_a = ucb_score(11, 10, 0.2, 1.0);
        let score_b = ucb_score(11, 1, 1.0, 1.0);
        assert!((score_a - 0.6896).abs() < 1e-3, "got {score_a}");
        assert!((score_b - 2.5485).abs() < 1e-3, "got {score_b}");
        assert!(score_b > score_a);
        assert_eq!(ucb_score(11, 0, 0.0, 1.0), f64::INFINITY);
    }

    #[test]
    fn test_coverage_key_fallback_chain() {
        assert_eq!(coverage_bucket_key(None), "NO_COVERAGE");
        assert_eq!(coverage_bucket_key(Some(&Signals::default())), "NO_COVERAGE");

        let explicit = Signals {
            coverage_key: Some("COV:abc".to_string()),
            ..Signals::default()
        };
        assert_eq!(coverage_bucket_key(Some(&explicit)), "COV:abc");

        let signature = Signals {
            coverage_signature: Some("sig123".to_string()),
            ..Signals::default()
        };
        assert_eq!(coverage_bucket_key(Some(&signature)), "sig123");

        let details = Signals {
            branch_details: Some(serde_json::json!([{"file": "a.py"}])),
            ..Signals::default()
        };
        assert!(coverage_bucket_key(Some(&details)).starts_with("COV:"));

        let counts = Signals {
            branch_counts: Some((Some(4), Some(2))),
            ..Signals::default()
        };
        let key = coverage_bucket_key(Some(&counts));
        assert!(key.starts_with("COV:"));
        assert_ne!(key, coverage_bucket_key(Some(&details)));
    }

    #[test]
    fn test_bug_key_fallback_chain() {
        assert_eq!(bug_bucket_key(None), "NO_BUG");
        assert_eq!(bug_bucket_key(Some(&Signals::default())), "NO_BUG");

        let with_sig = Signals {
            bug_signature: Some(crate::target::BugSignature {
                exception: Some("ValueError".to_string()),
                line: Some(3),
                ..Default::default()
            }),
            ..Signals::default()
        };
        assert!(bug_bucket_key(Some(&with_sig)).starts_with("BUG:"));

        // An all-empty signature falls through to the status class.
        let empty_sig_crash = Signals {
            bug_signature: Some(crate::target::BugSignature::default()),
            status: Some("timeout".to_string()),
            ..Signals::default()
        };
        assert_eq!(bug_bucket_key(Some(&empty_sig_crash)), "BUG:CRASH_OR_TIMEOUT");

        let outputs = Signals {
            stdout_signature: Some("aaaa".to_string()),
            ..Signals::default()
        };
        assert!(bug_bucket_key(Some(&outputs)).starts_with("OUT:"));
    }

    #[test]
    fn test_reward_components() {
        assert_eq!(reward_from_signals(None), 0.0);
        let all = Signals {
            new_coverage: Some(true),
            new_bug: Some(true),
            status: Some("crash".to_string()),
            ..Signals::default()
        };
        assert_eq!(reward_from_signals(Some(&all)), 6.0);
        let coverage_only = Signals {
            new_coverage: Some(true),
            status: Some("ok".to_string()),
            ..Signals::default()
        };
        assert_eq!(reward_from_signals(Some(&coverage_only)), 1.0);
        let timeout_flag = Signals {
            timeout: Some(true),
            ..Signals::default()
        };
        assert_eq!(reward_from_signals(Some(&timeout_flag)), 3.0);
    }

    #[test]
    fn test_add_next_update_cycle() {
        let mut scheduler = UcbTreeScheduler::new();
        assert!(scheduler.is_empty());
        assert!(matches!(scheduler.next(), Err(SchedulerError::Empty)));

        let a = scheduler.add(test_seed("a", "valid", "{}"), None);
        scheduler.add(test_seed("b", "valid", "[1,2,3]"), None);
        assert_eq!(scheduler.len(), 2);

        // Shorter text first within the leaf.
        let first = scheduler.next().unwrap();
        assert_eq!(first.item_id, a.item_id);
        assert_eq!(scheduler.len(), 1);

        let updated = scheduler
            .update(&first.item_id, 0.4, Some(&signals_with("ok", "COV:x")))
            .unwrap();
        assert_eq!(updated.updates, 1);
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_update_before_next_is_error() {
        let mut scheduler = UcbTreeScheduler::new();
        let item = scheduler.add(test_seed("a", "valid", "{}"), None);
        assert!(matches!(
            scheduler.update(&item.item_id, 0.1, None),
            Err(SchedulerError::UpdateBeforeNext(_))
        ));
        assert!(matches!(
            scheduler.update("u999999", 0.1, None),
            Err(SchedulerError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_update_rebuckets_by_new_signals() {
        let mut scheduler = UcbTreeScheduler::new();
        let item = scheduler.add(test_seed("a", "valid", "{}"), None);
        let taken = scheduler.next().unwrap();
        assert_eq!(taken.item_id, item.item_id);

        scheduler
            .update(&item.item_id, 0.9, Some(&signals_with("ok", "COV:new-frontier")))
            .unwrap();
        let stats = scheduler.stats();
        assert_eq!(stats.detail["coverage_buckets"], 2);
        // The item now lives under the new coverage bucket.
        let dump = scheduler.debug_dump(10);
        let keys: Vec<&str> = dump["leaves"]
            .as_array()
            .unwrap()
            .iter()
            .map(|leaf| leaf["coverage_key"].as_str().unwrap())
            .collect();
        assert!(keys.contains(&"COV:new-frontier"));
    }

    #[test]
    fn test_leaf_eviction_beyond_capacity() {
        let mut scheduler = UcbTreeScheduler::with_params(1.0, 2);
        scheduler.add(test_seed("s1", "valid", "1"), None);
        scheduler.add(test_seed("s2", "valid", "22"), None);
        // Longest text overflows and is dropped from the registry.
        scheduler.add(test_seed("s3", "valid", "333"), None);
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.stats().total_items, 2);

        // A shorter add evicts the longer resident.
        scheduler.add(test_seed("s0", "valid", ""), None);
        assert_eq!(scheduler.len(), 2);
        let first = scheduler.next().unwrap();
        assert_eq!(first.seed.seed_id, "s0");
    }

    #[test]
    fn test_unvisited_buckets_selected_first() {
        let mut scheduler = UcbTreeScheduler::new();
        let a = scheduler.add(test_seed("a", "valid", "{}"), Some(&signals_with("ok", "COV:a")));
        scheduler.add(test_seed("b", "valid", "{}"), Some(&signals_with("ok", "COV:b")));

        let first = scheduler.next().unwrap();
        assert_eq!(first.item_id, a.item_id);
        scheduler
            .update(&first.item_id, 0.0, Some(&signals_with("ok", "COV:a")))
            .unwrap();

        // COV:b is still unvisited, so it wins over the visited COV:a.
        let second = scheduler.next().unwrap();
        assert_eq!(second.seed.seed_id, "b");
    }

    #[test]
    fn test_counter_invariants_hold() {
        let mut scheduler = UcbTreeScheduler::new();
        for i in 0..4 {
            let cov = format!("COV:{}", i % 2);
            scheduler.add(
                test_seed(&format!("s{i}"), "valid", &format!("{i}")),
                Some(&signals_with("ok", &cov)),
            );
        }

        let mut rewards_seen = Vec::new();
        for round in 0..12 {
            let item = scheduler.next().unwrap();
            let signals = Signals {
                status: Some(if round % 3 == 0 { "crash" } else { "ok" }.to_string()),
                new_coverage: Some(round % 2 == 0),
                coverage_key: Some(format!("COV:{}", round % 2)),
                ..Signals::default()
            };
            rewards_seen.push(reward_from_signals(Some(&signals)));
            scheduler.update(&item.item_id, 0.5, Some(&signals)).unwrap();
        }

        // Root visit count equals total updates, and equals the sum over
        // its children.
        let root = &scheduler.nodes[UcbTreeScheduler::ROOT];
        assert_eq!(root.n_selected, 12);
        let child_sum: u64 = root
            .children
            .iter()
            .map(|&c| scheduler.nodes[c].n_selected)
            .sum();
        assert!(root.n_selected >= child_sum);
        assert_eq!(root.n_selected, child_sum);

        // Root q is the arithmetic mean of all rewards.
        let mean: f64 = rewards_seen.iter().sum::<f64>() / rewards_seen.len() as f64;
        assert!((root.q_avg_reward - mean).abs() < 1e-9);

        for &cov in &root.children {
            let cov_node = &scheduler.nodes[cov];
            let bug_sum: u64 = cov_node
                .children
                .iter()
                .map(|&b| scheduler.nodes[b].n_selected)
                .sum();
            assert!(cov_node.n_selected >= bug_sum);
        }
    }
}
