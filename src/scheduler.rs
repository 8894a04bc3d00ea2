//! Seed schedulers: the ordered queue of scheduled items
//!
//! All variants share one contract: `add` wraps a seed, `next` hands out
//! the next item to fuzz, `update` feeds back the batch score (and the run
//! signals that drive the UCB tree). `next` on an empty scheduler is an
//! error; callers check `is_empty` first.

use crate::corpus::Seed;
use crate::target::{normalize_status, BugSignature, ParserResult};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is empty")]
    Empty,
    #[error("unknown item_id '{0}'")]
    UnknownItem(String),
    #[error("update() called before next() for item '{0}'")]
    UpdateBeforeNext(String),
}

/// Flattened per-run signals consumed by the schedulers.
///
/// Built either directly by the caller or from the wrapped closed/open
/// result shape via [`Signals::from_parser_result`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Signals {
    pub status: Option<String>,
    pub bug_signature: Option<BugSignature>,
    pub new_coverage: Option<bool>,
    pub new_bug: Option<bool>,
    pub crash: Option<bool>,
    pub timeout: Option<bool>,
    pub coverage_key: Option<String>,
    pub coverage_signature: Option<String>,
    pub bug_key: Option<String>,
    pub stdout_signature: Option<String>,
    pub stderr_signature: Option<String>,
    /// Raw branch details, the preferred coverage-bucketing source.
    pub branch_details: Option<serde_json::Value>,
    /// `(covered, missing)` aggregate counts, the bucketing fallback.
    pub branch_counts: Option<(Option<i64>, Option<i64>)>,
}

impl Signals {
    /// Flatten a wrapped closed/open result into scheduler signals.
    pub fn from_parser_result(result: &ParserResult) -> Self {
        let closed = &result.closed;
        let open = result.open.as_ref();

        let status = {
            let closed_status = closed.normalized_status();
            if !closed_status.is_empty() {
                closed_status
            } else {
                open.map(|o| o.normalized_status())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "ok".to_string())
            }
        };

        let bug_signature = closed
            .bug_signature
            .clone()
            .or_else(|| open.and_then(|o| o.bug_signature.clone()));

        let branch_details = closed.branch_details_by_file.clone();
        let branch_counts = if branch_details.is_none()
            && (closed.covered_branches.is_some()
                || closed.missing_branches.is_some()
                || open.is_some_and(|o| o.covered_branches.is_some() || o.missing_branches.is_some()))
        {
            Some((
                closed
                    .covered_branches
                    .or_else(|| open.and_then(|o| o.covered_branches)),
                closed
                    .missing_branches
                    .or_else(|| open.and_then(|o| o.missing_branches)),
            ))
        } else {
            None
        };

        Self {
            status: Some(status),
            bug_signature,
            stdout_signature: closed
                .stdout_signature
                .clone()
                .or_else(|| open.and_then(|o| o.stdout_signature.clone())),
            stderr_signature: closed
                .stderr_signature
                .clone()
                .or_else(|| open.and_then(|o| o.stderr_signature.clone())),
            branch_details,
            branch_counts,
            ..Self::default()
        }
    }

    pub fn with_novelty(mut self, new_coverage: bool, new_bug: bool) -> Self {
        self.new_coverage = Some(new_coverage);
        self.new_bug = Some(new_bug);
        self
    }

    pub fn is_crash_or_timeout(&self) -> bool {
        if self.crash == Some(true) || self.timeout == Some(true) {
            return true;
        }
        self.status
            .as_deref()
            .map(normalize_status)
            .is_some_and(|s| s == "crash" || s == "timeout")
    }
}

/// The scheduler's mutable wrapper around an immutable seed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledSeed {
    pub item_id: String,
    pub seed: Seed,
    pub priority: f64,
    pub times_selected: u64,
    pub updates: u64,
    pub last_interesting_score: Option<f64>,
    pub total_interesting_score: f64,
    pub metadata: BTreeMap<String, String>,
    pub last_signals: Option<Signals>,
}

impl ScheduledSeed {
    pub(crate) fn new(item_id: String, seed: Seed, priority: f64) -> Self {
        Self {
            item_id,
            seed,
            priority,
            times_selected: 0,
            updates: 0,
            last_interesting_score: None,
            total_interesting_score: 0.0,
            metadata: BTreeMap::new(),
            last_signals: None,
        }
    }

    pub fn avg_interesting_score(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            self.total_interesting_score / self.updates as f64
        }
    }

    /// Record one batch score and its signals.
    pub(crate) fn record_update(&mut self, interesting_score: f64, signals: Option<&Signals>) {
        self.last_interesting_score = Some(interesting_score);
        self.total_interesting_score += interesting_score;
        self.updates += 1;
        if let Some(signals) = signals {
            self.last_signals = Some(signals.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub kind: &'static str,
    pub ready: usize,
    pub total_items: usize,
    pub detail: serde_json::Value,
}

pub trait SeedScheduler: Send {
    /// Wrap and enqueue a seed. Signals (when present) place the item in
    /// signal-derived buckets for schedulers that use them.
    fn add(&mut self, seed: Seed, signals: Option<&Signals>) -> ScheduledSeed;

    /// Hand out the next item to fuzz.
    fn next(&mut self) -> Result<ScheduledSeed, SchedulerError>;

    /// Feed back the batch score for an item returned by `next`.
    fn update(
        &mut self,
        item_id: &str,
        interesting_score: f64,
        signals: Option<&Signals>,
    ) -> Result<ScheduledSeed, SchedulerError>;

    fn is_empty(&self) -> bool;

    /// Number of items `next` can currently return.
    fn len(&self) -> usize;

    fn stats(&self) -> SchedulerStats;

    fn debug_dump(&self, limit: usize) -> serde_json::Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Queue,
    Heap,
    UcbTree,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Queue => write!(f, "queue"),
            SchedulerKind::Heap => write!(f, "heap"),
            SchedulerKind::UcbTree => write!(f, "ucb_tree"),
        }
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Ok(SchedulerKind::Queue),
            "heap" => Ok(SchedulerKind::Heap),
            "ucb_tree" | "ucb" | "tree" => Ok(SchedulerKind::UcbTree),
            _ => Err(format!("unknown scheduler kind: {}", s)),
        }
    }
}

pub fn make_scheduler(kind: SchedulerKind) -> Box<dyn SeedScheduler> {
    match kind {
        SchedulerKind::Queue => Box::new(QueueScheduler::new()),
        SchedulerKind::Heap => {
            Box::new(HeapScheduler::new(PriorityMode::AvgScore, BTreeMap::new()))
        }
        SchedulerKind::UcbTree => Box::new(crate::ucb::UcbTreeScheduler::new()),
    }
}

/// FIFO cyclic baseline: `next` pops the head, `update` re-appends.
pub struct QueueScheduler {
    queue: VecDeque<String>,
    items: HashMap<String, ScheduledSeed>,
    seq: u64,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            items: HashMap::new(),
            seq: 0,
        }
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedScheduler for QueueScheduler {
    fn add(&mut self, seed: Seed, _signals: Option<&Signals>) -> ScheduledSeed {
        self.seq += 1;
        let item_id = format!("q{:06}", self.seq);
        let item = ScheduledSeed::new(item_id.clone(), seed, 0.0);
        self.items.insert(item_id.clone(), item.clone());
        self.queue.push_back(item_id);
        item
    }

    fn next(&mut self) -> Result<ScheduledSeed, SchedulerError> {
        let item_id = self.queue.pop_front().ok_or(SchedulerError::Empty)?;
        let item = self
            .items
            .get_mut(&item_id)
            .expect("queued item is registered");
        item.times_selected += 1;
        Ok(item.clone())
    }

    fn update(
        &mut self,
        item_id: &str,
        interesting_score: f64,
        signals: Option<&Signals>,
    ) -> Result<ScheduledSeed, SchedulerError> {
        let item = self
            .items
            .get_mut(item_id)
            .ok_or_else(|| SchedulerError::UnknownItem(item_id.to_string()))?;
        item.record_update(interesting_score, signals);
        self.queue.push_back(item_id.to_string());
        Ok(item.clone())
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            kind: "queue",
            ready: self.queue.len(),
            total_items: self.items.len(),
            detail: serde_json::Value::Null,
        }
    }

    fn debug_dump(&self, limit: usize) -> serde_json::Value {
        let order: Vec<serde_json::Value> = self
            .queue
            .iter()
            .take(limit)
            .map(|item_id| {
                let item = &self.items[item_id];
                serde_json::json!({
                    "item_id": item.item_id,
                    "seed_id": item.seed.seed_id,
                    "bucket": item.seed.bucket,
                    "times_selected": item.times_selected,
                    "last_interesting_score": item.last_interesting_score,
                })
            })
            .collect();
        serde_json::json!({
            "stats": self.stats(),
            "queue_order": order,
            "truncated": self.queue.len() > limit,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityMode {
    AvgScore,
    LastScore,
}

impl PriorityMode {
    fn as_str(self) -> &'static str {
        match self {
            PriorityMode::AvgScore => "avg_score",
            PriorityMode::LastScore => "last_score",
        }
    }
}

impl std::str::FromStr for PriorityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "avg_score" => Ok(PriorityMode::AvgScore),
            "last_score" => Ok(PriorityMode::LastScore),
            _ => Err(format!("unknown priority mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct HeapEntry {
    neg_priority: f64,
    counter: u64,
    item_id: String,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.neg_priority
            .total_cmp(&other.neg_priority)
            .then(self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-priority scheduler. Re-pushed entries leave stale duplicates in the
/// heap; pops skip entries whose item is no longer registered.
pub struct HeapScheduler {
    priority_mode: PriorityMode,
    bucket_prior: BTreeMap<String, f64>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    items: HashMap<String, ScheduledSeed>,
    seq: u64,
    heap_counter: u64,
}

impl HeapScheduler {
    pub fn new(priority_mode: PriorityMode, bucket_prior: BTreeMap<String, f64>) -> Self {
        Self {
            priority_mode,
            bucket_prior,
            heap: BinaryHeap::new(),
            items: HashMap::new(),
            seq: 0,
            heap_counter: 0,
        }
    }

    fn bucket_prior(&self, bucket: &str) -> f64 {
        self.bucket_prior.get(bucket).copied().unwrap_or(0.0)
    }

    fn compute_priority(&self, item: &ScheduledSeed) -> f64 {
        let base = self.bucket_prior(&item.seed.bucket);
        match self.priority_mode {
            PriorityMode::LastScore => base + item.last_interesting_score.unwrap_or(0.0),
            PriorityMode::AvgScore => base + item.avg_interesting_score(),
        }
    }

    fn push_entry(&mut self, item_id: &str, priority: f64) {
        self.heap_counter += 1;
        self.heap.push(Reverse(HeapEntry {
            neg_priority: -priority,
            counter: self.heap_counter,
            item_id: item_id.to_string(),
        }));
    }
}

impl SeedScheduler for HeapScheduler {
    fn add(&mut self, seed: Seed, _signals: Option<&Signals>) -> ScheduledSeed {
        self.seq += 1;
        let item_id = format!("h{:06}", self.seq);
        let priority = self.bucket_prior(&seed.bucket);
        let item = ScheduledSeed::new(item_id.clone(), seed, priority);
        self.items.insert(item_id.clone(), item.clone());
        self.push_entry(&item_id, priority);
        item
    }

    fn next(&mut self) -> Result<ScheduledSeed, SchedulerError> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            let Some(item) = self.items.get_mut(&entry.item_id) else {
                continue;
            };
            item.times_selected += 1;
            return Ok(item.clone());
        }
        Err(SchedulerError::Empty)
    }

    fn update(
        &mut self,
        item_id: &str,
        interesting_score: f64,
        signals: Option<&Signals>,
    ) -> Result<ScheduledSeed, SchedulerError> {
        {
            let item = self
                .items
                .get_mut(item_id)
                .ok_or_else(|| SchedulerError::UnknownItem(item_id.to_string()))?;
            item.record_update(interesting_score, signals);
        }
        let priority = self.compute_priority(&self.items[item_id]);
        let item = self.items.get_mut(item_id).expect("just updated");
        item.priority = priority;
        let snapshot = item.clone();
        self.push_entry(item_id, priority);
        Ok(snapshot)
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            kind: "heap",
            ready: self.heap.len(),
            total_items: self.items.len(),
            detail: serde_json::json!({ "priority_mode": self.priority_mode.as_str() }),
        }
    }

    fn debug_dump(&self, limit: usize) -> serde_json::Value {
        let mut ordered: Vec<&ScheduledSeed> = self.items.values().collect();
        ordered.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        let shown: Vec<serde_json::Value> = ordered
            .iter()
            .take(limit)
            .map(|item| {
                serde_json::json!({
                    "item_id": item.item_id,
                    "seed_id": item.seed.seed_id,
                    "bucket": item.seed.bucket,
                    "priority": item.priority,
                    "times_selected": item.times_selected,
                    "last_interesting_score": item.last_interesting_score,
                    "avg_interesting_score": item.avg_interesting_score(),
                })
            })
            .collect();
        serde_json::json!({
            "stats": self.stats(),
            "priority_order": shown,
            "truncated": self.items.len() > shown.len(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_seed(seed_id: &str, bucket: &str, text: &str) -> Seed {
    Seed {
        seed_id: seed_id.to_string(),
        family: "json".to_string(),
        bucket: bucket.to_string(),
        label: seed_id.to_string(),
        text: text.to_string(),
        tags: Vec::new(),
        expected: "unknown".to_string(),
        ordinal: 0,
        fingerprint: crate::corpus::fingerprint_bytes(text.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("queue".parse::<SchedulerKind>().unwrap(), SchedulerKind::Queue);
        assert_eq!("UCB".parse::<SchedulerKind>().unwrap(), SchedulerKind::UcbTree);
        assert_eq!("tree".parse::<SchedulerKind>().unwrap(), SchedulerKind::UcbTree);
        assert!("fifo".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn test_queue_cycles_forever() {
        let mut scheduler = QueueScheduler::new();
        scheduler.add(test_seed("a", "valid", "{}"), None);
        scheduler.add(test_seed("b", "valid", "[]"), None);

        let mut order = Vec::new();
        for _ in 0..6 {
            let item = scheduler.next().unwrap();
            order.push(item.seed.seed_id.clone());
            scheduler.update(&item.item_id, 0.1, None).unwrap();
        }
        assert_eq!(order, vec!["a", "b", "a", "b", "a", "b"]);
        assert_eq!(scheduler.len(), 2);
        assert!(!scheduler.is_empty());
    }

    #[test]
    fn test_queue_empty_error() {
        let mut scheduler = QueueScheduler::new();
        assert!(scheduler.is_empty());
        assert!(matches!(scheduler.next(), Err(SchedulerError::Empty)));
        scheduler.add(test_seed("a", "valid", "{}"), None);
        let item = scheduler.next().unwrap();
        // Popped but not yet updated: the ready population is zero.
        assert!(scheduler.is_empty());
        assert!(matches!(scheduler.next(), Err(SchedulerError::Empty)));
        scheduler.update(&item.item_id, 0.0, None).unwrap();
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_queue_unknown_item_update() {
        let mut scheduler = QueueScheduler::new();
        assert!(matches!(
            scheduler.update("q999999", 0.5, None),
            Err(SchedulerError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_avg_interesting_score() {
        let mut item = ScheduledSeed::new("x".to_string(), test_seed("a", "valid", "{}"), 0.0);
        assert_eq!(item.avg_interesting_score(), 0.0);
        item.record_update(0.5, None);
        item.record_update(1.0, None);
        assert!((item.avg_interesting_score() - 0.75).abs() < 1e-12);
        assert_eq!(item.last_interesting_score, Some(1.0));
        assert_eq!(item.updates, 2);
    }

    #[test]
    fn test_heap_prefers_high_average() {
        let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore, BTreeMap::new());
        let a = scheduler.add(test_seed("a", "valid", "{}"), None);
        let b = scheduler.add(test_seed("b", "valid", "[]"), None);

        // Both start at priority 0; insertion order breaks the tie.
        assert_eq!(scheduler.next().unwrap().item_id, a.item_id);
        assert_eq!(scheduler.next().unwrap().item_id, b.item_id);

        scheduler.update(&a.item_id, 0.1, None).unwrap();
        scheduler.update(&b.item_id, 0.9, None).unwrap();
        assert_eq!(scheduler.next().unwrap().item_id, b.item_id);
    }

    #[test]
    fn test_heap_bucket_prior() {
        let prior: BTreeMap<String, f64> = [("crashes".to_string(), 2.0)].into_iter().collect();
        let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore, prior);
        scheduler.add(test_seed("plain", "valid", "{}"), None);
        let hot = scheduler.add(test_seed("hot", "crashes", "[]"), None);
        assert_eq!(scheduler.next().unwrap().item_id, hot.item_id);
    }

    #[test]
    fn test_heap_last_score_mode_keeps_stale_entries() {
        let mut scheduler = HeapScheduler::new(PriorityMode::LastScore, BTreeMap::new());
        let a = scheduler.add(test_seed("a", "valid", "{}"), None);
        let b = scheduler.add(test_seed("b", "valid", "[]"), None);
        scheduler.next().unwrap();
        scheduler.next().unwrap();
        scheduler.update(&a.item_id, 0.8, None).unwrap();
        scheduler.update(&a.item_id, 0.2, None).unwrap();
        scheduler.update(&b.item_id, 0.5, None).unwrap();
        // a's 0.8-priority entry is stale (its priority is now 0.2) but the
        // item is live, so the old entry still wins the first pop.
        assert_eq!(scheduler.next().unwrap().item_id, a.item_id);
        assert_eq!(scheduler.next().unwrap().item_id, b.item_id);
        assert_eq!(scheduler.next().unwrap().item_id, a.item_id);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_heap_len_counts_heap_entries() {
        let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore, BTreeMap::new());
        let a = scheduler.add(test_seed("a", "valid", "{}"), None);
        scheduler.next().unwrap();
        scheduler.update(&a.item_id, 0.3, None).unwrap();
        scheduler.update(&a.item_id, 0.3, None).unwrap();
        // Two live entries for the same item after double update.
        assert_eq!(scheduler.len(), 2);
        assert!(!scheduler.is_empty());
        scheduler.next().unwrap();
        scheduler.next().unwrap();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_signals_flatten_from_result() {
        use crate::target::{ParserResult, TargetResult};
        let mut closed = TargetResult::with_status("BUG");
        closed.bug_signature = Some(BugSignature {
            exception: Some("X".to_string()),
            ..BugSignature::default()
        });
        closed.covered_branches = Some(3);
        closed.missing_branches = Some(1);
        let result = ParserResult {
            closed,
            open: Some(TargetResult::with_status("ok")),
        };
        let signals = Signals::from_parser_result(&result);
        assert_eq!(signals.status.as_deref(), Some("bug"));
        assert!(signals.bug_signature.is_some());
        assert_eq!(signals.branch_counts, Some((Some(3), Some(1))));
        assert!(signals.branch_details.is_none());
        assert!(!signals.is_crash_or_timeout());

        let crash = Signals {
            status: Some("crash".to_string()),
            ..Signals::default()
        };
        assert!(crash.is_crash_or_timeout());
    }
}
