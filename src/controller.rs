//! Fuzzing controller: drives the select/mutate/run/score/promote loop
//!
//! The campaign owns the scheduler, the write-capable store handle, the
//! mutator, and the RNG. Scoring reads through a separate read-only store
//! handle. The multi-worker variant in `workers` reuses the persistence
//! and promotion logic here; only target execution moves off-thread.

use crate::config::FuzzConfig;
use crate::corpus::{make_discovered_seed, SeedCorpus, DISCOVERED_ORDINAL_BASE};
use crate::mutator::TextMutator;
use crate::power::{compute_power_schedule, PowerSchedule, SeedEnergyInput};
use crate::scheduler::{make_scheduler, ScheduledSeed, SeedScheduler, Signals};
use crate::scorer::{compute_interestingness, covered_edges_from_value, ScoreContext};
use crate::store::{now_iso8601, RunRecord, RunStore};
use crate::target::{is_bug_class, BugSignature, ParserResult, TargetResult, TargetRunner};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Candidate draws per batch slot before the last candidate is accepted
/// as-is.
pub(crate) const MAX_UNIQUE_ATTEMPTS: usize = 200;

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Corpus(#[from] crate::corpus::CorpusError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Target(#[from] crate::target::TargetError),
    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IterationsExhausted,
    HoursElapsed,
    SchedulerEmpty,
    Shutdown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::IterationsExhausted => write!(f, "iterations exhausted"),
            StopReason::HoursElapsed => write!(f, "time budget elapsed"),
            StopReason::SchedulerEmpty => write!(f, "scheduler empty"),
            StopReason::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Debug)]
pub struct CampaignSummary {
    pub iterations: u64,
    pub runs_recorded: u64,
    pub promotions: u64,
    pub stop: StopReason,
}

/// One campaign's full mutable state. Confined to the controller thread;
/// workers only ever see pre-mutated job payloads.
pub struct Campaign {
    pub(crate) config: FuzzConfig,
    pub(crate) scheduler: Box<dyn SeedScheduler>,
    pub(crate) store: RunStore,
    read_store: Option<RunStore>,
    pub(crate) mutator: TextMutator,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) target_runner: Arc<dyn TargetRunner>,
    /// `(seed_id, ordinal)` of every live seed, corpus plus discovered.
    seed_index: Vec<(String, i64)>,
    promoted: HashSet<String>,
    next_discovered_ordinal: i64,
    session_inputs: HashSet<String>,
    pub(crate) iteration: u64,
    runs_recorded: u64,
    promotions: u64,
    pub(crate) shutdown: Arc<AtomicBool>,
    started: Instant,
}

impl Campaign {
    /// Initialize a campaign. Returns `None` when the corpus holds no
    /// seeds for the target; in that case the store is never opened.
    pub fn new(
        config: FuzzConfig,
        target_runner: Arc<dyn TargetRunner>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Option<Self>, CampaignError> {
        config.validate()?;

        let corpus = SeedCorpus::load(&config.corpus_dir)?;
        let seeds: Vec<crate::corpus::Seed> = corpus
            .seeds_for_target(&config.target)?
            .into_iter()
            .cloned()
            .collect();
        if seeds.is_empty() {
            return Ok(None);
        }

        let mut scheduler = make_scheduler(config.scheduler_kind);
        let mut seed_index = Vec::with_capacity(seeds.len());
        for seed in seeds {
            seed_index.push((seed.seed_id.clone(), seed.ordinal));
            scheduler.add(seed, None);
        }

        let store = RunStore::open(&config.db_path)?;
        let read_store = match RunStore::open_read_only(&config.db_path) {
            Ok(store) => Some(store),
            Err(err) => {
                tracing::warn!(error = %err, "read-only store unavailable; scoring uses base formula");
                None
            }
        };

        let mutator = TextMutator::new(config.mutator_kind, &config.target);
        let rng = match config.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let mut campaign = Self {
            config,
            scheduler,
            store,
            read_store,
            mutator,
            rng,
            target_runner,
            seed_index,
            promoted: HashSet::new(),
            next_discovered_ordinal: DISCOVERED_ORDINAL_BASE,
            session_inputs: HashSet::new(),
            iteration: 0,
            runs_recorded: 0,
            promotions: 0,
            shutdown,
            started: Instant::now(),
        };

        let warmup = campaign.refresh_power_schedule();
        tracing::debug!(
            seeds = campaign.seed_index.len(),
            energies = warmup.seed_energies.len(),
            "warmup power schedule computed"
        );
        Ok(Some(campaign))
    }

    pub fn run(&mut self) -> Result<CampaignSummary, CampaignError> {
        self.started = Instant::now();
        if self.config.workers > 1 {
            crate::workers::run_multi_worker(self)
        } else {
            self.run_single_worker()
        }
    }

    fn run_single_worker(&mut self) -> Result<CampaignSummary, CampaignError> {
        let stop = loop {
            if let Some(reason) = self.stop_reason() {
                break reason;
            }

            let schedule = self.refresh_power_schedule();
            let scheduled = match self.scheduler.next() {
                Ok(scheduled) => scheduled,
                Err(_) => break StopReason::SchedulerEmpty,
            };
            let energy = self.energy_for(&schedule, &scheduled);
            let batch = self.generate_unique(energy as usize, &scheduled.seed.text);

            let mut scores = Vec::with_capacity(batch.len());
            let mut last_signals = None;
            for mutated in batch {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let (score, signals) = self.execute_and_record(&scheduled, &mutated);
                tracing::info!(
                    iteration = self.iteration - 1,
                    seed_id = %scheduled.seed.seed_id,
                    bucket = %scheduled.seed.bucket,
                    status = signals.status.as_deref().unwrap_or(""),
                    score,
                    "run complete"
                );
                scores.push(score);
                last_signals = Some(signals);
            }

            if !scores.is_empty() {
                let avg = scores.iter().sum::<f64>() / scores.len() as f64;
                self.scheduler
                    .update(&scheduled.item_id, avg, last_signals.as_ref())?;
            }
        };

        Ok(self.summary(stop))
    }

    pub(crate) fn summary(&self, stop: StopReason) -> CampaignSummary {
        CampaignSummary {
            iterations: self.iteration,
            runs_recorded: self.runs_recorded,
            promotions: self.promotions,
            stop,
        }
    }

    /// Budget-only stop check: shutdown flag, wall clock, iteration count.
    /// The multi-worker coordinator layers its own scheduler-drain logic
    /// on top of this.
    pub(crate) fn budget_stop_reason(&self) -> Option<StopReason> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Some(StopReason::Shutdown);
        }
        if let Some(hours) = self.config.budget.hours_limit() {
            if self.started.elapsed().as_secs_f64() / 3600.0 >= hours {
                return Some(StopReason::HoursElapsed);
            }
        }
        if self.remaining_iterations() == Some(0) {
            return Some(StopReason::IterationsExhausted);
        }
        None
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if let Some(reason) = self.budget_stop_reason() {
            return Some(reason);
        }
        if self.scheduler.is_empty() {
            return Some(StopReason::SchedulerEmpty);
        }
        None
    }

    pub(crate) fn remaining_iterations(&self) -> Option<u64> {
        self.config
            .budget
            .iteration_limit()
            .map(|limit| limit.saturating_sub(self.iteration))
    }

    /// Recompute the power schedule from the freshest store aggregates.
    pub(crate) fn refresh_power_schedule(&self) -> PowerSchedule {
        let stats = match self.store.aggregate_seed_stats(&self.config.target) {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(error = %err, "seed stats unavailable; using defaults");
                Default::default()
            }
        };
        let inputs: Vec<SeedEnergyInput> = self
            .seed_index
            .iter()
            .map(|(seed_id, ordinal)| match stats.get(seed_id) {
                Some(aggregate) => SeedEnergyInput {
                    id: *ordinal,
                    fuzz_count: aggregate.fuzz_count,
                    avg_interesting_score: Some(aggregate.avg_interesting_score),
                    bug_count: Some(aggregate.bug_count),
                },
                None => SeedEnergyInput {
                    id: *ordinal,
                    ..SeedEnergyInput::default()
                },
            })
            .collect();
        compute_power_schedule(&inputs, self.config.min_energy, self.config.max_energy)
    }

    /// Energy for one scheduled seed, at least 1, never past the budget.
    pub(crate) fn energy_for(&self, schedule: &PowerSchedule, scheduled: &ScheduledSeed) -> u64 {
        let energy = schedule
            .energy_for(scheduled.seed.ordinal)
            .unwrap_or(1)
            .max(1) as u64;
        match self.remaining_iterations() {
            Some(remaining) => energy.min(remaining.max(1)),
            None => energy,
        }
    }

    /// Draw `n` mutations, avoiding the session seen-set and prior store
    /// rows; after `MAX_UNIQUE_ATTEMPTS` draws a slot accepts its last
    /// candidate.
    pub(crate) fn generate_unique(&mut self, n: usize, text: &str) -> Vec<String> {
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            let mut candidate = String::new();
            for _ in 0..MAX_UNIQUE_ATTEMPTS {
                candidate = self.mutator.mutate(text, &mut self.rng);
                if self.session_inputs.contains(&candidate) {
                    continue;
                }
                match self.store.input_already_run(&candidate, &self.config.target) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "dedup lookup failed; accepting candidate");
                        break;
                    }
                }
            }
            self.session_inputs.insert(candidate.clone());
            batch.push(candidate);
        }
        batch
    }

    /// Run one mutation against the target, score it, persist it, and
    /// promote it when warranted. Single-worker path only.
    fn execute_and_record(&mut self, scheduled: &ScheduledSeed, mutated: &str) -> (f64, Signals) {
        let result = match self.target_runner.run(mutated.as_bytes()) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "target invocation failed");
                ParserResult {
                    closed: TargetResult::with_status("error"),
                    open: None,
                }
            }
        };

        let score = {
            let context = self.score_context();
            compute_interestingness(&result, context.as_ref())
        };

        let status = result.closed.normalized_status();
        let bug_signature = result.closed.bug_signature.clone();
        let base_signals = Signals::from_parser_result(&result);
        let iteration = self.iteration;
        self.iteration += 1;
        let signals = self.persist_run(
            iteration,
            scheduled,
            mutated,
            &status,
            bug_signature.as_ref(),
            score,
            base_signals,
        );
        (score, signals)
    }

    /// Persist one run and its coverage edges, then promote the input as a
    /// discovered seed when the score clears the threshold. Returns the
    /// signals enriched with the novelty flags observed before insertion.
    pub(crate) fn persist_run(
        &mut self,
        iteration: u64,
        scheduled: &ScheduledSeed,
        mutated: &str,
        status: &str,
        bug_signature: Option<&BugSignature>,
        score: f64,
        base_signals: Signals,
    ) -> Signals {
        let edges = base_signals
            .branch_details
            .as_ref()
            .map(covered_edges_from_value)
            .unwrap_or_default();

        // Novelty is judged against the frontier as it stood before this
        // run lands in the store.
        let new_coverage = !edges.is_empty()
            && match self.store.count_seen_edges(&edges) {
                Ok(seen) => seen < edges.len(),
                Err(err) => {
                    tracing::warn!(error = %err, "edge lookup failed");
                    false
                }
            };
        let new_bug = is_bug_class(status)
            && bug_signature.is_some_and(|bug| {
                let exception = bug.exception.as_deref().unwrap_or("");
                let file = bug.file.as_deref().unwrap_or("");
                match self
                    .store
                    .count_matching_bugs(&self.config.target, exception, file, bug.line)
                {
                    Ok(count) => count == 0,
                    Err(err) => {
                        tracing::warn!(error = %err, "bug lookup failed");
                        false
                    }
                }
            });

        let record = RunRecord {
            iteration,
            seed_id: scheduled.seed.seed_id.clone(),
            seed_text: scheduled.seed.text.clone(),
            mutated_input: mutated.to_string(),
            status: status.to_string(),
            bug_signature: bug_signature.cloned(),
            interesting_score: score,
            target: self.config.target.clone(),
            created_at: now_iso8601(),
        };
        if let Err(err) = self.store.insert_run(&record) {
            tracing::warn!(error = %err, iteration, "run insert failed");
        }
        if let Err(err) = self.store.insert_covered_edges(&edges) {
            tracing::warn!(error = %err, iteration, "edge insert failed");
        }
        self.runs_recorded += 1;

        let signals = base_signals.with_novelty(new_coverage, new_bug);

        if score > self.config.effective_promote_threshold()
            && !self.promoted.contains(mutated)
        {
            self.promoted.insert(mutated.to_string());
            let seed = make_discovered_seed(
                mutated,
                &scheduled.seed.family,
                &scheduled.seed.bucket,
                self.next_discovered_ordinal,
            );
            self.next_discovered_ordinal += 1;
            self.seed_index.push((seed.seed_id.clone(), seed.ordinal));
            tracing::info!(seed_id = %seed.seed_id, score, "promoted discovered seed");
            self.scheduler.add(seed, Some(&signals));
            self.promotions += 1;
        }

        signals
    }

    /// Read-only store handle for scoring in this process.
    pub(crate) fn score_context(&self) -> Option<ScoreContext<'_>> {
        self.read_store.as_ref().map(|store| ScoreContext {
            store,
            target: &self.config.target,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::target::TargetError;
    use std::path::Path;

    /// Deterministic in-process stand-in for a parser harness: valid JSON
    /// is `ok`, anything else is a `bug` with a length-derived signature.
    /// Coverage is a pure function of the input bytes.
    pub struct MockJsonTarget;

    impl TargetRunner for MockJsonTarget {
        fn run(&self, input: &[u8]) -> Result<ParserResult, TargetError> {
            let text = String::from_utf8_lossy(input);
            let parses = serde_json::from_str::<serde_json::Value>(&text).is_ok();
            let length = text.chars().count() as i64;

            let mut closed = TargetResult::with_status(if parses { "ok" } else { "bug" });
            if !parses {
                closed.bug_signature = Some(BugSignature {
                    kind: Some("invalidity".to_string()),
                    exception: Some(format!("JSONDecodeError{}", length % 3)),
                    message: Some("could not decode".to_string()),
                    file: Some("decoder.py".to_string()),
                    line: Some(100 + length % 7),
                });
            }
            let covered = 4 + length % 5;
            let missing = 1 + length % 3;
            closed.covered_branches = Some(covered);
            closed.missing_branches = Some(missing);
            closed.branch_details_by_file = Some(serde_json::json!([
                {
                    "file": "decoder.py",
                    "covered_branches": [
                        {"from_line": 1 + length % 11, "to_line": 2 + length % 11},
                        {"from_line": 20 + length % 4, "to_line": 21 + length % 4},
                    ],
                    "missing_branches": [],
                }
            ]));

            Ok(ParserResult {
                closed,
                open: Some(TargetResult::with_status("ok")),
            })
        }

        fn target_name(&self) -> &str {
            "json-decoder"
        }
    }

    /// Minimal on-disk corpus: one json family with two buckets.
    pub fn write_corpus(dir: &Path, seed_count: usize) {
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"targets": {"json": "json_seeds.json"}}"#,
        )
        .unwrap();
        let seeds: Vec<serde_json::Value> = (0..seed_count)
            .map(|i| {
                serde_json::json!({
                    "id": format!("json_{:03}", i),
                    "bucket": if i % 2 == 0 { "valid" } else { "near_valid" },
                    "content": format!("{{\"k{}\": {}}}", i, i),
                })
            })
            .collect();
        let doc = serde_json::json!({
            "target_family": "json",
            "buckets": [{"name": "valid"}, {"name": "near_valid"}],
            "seeds": seeds,
        });
        std::fs::write(dir.join("json_seeds.json"), doc.to_string()).unwrap();
    }

    pub fn test_config(dir: &Path, iterations: u64) -> FuzzConfig {
        use crate::config::{Budget, SubsystemVersions};
        use crate::mutator::MutatorKind;
        use crate::scheduler::SchedulerKind;
        FuzzConfig {
            target: "json-decoder".to_string(),
            scheduler_kind: SchedulerKind::Queue,
            mutator_kind: MutatorKind::Auto,
            budget: Budget::Iterations(iterations),
            timeout_secs: 5.0,
            rng_seed: Some(42),
            workers: 1,
            db_path: dir.join("runs.sqlite"),
            corpus_dir: dir.to_path_buf(),
            targets_dir: dir.to_path_buf(),
            targets_file: None,
            promote_threshold: None,
            min_energy: 1,
            max_energy: 8,
            versions: SubsystemVersions::default(),
        }
    }

    pub fn new_campaign(config: FuzzConfig) -> Option<Campaign> {
        Campaign::new(
            config,
            Arc::new(MockJsonTarget),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }
}
