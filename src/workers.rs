//! Multi-worker dispatch: one logical scheduler, N target executors
//!
//! The coordinator (this module, run on the campaign thread) owns the
//! scheduler, the store, mutation, and promotion. Worker threads only run
//! the target and score against a read-only store handle. Three channels
//! carry the protocol: workers push request tokens, the coordinator
//! answers each with one job (or a `None` terminator), and workers push
//! results back. A batch's scheduler update fires exactly once, after all
//! of its dispatched results have been received.

use crate::controller::{Campaign, CampaignError, CampaignSummary, StopReason};
use crate::scheduler::{ScheduledSeed, Signals};
use crate::scorer::{compute_interestingness, ScoreContext};
use crate::store::RunStore;
use crate::target::{BugSignature, ParserResult, TargetResult, TargetRunner};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

/// One pre-mutated input handed to a worker.
#[derive(Debug, Clone)]
pub struct FuzzJob {
    pub job_id: u64,
    pub item_id: String,
    pub iteration: u64,
    pub seed_id: String,
    pub seed_text: String,
    pub bucket: String,
    pub target: String,
    pub mutated_text: String,
}

/// A worker's reply for one job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: u64,
    pub status: String,
    pub bug_signature: Option<BugSignature>,
    pub interesting_score: f64,
    pub mutated_input: String,
    pub signals: Signals,
}

struct WorkerContext {
    worker_id: usize,
    runner: Arc<dyn TargetRunner>,
    db_path: PathBuf,
    request_tx: Sender<usize>,
    reply_rx: Receiver<Option<FuzzJob>>,
    result_tx: Sender<JobResult>,
}

fn worker_loop(context: WorkerContext) {
    let read_store = RunStore::open_read_only(&context.db_path).ok();
    loop {
        if context.request_tx.send(context.worker_id).is_err() {
            break;
        }
        let Ok(reply) = context.reply_rx.recv() else {
            break;
        };
        let Some(job) = reply else {
            break;
        };

        let result = match context.runner.run(job.mutated_text.as_bytes()) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(worker = context.worker_id, error = %err, "target invocation failed");
                ParserResult {
                    closed: TargetResult::with_status("error"),
                    open: None,
                }
            }
        };
        let score = {
            let score_context = read_store.as_ref().map(|store| ScoreContext {
                store,
                target: &job.target,
            });
            compute_interestingness(&result, score_context.as_ref())
        };

        let job_result = JobResult {
            job_id: job.job_id,
            status: result.closed.normalized_status(),
            bug_signature: result.closed.bug_signature.clone(),
            interesting_score: score,
            mutated_input: job.mutated_text,
            signals: Signals::from_parser_result(&result),
        };
        if context.result_tx.send(job_result).is_err() {
            break;
        }
    }
}

/// Per-seed batch accounting. `expected` stays open until the batch is
/// fully dispatched (or abandoned at termination), so the single scheduler
/// update can fire after the final in-flight result lands.
struct BatchAccum {
    scheduled: ScheduledSeed,
    queue: VecDeque<String>,
    dispatched: usize,
    expected: Option<usize>,
    received: usize,
    scores: Vec<f64>,
    last_signals: Option<Signals>,
}

impl BatchAccum {
    fn new(scheduled: ScheduledSeed, mutations: Vec<String>) -> Self {
        Self {
            scheduled,
            queue: mutations.into(),
            dispatched: 0,
            expected: None,
            received: 0,
            scores: Vec::new(),
            last_signals: None,
        }
    }

    fn complete(&self) -> bool {
        self.expected == Some(self.received)
    }
}

struct Coordinator<'a> {
    campaign: &'a mut Campaign,
    batches: HashMap<u64, BatchAccum>,
    current: Option<u64>,
    pending: HashMap<u64, (u64, u64)>, // job_id -> (batch_id, iteration)
    waiting: VecDeque<usize>,
    next_batch_id: u64,
    next_job_id: u64,
    stop: Option<StopReason>,
}

impl<'a> Coordinator<'a> {
    fn new(campaign: &'a mut Campaign) -> Self {
        Self {
            campaign,
            batches: HashMap::new(),
            current: None,
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            next_batch_id: 0,
            next_job_id: 0,
            stop: None,
        }
    }

    /// Latch the first budget stop and finalize the in-progress batch so
    /// its outstanding results still produce the one scheduler update.
    fn refresh_stop(&mut self) -> Result<(), CampaignError> {
        if self.stop.is_some() {
            return Ok(());
        }
        if let Some(reason) = self.campaign.budget_stop_reason() {
            self.stop = Some(reason);
            self.abandon_current()?;
        }
        Ok(())
    }

    fn enter_drain(&mut self, reason: StopReason) -> Result<(), CampaignError> {
        if self.stop.is_none() {
            self.stop = Some(reason);
            self.abandon_current()?;
        }
        Ok(())
    }

    fn abandon_current(&mut self) -> Result<(), CampaignError> {
        let Some(batch_id) = self.current.take() else {
            return Ok(());
        };
        let batch = self.batches.get_mut(&batch_id).expect("current batch exists");
        batch.expected = Some(batch.dispatched);
        if batch.dispatched == 0 {
            // Selected but never dispatched: no feedback to give.
            self.batches.remove(&batch_id);
        } else if self.batches[&batch_id].complete() {
            self.finish_batch(batch_id)?;
        }
        Ok(())
    }

    /// Pop the next mutation, refilling from the scheduler as batches
    /// drain. `None` means the scheduler has nothing ready right now.
    fn try_make_job(&mut self) -> Result<Option<FuzzJob>, CampaignError> {
        loop {
            if let Some(batch_id) = self.current {
                let batch = self.batches.get_mut(&batch_id).expect("current batch exists");
                if let Some(mutated_text) = batch.queue.pop_front() {
                    batch.dispatched += 1;
                    if batch.queue.is_empty() {
                        batch.expected = Some(batch.dispatched);
                        self.current = None;
                    }
                    let scheduled = &batch.scheduled;
                    let job = FuzzJob {
                        job_id: self.next_job_id,
                        item_id: scheduled.item_id.clone(),
                        iteration: self.campaign.iteration,
                        seed_id: scheduled.seed.seed_id.clone(),
                        seed_text: scheduled.seed.text.clone(),
                        bucket: scheduled.seed.bucket.clone(),
                        target: self.campaign.config.target.clone(),
                        mutated_text,
                    };
                    self.pending
                        .insert(job.job_id, (batch_id, self.campaign.iteration));
                    self.next_job_id += 1;
                    self.campaign.iteration += 1;
                    return Ok(Some(job));
                }
                self.current = None;
                continue;
            }

            if self.campaign.scheduler.is_empty() {
                return Ok(None);
            }
            let schedule = self.campaign.refresh_power_schedule();
            let scheduled = match self.campaign.scheduler.next() {
                Ok(scheduled) => scheduled,
                Err(_) => return Ok(None),
            };
            let energy = self.campaign.energy_for(&schedule, &scheduled);
            let mutations = self
                .campaign
                .generate_unique(energy as usize, &scheduled.seed.text);
            let batch_id = self.next_batch_id;
            self.next_batch_id += 1;
            self.batches
                .insert(batch_id, BatchAccum::new(scheduled, mutations));
            self.current = Some(batch_id);
        }
    }

    fn handle_result(&mut self, result: JobResult) -> Result<(), CampaignError> {
        let Some((batch_id, iteration)) = self.pending.remove(&result.job_id) else {
            tracing::warn!(job_id = result.job_id, "result for unknown job");
            return Ok(());
        };
        let scheduled = self
            .batches
            .get(&batch_id)
            .expect("pending batch exists")
            .scheduled
            .clone();

        let signals = self.campaign.persist_run(
            iteration,
            &scheduled,
            &result.mutated_input,
            &result.status,
            result.bug_signature.as_ref(),
            result.interesting_score,
            result.signals,
        );

        let batch = self.batches.get_mut(&batch_id).expect("pending batch exists");
        batch.received += 1;
        batch.scores.push(result.interesting_score);
        batch.last_signals = Some(signals);
        if batch.complete() {
            self.finish_batch(batch_id)?;
        }
        Ok(())
    }

    /// Exactly one scheduler update per batch.
    fn finish_batch(&mut self, batch_id: u64) -> Result<(), CampaignError> {
        let batch = self.batches.remove(&batch_id).expect("batch exists");
        if batch.scores.is_empty() {
            return Ok(());
        }
        let avg = batch.scores.iter().sum::<f64>() / batch.scores.len() as f64;
        self.campaign
            .scheduler
            .update(&batch.scheduled.item_id, avg, batch.last_signals.as_ref())?;
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

pub(crate) fn run_multi_worker(campaign: &mut Campaign) -> Result<CampaignSummary, CampaignError> {
    let worker_count = campaign.config.workers;
    let (request_tx, request_rx) = unbounded::<usize>();
    let (result_tx, result_rx) = unbounded::<JobResult>();

    let mut reply_txs: Vec<Sender<Option<FuzzJob>>> = Vec::with_capacity(worker_count);
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let (reply_tx, reply_rx) = unbounded::<Option<FuzzJob>>();
        reply_txs.push(reply_tx);
        let context = WorkerContext {
            worker_id,
            runner: campaign.target_runner.clone(),
            db_path: campaign.config.db_path.clone(),
            request_tx: request_tx.clone(),
            reply_rx,
            result_tx: result_tx.clone(),
        };
        handles.push(
            std::thread::Builder::new()
                .name(format!("fuzz-worker-{worker_id}"))
                .spawn(move || worker_loop(context))
                .expect("worker thread spawn"),
        );
    }
    // Only worker-held clones remain; channel errors then mean all workers
    // are gone.
    drop(request_tx);
    drop(result_tx);

    let mut coordinator = Coordinator::new(campaign);
    let mut terminated = 0usize;

    while terminated < worker_count || coordinator.in_flight() > 0 {
        crossbeam_channel::select! {
            recv(result_rx) -> message => {
                let Ok(result) = message else { break; };
                coordinator.handle_result(result)?;
                service_waiting(&mut coordinator, &reply_txs, &mut terminated)?;
            }
            recv(request_rx) -> message => {
                let Ok(worker_id) = message else { break; };
                // Results queued ahead of this request must land first so
                // scoring and dedup see every earlier run.
                while let Ok(result) = result_rx.try_recv() {
                    coordinator.handle_result(result)?;
                }
                coordinator.waiting.push_back(worker_id);
                service_waiting(&mut coordinator, &reply_txs, &mut terminated)?;
            }
        }
    }

    // Terminators for any worker still parked on its reply channel.
    for reply_tx in &reply_txs {
        let _ = reply_tx.send(None);
    }
    drop(reply_txs);
    for handle in handles {
        let _ = handle.join();
    }

    let stop = coordinator.stop.unwrap_or(StopReason::SchedulerEmpty);
    Ok(campaign.summary(stop))
}

/// Hand jobs to parked workers, or terminators once the campaign is
/// stopping (or the scheduler is dry with nothing in flight).
fn service_waiting(
    coordinator: &mut Coordinator<'_>,
    reply_txs: &[Sender<Option<FuzzJob>>],
    terminated: &mut usize,
) -> Result<(), CampaignError> {
    while let Some(worker_id) = coordinator.waiting.pop_front() {
        coordinator.refresh_stop()?;
        let job = if coordinator.stop.is_some() {
            None
        } else {
            coordinator.try_make_job()?
        };
        match job {
            Some(job) => {
                if reply_txs[worker_id].send(Some(job)).is_err() {
                    *terminated += 1;
                }
            }
            None => {
                if coordinator.stop.is_none() && coordinator.in_flight() > 0 {
                    // Scheduler dry but results outstanding: a promotion or
                    // batch update may refill it, so keep the worker parked.
                    coordinator.waiting.push_front(worker_id);
                    break;
                }
                coordinator.enter_drain(StopReason::SchedulerEmpty)?;
                let _ = reply_txs[worker_id].send(None);
                *terminated += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::{new_campaign, test_config, write_corpus, MockJsonTarget};
    use crate::controller::Campaign;
    use std::sync::atomic::AtomicBool;

    fn run_rows(campaign: &Campaign) -> Vec<(u64, String, String, String, f64)> {
        campaign
            .store
            .list_runs("json-decoder")
            .unwrap()
            .into_iter()
            .map(|row| {
                (
                    row.iteration,
                    row.seed_id,
                    row.mutated_input,
                    row.status,
                    row.interesting_score,
                )
            })
            .collect()
    }

    #[test]
    fn test_single_worker_multi_path_matches_single_path() {
        // Same rng seed, same corpus: the coordinator protocol with one
        // worker must write the same rows as the plain loop.
        let dir_single = tempfile::tempdir().unwrap();
        write_corpus(dir_single.path(), 3);
        let mut single = new_campaign(test_config(dir_single.path(), 20)).unwrap();
        single.run().unwrap();

        let dir_multi = tempfile::tempdir().unwrap();
        write_corpus(dir_multi.path(), 3);
        let mut multi = new_campaign(test_config(dir_multi.path(), 20)).unwrap();
        run_multi_worker(&mut multi).unwrap();

        assert_eq!(run_rows(&single), run_rows(&multi));
    }

    #[test]
    fn test_multi_worker_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path(), 4);
        let mut config = test_config(dir.path(), 40);
        config.workers = 4;
        let mut campaign = Campaign::new(
            config,
            Arc::new(MockJsonTarget),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
        .unwrap();
        let summary = campaign.run().unwrap();

        assert_eq!(summary.stop, StopReason::IterationsExhausted);
        assert_eq!(summary.runs_recorded, 40);
        let rows = campaign.store.list_runs("json-decoder").unwrap();
        assert_eq!(rows.len(), 40);
        // Iterations are assigned at dispatch: all distinct, covering 0..40.
        let mut iterations: Vec<u64> = rows.iter().map(|row| row.iteration).collect();
        iterations.sort_unstable();
        assert_eq!(iterations, (0..40).collect::<Vec<u64>>());
        for row in &rows {
            assert!((0.0..=1.0).contains(&row.interesting_score));
        }
    }

    #[test]
    fn test_multi_worker_shutdown_drains() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path(), 4);
        let mut config = test_config(dir.path(), 100_000);
        config.workers = 3;
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut campaign = Campaign::new(config, Arc::new(MockJsonTarget), shutdown)
            .unwrap()
            .unwrap();
        let summary = campaign.run().unwrap();
        assert_eq!(summary.stop, StopReason::Shutdown);
        assert_eq!(summary.runs_recorded, 0);
    }

    #[test]
    fn test_multi_worker_promotes_at_lower_threshold() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path(), 2);
        let mut config = test_config(dir.path(), 30);
        config.workers = 2;
        // Default multi-worker threshold is 0.0: any positive score
        // promotes.
        assert_eq!(config.effective_promote_threshold(), 0.0);
        let mut campaign = Campaign::new(
            config,
            Arc::new(MockJsonTarget),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
        .unwrap();
        let summary = campaign.run().unwrap();
        assert!(summary.promotions > 0);
    }
}
