//! The incremental tuning loop.
//!
//! Each `build` call runs the agent's candidates one step at a time while the
//! time budget allows, checkpointing as it goes, and then tries to finalize the
//! ensemble. With a checkpoint directory several worker processes can run the
//! same configuration side by side: they coordinate only through the
//! `CheckpointStore` lock and marker files, and exactly one of them finalizes.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::{Duration, Instant},
};

use inctune_config::TuneParams;
use inctune_core::{
    Agent, AgentError, Candidate, CandidateError, CandidateSettings, Dataset, ElapsedTimer,
    MemoryTracker, MemoryWatch, Mode, MonitorError, ResourceMonitors, ResourceUsage,
};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    ensemble::{EnsembleError, Ensembler, arg_max},
    store::{CheckpointStore, StoreError, now_timestamp},
};

/// How often the resident set is sampled while a candidate trains.
const MEMORY_WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one `build` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// This process finalized the ensemble.
    Done,
    /// Every candidate is finished or being finished elsewhere; another worker finalizes.
    Yielded,
    /// Work was skipped because another worker held it; this process cannot finalize.
    Deferred,
    /// The time budget ran out before the agent did.
    OutOfBudget,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Yielded => write!(f, "yielded"),
            Self::Deferred => write!(f, "deferred"),
            Self::OutOfBudget => write!(f, "out-of-budget"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Trained { fully_trained: bool },
    /// Finished elsewhere; restored from its checkpoint.
    Restored,
    /// Locked by another worker.
    Skipped,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trained {
                fully_trained: true,
            } => write!(f, "trained"),
            Self::Trained {
                fully_trained: false,
            } => write!(f, "partial"),
            Self::Restored => write!(f, "restored"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Reported to the observer after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub step: usize,
    pub candidate: String,
    pub outcome: StepOutcome,
}

impl std::fmt::Display for StepEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TuneProgress {{ step: {}, candidate: {:?}, outcome: {} }}",
            self.step, self.candidate, self.outcome
        )
    }
}

/// One ensemble member and its vote weight.
#[derive(Debug, Clone)]
pub struct Member {
    pub candidate: Box<dyn Candidate>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberReport {
    pub name: String,
    pub weight: f64,
    pub score: f64,
}

/// Summary written to `overall.json` by the finalizing worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub members: Vec<MemberReport>,
    pub score: f64,
    pub usage: ResourceUsage,
    pub seed: u64,
    pub started_at: String,
    pub finished_at: String,
}

type SetupHook = Box<dyn FnMut(&Dataset) -> Result<(), CandidateError> + Send>;
type Observer = Box<dyn FnMut(&StepEvent) + Send>;

pub struct TuningEngine {
    params: TuneParams,
    agent: Box<dyn Agent>,
    ensembler: Box<dyn Ensembler>,
    store: Option<CheckpointStore>,
    load_store: Option<CheckpointStore>,
    setup: Option<SetupHook>,
    observer: Option<Observer>,
    monitors: ResourceMonitors,
    candidate_usage: BTreeMap<String, ResourceUsage>,
    seen: BTreeSet<String>,
    skipped: bool,
    yielded: bool,
    retrain: bool,
    built: bool,
    steps: usize,
    last_checkpoint: Option<Instant>,
    started_at: Option<String>,
    members: Vec<Member>,
    status: Option<BuildStatus>,
    test_rng: StdRng,
}

impl TuningEngine {
    #[must_use]
    pub fn new(params: TuneParams, agent: Box<dyn Agent>, ensembler: Box<dyn Ensembler>) -> Self {
        let store = params.checkpoint_dir.as_ref().map(CheckpointStore::new);
        let load_store = params.load_dir().map(CheckpointStore::new);
        let test_rng = StdRng::seed_from_u64(params.test_seed);
        Self {
            params,
            agent,
            ensembler,
            store,
            load_store,
            setup: None,
            observer: None,
            monitors: ResourceMonitors::new(),
            candidate_usage: BTreeMap::new(),
            seen: BTreeSet::new(),
            skipped: false,
            yielded: false,
            retrain: true,
            built: false,
            steps: 0,
            last_checkpoint: None,
            started_at: None,
            members: Vec::new(),
            status: None,
            test_rng,
        }
    }

    /// Run `setup` once against the training data on every full rebuild.
    #[must_use]
    pub fn with_setup(
        mut self,
        setup: impl FnMut(&Dataset) -> Result<(), CandidateError> + Send + 'static,
    ) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: impl FnMut(&StepEvent) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Whether the next `build` resets run state. True until the first build.
    pub fn set_retrain(&mut self, retrain: bool) {
        self.retrain = retrain;
    }

    /// Reseed prediction-time tie breaking.
    pub fn set_test_seed(&mut self, seed: u64) {
        self.params.test_seed = seed;
        self.test_rng = StdRng::seed_from_u64(seed);
    }

    pub fn build(&mut self, data: &Dataset) -> Result<BuildStatus, EngineError> {
        self.monitors.enable_anyway();
        let result = self.build_inner(data);
        self.monitors.disable_anyway();
        if let Ok(status) = result {
            self.status = Some(status);
            self.built = true;
        }
        result
    }

    fn build_inner(&mut self, data: &Dataset) -> Result<BuildStatus, EngineError> {
        if self.retrain {
            tracing::info!("building from scratch");
            self.reset();
            if let Some(setup) = self.setup.as_mut() {
                setup(data)?;
            }
            self.retrain = false;
        } else {
            tracing::info!("resuming build after {} steps", self.steps);
        }

        while self.agent.has_next() && self.has_remaining_budget() {
            self.step(data)?;
        }

        if self.agent.has_next() {
            tracing::info!(
                "time budget spent after {:.1?}, work remains",
                self.monitors.timer.elapsed()
            );
            return Ok(BuildStatus::OutOfBudget);
        }
        self.finalize()
    }

    fn reset(&mut self) {
        self.monitors.reset();
        self.candidate_usage.clear();
        self.seen.clear();
        self.skipped = false;
        self.yielded = false;
        self.steps = 0;
        self.last_checkpoint = None;
        self.members.clear();
        self.started_at = Some(now_timestamp());
    }

    fn has_remaining_budget(&self) -> bool {
        let Some(limit) = self.params.time_limit() else {
            return true;
        };
        let elapsed = self.monitors.timer.elapsed();
        if elapsed >= limit {
            return false;
        }
        self.agent
            .predict_next_step_cost()
            .is_none_or(|cost| elapsed.checked_add(cost).is_some_and(|end| end <= limit))
    }

    fn remaining_budget(&self) -> Option<Duration> {
        self.params
            .time_limit()
            .map(|limit| limit.saturating_sub(self.monitors.timer.elapsed()))
    }

    fn emit(&mut self, name: &str, outcome: StepOutcome) {
        self.steps += 1;
        let event = StepEvent {
            step: self.steps,
            candidate: name.to_string(),
            outcome,
        };
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    fn step(&mut self, data: &Dataset) -> Result<(), EngineError> {
        let mode = self.agent.is_exploring_or_exploiting();
        let mut candidate = self.agent.next()?;
        let name = candidate.name().to_string();

        let store = self.store.clone();
        let lock = match &store {
            Some(store) => {
                self.seen.insert(name.clone());
                let lock = store.try_lock(&name)?;
                if !lock.is_locked() {
                    tracing::info!(
                        "skip evaluation due to parallelisation or already done: {name}"
                    );
                    self.skipped = true;
                    self.emit(&name, StepOutcome::Skipped);
                    return Ok(());
                }
                Some(lock)
            }
            None => None,
        };

        // an early return drops the handle, which releases the lock
        let outcome = match self.step_locked(data, mode, &mut candidate, &name)? {
            StepOutcome::Skipped => {
                self.skipped = true;
                StepOutcome::Skipped
            }
            outcome => self.feed_back(candidate, &name, outcome)?,
        };
        if let (Some(store), Some(lock)) = (&store, lock) {
            store.unlock(lock)?;
        }
        self.emit(&name, outcome);
        Ok(())
    }

    /// Restore or train a locked candidate.
    fn step_locked(
        &mut self,
        data: &Dataset,
        mode: Mode,
        candidate: &mut Box<dyn Candidate>,
        name: &str,
    ) -> Result<StepOutcome, EngineError> {
        let done = match &self.store {
            Some(store) => store.is_done(name)?,
            None => false,
        };
        if done {
            if self.restore_done(candidate.as_mut())? {
                tracing::info!("restored completed candidate {name}");
                return Ok(StepOutcome::Restored);
            }
            tracing::warn!("{name} is marked done but its checkpoint cannot be restored");
            return Ok(StepOutcome::Skipped);
        }

        if mode == Mode::Explore {
            self.resume(candidate.as_mut())?;
            self.configure(candidate.as_mut())?;
        }
        tracing::info!("evaluating {name}");
        self.train(data, candidate.as_mut())?;
        Ok(StepOutcome::Trained {
            fully_trained: candidate.is_fully_trained(),
        })
    }

    /// Load a candidate finished by any worker from the directory holding its
    /// done marker. Its recorded usage replaces whatever this process counted.
    fn restore_done(&mut self, candidate: &mut dyn Candidate) -> Result<bool, EngineError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(usage) = store.load(candidate)? else {
            return Ok(false);
        };
        if !candidate.is_fully_trained() {
            return Ok(false);
        }
        self.catch_up(candidate.name(), usage);
        Ok(true)
    }

    /// Load from the resume root and fold the restored usage into the totals.
    fn resume(&mut self, candidate: &mut dyn Candidate) -> Result<bool, EngineError> {
        let Some(store) = &self.load_store else {
            return Ok(false);
        };
        let Some(usage) = store.load(candidate)? else {
            return Ok(false);
        };
        tracing::info!(
            "loaded {} from checkpoint ({:.1?} already spent)",
            candidate.name(),
            usage.elapsed
        );
        self.catch_up(candidate.name(), usage);
        Ok(true)
    }

    /// Account for usage recorded in a checkpoint. Only the part this process
    /// has not counted yet is added to the totals.
    fn catch_up(&mut self, name: &str, usage: ResourceUsage) {
        let counted = self.candidate_usage.get(name).copied().unwrap_or_default();
        let missing = usage.elapsed.saturating_sub(counted.elapsed);
        self.monitors
            .add_usage(&ResourceUsage::new(missing, usage.peak_bytes));
        let entry = self.candidate_usage.entry(name.to_string()).or_default();
        entry.elapsed = entry.elapsed.max(usage.elapsed);
        entry.peak_bytes = entry.peak_bytes.max(usage.peak_bytes);
    }

    fn configure(&mut self, candidate: &mut dyn Candidate) -> Result<(), EngineError> {
        candidate.configure(&CandidateSettings {
            seed: self.params.seed,
            debug: self.params.debug_candidates,
            log: self.params.log_candidates,
        });
        let dir = match &self.store {
            Some(store) => Some(store.candidate_dir(candidate.name())?),
            None => None,
        };
        if let Some(own) = candidate.self_checkpointing() {
            own.set_checkpoint_dir(dir.as_deref());
            own.set_min_checkpoint_interval(self.params.min_checkpoint_interval());
        }
        Ok(())
    }

    /// One timed training step. The engine timer is suspended meanwhile so the
    /// step is counted exactly once.
    fn train(&mut self, data: &Dataset, candidate: &mut dyn Candidate) -> Result<(), EngineError> {
        let limit = self.remaining_budget();
        if let Some(contract) = candidate.time_contractable() {
            contract.set_train_time_limit(limit);
        }
        let own_before = candidate.self_timed().map(|t| t.train_time());

        self.monitors.suspend()?;
        let mut timer = ElapsedTimer::started();
        let mut memory = MemoryTracker::new();
        memory.enable_anyway();
        let watch = MemoryWatch::start(MEMORY_WATCH_INTERVAL);
        let result = candidate.train(data);
        timer.disable_anyway();
        memory.add_peak(watch.stop());
        memory.disable_anyway();
        self.monitors.unsuspend()?;
        result?;

        let elapsed = match (own_before, candidate.self_timed()) {
            (Some(before), Some(own)) => own.train_time().saturating_sub(before),
            _ => timer.elapsed(),
        };
        let peak_bytes = candidate
            .self_memory_tracked()
            .map_or(memory.peak_bytes(), |own| own.peak_memory_bytes());
        let usage = ResourceUsage::new(elapsed, peak_bytes);
        self.monitors.add_usage(&usage);
        self.candidate_usage
            .entry(candidate.name().to_string())
            .or_default()
            .merge(&usage);
        Ok(())
    }

    /// Hand the candidate back to the agent, then checkpoint it if it is
    /// finished or a checkpoint is due.
    fn feed_back(
        &mut self,
        candidate: Box<dyn Candidate>,
        name: &str,
        outcome: StepOutcome,
    ) -> Result<StepOutcome, EngineError> {
        let needs_more = self.agent.feedback(candidate)?;
        if outcome == StepOutcome::Restored {
            return Ok(outcome);
        }
        let Some(store) = &self.store else {
            return Ok(outcome);
        };

        let interval = self.params.min_checkpoint_interval();
        let due = self.last_checkpoint.is_none_or(|t| t.elapsed() >= interval);
        let usage = self.candidate_usage.get(name).copied().unwrap_or_default();
        let Some(candidate) = self.agent.candidate_mut(name) else {
            if !needs_more {
                store.mark_done(name)?;
            }
            return Ok(outcome);
        };
        let self_checkpointing = candidate.self_checkpointing().is_some();
        if !needs_more || (due && !self_checkpointing) {
            store.save(candidate, usage)?;
            self.last_checkpoint = Some(Instant::now());
            tracing::debug!("checkpointed {name}");
            if !needs_more {
                store.mark_done(name)?;
                tracing::info!("{name} done");
            }
        }
        Ok(outcome)
    }

    fn finalize(&mut self) -> Result<BuildStatus, EngineError> {
        if self.skipped {
            if self.store.is_none() {
                return Err(EngineError::InconsistentState(
                    "evaluations were skipped but checkpointing is disabled".to_string(),
                ));
            }
            tracing::info!("work was skipped, leaving finalization to other workers");
            return Ok(BuildStatus::Deferred);
        }

        let Some(store) = self.store.clone() else {
            self.finalize_members()?;
            return Ok(BuildStatus::Done);
        };

        let mut pending = Vec::new();
        for name in &self.seen {
            if !store.is_done(name)? {
                pending.push(name.as_str());
            }
        }
        if !pending.is_empty() {
            tracing::info!(
                "yielding, {} candidates still in progress: {}",
                pending.len(),
                pending.join(", ")
            );
            self.yielded = true;
            return Ok(BuildStatus::Yielded);
        }

        let lock = store.try_finalize_run()?;
        if !lock.is_locked() {
            tracing::info!("yielding, the run is finalized by another worker");
            self.yielded = true;
            return Ok(BuildStatus::Yielded);
        }
        let finished = self.finalize_members().and_then(|()| {
            store.finish_run(&self.report())?;
            Ok(())
        });
        store.unlock(lock)?;
        finished?;
        Ok(BuildStatus::Done)
    }

    fn finalize_members(&mut self) -> Result<(), EngineError> {
        let finals = self.agent.find_final_candidates()?;
        let weights = match finals.len() {
            0 => {
                return Err(EngineError::Unsupported(
                    "no final candidates to build an ensemble from".to_string(),
                ));
            }
            1 => vec![1.0],
            _ => self.ensembler.weight_votes(&finals)?,
        };
        self.members = finals
            .into_iter()
            .zip(weights)
            .map(|(candidate, weight)| Member { candidate, weight })
            .collect();
        self.yielded = false;
        tracing::info!(
            "finalized ensemble of {} members, score {:.4}",
            self.members.len(),
            self.score().unwrap_or_default()
        );
        Ok(())
    }

    #[must_use]
    pub fn report(&self) -> BuildReport {
        BuildReport {
            members: self
                .members
                .iter()
                .map(|m| MemberReport {
                    name: m.candidate.name().to_string(),
                    weight: m.weight,
                    score: m.candidate.score(),
                })
                .collect(),
            score: self.score().unwrap_or_default(),
            usage: self.usage(),
            seed: self.params.seed,
            started_at: self.started_at.clone().unwrap_or_default(),
            finished_at: now_timestamp(),
        }
    }

    /// Weighted, renormalised class distribution of the ensemble.
    pub fn distribution(&self, instance: &[f64]) -> Result<Vec<f64>, EngineError> {
        match self.members.as_slice() {
            [] => Err(EngineError::NotBuilt),
            [only] => Ok(only.candidate.distribution(instance)?),
            members => {
                let mut combined: Vec<f64> = Vec::new();
                for member in members {
                    let dist = member.candidate.distribution(instance)?;
                    if combined.len() < dist.len() {
                        combined.resize(dist.len(), 0.0);
                    }
                    for (total, p) in combined.iter_mut().zip(dist) {
                        *total += p * member.weight;
                    }
                }
                let sum: f64 = combined.iter().sum();
                if sum > 0.0 {
                    combined.iter_mut().for_each(|p| *p /= sum);
                }
                Ok(combined)
            }
        }
    }

    /// Most probable class, ties broken by the test-seeded generator.
    pub fn classify(&mut self, instance: &[f64]) -> Result<usize, EngineError> {
        let dist = self.distribution(instance)?;
        arg_max(&dist, &mut self.test_rng).ok_or(EngineError::NotBuilt)
    }

    /// Single member's score, or the weight-averaged member score.
    #[must_use]
    pub fn score(&self) -> Option<f64> {
        match self.members.as_slice() {
            [] => None,
            [only] => Some(only.candidate.score()),
            members => Some(
                members
                    .iter()
                    .map(|m| m.weight * m.candidate.score())
                    .sum(),
            ),
        }
    }

    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    #[must_use]
    pub fn weights(&self) -> Vec<f64> {
        self.members.iter().map(|m| m.weight).collect()
    }

    /// Total resources spent, restored checkpoints included.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        self.monitors.usage()
    }

    #[must_use]
    pub fn candidate_usage(&self, name: &str) -> Option<ResourceUsage> {
        self.candidate_usage.get(name).copied()
    }

    #[must_use]
    pub fn predict_next_step_cost(&self) -> Option<Duration> {
        self.agent.predict_next_step_cost()
    }

    /// The last build finalized the ensemble in this process. A build that
    /// yielded or deferred to another worker does not count.
    #[must_use]
    pub fn is_fully_trained(&self) -> bool {
        self.built && self.status == Some(BuildStatus::Done)
    }

    /// This process holds the finalized ensemble.
    #[must_use]
    pub fn is_final_model(&self) -> bool {
        self.status == Some(BuildStatus::Done)
            && !self.skipped
            && !self.yielded
            && !self.members.is_empty()
    }

    #[must_use]
    pub fn status(&self) -> Option<BuildStatus> {
        self.status
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> Option<PathBuf> {
        self.store.as_ref().map(|s| s.root().to_path_buf())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("engine has no final model")]
    NotBuilt,
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Candidate(#[from] CandidateError),
}
