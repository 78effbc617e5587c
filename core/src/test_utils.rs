//! Shared test utilities: scripted candidates and a tiny dataset.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use inctune_data::Dataset;
use serde::{Deserialize, Serialize};

use crate::{
    Candidate, CandidateError, CandidateSettings, SelfCheckpointing, SelfMemoryTracked, SelfTimed,
};

/// File a self-checkpointing `ScriptedCandidate` writes into its directory.
pub const SCRIPTED_CHECKPOINT_FILE: &str = "scripted.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ScriptedState {
    steps_done: usize,
}

/// Candidate with a fixed score that needs a fixed number of `train` calls.
///
/// It always votes for one class. Optional fake self-timing reports
/// `steps_done * step_time` without sleeping, so time accounting is exact.
/// Clones share the train-call counter.
#[derive(Debug, Clone)]
pub struct ScriptedCandidate {
    name: String,
    score: f64,
    steps: usize,
    steps_done: usize,
    vote: usize,
    classes: usize,
    step_time: Option<Duration>,
    peak_bytes: Option<u64>,
    scratch_bytes: usize,
    self_checkpointing: bool,
    checkpoint_dir: Option<String>,
    settings: CandidateSettings,
    train_calls: Arc<AtomicUsize>,
}

impl ScriptedCandidate {
    #[must_use]
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
            steps: 1,
            steps_done: 0,
            vote: 0,
            classes: 2,
            step_time: None,
            peak_bytes: None,
            scratch_bytes: 0,
            self_checkpointing: false,
            checkpoint_dir: None,
            settings: CandidateSettings::default(),
            train_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `train` calls before the candidate is fully trained.
    #[must_use]
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps.max(1);
        self
    }

    /// Always predict `vote` out of `classes`.
    #[must_use]
    pub fn with_vote(mut self, vote: usize, classes: usize) -> Self {
        self.classes = classes.max(vote + 1);
        self.vote = vote;
        self
    }

    /// Report `step_time` per step as its own training time.
    #[must_use]
    pub fn with_fake_step_time(mut self, step_time: Duration) -> Self {
        self.step_time = Some(step_time);
        self
    }

    #[must_use]
    pub fn with_peak_bytes(mut self, bytes: u64) -> Self {
        self.peak_bytes = Some(bytes);
        self
    }

    /// Fill and free a `bytes` buffer inside every `train` call.
    #[must_use]
    pub fn with_scratch_bytes(mut self, bytes: usize) -> Self {
        self.scratch_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_self_checkpointing(mut self) -> Self {
        self.self_checkpointing = true;
        self
    }

    /// Count `train` calls into `counter`.
    #[must_use]
    pub fn with_train_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.train_calls = counter;
        self
    }

    #[must_use]
    pub fn steps_done(&self) -> usize {
        self.steps_done
    }

    #[must_use]
    pub fn train_calls(&self) -> usize {
        self.train_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn settings(&self) -> CandidateSettings {
        self.settings
    }
}

impl Candidate for ScriptedCandidate {
    fn name(&self) -> &str {
        &self.name
    }

    fn train(&mut self, _data: &Dataset) -> Result<(), CandidateError> {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        if self.scratch_bytes > 0 {
            let scratch = std::hint::black_box(vec![1u8; self.scratch_bytes]);
            // held long enough for a sampler to see it
            std::thread::sleep(Duration::from_millis(50));
            drop(std::hint::black_box(scratch));
        }
        if self.steps_done < self.steps {
            self.steps_done += 1;
        }
        Ok(())
    }

    fn distribution(&self, _instance: &[f64]) -> Result<Vec<f64>, CandidateError> {
        if self.steps_done == 0 {
            return Err(CandidateError::NotTrained(self.name.clone()));
        }
        let mut dist = vec![0.0; self.classes];
        dist[self.vote] = 1.0;
        Ok(dist)
    }

    fn score(&self) -> f64 {
        self.score
    }

    fn is_fully_trained(&self) -> bool {
        self.steps_done >= self.steps
    }

    fn predict_next_step_cost(&self) -> Option<Duration> {
        self.step_time
    }

    fn configure(&mut self, settings: &CandidateSettings) {
        self.settings = *settings;
    }

    fn snapshot(&self) -> Result<serde_json::Value, CandidateError> {
        serde_json::to_value(ScriptedState {
            steps_done: self.steps_done,
        })
        .map_err(|e| CandidateError::state(&self.name, e))
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<(), CandidateError> {
        let state: ScriptedState =
            serde_json::from_value(state).map_err(|e| CandidateError::state(&self.name, e))?;
        self.steps_done = state.steps_done;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Candidate> {
        Box::new(self.clone())
    }

    fn self_timed(&self) -> Option<&dyn SelfTimed> {
        self.step_time.map(|_| self as &dyn SelfTimed)
    }

    fn self_memory_tracked(&self) -> Option<&dyn SelfMemoryTracked> {
        self.peak_bytes.map(|_| self as &dyn SelfMemoryTracked)
    }

    fn self_checkpointing(&mut self) -> Option<&mut dyn SelfCheckpointing> {
        if self.self_checkpointing {
            Some(self)
        } else {
            None
        }
    }
}

impl SelfTimed for ScriptedCandidate {
    fn train_time(&self) -> Duration {
        self.step_time.unwrap_or_default() * u32::try_from(self.steps_done).unwrap_or(u32::MAX)
    }
}

impl SelfMemoryTracked for ScriptedCandidate {
    fn peak_memory_bytes(&self) -> u64 {
        self.peak_bytes.unwrap_or(0)
    }
}

impl SelfCheckpointing for ScriptedCandidate {
    fn set_checkpoint_dir(&mut self, dir: Option<&Path>) {
        self.checkpoint_dir = dir.map(|d| d.display().to_string());
    }

    fn set_min_checkpoint_interval(&mut self, _interval: Duration) {}

    fn save_checkpoint(&self, dir: &Path) -> Result<(), CandidateError> {
        let path = dir.join(SCRIPTED_CHECKPOINT_FILE);
        let state = self.snapshot()?;
        std::fs::write(&path, state.to_string()).map_err(|e| CandidateError::io(&self.name, &path, e))
    }

    fn load_checkpoint(&mut self, dir: &Path) -> Result<bool, CandidateError> {
        let path = dir.join(SCRIPTED_CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| CandidateError::io(&self.name, &path, e))?;
        let state = serde_json::from_str(&content).map_err(|e| CandidateError::state(&self.name, e))?;
        self.restore(state)?;
        Ok(true)
    }
}

/// Six two-dimensional instances, two well separated classes.
#[must_use]
pub fn tiny_dataset() -> Dataset {
    let features = vec![
        vec![0.0, 0.0],
        vec![0.2, 0.1],
        vec![0.1, 0.3],
        vec![5.0, 5.0],
        vec![5.2, 4.9],
        vec![4.8, 5.1],
    ];
    let labels = vec![0, 0, 0, 1, 1, 1];
    Dataset::new(features, labels, 2).unwrap()
}
