//! Breadth-first search over a fixed candidate pool.
//!
//! Every unexplored candidate is explored before any partially trained one is
//! exploited. Partially trained candidates are then exploited round-robin until
//! each reports fully trained. The final set is the fed-back candidates ranked
//! by score.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use inctune_core::{Agent, AgentError, Candidate, Mode};
use inctune_data::seeded_shuffle;

pub struct SearchAgent {
    unexplored: VecDeque<Box<dyn Candidate>>,
    /// Names awaiting another step, in exploitation order.
    partial: VecDeque<String>,
    /// Fed-back candidates, in feedback order.
    held: Vec<Box<dyn Candidate>>,
    top_k: Option<usize>,
    train_times: HashMap<String, Duration>,
    longest_step: Option<Duration>,
}

impl SearchAgent {
    #[must_use]
    pub fn new(candidates: Vec<Box<dyn Candidate>>) -> Self {
        Self {
            unexplored: candidates.into(),
            partial: VecDeque::new(),
            held: Vec::new(),
            top_k: None,
            train_times: HashMap::new(),
            longest_step: None,
        }
    }

    /// Explore in a seeded random order.
    #[must_use]
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        seeded_shuffle(self.unexplored.make_contiguous(), seed);
        self
    }

    /// Keep only the best `top_k` candidates in the final set.
    #[must_use]
    pub fn with_top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.held.iter().position(|c| c.name() == name)
    }

    fn observe_step(&mut self, candidate: &dyn Candidate) {
        let Some(timed) = candidate.self_timed() else {
            return;
        };
        let total = timed.train_time();
        let previous = self
            .train_times
            .insert(candidate.name().to_string(), total)
            .unwrap_or_default();
        let step = total.saturating_sub(previous);
        self.longest_step = Some(self.longest_step.map_or(step, |longest| longest.max(step)));
    }
}

impl Agent for SearchAgent {
    fn has_next(&self) -> bool {
        !self.unexplored.is_empty() || !self.partial.is_empty()
    }

    fn predict_next_step_cost(&self) -> Option<Duration> {
        if self.unexplored.is_empty()
            && let Some(name) = self.partial.front()
            && let Some(index) = self.position(name)
            && let Some(cost) = self.held[index].predict_next_step_cost()
        {
            return Some(cost);
        }
        self.longest_step
    }

    fn is_exploring_or_exploiting(&self) -> Mode {
        if self.unexplored.is_empty() {
            Mode::Exploit
        } else {
            Mode::Explore
        }
    }

    fn next(&mut self) -> Result<Box<dyn Candidate>, AgentError> {
        if let Some(candidate) = self.unexplored.pop_front() {
            return Ok(candidate);
        }
        while let Some(name) = self.partial.pop_front() {
            if let Some(index) = self.position(&name) {
                return Ok(self.held.remove(index));
            }
        }
        Err(AgentError::Exhausted)
    }

    fn feedback(&mut self, candidate: Box<dyn Candidate>) -> Result<bool, AgentError> {
        self.observe_step(candidate.as_ref());
        let name = candidate.name().to_string();
        let needs_more = !candidate.is_fully_trained();
        match self.position(&name) {
            Some(index) => self.held[index] = candidate,
            None => self.held.push(candidate),
        }
        self.partial.retain(|n| *n != name);
        if needs_more {
            self.partial.push_back(name);
        }
        Ok(needs_more)
    }

    fn candidate_mut(&mut self, name: &str) -> Option<&mut dyn Candidate> {
        let index = self.position(name)?;
        Some(self.held[index].as_mut())
    }

    fn find_final_candidates(&mut self) -> Result<Vec<Box<dyn Candidate>>, AgentError> {
        let mut ranked: Vec<&dyn Candidate> = self.held.iter().map(AsRef::as_ref).collect();
        ranked.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| a.name().cmp(b.name()))
        });
        if let Some(k) = self.top_k {
            ranked.truncate(k.max(1));
        }
        Ok(ranked.into_iter().map(Candidate::clone_box).collect())
    }
}
