//! Single-candidate agent and agent construction from config.

use std::time::Duration;

use inctune_config::{AgentKind, TuneParams};
use inctune_core::{Agent, AgentError, Candidate, Mode};

use crate::search::SearchAgent;

/// Offers one fixed candidate: explores it once, then exploits it until it is
/// fully trained.
pub struct SingleShotAgent {
    pending: Option<Box<dyn Candidate>>,
    held: Option<Box<dyn Candidate>>,
    needs_more: bool,
}

impl SingleShotAgent {
    #[must_use]
    pub fn new(candidate: Box<dyn Candidate>) -> Self {
        Self {
            pending: Some(candidate),
            held: None,
            needs_more: false,
        }
    }
}

impl Agent for SingleShotAgent {
    fn has_next(&self) -> bool {
        self.pending.is_some() || (self.needs_more && self.held.is_some())
    }

    fn predict_next_step_cost(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .or(self.held.as_ref())
            .and_then(|c| c.predict_next_step_cost())
    }

    fn is_exploring_or_exploiting(&self) -> Mode {
        if self.pending.is_some() {
            Mode::Explore
        } else {
            Mode::Exploit
        }
    }

    fn next(&mut self) -> Result<Box<dyn Candidate>, AgentError> {
        if let Some(candidate) = self.pending.take() {
            return Ok(candidate);
        }
        if self.needs_more {
            self.needs_more = false;
            return self.held.take().ok_or(AgentError::Exhausted);
        }
        Err(AgentError::Exhausted)
    }

    fn feedback(&mut self, candidate: Box<dyn Candidate>) -> Result<bool, AgentError> {
        self.needs_more = !candidate.is_fully_trained();
        self.held = Some(candidate);
        Ok(self.needs_more)
    }

    fn candidate_mut(&mut self, name: &str) -> Option<&mut dyn Candidate> {
        match &mut self.held {
            Some(candidate) if candidate.name() == name => Some(candidate.as_mut()),
            _ => None,
        }
    }

    fn find_final_candidates(&mut self) -> Result<Vec<Box<dyn Candidate>>, AgentError> {
        Ok(self.held.iter().cloned().collect())
    }
}

/// Agent selected by `params.agent` over `candidates`.
///
/// `SingleShot` keeps only the first candidate.
pub fn build_agent(
    params: &TuneParams,
    candidates: Vec<Box<dyn Candidate>>,
    shuffle_seed: u64,
) -> Result<Box<dyn Agent>, AgentError> {
    if candidates.is_empty() {
        return Err(AgentError::NoCandidates);
    }
    match params.agent {
        AgentKind::SingleShot => {
            if candidates.len() > 1 {
                tracing::warn!(
                    "single-shot agent ignores {} of {} candidates",
                    candidates.len() - 1,
                    candidates.len()
                );
            }
            let first = candidates
                .into_iter()
                .next()
                .ok_or(AgentError::NoCandidates)?;
            Ok(Box::new(SingleShotAgent::new(first)))
        }
        AgentKind::Search => {
            let mut agent = SearchAgent::new(candidates).with_top_k(params.top_k);
            if params.shuffle {
                agent = agent.with_shuffle(shuffle_seed);
            }
            Ok(Box::new(agent))
        }
    }
}
