//! Candidate source and selection policy.

use std::time::Duration;

use crate::Candidate;

/// Whether the next candidate is new or a continuation of one the agent holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Newly introduced; the engine should try to resume it from a checkpoint.
    Explore,
    /// Partially trained and held in memory by the agent.
    Exploit,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explore => write!(f, "explore"),
            Self::Exploit => write!(f, "exploit"),
        }
    }
}

/// Decides which candidate to evaluate next and which survive to the ensemble.
///
/// The engine hands ownership of a candidate back through `feedback`; the
/// agent keeps it (for later exploitation and the final set) and decides
/// whether it needs more steps.
pub trait Agent: Send {
    /// True while `next` can produce another candidate.
    fn has_next(&self) -> bool;

    /// Best-effort estimate for the next step, `None` when unknown.
    fn predict_next_step_cost(&self) -> Option<Duration>;

    /// Mode of the candidate the next call to `next` will return.
    fn is_exploring_or_exploiting(&self) -> Mode;

    /// Fails with `Exhausted` when `has_next` is false.
    fn next(&mut self) -> Result<Box<dyn Candidate>, AgentError>;

    /// Return a trained candidate. `Ok(true)` means it needs more steps.
    fn feedback(&mut self, candidate: Box<dyn Candidate>) -> Result<bool, AgentError>;

    /// A candidate previously fed back, by name.
    fn candidate_mut(&mut self, name: &str) -> Option<&mut dyn Candidate>;

    /// The final selection. Repeated calls return the same set.
    fn find_final_candidates(&mut self) -> Result<Vec<Box<dyn Candidate>>, AgentError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent has no more candidates")]
    Exhausted,
    #[error("agent was given no candidates")]
    NoCandidates,
}
