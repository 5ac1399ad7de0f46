//! Consumer lifecycle phases and the legal transitions between them.

use serde::{Deserialize, Serialize};

use crate::error::{ConsumerError, Result};

/// Lifecycle phase of a consumer.
///
/// ```text
/// NotStarted -> Running <-> Paused
///                  |          |
///                  +-> Stopped <-+
/// ```
///
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

impl Phase {
    /// Phases reachable from this one.
    #[must_use]
    pub fn allowed_next(self) -> &'static [Phase] {
        match self {
            Phase::NotStarted => &[Phase::Running],
            Phase::Running => &[Phase::Paused, Phase::Stopped],
            Phase::Paused => &[Phase::Running, Phase::Stopped],
            Phase::Stopped => &[],
        }
    }

    /// Whether `next` is reachable from this phase in one step.
    #[must_use]
    pub fn can_transition_to(self, next: Phase) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Validate a transition, returning the target phase when legal.
    pub fn check_transition(self, next: Phase) -> Result<Phase> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ConsumerError::IllegalTransition {
                from: self,
                to: next,
                allowed: self.allowed_next().to_vec(),
            })
        }
    }

    /// Running or paused.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Running | Phase::Paused)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::NotStarted => "NOT_STARTED",
            Phase::Running => "RUNNING",
            Phase::Paused => "PAUSED",
            Phase::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
