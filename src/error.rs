//! Error taxonomy for planning, navigation and interaction.
//!
//! `Stuck` and single interaction failures are retried inside the task machine; every other
//! variant is terminal for the owning task and ends up in its [`crate::report::TaskReport`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the navigation core and the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// A simulator query (reachable positions, interactable poses) itself failed.
    #[error("Simulator query failed: {0}")]
    SimulatorQuery(String),

    #[error("No path derivable: {0}")]
    PlanningFailure(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Target not visible after scan: {0}")]
    TargetNotVisible(String),

    #[error("Interaction {action} failed: {message}")]
    InteractionFailed { action: String, message: String },

    #[error("Round or time budget exhausted")]
    Timeout,

    /// The planning oracle's output did not match the task schema.
    #[error("Malformed plan: {0}")]
    PlanningMalformed(String),

    /// The planning oracle could not be reached or timed out.
    #[error("Planning oracle unavailable: {0}")]
    PlanningUnavailable(String),

    /// Motion budget exhausted for a waypoint. Internal; escalated by the task machine.
    #[error("Motion budget exhausted")]
    Stuck,

    #[error("Dependency task {0} did not succeed")]
    DependencyFailed(usize),

    #[error("Cancelled by orchestrator")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Report store error: {0}")]
    Store(String),
}

/// Flat failure classification recorded in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SimulatorQuery,
    PlanningFailure,
    TargetNotFound,
    TargetNotVisible,
    InteractionFailed,
    Timeout,
    PlanningMalformed,
    PlanningUnavailable,
    Stuck,
    DependencyFailed,
    Cancelled,
    Config,
    Store,
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SimulatorQuery(_) => FailureKind::SimulatorQuery,
            Self::PlanningFailure(_) => FailureKind::PlanningFailure,
            Self::TargetNotFound(_) => FailureKind::TargetNotFound,
            Self::TargetNotVisible(_) => FailureKind::TargetNotVisible,
            Self::InteractionFailed { .. } => FailureKind::InteractionFailed,
            Self::Timeout => FailureKind::Timeout,
            Self::PlanningMalformed(_) => FailureKind::PlanningMalformed,
            Self::PlanningUnavailable(_) => FailureKind::PlanningUnavailable,
            Self::Stuck => FailureKind::Stuck,
            Self::DependencyFailed(_) => FailureKind::DependencyFailed,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Config(_) => FailureKind::Config,
            Self::Store(_) => FailureKind::Store,
        }
    }
}

impl From<sled::Error> for TaskError {
    fn from(e: sled::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<config::ConfigError> for TaskError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Errors raised by a simulator backend outside of per-action results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("Unknown scene: {0}")]
    UnknownScene(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(usize),

    #[error("Backend error: {0}")]
    Backend(String),
}
