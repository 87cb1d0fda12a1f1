//! Waypoint path derivation.
//!
//! The simulator's own shortest-path query accounts for obstacles and is always tried first.
//! When it has no answer, a straight line is interpolated instead; that fallback does not avoid
//! obstacles and relies on the motion controller's collision recovery.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::error::TaskError;
use crate::geometry::Position;
use crate::session::SceneSession;
use crate::simulator::{Action, ActionReturn, AgentId};

/// Where a path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSource {
    Simulator,
    DirectLine,
}

/// An ordered sequence of waypoints, consumed front to back.
#[derive(Debug, Clone, PartialEq)]
pub struct WaypointPath {
    waypoints: VecDeque<Position>,
    source: PathSource,
}

impl WaypointPath {
    pub fn new(waypoints: impl IntoIterator<Item = Position>, source: PathSource) -> Self {
        Self {
            waypoints: waypoints.into_iter().collect(),
            source,
        }
    }

    pub fn source(&self) -> PathSource {
        self.source
    }

    pub fn next(&self) -> Option<&Position> {
        self.waypoints.front()
    }

    /// Discards the front waypoint. A consumed waypoint is never returned again.
    pub fn consume(&mut self) -> Option<Position> {
        self.waypoints.pop_front()
    }

    pub fn is_complete(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn waypoints(&self) -> impl Iterator<Item = &Position> {
        self.waypoints.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathPlanner {
    config: PlannerConfig,
    arrival_tolerance: f32,
}

impl PathPlanner {
    pub fn new(config: PlannerConfig, arrival_tolerance: f32) -> Self {
        Self {
            config,
            arrival_tolerance,
        }
    }

    /// Plans from `from` to `to` for `agent`.
    ///
    /// Returns an empty (already complete) path when `from` is within the arrival tolerance.
    pub fn plan_path(
        &self,
        session: &mut SceneSession,
        agent: AgentId,
        from: Position,
        to: Position,
    ) -> Result<WaypointPath, TaskError> {
        if !from.is_finite() || !to.is_finite() {
            return Err(TaskError::PlanningFailure(format!(
                "non-finite endpoints {from:?} -> {to:?}"
            )));
        }
        if from.planar_distance(&to) <= self.arrival_tolerance {
            return Ok(WaypointPath::new(std::iter::empty(), PathSource::Simulator));
        }

        let result = session.execute(agent, &Action::GetShortestPathToPoint { from, target: to })?;
        match result.action_return {
            ActionReturn::Path(corners) if result.success && !corners.is_empty() => {
                tracing::debug!(%agent, waypoints = corners.len(), "simulator path");
                return Ok(WaypointPath::new(corners, PathSource::Simulator));
            }
            _ => {}
        }

        if !self.config.direct_fallback {
            return Err(TaskError::PlanningFailure(
                result
                    .error_message
                    .unwrap_or_else(|| "simulator returned no path".into()),
            ));
        }

        let path = self.direct_line(from, to);
        tracing::debug!(
            %agent,
            waypoints = path.len(),
            reason = result.error_message.as_deref().unwrap_or("empty path"),
            "falling back to direct line"
        );
        Ok(path)
    }

    /// Evenly spaced points from `from` (excluded) to `to` (included).
    pub fn direct_line(&self, from: Position, to: Position) -> WaypointPath {
        let dist = from.planar_distance(&to);
        let steps = (dist / self.config.fallback_step).ceil().max(1.0) as usize;
        WaypointPath::new(
            (1..=steps).map(|i| from.lerp(&to, i as f32 / steps as f32)),
            PathSource::DirectLine,
        )
    }
}
