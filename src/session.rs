//! The owning context around one simulator scene.
//!
//! A [`SceneSession`] is created per scene (create-scene → run → teardown) and injected into
//! every component instead of being reachable as global state. It funnels all simulator calls,
//! so it is also where the per-round action trace and each agent's last error are kept.
//!
//! The trace is a ring buffer of the most recent calls. Mutating-action counts per
//! (round, agent) are kept separately for the same number of recent rounds, so the
//! one-action-per-round check keeps working after old records are evicted.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{SimError, TaskError};
use crate::geometry::{Pose, Position};
use crate::simulator::{Action, ActionResult, AgentId, SceneMetadata, Simulator};

/// Records kept by [`SceneSession::action_log`] unless overridden.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// One simulator call as seen by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub round: u64,
    pub agent: AgentId,
    pub action: String,
    pub mutating: bool,
    pub success: bool,
}

pub struct SceneSession {
    sim: Box<dyn Simulator>,
    scene: String,
    agent_count: usize,
    round: u64,
    log: VecDeque<ActionRecord>,
    log_capacity: usize,
    mutating: BTreeMap<(u64, AgentId), usize>,
    last_errors: HashMap<AgentId, String>,
    /// Scene geometry shared by every agent; cleared on reset.
    reachable: Option<Vec<Position>>,
    active: bool,
}

impl Drop for SceneSession {
    fn drop(&mut self) {
        if self.active {
            tracing::debug!(scene = %self.scene, "scene session dropped without teardown");
            self.sim.stop();
        }
    }
}

impl std::fmt::Debug for SceneSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneSession")
            .field("scene", &self.scene)
            .field("agent_count", &self.agent_count)
            .field("round", &self.round)
            .field("actions_logged", &self.log.len())
            .field("reachable_cached", &self.reachable.is_some())
            .finish()
    }
}

fn sim_err(e: SimError) -> TaskError {
    TaskError::SimulatorQuery(e.to_string())
}

impl SceneSession {
    /// Loads `scene` into the backend and takes ownership of it.
    pub fn create(
        mut sim: Box<dyn Simulator>,
        scene: &str,
        agent_count: usize,
    ) -> Result<Self, TaskError> {
        sim.reset(scene, agent_count).map_err(sim_err)?;
        tracing::info!(scene, agent_count, "scene session created");
        Ok(Self {
            sim,
            scene: scene.to_string(),
            agent_count,
            round: 0,
            log: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            mutating: BTreeMap::new(),
            last_errors: HashMap::new(),
            reachable: None,
            active: true,
        })
    }

    /// Reloads the scene, invalidating the cached reachable set and the action trace.
    pub fn reset(&mut self, agent_count: usize) -> Result<(), TaskError> {
        self.sim.reset(&self.scene, agent_count).map_err(sim_err)?;
        self.agent_count = agent_count;
        self.round = 0;
        self.log.clear();
        self.mutating.clear();
        self.last_errors.clear();
        self.reachable = None;
        tracing::info!(scene = %self.scene, agent_count, "scene session reset");
        Ok(())
    }

    /// Stops the backend. The session cannot be used afterwards.
    pub fn teardown(mut self) {
        self.sim.stop();
        self.active = false;
        tracing::info!(scene = %self.scene, actions = self.log.len(), "scene session torn down");
    }

    /// Keeps at most `capacity` records, and mutating counts for as many rounds.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        while self.log.len() > self.log_capacity {
            self.log.pop_front();
        }
        self
    }

    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    /// Marks the start of a scheduler round; subsequent actions are attributed to it.
    pub fn begin_round(&mut self, round: u64) {
        self.round = round;
        let oldest = round.saturating_sub(self.log_capacity as u64);
        if self.mutating.keys().next().is_some_and(|(r, _)| *r < oldest) {
            self.mutating = self.mutating.split_off(&(oldest, AgentId(0)));
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Issues one action. A failed action is still `Ok`; callers must check `success`.
    pub fn execute(&mut self, agent: AgentId, action: &Action) -> Result<ActionResult, TaskError> {
        let result = self.sim.step(agent, action).map_err(sim_err)?;

        if self.log.len() == self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(ActionRecord {
            round: self.round,
            agent,
            action: action.name().to_string(),
            mutating: action.is_mutating(),
            success: result.success,
        });
        if action.is_mutating() {
            *self.mutating.entry((self.round, agent)).or_default() += 1;
        }

        if result.success {
            tracing::trace!(%agent, round = self.round, action = action.name(), "action ok");
        } else {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} failed", action.name()));
            tracing::debug!(%agent, round = self.round, action = action.name(), %message, "action failed");
            self.last_errors.insert(agent, message);
        }

        Ok(result)
    }

    /// Read-through observation; never cached.
    pub fn observe(&self, agent: AgentId) -> Result<SceneMetadata, TaskError> {
        self.sim.metadata(agent).map_err(sim_err)
    }

    pub fn pose(&self, agent: AgentId) -> Result<Pose, TaskError> {
        Ok(self.observe(agent)?.agent.pose)
    }

    /// The most recent calls, oldest first.
    pub fn action_log(&self) -> &VecDeque<ActionRecord> {
        &self.log
    }

    /// Number of state-changing calls `agent` issued in `round`. Zero for rounds older than
    /// the log capacity.
    pub fn mutating_actions_in(&self, round: u64, agent: AgentId) -> usize {
        self.mutating.get(&(round, agent)).copied().unwrap_or(0)
    }

    pub fn last_error(&self, agent: AgentId) -> Option<&str> {
        self.last_errors.get(&agent).map(String::as_str)
    }

    pub(crate) fn cached_reachable(&self) -> Option<&[Position]> {
        self.reachable.as_deref()
    }

    pub(crate) fn store_reachable(&mut self, positions: Vec<Position>) {
        self.reachable = Some(positions);
    }
}
