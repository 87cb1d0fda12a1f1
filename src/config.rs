//! Tuning configuration: loaded from an optional TOML file and `THOR__*` environment variables.
//!
//! Load order: the file (if given and present) first, then environment variables such as
//! `THOR__MOTION__ARRIVAL_TOLERANCE=0.3` (double underscore separates nested keys).
//! Every field has a default, so an empty configuration is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::geometry::Position;

/// Configuration root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThorConfig {
    pub motion: MotionConfig,
    pub scan: ScanConfig,
    pub planner: PlannerConfig,
    pub spatial: SpatialConfig,
    pub task: TaskConfig,
    pub scheduler: SchedulerConfig,
    pub orchestrator: OrchestratorConfig,
}

/// [motion]: per-waypoint controller constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Planar distance (m) at which a waypoint counts as reached. Inclusive.
    pub arrival_tolerance: f32,
    /// Heading error (degrees) below which the agent stops rotating and walks.
    pub angle_tolerance: f32,
    /// Largest single rotation issued while aligning.
    pub max_rotation_step: f32,
    pub forward_step: f32,
    pub backoff_distance: f32,
    /// Offset rotation applied after a collision; its sign alternates.
    pub recovery_rotation: f32,
    /// A forward step that shortens the distance to the waypoint by less than this (m) counts
    /// as failed even when the simulator reports success.
    pub min_progress: f32,
    /// Consecutive failed attempts (blocked or stalled forward steps, failed rotations)
    /// tolerated per waypoint.
    pub max_consecutive_failures: u32,
    /// Total failed attempts tolerated per waypoint.
    pub max_total_failures: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            arrival_tolerance: 0.35,
            angle_tolerance: 15.0,
            max_rotation_step: 45.0,
            forward_step: 0.25,
            backoff_distance: 0.2,
            recovery_rotation: 30.0,
            min_progress: 0.03,
            max_consecutive_failures: 10,
            max_total_failures: 30,
        }
    }
}

/// [scan]: the vertical search performed after arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub look_down: f32,
    /// Magnitude of the single `LookUp` issued after looking down; must exceed `look_down`.
    pub look_up: f32,
    /// Retries of a failed camera move before the scan moves on.
    pub max_retries: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            look_down: 30.0,
            look_up: 60.0,
            max_retries: 2,
        }
    }
}

/// [planner]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Spacing of the synthesized direct-line path.
    pub fallback_step: f32,
    /// Whether a direct line may be used when the simulator has no path.
    pub direct_fallback: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            fallback_step: 0.25,
            direct_fallback: true,
        }
    }
}

/// [spatial]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Max distance between an interactable pose and a reachable grid point (grid size + slack).
    pub grid_tolerance: f32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            grid_tolerance: 0.26,
        }
    }
}

/// [task]: retry budgets of the task step state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub max_replans: u32,
    pub interaction_retries: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_replans: 3,
            interaction_retries: 1,
        }
    }
}

/// [scheduler]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_rounds: u64,
    /// Optional wall-clock budget in seconds.
    pub max_duration_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 1000,
            max_duration_secs: None,
        }
    }
}

/// [orchestrator]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scene: String,
    pub max_agents: usize,
    pub oracle_timeout_secs: u64,
    /// Spawn positions, assigned to agents in order (cycled when there are more agents).
    pub start_positions: Vec<[f32; 3]>,
    /// Hint for recorders attached through the frame hook.
    pub frame_rate: u32,
    /// When set, task reports are persisted to a sled database at this path.
    pub report_store: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scene: "FloorPlan1".to_string(),
            max_agents: 3,
            oracle_timeout_secs: 30,
            start_positions: vec![[0.0, 0.91, 0.0], [2.0, 0.91, 0.0], [-2.0, 0.91, 0.0]],
            frame_rate: 10,
            report_store: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn start_position(&self, index: usize) -> Position {
        match self.start_positions.get(index % self.start_positions.len().max(1)) {
            Some([x, y, z]) => Position::new(*x, *y, *z),
            None => Position::planar(0.0, 0.0),
        }
    }
}

impl ThorConfig {
    /// Loads the configuration, layering `THOR__*` environment variables over the file.
    pub fn load(path: Option<&Path>) -> Result<Self, TaskError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("THOR")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: ThorConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values that would make the controllers loop forever or never arrive.
    pub fn validate(&self) -> Result<(), TaskError> {
        let m = &self.motion;
        if !(m.arrival_tolerance > 0.0) {
            return Err(TaskError::Config("motion.arrival_tolerance must be > 0".into()));
        }
        if !(m.forward_step > 0.0) || !(m.max_rotation_step > 0.0) {
            return Err(TaskError::Config(
                "motion.forward_step and motion.max_rotation_step must be > 0".into(),
            ));
        }
        if !(m.min_progress >= 0.0 && m.min_progress < m.forward_step) {
            return Err(TaskError::Config(
                "motion.min_progress must be in [0, motion.forward_step)".into(),
            ));
        }
        if !(m.angle_tolerance > 0.0 && m.angle_tolerance < 180.0) {
            return Err(TaskError::Config("motion.angle_tolerance must be in (0, 180)".into()));
        }
        if !(self.planner.fallback_step > 0.0) {
            return Err(TaskError::Config("planner.fallback_step must be > 0".into()));
        }
        if self.scan.look_up <= self.scan.look_down {
            return Err(TaskError::Config("scan.look_up must exceed scan.look_down".into()));
        }
        if self.orchestrator.max_agents == 0 {
            return Err(TaskError::Config("orchestrator.max_agents must be >= 1".into()));
        }
        Ok(())
    }
}
