//! AI2-THOR navigation and multi-agent task core.
//!
//! This crate turns a natural-language household command into a plan of subtasks and runs them
//! with several embodied agents in one shared simulator scene:
//! - [`Simulator`]: the seam to the 3D environment. [`mock::MockSimulator`] is a deterministic
//!   grid-world stand-in used by the tests.
//! - [`Approach`] and [`MotionController`]: reach an interactable pose, face the object and bring
//!   it into view, recovering from blocked moves and replanning when stuck.
//! - [`TaskMachine`]: the per-agent phase machine for one subtask.
//! - [`InterleavingScheduler`]: steps every active machine once per round, so at most one
//!   mutating action per agent lands in a round.
//! - [`Orchestrator`]: plan, spawn, assign, report.

pub mod config;
pub mod error;
pub mod geometry;
pub mod mock;
pub mod motion;
pub mod navigation;
pub mod observability;
pub mod oracle;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod simulator;
pub mod spatial;
pub mod task;

// Re-export so embedders can hand an already-open database to `ReportStore::from_db`
// without declaring their own `sled` dependency.
pub use sled;

pub use config::ThorConfig;
pub use error::{FailureKind, SimError, TaskError};
pub use geometry::{Pose, Position};
pub use motion::{MotionController, MotionState, ScanStatus, VerticalScan};
pub use navigation::{Approach, ApproachStatus, Navigator};
pub use oracle::{parse_plan, KeywordPlanner, Plan, PlanningContext, PlanningOracle};
pub use orchestrator::{AgentState, ExecutionSummary, Orchestrator};
pub use planner::{PathPlanner, PathSource, WaypointPath};
pub use report::{ReportStore, TaskReport};
pub use scheduler::{FrameSink, InterleavingScheduler, NoopFrameSink, StepMachine, StepStatus};
pub use session::SceneSession;
pub use simulator::{Action, ActionResult, AgentId, SceneMetadata, Simulator};
pub use spatial::{ObjectRef, SpatialIndex};
pub use task::{LightAction, Phase, TaskKind, TaskMachine, TaskSpec};
