//! The simulator backend contract.
//!
//! A backend applies one typed [`Action`] for one agent and answers with an [`ActionResult`].
//! Queries (reachable positions, interactable poses, shortest paths) travel through the same
//! call but never mutate the world; [`Action::is_mutating`] tells them apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::geometry::{Pose, Position};

/// Index of an agent inside a multi-agent scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub usize);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent{}", self.0)
    }
}

/// Every action the navigation core issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params")]
pub enum Action {
    GetReachablePositions,
    GetInteractablePoses { object_id: String },
    GetShortestPathToPoint { from: Position, target: Position },

    MoveAhead { magnitude: f32 },
    MoveBack { magnitude: f32 },
    RotateLeft { degrees: f32 },
    RotateRight { degrees: f32 },
    LookUp { degrees: f32 },
    LookDown { degrees: f32 },
    Teleport { pose: Pose },

    PickupObject { object_id: String },
    PutObject { object_id: String },
    SliceObject { object_id: String },
    OpenObject { object_id: String },
    CloseObject { object_id: String },
    ToggleObjectOn { object_id: String },
    ToggleObjectOff { object_id: String },
    CleanObject { object_id: String },
}

impl Action {
    /// The simulator's action name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetReachablePositions => "GetReachablePositions",
            Self::GetInteractablePoses { .. } => "GetInteractablePoses",
            Self::GetShortestPathToPoint { .. } => "GetShortestPathToPoint",
            Self::MoveAhead { .. } => "MoveAhead",
            Self::MoveBack { .. } => "MoveBack",
            Self::RotateLeft { .. } => "RotateLeft",
            Self::RotateRight { .. } => "RotateRight",
            Self::LookUp { .. } => "LookUp",
            Self::LookDown { .. } => "LookDown",
            Self::Teleport { .. } => "TeleportFull",
            Self::PickupObject { .. } => "PickupObject",
            Self::PutObject { .. } => "PutObject",
            Self::SliceObject { .. } => "SliceObject",
            Self::OpenObject { .. } => "OpenObject",
            Self::CloseObject { .. } => "CloseObject",
            Self::ToggleObjectOn { .. } => "ToggleObjectOn",
            Self::ToggleObjectOff { .. } => "ToggleObjectOff",
            Self::CleanObject { .. } => "CleanObject",
        }
    }

    /// Whether the action can change agent or object state.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::GetReachablePositions
                | Self::GetInteractablePoses { .. }
                | Self::GetShortestPathToPoint { .. }
        )
    }

    /// Signed rotation toward `degrees` (positive turns right).
    pub fn rotate(degrees: f32) -> Self {
        if degrees >= 0.0 {
            Self::RotateRight { degrees }
        } else {
            Self::RotateLeft { degrees: -degrees }
        }
    }
}

/// Typed payload of a successful query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ActionReturn {
    #[default]
    None,
    Positions(Vec<Position>),
    Poses(Vec<Pose>),
    /// Corners of a shortest path, starting at the query origin.
    Path(Vec<Position>),
}

/// Per-object state as seen by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub object_id: String,
    pub object_type: String,
    pub position: Position,
    /// Visible from the observing agent's current camera.
    pub visible: bool,
    #[serde(default)]
    pub is_picked_up: bool,
    #[serde(default)]
    pub is_toggled: bool,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub is_sliced: bool,
    #[serde(default)]
    pub is_dirty: bool,
    #[serde(default)]
    pub parent_receptacle: Option<String>,
}

/// The observing agent's own state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMeta {
    pub pose: Pose,
    pub held_object: Option<String>,
}

/// Observation metadata for one agent after a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub agent: AgentMeta,
    pub objects: Vec<ObjectMeta>,
}

impl SceneMetadata {
    pub fn object(&self, object_id: &str) -> Option<&ObjectMeta> {
        self.objects.iter().find(|o| o.object_id == object_id)
    }
}

/// Result of one simulator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub action_return: ActionReturn,
    pub metadata: SceneMetadata,
}

/// A simulator backend.
///
/// The session is not reentrant: all calls come from one control thread, one at a time.
pub trait Simulator: Send {
    /// Loads `scene` with `agent_count` agents, discarding any previous scene state.
    fn reset(&mut self, scene: &str, agent_count: usize) -> Result<(), SimError>;

    /// Applies one action for one agent.
    fn step(&mut self, agent: AgentId, action: &Action) -> Result<ActionResult, SimError>;

    /// The latest observation for `agent` without issuing an action.
    fn metadata(&self, agent: AgentId) -> Result<SceneMetadata, SimError>;

    fn agent_count(&self) -> usize;

    /// Releases backend resources. Further calls are undefined.
    fn stop(&mut self) {}
}
