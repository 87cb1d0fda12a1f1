//! Reachable and interactable positions, and read-through object resolution.
//!
//! The reachable set is scene geometry: it is queried once, cached in the [`SceneSession`] and
//! shared by every agent until the session is reset. Interactable poses depend on occluders
//! that move, so they are recomputed on every query.

use crate::config::SpatialConfig;
use crate::error::TaskError;
use crate::geometry::{Pose, Position};
use crate::session::SceneSession;
use crate::simulator::{Action, ActionReturn, AgentId, ObjectMeta};

/// How a task names an object before it has been bound to a concrete id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    /// A concrete simulator identifier.
    Id(String),
    /// An object type, bound to the first matching object that is not picked up.
    Type(String),
}

impl ObjectRef {
    /// Object ids contain `|` in AI2-THOR; plain words are types.
    pub fn parse(s: &str) -> Self {
        if s.contains('|') {
            Self::Id(s.to_string())
        } else {
            Self::Type(s.to_string())
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::Type(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    config: SpatialConfig,
}

impl SpatialIndex {
    pub fn new(config: SpatialConfig) -> Self {
        Self { config }
    }

    /// Every position an agent could occupy in the current scene.
    ///
    /// An empty scene is a valid, empty result; a failed query is a `SimulatorQuery` error.
    pub fn reachable_positions<'s>(
        &self,
        session: &'s mut SceneSession,
        agent: AgentId,
    ) -> Result<&'s [Position], TaskError> {
        if session.cached_reachable().is_none() {
            let result = session.execute(agent, &Action::GetReachablePositions)?;
            if !result.success {
                return Err(TaskError::SimulatorQuery(
                    result
                        .error_message
                        .unwrap_or_else(|| "GetReachablePositions failed".into()),
                ));
            }
            let positions = match result.action_return {
                ActionReturn::Positions(p) => p,
                _ => Vec::new(),
            };
            tracing::debug!(scene = session.scene(), count = positions.len(), "reachable set cached");
            session.store_reachable(positions);
        }
        Ok(session.cached_reachable().unwrap_or(&[]))
    }

    /// Poses from which `object_id` is visible and in reach, nearest to the agent first.
    ///
    /// Each simulator pose is snapped to the reachable grid point it lies on; poses with no
    /// reachable point within the grid tolerance are dropped. An empty result means the object
    /// is not currently interactable from anywhere known.
    pub fn interactable_poses(
        &self,
        session: &mut SceneSession,
        agent: AgentId,
        object_id: &str,
    ) -> Result<Vec<Pose>, TaskError> {
        let origin = session.pose(agent)?.position;
        let reachable = self.reachable_positions(session, agent)?.to_vec();

        let result = session.execute(
            agent,
            &Action::GetInteractablePoses {
                object_id: object_id.to_string(),
            },
        )?;
        if !result.success {
            return Err(TaskError::SimulatorQuery(
                result
                    .error_message
                    .unwrap_or_else(|| format!("GetInteractablePoses({object_id}) failed")),
            ));
        }
        let candidates = match result.action_return {
            ActionReturn::Poses(p) => p,
            _ => Vec::new(),
        };

        let mut poses: Vec<Pose> = candidates
            .into_iter()
            .filter_map(|pose| {
                reachable
                    .iter()
                    .find(|r| r.planar_distance(&pose.position) < self.config.grid_tolerance)
                    .map(|r| Pose { position: *r, ..pose })
            })
            .collect();
        poses.sort_by(|a, b| {
            origin
                .planar_distance(&a.position)
                .total_cmp(&origin.planar_distance(&b.position))
        });

        tracing::debug!(%agent, object_id, count = poses.len(), "interactable poses");
        Ok(poses)
    }

    /// Looks `reference` up in the agent's current metadata. Never cached.
    pub fn resolve(
        &self,
        session: &SceneSession,
        agent: AgentId,
        reference: &ObjectRef,
    ) -> Result<ObjectMeta, TaskError> {
        let meta = session.observe(agent)?;
        let found = match reference {
            ObjectRef::Id(id) => meta.objects.into_iter().find(|o| &o.object_id == id),
            ObjectRef::Type(t) => meta
                .objects
                .into_iter()
                .find(|o| &o.object_type == t && !o.is_picked_up),
        };
        found.ok_or_else(|| TaskError::TargetNotFound(reference.to_string()))
    }

    /// Nearest object of `object_type` to the agent, picked up or not.
    pub fn nearest_of_type(
        &self,
        session: &SceneSession,
        agent: AgentId,
        object_type: &str,
    ) -> Result<ObjectMeta, TaskError> {
        let meta = session.observe(agent)?;
        let here = meta.agent.pose.position;
        meta.objects
            .into_iter()
            .filter(|o| o.object_type == object_type && !o.is_picked_up)
            .min_by(|a, b| {
                here.planar_distance(&a.position)
                    .total_cmp(&here.planar_distance(&b.position))
            })
            .ok_or_else(|| TaskError::TargetNotFound(object_type.to_string()))
    }
}
