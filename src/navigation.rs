//! Approaching one target object.
//!
//! An [`Approach`] picks the nearest interactable pose for its object, plans a path there, walks
//! it waypoint by waypoint and finally turns to face the object. Planning only uses
//! simulator queries, so it happens inside the same step as the first motion command.

use crate::config::{MotionConfig, ScanConfig, ThorConfig};
use crate::error::TaskError;
use crate::geometry::Pose;
use crate::motion::{MotionController, MotionState, ScanStatus, VerticalScan};
use crate::planner::{PathPlanner, WaypointPath};
use crate::session::SceneSession;
use crate::simulator::{Action, AgentId};
use crate::spatial::SpatialIndex;

/// Shared, immutable navigation components for one run.
#[derive(Debug, Clone)]
pub struct Navigator {
    pub spatial: SpatialIndex,
    pub planner: PathPlanner,
    pub motion: MotionConfig,
    pub scan: ScanConfig,
    pub max_replans: u32,
}

impl Navigator {
    pub fn from_config(config: &ThorConfig) -> Self {
        Self {
            spatial: SpatialIndex::new(config.spatial.clone()),
            planner: PathPlanner::new(config.planner.clone(), config.motion.arrival_tolerance),
            motion: config.motion.clone(),
            scan: config.scan.clone(),
            max_replans: config.task.max_replans,
        }
    }
}

impl Default for Navigator {
    fn default() -> Self {
        Self::from_config(&ThorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproachStatus {
    /// An action was issued this step.
    InProgress,
    /// Standing at the target and facing it. Nothing was issued this step.
    Arrived,
}

#[derive(Debug, Clone)]
enum Stage {
    Walking,
    Facing,
    Scanning(VerticalScan),
    Done,
}

/// The single in-flight navigation of one agent towards one object.
#[derive(Debug, Clone)]
pub struct Approach {
    object_id: String,
    goal: Option<Pose>,
    path: Option<WaypointPath>,
    motion: Option<MotionController>,
    replans: u32,
    /// Rotations issued while facing the object since the last re-plan.
    facing_turns: u32,
    scan_on_arrival: bool,
    stage: Stage,
}

impl Approach {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            goal: None,
            path: None,
            motion: None,
            replans: 0,
            facing_turns: 0,
            scan_on_arrival: false,
            stage: Stage::Walking,
        }
    }

    /// Ends the approach with a vertical scan for the object.
    pub fn with_scan(mut self) -> Self {
        self.scan_on_arrival = true;
        self
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn goal(&self) -> Option<&Pose> {
        self.goal.as_ref()
    }

    pub fn path(&self) -> Option<&WaypointPath> {
        self.path.as_ref()
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }

    /// Counts a stuck walk or a failed turn. Errors once the re-plan budget is spent.
    fn replan(&mut self, nav: &Navigator, agent: AgentId, reason: &'static str) -> Result<(), TaskError> {
        self.replans += 1;
        if self.replans > nav.max_replans {
            return Err(TaskError::PlanningFailure(format!(
                "{reason} approaching {} after {} re-plans",
                self.object_id, nav.max_replans
            )));
        }
        tracing::info!(%agent, object_id = %self.object_id, replans = self.replans, reason, "re-planning");
        self.path = None;
        self.motion = None;
        self.facing_turns = 0;
        self.stage = Stage::Walking;
        Ok(())
    }

    fn plan(&mut self, nav: &Navigator, session: &mut SceneSession, agent: AgentId) -> Result<(), TaskError> {
        let poses = nav.spatial.interactable_poses(session, agent, &self.object_id)?;
        let goal = poses.first().copied().ok_or_else(|| {
            TaskError::PlanningFailure(format!(
                "{} is not interactable from any reachable position",
                self.object_id
            ))
        })?;
        let from = session.pose(agent)?.position;
        let path = nav.planner.plan_path(session, agent, from, goal.position)?;
        tracing::debug!(
            %agent,
            object_id = %self.object_id,
            waypoints = path.len(),
            source = ?path.source(),
            replans = self.replans,
            "approach planned"
        );
        self.goal = Some(goal);
        self.path = Some(path);
        Ok(())
    }

    /// Advances the approach by at most one mutating action.
    pub fn step(
        &mut self,
        nav: &Navigator,
        session: &mut SceneSession,
        agent: AgentId,
    ) -> Result<ApproachStatus, TaskError> {
        loop {
            match self.stage {
                Stage::Done => return Ok(ApproachStatus::Arrived),
                Stage::Walking => {
                    if self.path.is_none() {
                        self.plan(nav, session, agent)?;
                    }
                    let Some(path) = self.path.as_mut() else {
                        continue;
                    };
                    let Some(waypoint) = path.next().copied() else {
                        self.path = None;
                        self.stage = Stage::Facing;
                        continue;
                    };
                    let motion = self
                        .motion
                        .get_or_insert_with(|| MotionController::new(nav.motion.clone(), waypoint));
                    match motion.step(session, agent)? {
                        MotionState::Arrived => {
                            path.consume();
                            self.motion = None;
                        }
                        MotionState::Stuck => {
                            self.replan(nav, agent, "stuck")?;
                            return Ok(ApproachStatus::InProgress);
                        }
                        _ => return Ok(ApproachStatus::InProgress),
                    }
                }
                Stage::Facing => {
                    let meta = session.observe(agent)?;
                    let object = meta
                        .object(&self.object_id)
                        .ok_or_else(|| TaskError::TargetNotFound(self.object_id.clone()))?;
                    let error = meta.agent.pose.heading_error_to(&object.position);
                    if error.abs() <= nav.motion.angle_tolerance {
                        self.facing_turns = 0;
                        self.stage = if self.scan_on_arrival {
                            Stage::Scanning(VerticalScan::new(nav.scan.clone()))
                        } else {
                            Stage::Done
                        };
                        continue;
                    }
                    // a half turn needs a handful of rotations; more than the budget means
                    // the turns are failing or not taking effect
                    if self.facing_turns >= nav.motion.max_consecutive_failures {
                        self.replan(nav, agent, "cannot face target")?;
                        continue;
                    }
                    let turn = error.abs().min(nav.motion.max_rotation_step).copysign(error);
                    self.facing_turns += 1;
                    let result = session.execute(agent, &Action::rotate(turn))?;
                    if !result.success {
                        tracing::debug!(%agent, object_id = %self.object_id, turns = self.facing_turns, "facing rotation failed");
                    }
                    return Ok(ApproachStatus::InProgress);
                }
                Stage::Scanning(ref mut scan) => match scan.step(session, agent, &self.object_id)? {
                    ScanStatus::Found => self.stage = Stage::Done,
                    ScanStatus::Scanning => return Ok(ApproachStatus::InProgress),
                    ScanStatus::NotVisible => {
                        return Err(TaskError::TargetNotVisible(self.object_id.clone()))
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Position;
    use crate::mock::{MockLayout, MockObject, MockSimulator, Rect};

    fn session(sim: MockSimulator) -> SceneSession {
        SceneSession::create(Box::new(sim), "FloorPlan1", 1).unwrap()
    }

    fn drive(approach: &mut Approach, s: &mut SceneSession, limit: usize) -> Result<usize, TaskError> {
        for n in 1..=limit {
            let before = s.action_log().iter().filter(|r| r.mutating).count();
            let status = approach.step(&Navigator::default(), s, AgentId(0))?;
            let issued = s.action_log().iter().filter(|r| r.mutating).count() - before;
            assert!(issued <= 1, "step issued {issued} mutating actions");
            if status == ApproachStatus::Arrived {
                assert_eq!(issued, 0);
                return Ok(n);
            }
        }
        panic!("approach did not finish in {limit} steps");
    }

    #[test]
    fn reaches_and_faces_kitchen_fridge() {
        let mut s = session(MockSimulator::kitchen());
        let mut approach = Approach::new("Fridge|1").with_scan();
        drive(&mut approach, &mut s, 300).unwrap();

        let meta = s.observe(AgentId(0)).unwrap();
        let fridge = meta.object("Fridge|1").unwrap();
        assert!(fridge.visible);
        assert!(meta.agent.pose.position.planar_distance(&fridge.position) <= 1.5);
    }

    #[test]
    fn walks_around_an_obstacle() {
        let mut s = session(
            MockSimulator::new(MockLayout::room(-2.0, -2.0, 2.0, 2.0))
                .with_obstacle(Rect::new(-0.6, 0.4, 0.6, 0.6))
                .with_object(MockObject::new("Mug|1", "Mug", Position::new(0.0, 1.0, 1.8)))
                .with_agent_start(Pose::new(Position::new(0.0, 0.9, -1.0), 0.0, 0.0)),
        );
        let mut approach = Approach::new("Mug|1");
        drive(&mut approach, &mut s, 300).unwrap();
        let here = s.pose(AgentId(0)).unwrap().position;
        assert!(here.z() > 0.6);
    }

    #[test]
    fn unreachable_object_is_a_planning_failure() {
        let mut s = session(
            MockSimulator::new(MockLayout::room(-3.0, -3.0, 3.0, 3.0))
                .with_obstacle(Rect::new(-1.2, -1.2, 1.2, 1.2))
                .with_object(MockObject::new("Safe|1", "Safe", Position::new(0.0, 1.0, 0.0)))
                .with_agent_start(Pose::new(Position::new(2.5, 0.9, 2.5), 0.0, 0.0)),
        );
        let err = Approach::new("Safe|1")
            .step(&Navigator::default(), &mut s, AgentId(0))
            .unwrap_err();
        assert!(matches!(err, TaskError::PlanningFailure(_)));
    }

    #[test]
    fn gives_up_after_three_replans() {
        let mut s = session(MockSimulator::kitchen().fail_next(AgentId(0), "MoveAhead", 10_000));
        let mut approach = Approach::new("Fridge|1");
        let err = drive(&mut approach, &mut s, 2_000).unwrap_err();
        assert!(matches!(err, TaskError::PlanningFailure(_)));
        assert_eq!(approach.replans(), 4);
        let plans = s
            .action_log()
            .iter()
            .filter(|r| r.action == "GetInteractablePoses")
            .count();
        assert_eq!(plans, 4);
    }

    #[test]
    fn turns_that_never_take_effect_exhaust_the_replans() {
        let mut s = session(
            MockSimulator::new(MockLayout::room(-2.0, -2.0, 2.0, 2.0))
                .with_object(MockObject::new("Kettle|1", "Kettle", Position::new(0.9, 1.0, 0.0)))
                .with_agent_start(Pose::new(Position::new(0.0, 0.9, 0.0), 0.0, 0.0))
                .fail_next(AgentId(0), "RotateLeft", 1_000)
                .fail_next(AgentId(0), "RotateRight", 1_000),
        );
        let mut approach = Approach::new("Kettle|1");
        let err = drive(&mut approach, &mut s, 500).unwrap_err();

        assert!(matches!(err, TaskError::PlanningFailure(_)));
        assert_eq!(approach.replans(), 4);
        let turns = s
            .action_log()
            .iter()
            .filter(|r| r.action.starts_with("Rotate"))
            .count();
        assert_eq!(turns, 40);
        assert!(s.action_log().iter().all(|r| r.action != "MoveAhead"));
    }
}
