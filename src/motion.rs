//! Per-waypoint motion control and the vertical visibility scan.
//!
//! A [`MotionController`] walks one agent to one waypoint, issuing at most one discrete
//! simulator action per [`MotionController::step`]. Collisions are handled locally with a
//! back-off and an offset rotation; when the failure budget is spent the controller reports
//! [`MotionState::Stuck`] and the caller re-plans.

use serde::{Deserialize, Serialize};

use crate::config::{MotionConfig, ScanConfig};
use crate::error::TaskError;
use crate::geometry::{Pose, Position};
use crate::session::SceneSession;
use crate::simulator::{Action, AgentId};

const ARRIVAL_EPSILON: f32 = 1e-4;
const PITCH_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    Aligning,
    Advancing,
    Recovering,
    Arrived,
    Stuck,
}

impl MotionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Arrived | Self::Stuck)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    BackOff,
    Rotate,
}

/// Drives one agent to one waypoint.
#[derive(Debug, Clone)]
pub struct MotionController {
    config: MotionConfig,
    waypoint: Position,
    state: MotionState,
    recovery: Option<Recovery>,
    /// Set after a recovery rotation: the next forward step skips alignment.
    retry_forward: bool,
    recovery_sign: f32,
    consecutive_failures: u32,
    total_failures: u32,
}

impl MotionController {
    pub fn new(config: MotionConfig, waypoint: Position) -> Self {
        Self {
            config,
            waypoint,
            state: MotionState::Aligning,
            recovery: None,
            retry_forward: false,
            recovery_sign: 1.0,
            consecutive_failures: 0,
            total_failures: 0,
        }
    }

    pub fn waypoint(&self) -> Position {
        self.waypoint
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }

    /// Pure arrival check. The tolerance is inclusive.
    pub fn has_arrived(&self, pose: &Pose) -> bool {
        pose.position.planar_distance(&self.waypoint)
            <= self.config.arrival_tolerance + ARRIVAL_EPSILON
    }

    /// Charges one failed attempt to both budgets. Returns `true` once either is spent.
    fn charge_failure(&mut self, agent: AgentId, attempt: &'static str) -> bool {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        let spent = self.consecutive_failures > self.config.max_consecutive_failures
            || self.total_failures > self.config.max_total_failures;
        if spent {
            tracing::warn!(
                %agent,
                waypoint = ?self.waypoint,
                attempt,
                consecutive = self.consecutive_failures,
                total = self.total_failures,
                "motion budget exhausted"
            );
            self.state = MotionState::Stuck;
        }
        spent
    }

    /// Advances the controller by at most one simulator action.
    ///
    /// Returns [`MotionState::Arrived`] without issuing anything when the agent is already
    /// within tolerance. Failed rotations and forward steps that report success without
    /// getting closer are charged to the same budget as blocked forward steps.
    pub fn step(&mut self, session: &mut SceneSession, agent: AgentId) -> Result<MotionState, TaskError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        let pose = session.pose(agent)?;
        if self.has_arrived(&pose) {
            tracing::trace!(%agent, waypoint = ?self.waypoint, "waypoint reached");
            self.state = MotionState::Arrived;
            return Ok(self.state);
        }

        match self.recovery {
            Some(Recovery::BackOff) => {
                let result = session.execute(
                    agent,
                    &Action::MoveBack {
                        magnitude: self.config.backoff_distance,
                    },
                )?;
                if !result.success {
                    tracing::debug!(%agent, "back-off blocked, rotating in place");
                }
                self.recovery = Some(Recovery::Rotate);
                return Ok(self.state);
            }
            Some(Recovery::Rotate) => {
                let result = session.execute(
                    agent,
                    &Action::rotate(self.recovery_sign * self.config.recovery_rotation),
                )?;
                self.recovery_sign = -self.recovery_sign;
                if !result.success {
                    // the next attempt turns the other way
                    self.charge_failure(agent, "recovery rotation");
                    return Ok(self.state);
                }
                self.recovery = None;
                self.retry_forward = true;
                return Ok(self.state);
            }
            None => {}
        }

        let error = pose.heading_error_to(&self.waypoint);
        if !self.retry_forward && error.abs() > self.config.angle_tolerance {
            let turn = error.abs().min(self.config.max_rotation_step).copysign(error);
            let result = session.execute(agent, &Action::rotate(turn))?;
            self.state = MotionState::Aligning;
            if !result.success {
                self.charge_failure(agent, "rotation");
            }
            return Ok(self.state);
        }
        self.retry_forward = false;

        let distance = pose.position.planar_distance(&self.waypoint);
        let magnitude = self.config.forward_step.min(distance);
        let result = session.execute(agent, &Action::MoveAhead { magnitude })?;
        if result.success {
            let progress = distance
                - result
                    .metadata
                    .agent
                    .pose
                    .position
                    .planar_distance(&self.waypoint);
            if progress >= self.config.min_progress {
                self.consecutive_failures = 0;
                self.state = MotionState::Advancing;
                return Ok(self.state);
            }
            tracing::debug!(%agent, progress, "forward step made no progress");
        }

        if self.charge_failure(agent, "forward") {
            return Ok(self.state);
        }
        self.recovery = Some(Recovery::BackOff);
        self.state = MotionState::Recovering;
        Ok(self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Scanning,
    Found,
    NotVisible,
}

/// Bounded vertical search: down, then up past neutral, then back to neutral.
///
/// Only camera moves the simulator accepted count towards the pitch that the last move undoes,
/// so a failed move never leaves the camera tilted after a successful restore.
#[derive(Debug, Clone, Default)]
pub struct VerticalScan {
    config: ScanConfig,
    stage: u8,
    /// Net pitch applied so far, positive down.
    pitch: f32,
    failures: u32,
}

impl VerticalScan {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            stage: 0,
            pitch: 0.0,
            failures: 0,
        }
    }

    /// Net pitch (degrees, positive down) this scan has applied to the camera.
    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    fn next_move(&self) -> Option<Action> {
        match self.stage {
            0 => Some(Action::LookDown {
                degrees: self.config.look_down,
            }),
            1 => Some(Action::LookUp {
                degrees: self.config.look_up,
            }),
            2 if self.pitch > PITCH_EPSILON => Some(Action::LookUp { degrees: self.pitch }),
            2 if self.pitch < -PITCH_EPSILON => Some(Action::LookDown { degrees: -self.pitch }),
            _ => None,
        }
    }

    /// Checks visibility of `object_id` and, if still hidden, issues the next camera move.
    pub fn step(
        &mut self,
        session: &mut SceneSession,
        agent: AgentId,
        object_id: &str,
    ) -> Result<ScanStatus, TaskError> {
        let visible = session
            .observe(agent)?
            .object(object_id)
            .map(|o| o.visible)
            .ok_or_else(|| TaskError::TargetNotFound(object_id.to_string()))?;
        if visible {
            tracing::debug!(%agent, object_id, stage = self.stage, "target visible");
            return Ok(ScanStatus::Found);
        }

        let Some(action) = self.next_move() else {
            tracing::debug!(%agent, object_id, pitch = self.pitch, "target not visible after scan");
            return Ok(ScanStatus::NotVisible);
        };
        let result = session.execute(agent, &action)?;
        if result.success {
            self.pitch += match action {
                Action::LookDown { degrees } => degrees,
                Action::LookUp { degrees } => -degrees,
                _ => 0.0,
            };
            self.stage += 1;
            self.failures = 0;
        } else {
            self.failures += 1;
            if self.failures > self.config.max_retries {
                tracing::warn!(%agent, object_id, action = action.name(), pitch = self.pitch, "camera move keeps failing");
                self.failures = 0;
                // give up on the search and go straight to the restore
                self.stage = if self.stage < 2 { 2 } else { 3 };
            }
        }

        if self.stage > 2 {
            tracing::debug!(%agent, object_id, pitch = self.pitch, "target not visible after scan");
            Ok(ScanStatus::NotVisible)
        } else {
            Ok(ScanStatus::Scanning)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use crate::mock::{MockLayout, MockObject, MockSimulator};
    use crate::simulator::{ActionResult, ActionReturn, SceneMetadata, Simulator};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Forward {
        Normal,
        Blocked,
        /// Reported as a success while the agent stays where it is.
        Slipping,
    }

    /// The mock with a scripted outcome for every `MoveAhead`, indexed from 1.
    struct ScriptedFloor {
        inner: MockSimulator,
        attempts: u32,
        script: fn(u32) -> Forward,
    }

    impl ScriptedFloor {
        fn new(inner: MockSimulator, script: fn(u32) -> Forward) -> Self {
            Self {
                inner,
                attempts: 0,
                script,
            }
        }
    }

    impl Simulator for ScriptedFloor {
        fn reset(&mut self, scene: &str, agent_count: usize) -> Result<(), SimError> {
            self.inner.reset(scene, agent_count)
        }

        fn step(&mut self, agent: AgentId, action: &Action) -> Result<ActionResult, SimError> {
            if !matches!(action, Action::MoveAhead { .. }) {
                return self.inner.step(agent, action);
            }
            self.attempts += 1;
            let (success, error_message) = match (self.script)(self.attempts) {
                Forward::Normal => return self.inner.step(agent, action),
                Forward::Blocked => (false, Some("Blocked (scripted)".to_string())),
                Forward::Slipping => (true, None),
            };
            Ok(ActionResult {
                success,
                error_message,
                action_return: ActionReturn::None,
                metadata: self.inner.metadata(agent)?,
            })
        }

        fn metadata(&self, agent: AgentId) -> Result<SceneMetadata, SimError> {
            self.inner.metadata(agent)
        }

        fn agent_count(&self) -> usize {
            self.inner.agent_count()
        }
    }

    fn scripted_session(script: fn(u32) -> Forward, start: Pose) -> SceneSession {
        let sim = ScriptedFloor::new(open_room().with_agent_start(start), script);
        SceneSession::create(Box::new(sim), "FloorPlan1", 1).unwrap()
    }

    fn run_to_terminal(c: &mut MotionController, s: &mut SceneSession, limit: usize) -> MotionState {
        for _ in 0..limit {
            let state = c.step(s, AgentId(0)).unwrap();
            if state.is_terminal() {
                return state;
            }
        }
        panic!("controller did not terminate in {limit} steps");
    }

    fn session(sim: MockSimulator) -> SceneSession {
        let sim = sim.with_agent_start(Pose::new(Position::new(0.0, 0.9, 0.0), 0.0, 0.0));
        SceneSession::create(Box::new(sim), "FloorPlan1", 1).unwrap()
    }

    fn open_room() -> MockSimulator {
        MockSimulator::new(MockLayout::room(-3.0, -3.0, 3.0, 3.0))
    }

    fn forward_failures(s: &SceneSession) -> usize {
        s.action_log()
            .iter()
            .filter(|r| r.action == "MoveAhead" && !r.success)
            .count()
    }

    #[test]
    fn arrival_boundary_is_inclusive() {
        let c = MotionController::new(MotionConfig::default(), Position::planar(0.35, 0.0));
        assert!(c.has_arrived(&Pose::new(Position::planar(0.0, 0.0), 0.0, 0.0)));

        let c = MotionController::new(MotionConfig::default(), Position::planar(1.0, 0.0));
        assert!(c.has_arrived(&Pose::new(Position::planar(0.95, 0.0), 0.0, 0.0)));
        assert!(!c.has_arrived(&Pose::new(Position::planar(0.6, 0.0), 0.0, 0.0)));
    }

    #[test]
    fn arrival_check_is_idempotent_and_issues_nothing() {
        let mut s = session(open_room());
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.3, 0.9, 0.0));
        assert_eq!(c.step(&mut s, AgentId(0)).unwrap(), MotionState::Arrived);
        assert_eq!(c.step(&mut s, AgentId(0)).unwrap(), MotionState::Arrived);
        assert!(s.action_log().is_empty());
    }

    #[test]
    fn aligns_then_walks_to_waypoint() {
        let mut s = session(open_room());
        let mut c = MotionController::new(MotionConfig::default(), Position::new(1.5, 0.9, 0.0));

        assert_eq!(c.step(&mut s, AgentId(0)).unwrap(), MotionState::Aligning);
        assert_eq!(s.action_log()[0].action, "RotateRight");

        let mut steps = 1;
        while c.step(&mut s, AgentId(0)).unwrap() != MotionState::Arrived {
            steps += 1;
            assert!(steps < 50, "controller did not converge");
        }
        let pose = s.pose(AgentId(0)).unwrap();
        assert!(pose.position.planar_distance(&Position::new(1.5, 0.9, 0.0)) <= 0.35 + 1e-4);
    }

    #[test]
    fn each_step_issues_at_most_one_action() {
        let mut s = session(open_room().fail_next(AgentId(0), "MoveAhead", 2));
        let mut c = MotionController::new(MotionConfig::default(), Position::new(-1.0, 0.9, 1.0));
        for _ in 0..40 {
            let before = s.action_log().len();
            if c.step(&mut s, AgentId(0)).unwrap().is_terminal() {
                break;
            }
            assert_eq!(s.action_log().len() - before, 1);
        }
        assert_eq!(c.state(), MotionState::Arrived);
    }

    #[test]
    fn three_failures_recover_and_arrive() {
        let mut s = session(open_room().fail_next(AgentId(0), "MoveAhead", 3));
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.0, 0.9, 1.5));

        while forward_failures(&s) < 3 {
            assert_ne!(c.step(&mut s, AgentId(0)).unwrap(), MotionState::Stuck);
        }
        assert_eq!(c.consecutive_failures(), 3);
        assert_ne!(c.state(), MotionState::Stuck);

        for _ in 0..100 {
            if c.step(&mut s, AgentId(0)).unwrap().is_terminal() {
                break;
            }
        }
        assert_eq!(c.state(), MotionState::Arrived);
    }

    #[test]
    fn eleventh_consecutive_failure_is_stuck() {
        let mut s = session(open_room().fail_next(AgentId(0), "MoveAhead", 100));
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.0, 0.9, 2.5));

        let mut state = MotionState::Aligning;
        for _ in 0..200 {
            state = c.step(&mut s, AgentId(0)).unwrap();
            if state.is_terminal() {
                break;
            }
            assert!(forward_failures(&s) <= 10);
        }
        assert_eq!(state, MotionState::Stuck);
        assert_eq!(forward_failures(&s), 11);
    }

    #[test]
    fn recovery_backs_off_then_rotates_with_alternating_sign() {
        let mut s = session(open_room().fail_next(AgentId(0), "MoveAhead", 2));
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.0, 0.9, 2.0));
        for _ in 0..6 {
            c.step(&mut s, AgentId(0)).unwrap();
        }
        let names: Vec<&str> = s.action_log().iter().map(|r| r.action.as_str()).collect();
        assert_eq!(
            names,
            ["MoveAhead", "MoveBack", "RotateRight", "MoveAhead", "MoveBack", "RotateLeft"]
        );
    }

    #[test]
    fn scan_finds_low_object_after_looking_down() {
        let mut s = session(
            open_room().with_object(MockObject::new("Cup|1", "Cup", Position::new(0.0, 0.5, 1.0))),
        );
        let mut scan = VerticalScan::default();
        assert_eq!(scan.step(&mut s, AgentId(0), "Cup|1").unwrap(), ScanStatus::Scanning);
        assert_eq!(scan.step(&mut s, AgentId(0), "Cup|1").unwrap(), ScanStatus::Found);
    }

    #[test]
    fn scan_finds_high_object_after_looking_up() {
        let mut s = session(
            open_room().with_object(MockObject::new("Lamp|1", "Lamp", Position::new(0.0, 2.5, 1.0))),
        );
        let mut scan = VerticalScan::default();
        assert_eq!(scan.step(&mut s, AgentId(0), "Lamp|1").unwrap(), ScanStatus::Scanning);
        assert_eq!(scan.step(&mut s, AgentId(0), "Lamp|1").unwrap(), ScanStatus::Scanning);
        assert_eq!(scan.step(&mut s, AgentId(0), "Lamp|1").unwrap(), ScanStatus::Found);
    }

    #[test]
    fn failed_scan_returns_camera_to_neutral() {
        let mut s = session(
            open_room().with_object(MockObject::new("Cup|1", "Cup", Position::new(0.0, 1.0, -1.0))),
        );
        let mut scan = VerticalScan::default();
        let mut last = ScanStatus::Scanning;
        for _ in 0..3 {
            last = scan.step(&mut s, AgentId(0), "Cup|1").unwrap();
        }
        assert_eq!(last, ScanStatus::NotVisible);
        assert_eq!(s.action_log().len(), 3);
        assert!(s.pose(AgentId(0)).unwrap().horizon.abs() < 1e-4);
    }

    #[test]
    fn forward_steps_without_progress_end_stuck() {
        let mut s = scripted_session(|_| Forward::Slipping, Pose::new(Position::new(0.0, 0.9, 0.0), 0.0, 0.0));
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.0, 0.9, 2.0));

        assert_eq!(run_to_terminal(&mut c, &mut s, 200), MotionState::Stuck);
        assert_eq!(c.consecutive_failures(), 11);
        let forwards: Vec<bool> = s
            .action_log()
            .iter()
            .filter(|r| r.action == "MoveAhead")
            .map(|r| r.success)
            .collect();
        assert_eq!(forwards.len(), 11);
        assert!(forwards.iter().all(|ok| *ok));
    }

    #[test]
    fn failing_rotations_end_stuck() {
        let mut s = session(
            open_room()
                .fail_next(AgentId(0), "RotateLeft", 1_000)
                .fail_next(AgentId(0), "RotateRight", 1_000),
        );
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.0, 0.9, -2.0));

        assert_eq!(run_to_terminal(&mut c, &mut s, 200), MotionState::Stuck);
        assert_eq!(s.action_log().len(), 11);
        assert!(s.action_log().iter().all(|r| r.action.starts_with("Rotate") && !r.success));
    }

    #[test]
    fn total_budget_caps_interleaved_failures() {
        // ten blocked attempts, then one that gets through
        let mut s = scripted_session(
            |n| if n % 11 == 0 { Forward::Normal } else { Forward::Blocked },
            Pose::new(Position::new(0.0, 0.9, -2.5), 0.0, 0.0),
        );
        let mut c = MotionController::new(MotionConfig::default(), Position::new(0.0, 0.9, 2.5));

        let mut state = MotionState::Aligning;
        for _ in 0..500 {
            state = c.step(&mut s, AgentId(0)).unwrap();
            assert!(c.consecutive_failures() <= 10);
            if state.is_terminal() {
                break;
            }
        }
        assert_eq!(state, MotionState::Stuck);
        assert_eq!(c.total_failures(), 31);
        assert_eq!(c.consecutive_failures(), 1);
    }

    #[test]
    fn failed_look_up_is_retried_and_camera_still_returns_to_neutral() {
        let mut s = session(
            open_room()
                .with_object(MockObject::new("Cup|1", "Cup", Position::new(0.0, 1.0, -1.0)))
                .fail_next(AgentId(0), "LookUp", 1),
        );
        let mut scan = VerticalScan::default();
        let mut last = ScanStatus::Scanning;
        for _ in 0..4 {
            last = scan.step(&mut s, AgentId(0), "Cup|1").unwrap();
        }
        assert_eq!(last, ScanStatus::NotVisible);
        let names: Vec<&str> = s.action_log().iter().map(|r| r.action.as_str()).collect();
        assert_eq!(names, ["LookDown", "LookUp", "LookUp", "LookDown"]);
        assert!(scan.pitch().abs() < 1e-4);
        assert!(s.pose(AgentId(0)).unwrap().horizon.abs() < 1e-4);
    }

    #[test]
    fn camera_that_never_moves_up_ends_the_scan() {
        let mut s = session(
            open_room()
                .with_object(MockObject::new("Cup|1", "Cup", Position::new(0.0, 1.0, -1.0)))
                .fail_next(AgentId(0), "LookUp", 1_000),
        );
        let mut scan = VerticalScan::default();
        let mut steps = 0;
        while scan.step(&mut s, AgentId(0), "Cup|1").unwrap() == ScanStatus::Scanning {
            steps += 1;
            assert!(steps < 20, "scan did not terminate");
        }
        // one LookDown, three LookUp attempts, then three attempts to undo the LookDown
        assert_eq!(s.action_log().len(), 7);
        assert_eq!(scan.pitch(), 30.0);
    }
}
